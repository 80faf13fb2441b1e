mod common;

use axum::http::StatusCode;
use callbridge_server::conversation::CallState;
use callbridge_types::CallPolicy;
use callbridge_voice::{InboundMessage, LoopbackInitiator, OutboundMessage};
use common::*;
use serde_json::json;

#[tokio::test]
async fn valid_report_places_an_active_call() {
    let mut t = test_app(CallPolicy::default());

    let (status, headers, body) = submit(&t.router, report_json(), "10.0.0.1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["aiCallStatus"], "active");
    assert!(body.get("fallbackMode").is_none());
    assert_eq!(headers["x-ratelimit-limit"], "3");
    assert_eq!(headers["x-ratelimit-remaining"], "2");

    let session_id = body["sessionId"].as_str().unwrap().to_string();
    assert!(session_id.starts_with("session_"));

    let conversation = t.state.registry.get(&session_id).expect("session registered");
    assert_eq!(conversation.state(), CallState::Active);
    assert!(conversation.is_active());
    assert!(conversation.call_initiated());
    assert_eq!(conversation.conversation_id().as_deref(), Some("loopback_conv_1"));

    let briefings = t.initiator.briefings();
    assert_eq!(briefings.len(), 1);
    assert!(briefings[0].contains("12 Birch Avenue, Flat 3"));
    assert!(briefings[0].contains("My neighbour collapsed and is not responding."));

    let remote = next_remote(&mut t.remotes).await;
    assert_eq!(remote.conversation_id(), "loopback_conv_1");
}

#[tokio::test]
async fn invalid_reports_are_rejected_before_rate_limiting() {
    let t = test_app(CallPolicy {
        intake_max_requests: 1,
        ..CallPolicy::default()
    });

    let mut short = report_json();
    short["description"] = json!("help");
    let (status, _, body) = submit(&t.router, short, "10.0.0.2").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("10"));

    let mut nowhere = report_json();
    nowhere.as_object_mut().unwrap().remove("manualAddress");
    let (status, _, _) = submit(&t.router, nowhere, "10.0.0.2").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut unknown = report_json();
    unknown["serviceNeeded"] = json!("plumber");
    let (status, _, body) = submit(&t.router, unknown, "10.0.0.2").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);

    // None of the above consumed the single intake slot.
    let (status, _, body) = submit(&t.router, report_json(), "10.0.0.2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["aiCallStatus"], "active");
}

#[tokio::test]
async fn coordinates_alone_are_a_valid_location() {
    let t = test_app(CallPolicy::default());
    let mut report = report_json();
    report.as_object_mut().unwrap().remove("manualAddress");
    report["location"] = json!({ "latitude": 51.5072, "longitude": -0.1276, "accuracy": 20.0 });

    let (status, _, body) = submit(&t.router, report, "10.0.0.3").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["aiCallStatus"], "active");
    assert!(t.initiator.briefings()[0].contains("latitude 51.50720"));
}

#[tokio::test]
async fn fourth_report_in_window_is_rate_limited() {
    let t = test_app(CallPolicy {
        intake_max_requests: 3,
        intake_window_ms: 60_000,
        ..relaxed_policy()
    });

    for remaining in [2, 1, 0] {
        let (status, headers, body) = submit(&t.router, report_json(), "192.0.2.7").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["aiCallStatus"], "active");
        assert_eq!(headers["x-ratelimit-remaining"], remaining.to_string().as_str());
    }

    let (status, headers, body) = submit(&t.router, report_json(), "192.0.2.7").await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["success"], false);
    assert_eq!(body["allowed"], false);
    assert_eq!(body["remaining"], 0);
    assert_eq!(body["limit"], 3);
    assert!(body["retryAfter"].as_u64().unwrap() >= 1);
    assert!(body["resetTime"].as_u64().is_some());
    assert!(headers.contains_key("retry-after"));
    assert_eq!(headers["x-ratelimit-remaining"], "0");

    // Another client is unaffected by the first one's window.
    let (status, _, _) = submit(&t.router, report_json(), "192.0.2.8").await;
    assert_ne!(status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn second_report_in_session_hits_cooldown() {
    let t = test_app_with(CallPolicy::default(), LoopbackInitiator::failing("no answer"));

    let (status, _, first) = submit(&t.router, report_for_session("session_cooldown_1"), "10.0.1.1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["aiCallStatus"], "failed");
    assert_eq!(first["fallbackMode"], true);
    assert!(first["error"].as_str().unwrap().contains("no answer"));

    let (status, headers, second) =
        submit(&t.router, report_for_session("session_cooldown_1"), "10.0.1.1").await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(second["allowed"], false);
    assert_eq!(second["reason"], "Call cooldown period active");
    assert_eq!(second["error"], "Call cooldown period active");
    let retry = second["retryAfter"].as_u64().unwrap();
    assert!(retry > 0 && retry <= 30);
    assert_eq!(headers["retry-after"], retry.to_string().as_str());
}

#[tokio::test]
async fn cooldown_applies_after_provider_ends_the_call() {
    let mut t = test_app(CallPolicy::default());

    let (_, _, first) = submit(&t.router, report_for_session("session_cooldown_2"), "10.0.1.2").await;
    assert_eq!(first["aiCallStatus"], "active");
    let remote = next_remote(&mut t.remotes).await;
    remote.push(InboundMessage::ConversationEnded).await;

    let conversation = t.state.registry.get("session_cooldown_2").unwrap();
    wait_for_state(&conversation, CallState::Ended).await;

    let (status, _, second) = submit(&t.router, report_for_session("session_cooldown_2"), "10.0.1.2").await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(second["reason"], "Call cooldown period active");
}

#[tokio::test]
async fn duplicate_report_while_active_is_refused() {
    let t = test_app(CallPolicy::default());

    let (_, _, first) = submit(&t.router, report_for_session("session_dup"), "10.0.1.3").await;
    assert_eq!(first["aiCallStatus"], "active");

    let (status, headers, second) = submit(&t.router, report_for_session("session_dup"), "10.0.1.3").await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(second["reason"], "Call already active");
    assert!(second.get("retryAfter").is_none());
    assert!(!headers.contains_key("retry-after"));
}

#[tokio::test]
async fn failed_call_does_not_use_up_the_session() {
    let t = test_app_with(
        CallPolicy {
            session_cooldown_ms: 0,
            ..CallPolicy::default()
        },
        LoopbackInitiator::failing("provider down"),
    );

    for _ in 0..2 {
        let (status, _, body) = submit(&t.router, report_for_session("session_retry"), "10.0.1.4").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["aiCallStatus"], "failed");
    }
    assert_eq!(t.initiator.attempts(), 2);

    let conversation = t.state.registry.get("session_retry").unwrap();
    assert_eq!(conversation.state(), CallState::Ended);
    assert!(!conversation.call_initiated());
}

#[tokio::test]
async fn call_that_never_connects_falls_back() {
    let mut t = test_app_manual(CallPolicy::default());

    let router = t.router.clone();
    let request = tokio::spawn(async move { submit(&router, report_for_session("session_slow"), "10.0.1.5").await });

    // Hold the remote without opening it.
    let _remote = next_remote(&mut t.remotes).await;
    let (status, _, body) = request.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["aiCallStatus"], "failed");
    assert_eq!(body["fallbackMode"], true);
    assert_eq!(body["error"], "Call did not connect in time");

    let conversation = t.state.registry.get("session_slow").unwrap();
    assert_eq!(conversation.state(), CallState::Ended);
    assert!(!conversation.call_initiated());
}

#[tokio::test]
async fn call_connects_when_handshake_completes_later() {
    let mut t = test_app_manual(CallPolicy::default());

    let router = t.router.clone();
    let request = tokio::spawn(async move { submit(&router, report_for_session("session_late"), "10.0.1.6").await });

    let remote = next_remote(&mut t.remotes).await;
    remote.open().await;

    let (status, _, body) = request.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["aiCallStatus"], "active");
}

#[tokio::test]
async fn relay_endpoint_forwards_text_to_provider() {
    let mut t = test_app(CallPolicy::default());
    let (_, _, body) = submit(&t.router, report_for_session("session_relay"), "10.0.2.1").await;
    assert_eq!(body["aiCallStatus"], "active");
    let mut remote = next_remote(&mut t.remotes).await;

    let (status, _, reply) = send(
        &t.router,
        "POST",
        "/api/sessions/session_relay/messages",
        Some(json!({ "text": "  The door is unlocked  " })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply["success"], true);

    assert_eq!(
        remote.next_outbound_within(WAIT).await,
        Some(OutboundMessage::ContextualUpdate {
            text: "The door is unlocked".to_string(),
            conversation_id: "loopback_conv_1".to_string(),
        })
    );

    let (status, _, _) = send(
        &t.router,
        "POST",
        "/api/sessions/session_relay/messages",
        Some(json!({ "text": "   " })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn relay_endpoint_reports_session_problems() {
    let mut t = test_app(CallPolicy::default());

    let (status, _, _) = send(
        &t.router,
        "POST",
        "/api/sessions/session_missing/messages",
        Some(json!({ "text": "hello" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    submit(&t.router, report_for_session("session_gone"), "10.0.2.2").await;
    let remote = next_remote(&mut t.remotes).await;
    remote.drop_connection(1011, "server error").await;
    let conversation = t.state.registry.get("session_gone").unwrap();
    wait_for_state(&conversation, CallState::Ended).await;

    let (status, _, body) = send(
        &t.router,
        "POST",
        "/api/sessions/session_gone/messages",
        Some(json!({ "text": "hello" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn relay_endpoint_surfaces_send_failures() {
    let mut t = test_app(CallPolicy::default());
    submit(&t.router, report_for_session("session_flaky"), "10.0.2.3").await;
    let remote = next_remote(&mut t.remotes).await;
    remote.set_fail_sends(true);

    let (status, _, _) = send(
        &t.router,
        "POST",
        "/api/sessions/session_flaky/messages",
        Some(json!({ "text": "are you there" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);

    // A failed send does not end the call.
    let conversation = t.state.registry.get("session_flaky").unwrap();
    assert_eq!(conversation.state(), CallState::Active);
}

#[tokio::test]
async fn end_snapshot_and_admission_endpoints() {
    let t = test_app(CallPolicy::default());
    submit(&t.router, report_for_session("session_end"), "10.0.3.1").await;

    let (status, _, snapshot) = send(&t.router, "GET", "/api/sessions/session_end", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snapshot["sessionId"], "session_end");
    assert_eq!(snapshot["state"], "active");
    assert_eq!(snapshot["isActive"], true);
    assert_eq!(snapshot["callInitiated"], true);
    assert_eq!(snapshot["conversationId"], "loopback_conv_1");

    let (_, _, admission) = send(&t.router, "GET", "/api/sessions/session_end/admission", None, None).await;
    assert_eq!(admission["allowed"], false);
    assert_eq!(admission["reason"], "Call already active");

    let (status, _, ended) = send(&t.router, "POST", "/api/sessions/session_end/end", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ended, json!({ "success": true, "ended": true }));

    let (_, _, again) = send(&t.router, "POST", "/api/sessions/session_end/end", None, None).await;
    assert_eq!(again, json!({ "success": true, "ended": false }));

    let (status, _, _) = send(&t.router, "GET", "/api/sessions/session_end", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, _, fresh) = send(&t.router, "GET", "/api/sessions/session_new/admission", None, None).await;
    assert_eq!(fresh, json!({ "allowed": true }));
    assert!(t.state.registry.get("session_new").is_none());
}

#[tokio::test]
async fn status_reports_configuration_without_secrets() {
    let t = test_app(CallPolicy::default());
    let (status, _, body) = send(&t.router, "GET", "/api/status", None, None).await;
    assert_eq!(status, StatusCode::OK);
    for key in [
        "configured",
        "apiKeyConfigured",
        "agentIdConfigured",
        "phoneNumberConfigured",
        "destinationConfigured",
    ] {
        assert!(body[key].is_boolean(), "{} should be a boolean", key);
    }
    assert_eq!(body["configured"], true);
}

#[tokio::test]
async fn invalid_session_id_is_rejected() {
    let t = test_app(CallPolicy::default());
    let (status, _, _) = submit(&t.router, report_for_session("../../etc/passwd"), "10.0.3.2").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn forwarded_header_identifies_clients_without_peer_address() {
    let t = test_app(CallPolicy {
        intake_max_requests: 1,
        ..relaxed_policy()
    });

    let forwarded = |ip: &'static str| {
        let router = t.router.clone();
        async move {
            let request = axum::http::Request::builder()
                .method("POST")
                .uri("/api/emergency")
                .header("content-type", "application/json")
                .header("x-forwarded-for", ip)
                .body(axum::body::Body::from(report_json().to_string()))
                .unwrap();
            tower::ServiceExt::oneshot(router, request).await.unwrap().status()
        }
    };

    assert_eq!(forwarded("198.51.100.1").await, StatusCode::OK);
    assert_eq!(forwarded("198.51.100.1").await, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(forwarded("198.51.100.2").await, StatusCode::OK);
}

#[tokio::test]
async fn ending_a_session_does_not_reset_its_cooldown() {
    let t = test_app(CallPolicy::default());

    let (_, _, first) = submit(&t.router, report_for_session("session_reended"), "10.0.4.1").await;
    assert_eq!(first["aiCallStatus"], "active");
    let (status, _, ended) = send(&t.router, "POST", "/api/sessions/session_reended/end", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ended["ended"], true);

    let (_, _, check) = send(&t.router, "GET", "/api/sessions/session_reended/admission", None, None).await;
    assert_eq!(check["allowed"], false);
    assert_eq!(check["reason"], "Call cooldown period active");

    let (status, headers, second) =
        submit(&t.router, report_for_session("session_reended"), "10.0.4.1").await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(second["reason"], "Call cooldown period active");
    assert!(headers.contains_key("retry-after"));
    assert_eq!(t.initiator.attempts(), 1);
}

#[tokio::test]
async fn ending_a_session_does_not_reset_its_call_limit() {
    let t = test_app(CallPolicy {
        session_cooldown_ms: 0,
        max_calls_per_session: 1,
        ..relaxed_policy()
    });

    submit(&t.router, report_for_session("session_once"), "10.0.4.2").await;
    send(&t.router, "POST", "/api/sessions/session_once/end", None, None).await;

    let (status, _, second) = submit(&t.router, report_for_session("session_once"), "10.0.4.2").await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(second["reason"], "Session call limit exceeded");
    assert_eq!(t.initiator.attempts(), 1);
}
