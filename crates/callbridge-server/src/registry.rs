//! Session id to conversation mapping, and the admission entry point.

use crate::admission::{AdmissionControl, AdmissionDecision, AdmissionRejection, SessionCallRecord};
use crate::conversation::Conversation;
use crate::{lock_or_recover, unix_millis};
use callbridge_types::CallPolicy;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const SESSION_SUFFIX_LEN: usize = 9;
const SESSION_SUFFIX_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const MAX_SESSION_ID_LEN: usize = 64;

/// Generates `session_<unix-millis>_<9 lowercase alphanumerics>`.
pub fn new_session_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..SESSION_SUFFIX_LEN)
        .map(|_| SESSION_SUFFIX_CHARS[rng.gen_range(0..SESSION_SUFFIX_CHARS.len())] as char)
        .collect();
    format!("session_{}_{}", unix_millis(), suffix)
}

/// Accepts client-supplied ids made of ASCII letters, digits, `_` and `-`.
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Owns every live conversation.
///
/// Lock order is registry map, then conversation, then call history, then
/// admission ledger.
#[derive(Clone, Debug)]
pub struct SessionRegistry {
    conversations: Arc<Mutex<HashMap<String, Arc<Conversation>>>>,
    /// Call records of sessions whose conversation was removed. A session
    /// keeps its cooldown and call count after its conversation is gone.
    history: Arc<Mutex<HashMap<String, SessionCallRecord>>>,
    admission: Arc<AdmissionControl>,
}

impl SessionRegistry {
    pub fn new(policy: CallPolicy) -> Self {
        Self {
            conversations: Arc::new(Mutex::new(HashMap::new())),
            history: Arc::new(Mutex::new(HashMap::new())),
            admission: Arc::new(AdmissionControl::new(policy)),
        }
    }

    pub fn policy(&self) -> &CallPolicy {
        self.admission.policy()
    }

    pub fn admission(&self) -> &AdmissionControl {
        &self.admission
    }

    /// Builds a conversation seeded with whatever the session did before.
    /// Called with the registry map locked.
    fn create(&self, session_id: &str) -> Arc<Conversation> {
        match lock_or_recover(&self.history, "call history").remove(session_id) {
            Some(record) => Conversation::resume(session_id, record),
            None => Conversation::new(session_id),
        }
    }

    /// Call history kept for a session with no live conversation.
    pub fn call_history(&self, session_id: &str) -> Option<SessionCallRecord> {
        lock_or_recover(&self.history, "call history")
            .get(session_id)
            .copied()
    }

    /// Returns the conversation for `session_id`, creating it if needed.
    pub fn get_conversation(&self, session_id: &str) -> Arc<Conversation> {
        let mut conversations = lock_or_recover(&self.conversations, "session registry");
        Arc::clone(
            conversations
                .entry(session_id.to_string())
                .or_insert_with(|| self.create(session_id)),
        )
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Conversation>> {
        lock_or_recover(&self.conversations, "session registry")
            .get(session_id)
            .cloned()
    }

    /// Ends and forgets the session's conversation, keeping its call
    /// history. Returns `true` if one existed.
    pub fn remove_conversation(&self, session_id: &str) -> bool {
        let mut conversations = lock_or_recover(&self.conversations, "session registry");
        let Some(conversation) = conversations.remove(session_id) else {
            return false;
        };
        conversation.end();
        let record = conversation.call_record();
        if record.call_count > 0 || record.last_call_at_ms.is_some() {
            lock_or_recover(&self.history, "call history").insert(
                session_id.to_string(),
                SessionCallRecord {
                    is_active: false,
                    call_initiated: false,
                    ..record
                },
            );
        }
        drop(conversations);
        tracing::info!(session_id, "session removed");
        true
    }

    /// Ends every conversation and empties the registry.
    pub fn cleanup_all(&self) -> usize {
        let drained: Vec<Arc<Conversation>> =
            lock_or_recover(&self.conversations, "session registry")
                .drain()
                .map(|(_, conversation)| conversation)
                .collect();
        for conversation in &drained {
            conversation.end();
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.conversations, "session registry").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn session_ids(&self) -> Vec<String> {
        lock_or_recover(&self.conversations, "session registry")
            .keys()
            .cloned()
            .collect()
    }

    /// Evaluates admission for `session_id` without changing anything.
    pub fn can_initiate_call(&self, session_id: &str) -> AdmissionDecision {
        let record = match self.get(session_id) {
            Some(conversation) => conversation.call_record(),
            None => self.call_history(session_id).unwrap_or_default(),
        };
        self.admission.evaluate(&record, unix_millis()).into()
    }

    /// Marks a call as initiated for `session_id` without checking the rules.
    pub fn mark_call_initiated(&self, session_id: &str) -> Arc<Conversation> {
        let now = unix_millis();
        let mut conversations = lock_or_recover(&self.conversations, "session registry");
        let conversation = Arc::clone(
            conversations
                .entry(session_id.to_string())
                .or_insert_with(|| self.create(session_id)),
        );
        // The closure never rejects.
        let _ = conversation.try_mark_call_initiated(now, |_| {
            self.admission.record_call(now);
            Ok(())
        });
        drop(conversations);
        conversation
    }

    /// Gets or creates the conversation, checks admission and marks the call
    /// as initiated, all under the registry lock.
    pub fn admit(&self, session_id: &str) -> Result<Arc<Conversation>, AdmissionRejection> {
        self.admit_at(session_id, unix_millis())
    }

    pub fn admit_at(
        &self,
        session_id: &str,
        now_ms: u64,
    ) -> Result<Arc<Conversation>, AdmissionRejection> {
        let mut conversations = lock_or_recover(&self.conversations, "session registry");
        let conversation = Arc::clone(
            conversations
                .entry(session_id.to_string())
                .or_insert_with(|| self.create(session_id)),
        );
        conversation.try_mark_call_initiated(now_ms, |record| {
            self.admission.check_and_record(record, now_ms)
        })?;
        drop(conversations);
        Ok(conversation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::CallState;

    #[test]
    fn session_ids_have_expected_shape() {
        let id = new_session_id();
        let parts: Vec<&str> = id.splitn(3, '_').collect();
        assert_eq!(parts[0], "session");
        assert!(parts[1].parse::<u64>().is_ok());
        assert_eq!(parts[2].len(), 9);
        assert!(parts[2]
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert!(is_valid_session_id(&id));
        assert_ne!(new_session_id(), id);
    }

    #[test]
    fn rejects_odd_session_ids() {
        assert!(!is_valid_session_id(""));
        assert!(!is_valid_session_id("has space"));
        assert!(!is_valid_session_id("../etc"));
        assert!(!is_valid_session_id(&"a".repeat(65)));
        assert!(is_valid_session_id("client-chosen_1"));
    }

    #[test]
    fn get_conversation_is_get_or_create() {
        let registry = SessionRegistry::new(CallPolicy::default());
        let a = registry.get_conversation("s1");
        let b = registry.get_conversation("s1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("s2").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn admit_marks_and_blocks_duplicates() {
        let registry = SessionRegistry::new(CallPolicy::default());
        let conversation = registry.admit("s1").unwrap();
        assert_eq!(conversation.state(), CallState::Calling);
        assert!(conversation.call_initiated());

        assert_eq!(
            registry.admit("s1").unwrap_err(),
            AdmissionRejection::CallInitiated
        );
        let decision = registry.can_initiate_call("s1");
        assert!(!decision.allowed);
        assert_eq!(decision.reason.as_deref(), Some("Call already initiated"));
    }

    #[test]
    fn can_initiate_call_does_not_create_sessions() {
        let registry = SessionRegistry::new(CallPolicy::default());
        assert!(registry.can_initiate_call("ghost").allowed);
        assert!(registry.is_empty());
    }

    #[test]
    fn mark_call_initiated_counts_towards_global_limits() {
        let registry = SessionRegistry::new(CallPolicy {
            max_calls_per_minute: 1,
            ..Default::default()
        });
        registry.mark_call_initiated("s1");
        let rejection = registry.admit("s2").unwrap_err();
        assert!(matches!(rejection, AdmissionRejection::MinuteLimit { .. }));
    }

    #[test]
    fn remove_and_cleanup_end_conversations() {
        let registry = SessionRegistry::new(CallPolicy::default());
        let first = registry.admit("s1").unwrap();
        let second = registry.admit("s2").unwrap();

        assert!(registry.remove_conversation("s1"));
        assert!(!registry.remove_conversation("s1"));
        assert_eq!(first.state(), CallState::Ended);

        assert_eq!(registry.cleanup_all(), 1);
        assert_eq!(second.state(), CallState::Ended);
        assert!(registry.is_empty());
    }

    #[test]
    fn removed_session_keeps_its_call_history() {
        let registry = SessionRegistry::new(CallPolicy {
            max_calls_per_hour: 100,
            max_calls_per_minute: 100,
            ..CallPolicy::default()
        });
        registry.admit_at("s1", 1_000).unwrap();
        assert!(registry.remove_conversation("s1"));

        let history = registry.call_history("s1").unwrap();
        assert_eq!(history.last_call_at_ms, Some(1_000));
        assert_eq!(history.call_count, 1);
        assert!(!history.call_initiated);

        assert!(matches!(
            registry.admit_at("s1", 2_000).unwrap_err(),
            AdmissionRejection::Cooldown {
                retry_after_ms: 29_000
            }
        ));
        assert_eq!(
            registry.admit_at("s1", 40_000).unwrap_err(),
            AdmissionRejection::SessionLimit
        );
        // The recreated conversation now carries the history.
        assert!(registry.call_history("s1").is_none());
        assert_eq!(registry.get("s1").unwrap().state(), CallState::Idle);
        assert!(!registry.can_initiate_call("s1").allowed);
    }

    #[test]
    fn removing_an_unused_session_leaves_no_history() {
        let registry = SessionRegistry::new(CallPolicy::default());
        registry.get_conversation("idle");
        assert!(registry.remove_conversation("idle"));
        assert!(registry.call_history("idle").is_none());
        assert!(registry.can_initiate_call("idle").allowed);
    }
}
