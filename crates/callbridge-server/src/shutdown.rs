//! Graceful shutdown.

use crate::AppState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Raised by the panic hook so the server winds down as it would on a signal.
#[derive(Clone, Default)]
pub struct FaultSignal(Arc<Notify>);

impl FaultSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Safe to call from any thread, with or without a runtime.
    pub fn raise(&self) {
        self.0.notify_one();
    }

    /// Resolves once `raise` has been called, including before this was awaited.
    pub async fn raised(&self) {
        self.0.notified().await;
    }
}

/// Waits for a SIGINT (Ctrl+C), a SIGTERM or a raised fault.
pub async fn shutdown_signal(fault: FaultSignal) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
        () = fault.raised() => { tracing::warn!("unhandled panic, initiating graceful shutdown"); }
    }
}

/// Stops background work, ends every call, then waits out `grace`.
///
/// Returns the number of conversations that were ended.
pub async fn shutdown(state: &AppState, grace: Duration) -> usize {
    state.rate_limiter.stop_sweeper();
    let ended = state.registry.cleanup_all();
    tracing::info!(
        conversations = ended,
        grace_ms = grace.as_millis() as u64,
        "ended all conversations"
    );
    tokio::time::sleep(grace).await;
    ended
}

/// Routes panics through `tracing` before the default hook runs, and
/// raises the returned fault so `shutdown_signal` starts teardown.
///
/// The hook takes no locks of its own: the panicking thread may still hold
/// the registry or a conversation lock.
pub fn install_panic_hook() -> FaultSignal {
    let fault = FaultSignal::new();
    let trigger = fault.clone();
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "<unknown>".to_string());
        tracing::error!(location = %location, "panic: {}", info);
        trigger.raise();
        default_hook(info);
    }));
    fault
}
