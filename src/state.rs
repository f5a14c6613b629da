//! # Application State Management
//!
//! Shared state handed to every actix worker: the runtime-updatable
//! configuration, service counters reported by the health endpoint, and
//! the session coordinator that owns all live-session machinery.
//!
//! ## Thread Safety:
//! - `Arc` allows multiple workers to share the same state
//! - `RwLock` allows either many readers or one writer at a time

use crate::config::AppConfig;
use crate::streaming::SessionCoordinator;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Service counters exposed through the health endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AppMetrics {
    /// Sessions currently live
    pub active_sessions: usize,
    /// Sessions started since boot
    pub sessions_started: u64,
    /// Audio chunks accepted since boot
    pub chunks_received: u64,
    /// Transcripts written to the store since boot
    pub transcripts_persisted: u64,
    /// Socket-level protocol errors since boot
    pub socket_errors: u64,
}

/// Central application state shared across all connections.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub coordinator: Arc<SessionCoordinator>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        coordinator: Arc<SessionCoordinator>,
        metrics: Arc<RwLock<AppMetrics>>,
    ) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics,
            coordinator,
            start_time: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Replace the live configuration. The new value is validated before
    /// it is accepted.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write().unwrap() = new_config;
        Ok(())
    }

    pub fn metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap().clone()
    }

    pub fn record_socket_error(&self) {
        self.metrics.write().unwrap().socket_errors += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::identity::StaticIdentityProvider;
    use crate::providers::recognizer::SilentRecognizer;
    use crate::providers::translator::NoopTranslator;
    use crate::streaming::{CoordinatorConfig, StreamingEngine};
    use crate::transcripts::InMemoryTranscriptStore;
    use crate::usage::ledger::UsageLedger;
    use crate::usage::store::InMemoryUsageStore;

    fn state() -> AppState {
        let metrics = Arc::new(RwLock::new(AppMetrics::default()));
        let coordinator = Arc::new(SessionCoordinator::new(
            Arc::new(StreamingEngine::new(Arc::new(SilentRecognizer))),
            Arc::new(UsageLedger::new(Arc::new(InMemoryUsageStore::new()))),
            Arc::new(NoopTranslator),
            Arc::new(InMemoryTranscriptStore::new()),
            Arc::new(StaticIdentityProvider::new()),
            metrics.clone(),
            CoordinatorConfig::default(),
        ));
        AppState::new(AppConfig::default(), coordinator, metrics)
    }

    #[test]
    fn metrics_start_at_zero() {
        let state = state();
        let snapshot = state.metrics_snapshot();
        assert_eq!(snapshot.active_sessions, 0);
        assert_eq!(snapshot.sessions_started, 0);
        assert_eq!(snapshot.socket_errors, 0);
    }

    #[test]
    fn socket_errors_are_counted() {
        let state = state();
        state.record_socket_error();
        state.record_socket_error();
        assert_eq!(state.metrics_snapshot().socket_errors, 2);
    }
}
