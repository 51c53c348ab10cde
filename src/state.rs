//! # Application State Management
//!
//! Shared state handed to every HTTP handler through `web::Data`.
//!
//! ## What lives here:
//! - **Configuration**: loaded once at startup, read-only afterwards
//! - **Conversation client**: opens a realtime session per WebSocket connection
//! - **Conversation metrics**: active/total counts and how conversations ended
//!
//! Per-connection state (socket halves, cancellation token, transcript) does not
//! live here; it is created by the upgrade handler and owned by that
//! conversation's dispatcher.
//!
//! ## Arc<RwLock<T>> Pattern
//! Handlers run on several actix worker threads at once, so the mutable metrics
//! are shared through `Arc` and guarded by an `RwLock`. Locks are held only for
//! a counter update or a snapshot copy.

use crate::config::AppConfig;
use crate::conversation::realtime::RealtimeClient;
use crate::conversation::TerminationCause;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,

    /// Realtime service client shared by all connections
    pub client: RealtimeClient,

    pub metrics: Arc<RwLock<ConversationMetrics>>,

    /// When the server started
    pub start_time: Instant,
}

/// Conversation counters since server start.
#[derive(Debug, Default, Clone)]
pub struct ConversationMetrics {
    /// Conversations currently holding a slot
    pub active: u32,

    pub total: u64,

    /// Upgrade requests turned away at the concurrency limit
    pub rejected: u64,

    /// Finished conversations keyed by how they ended
    pub outcomes: HashMap<String, u64>,
}

/// A conversation slot; gives the slot back when dropped.
#[derive(Debug)]
pub struct ConversationGuard {
    metrics: Arc<RwLock<ConversationMetrics>>,
}

impl Drop for ConversationGuard {
    fn drop(&mut self) {
        let mut metrics = write(&self.metrics);
        metrics.active = metrics.active.saturating_sub(1);
    }
}

fn read(metrics: &RwLock<ConversationMetrics>) -> RwLockReadGuard<'_, ConversationMetrics> {
    metrics.read().unwrap_or_else(PoisonError::into_inner)
}

fn write(metrics: &RwLock<ConversationMetrics>) -> RwLockWriteGuard<'_, ConversationMetrics> {
    metrics.write().unwrap_or_else(PoisonError::into_inner)
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let client = RealtimeClient::from_config(&config);
        Self {
            config: Arc::new(config),
            client,
            metrics: Arc::new(RwLock::new(ConversationMetrics::default())),
            start_time: Instant::now(),
        }
    }

    pub fn get_config(&self) -> &AppConfig {
        &self.config
    }

    /// Claim a conversation slot if fewer than `max_concurrent_sessions` are active.
    ///
    /// ## Returns:
    /// - `Some(guard)`: the slot is held until the guard is dropped
    /// - `None`: the server is at its limit; the rejection is counted
    pub fn try_begin_conversation(&self) -> Option<ConversationGuard> {
        let limit = self.config.performance.max_concurrent_sessions;
        let mut metrics = write(&self.metrics);
        if metrics.active as usize >= limit {
            metrics.rejected += 1;
            return None;
        }
        metrics.active += 1;
        metrics.total += 1;
        Some(ConversationGuard {
            metrics: self.metrics.clone(),
        })
    }

    pub fn record_outcome(&self, cause: &TerminationCause) {
        let mut metrics = write(&self.metrics);
        *metrics.outcomes.entry(cause.as_str().to_string()).or_default() += 1;
    }

    /// Record a conversation whose session never started.
    pub fn record_failed_start(&self) {
        let mut metrics = write(&self.metrics);
        *metrics.outcomes.entry("start_failed".to_string()).or_default() += 1;
    }

    pub fn get_metrics_snapshot(&self) -> ConversationMetrics {
        read(&self.metrics).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_limit(limit: usize) -> AppState {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = limit;
        AppState::new(config)
    }

    #[test]
    fn test_conversation_slots_respect_limit() {
        let state = state_with_limit(2);
        let first = state.try_begin_conversation();
        let second = state.try_begin_conversation();
        assert!(first.is_some() && second.is_some());
        assert!(state.try_begin_conversation().is_none());

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.active, 2);
        assert_eq!(metrics.total, 2);
        assert_eq!(metrics.rejected, 1);

        drop(first);
        assert_eq!(state.get_metrics_snapshot().active, 1);
        assert!(state.try_begin_conversation().is_some());
    }

    #[test]
    fn test_outcomes_are_counted_by_cause() {
        let state = state_with_limit(1);
        state.record_outcome(&TerminationCause::FinishToolInvoked);
        state.record_outcome(&TerminationCause::FinishToolInvoked);
        state.record_outcome(&TerminationCause::SessionError("boom".to_string()));
        state.record_failed_start();

        let outcomes = state.get_metrics_snapshot().outcomes;
        assert_eq!(outcomes["finished"], 2);
        assert_eq!(outcomes["session_error"], 1);
        assert_eq!(outcomes["start_failed"], 1);
    }
}
