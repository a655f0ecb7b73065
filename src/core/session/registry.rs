//! Session registry.
//!
//! An owned table of live sessions indexed by call id, with explicit
//! creation on call start and explicit teardown on call end. Nothing in the
//! pipeline relies on ambient global state; every lookup goes through here.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::{info, warn};

use super::coordinator::{SessionDeps, SessionHandle, spawn_session};
use crate::core::metrics::MetricsSummary;
use crate::core::transcript::{CallId, TranscriptEvent};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("call {0} is already active")]
    AlreadyActive(CallId),
    #[error("no active session for call {0}")]
    UnknownCall(CallId),
    #[error("session for call {0} has terminated")]
    SessionClosed(CallId),
}

/// Owns every per-call session in the process.
pub struct SessionRegistry {
    deps: SessionDeps,
    sessions: RwLock<HashMap<CallId, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new(deps: SessionDeps) -> Self {
        Self {
            deps,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Creates and starts a session for a new call.
    pub fn on_call_start(&self, call_id: CallId) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write();
        if let Some(existing) = sessions.get(&call_id) {
            if !existing.is_finished() {
                return Err(RegistryError::AlreadyActive(call_id));
            }
            // A finished session under this id is stale; replace it
            warn!(call = %call_id, "replacing terminated session");
        }
        let handle = spawn_session(call_id.clone(), self.deps.clone());
        sessions.insert(call_id.clone(), handle);
        info!(call = %call_id, "call registered");
        Ok(())
    }

    /// Routes a transcript event to the call's session.
    pub async fn transcript(
        &self,
        call_id: &CallId,
        event: TranscriptEvent,
    ) -> Result<(), RegistryError> {
        let handle = {
            let sessions = self.sessions.read();
            let handle = sessions
                .get(call_id)
                .ok_or_else(|| RegistryError::UnknownCall(call_id.clone()))?;
            // Clone the sender side out of the lock before awaiting
            handle.sender()
        };
        handle
            .send(super::coordinator::SessionEvent::Transcript(event))
            .await
            .map_err(|_| RegistryError::SessionClosed(call_id.clone()))
    }

    /// Tears down the call's session: pending speculation aborted, delivery
    /// queue dropped, metrics flushed, all within the configured grace.
    /// Returns the final metrics summary if the call existed.
    pub async fn on_call_end(&self, call_id: &CallId) -> Option<MetricsSummary> {
        let handle = self.sessions.write().remove(call_id)?;
        let tracker = handle.tracker();
        handle.shutdown(self.deps.config.shutdown_grace).await;
        let summary = tracker.summary();
        info!(
            call = %call_id,
            cycles = summary.cycles,
            "call unregistered"
        );
        Some(summary)
    }

    /// Number of sessions that are registered and still running.
    pub fn active_calls(&self) -> usize {
        self.sessions
            .read()
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Metrics tracker for a live call.
    pub fn tracker(&self, call_id: &CallId) -> Option<std::sync::Arc<crate::core::metrics::CycleTracker>> {
        self.sessions.read().get(call_id).map(|h| h.tracker())
    }

    /// Ends every registered call. Used at process shutdown.
    pub async fn shutdown_all(&self) {
        let handles: Vec<(CallId, SessionHandle)> = self.sessions.write().drain().collect();
        for (call_id, handle) in handles {
            info!(call = %call_id, "shutting down session");
            handle.shutdown(self.deps.config.shutdown_grace).await;
        }
    }
}
