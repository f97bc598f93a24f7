//! Events published to observers
//!
//! The orchestrator's only outward interface. Observers subscribe through
//! [`SelfCheckOrchestrator::events`](super::SelfCheckOrchestrator::events).

use super::session::SessionState;
use serde::Serialize;

/// Status change of a self-check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum CheckEvent {
    /// Any state transition
    Progress {
        device_id: String,
        description: String,
        /// Device is actively running the check
        checking: bool,
    },

    /// Session reached Completed or Failed
    Result {
        device_id: String,
        request_id: u64,
        state: SessionState,
        result_code: i64,
        success_count: i64,
        fail_count: i64,
    },

    /// Watchdog gave up on a session
    TimedOut { device_id: String, request_id: u64 },
}

impl CheckEvent {
    pub fn device_id(&self) -> &str {
        match self {
            CheckEvent::Progress { device_id, .. }
            | CheckEvent::Result { device_id, .. }
            | CheckEvent::TimedOut { device_id, .. } => device_id,
        }
    }

    pub(crate) fn progress(
        device_id: impl Into<String>,
        description: impl Into<String>,
        checking: bool,
    ) -> Self {
        CheckEvent::Progress {
            device_id: device_id.into(),
            description: description.into(),
            checking,
        }
    }
}
