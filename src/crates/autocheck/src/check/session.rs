//! In-flight self-check sessions

use super::protocol::NoticeState;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt;
use tokio::time::Instant;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SessionState {
    /// Command published, device has not started
    Sent,
    /// Device reported the check running
    Started,
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }

    /// Whether the device is actively running the check
    pub fn is_checking(&self) -> bool {
        matches!(self, SessionState::Started)
    }

    /// Effect of a progress notice in this state
    pub fn on_notice(&self, notice: &NoticeState) -> Step {
        match (self, notice) {
            (SessionState::Sent, NoticeState::CmdSent) => Step::Ack,
            (SessionState::Sent, NoticeState::Started) => Step::Advance(SessionState::Started),
            (SessionState::Sent | SessionState::Started, NoticeState::Completed) => {
                Step::Advance(SessionState::Completed)
            }
            (_, NoticeState::Unknown(state)) => Step::Ignore(format!("unknown state {}", state)),
            (state, notice) => Step::Ignore(format!("{:?} in state {}", notice, state)),
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Sent => write!(f, "Sent"),
            SessionState::Started => write!(f, "Started"),
            SessionState::Completed => write!(f, "Completed"),
            SessionState::Failed => write!(f, "Failed"),
        }
    }
}

/// What a notice does to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Acknowledged, no state change
    Ack,
    Advance(SessionState),
    /// Duplicate, stale or unknown; dropped
    Ignore(String),
}

/// One tracked request/response lifecycle
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelfCheckSession {
    pub request_id: u64,
    pub device_id: String,
    pub state: SessionState,
    pub progress_description: String,
    pub started_at: DateTime<Local>,
    pub finished_at: Option<DateTime<Local>>,
    /// Last time a notice touched the session; drives the watchdog
    #[serde(skip)]
    pub last_activity: Instant,
}

impl SelfCheckSession {
    pub fn new(request_id: u64, device_id: impl Into<String>) -> Self {
        Self {
            request_id,
            device_id: device_id.into(),
            state: SessionState::Sent,
            progress_description: String::new(),
            started_at: Local::now(),
            finished_at: None,
            last_activity: Instant::now(),
        }
    }

    /// Record a progress update
    pub fn touch(&mut self, description: &str) {
        if !description.is_empty() {
            self.progress_description = description.to_string();
        }
        self.last_activity = Instant::now();
    }

    /// Move to a terminal state and stamp the finish time
    pub fn finish(&mut self, state: SessionState, description: impl Into<String>) {
        self.state = state;
        self.progress_description = description.into();
        self.finished_at = Some(Local::now());
    }

    /// Whether the session has been quiet for at least `timeout`
    pub fn is_stale(&self, now: Instant, timeout: std::time::Duration) -> bool {
        now.saturating_duration_since(self.last_activity) >= timeout
    }
}
