use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::SessionStatus;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProctorState {
    pub status: SessionStatus,
    pub session_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    /// Backend-authoritative count from the last logged violation.
    pub warning_count: u32,
    pub violations_reported: u32,
    pub violations_suppressed: u32,
    /// Monotonic start, used for the grace window.
    #[serde(skip)]
    pub started_at_ms: Option<u64>,
}

impl Default for ProctorState {
    fn default() -> Self {
        Self {
            status: SessionStatus::Idle,
            session_id: None,
            started_at: None,
            warning_count: 0,
            violations_reported: 0,
            violations_suppressed: 0,
            started_at_ms: None,
        }
    }
}

impl ProctorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_session(&mut self, session_id: String, start_at: DateTime<Utc>, now_ms: u64) {
        *self = Self {
            status: SessionStatus::Running,
            session_id: Some(session_id),
            started_at: Some(start_at),
            started_at_ms: Some(now_ms),
            ..Self::default()
        };
    }

    pub fn is_running(&self) -> bool {
        self.status == SessionStatus::Running
    }

    pub fn in_grace_period(&self, now_ms: u64, grace_ms: u64) -> bool {
        match (self.status, self.started_at_ms) {
            (SessionStatus::Running, Some(started)) => now_ms.saturating_sub(started) < grace_ms,
            _ => false,
        }
    }

    /// Terminal states are sticky: a terminated session never reads as ended.
    pub fn finish(&mut self, status: SessionStatus) {
        if self.status == SessionStatus::Terminated {
            return;
        }
        self.status = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grace_window_counts_from_start() {
        let mut state = ProctorState::new();
        assert!(!state.in_grace_period(0, 5_000));

        state.begin_session("attempt-1".into(), Utc::now(), 1_000);
        assert!(state.in_grace_period(1_000, 5_000));
        assert!(state.in_grace_period(5_999, 5_000));
        assert!(!state.in_grace_period(6_000, 5_000));
    }

    #[test]
    fn terminated_is_sticky() {
        let mut state = ProctorState::new();
        state.begin_session("attempt-1".into(), Utc::now(), 0);
        state.finish(SessionStatus::Terminated);
        state.finish(SessionStatus::Ended);
        assert_eq!(state.status, SessionStatus::Terminated);
        assert!(!state.in_grace_period(0, 5_000));
    }
}
