use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{LocalSessionId, ServerSessionId};

/// Timer modes. Wire names follow the dashboard backend's `session_type`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionKind {
    #[serde(rename = "pomodoro", alias = "focus")]
    Focus,
    #[serde(rename = "break")]
    Break,
    #[serde(rename = "long-break", alias = "long_break")]
    LongBreak,
}

impl SessionKind {
    /// The mode selected automatically after a session of this kind completes.
    pub fn next_in_cadence(self) -> Self {
        match self {
            Self::Focus => Self::Break,
            Self::Break | Self::LongBreak => Self::Focus,
        }
    }

    /// `session_type` value used by the REST API.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Focus => "pomodoro",
            Self::Break => "break",
            Self::LongBreak => "long-break",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Focus => "focus",
            Self::Break => "break",
            Self::LongBreak => "long break",
        }
    }
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Aborted,
}

impl SessionStatus {
    /// Running or paused; at most one such session exists per user.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task a focus session is attached to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    pub id: i64,
    pub title: String,
}

/// Planned length of each mode, in seconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CadenceDurations {
    pub focus_seconds: u32,
    pub break_seconds: u32,
    pub long_break_seconds: u32,
}

impl Default for CadenceDurations {
    fn default() -> Self {
        Self::from_minutes(25, 5, 15)
    }
}

impl CadenceDurations {
    /// Build from the minute values the pomodoro settings endpoint returns.
    pub fn from_minutes(work: u32, short_break: u32, long_break: u32) -> Self {
        Self {
            focus_seconds: work.saturating_mul(60),
            break_seconds: short_break.saturating_mul(60),
            long_break_seconds: long_break.saturating_mul(60),
        }
    }

    pub fn for_kind(&self, kind: SessionKind) -> u32 {
        match kind {
            SessionKind::Focus => self.focus_seconds,
            SessionKind::Break => self.break_seconds,
            SessionKind::LongBreak => self.long_break_seconds,
        }
    }
}

/// The single local timer session.
///
/// Fields are public for the state machine that owns it; nothing else should
/// mutate one directly.
#[derive(Clone, Debug, PartialEq)]
pub struct TimerSession {
    pub local_id: LocalSessionId,
    pub server_session_id: Option<ServerSessionId>,
    pub kind: SessionKind,
    pub planned_seconds: u32,
    pub remaining_seconds: u32,
    pub status: SessionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub last_server_sync_at: Option<DateTime<Utc>>,
    pub task: Option<TaskRef>,
}

impl TimerSession {
    pub fn new(kind: SessionKind, planned_seconds: u32) -> Self {
        Self {
            local_id: LocalSessionId::new(),
            server_session_id: None,
            kind,
            planned_seconds,
            remaining_seconds: planned_seconds,
            status: SessionStatus::Idle,
            started_at: None,
            last_server_sync_at: None,
            task: None,
        }
    }

    pub fn elapsed_seconds(&self) -> u32 {
        self.planned_seconds.saturating_sub(self.remaining_seconds)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            local_id: self.local_id.clone(),
            server_session_id: self.server_session_id,
            kind: self.kind,
            status: self.status,
            planned_seconds: self.planned_seconds,
            remaining_seconds: self.remaining_seconds,
            started_at: self.started_at,
            last_server_sync_at: self.last_server_sync_at,
            task: self.task.clone(),
        }
    }
}

/// Read-only view handed to UI collaborators.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub local_id: LocalSessionId,
    pub server_session_id: Option<ServerSessionId>,
    pub kind: SessionKind,
    pub status: SessionStatus,
    pub planned_seconds: u32,
    pub remaining_seconds: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub last_server_sync_at: Option<DateTime<Utc>>,
    pub task: Option<TaskRef>,
}

impl SessionSnapshot {
    /// Fraction of the planned time already elapsed, in `0.0..=1.0`.
    pub fn progress(&self) -> f64 {
        if self.planned_seconds == 0 {
            return 0.0;
        }
        let elapsed = self.planned_seconds.saturating_sub(self.remaining_seconds);
        f64::from(elapsed) / f64::from(self.planned_seconds)
    }

    /// `mm:ss` rendering of the remaining time.
    pub fn format_remaining(&self) -> String {
        format!(
            "{:02}:{:02}",
            self.remaining_seconds / 60,
            self.remaining_seconds % 60
        )
    }
}

/// Body of `POST /api/timer/sessions`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub session_type: SessionKind,
    pub duration_planned: u32,
    pub task_id: Option<i64>,
    pub task_title: Option<String>,
}

impl CreateSessionRequest {
    pub fn for_session(session: &TimerSession) -> Self {
        Self {
            session_type: session.kind,
            duration_planned: session.planned_seconds,
            task_id: session.task.as_ref().map(|t| t.id),
            task_title: session.task.as_ref().map(|t| t.title.clone()),
        }
    }
}

/// Body of `PUT /api/timer/sessions/{id}`. Unset fields are left untouched
/// server-side, so a pause only reports progress.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSessionRequest {
    pub duration_actual: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub was_completed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl UpdateSessionRequest {
    pub fn progress(session: &TimerSession) -> Self {
        Self {
            duration_actual: session.elapsed_seconds(),
            was_completed: None,
            ended_at: None,
        }
    }

    pub fn ended(session: &TimerSession, was_completed: bool, at: DateTime<Utc>) -> Self {
        Self {
            duration_actual: session.elapsed_seconds(),
            was_completed: Some(was_completed),
            ended_at: Some(at),
        }
    }

    pub fn is_final(&self) -> bool {
        self.was_completed.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_wire_names_match_backend() {
        assert_eq!(serde_json::to_string(&SessionKind::Focus).unwrap(), "\"pomodoro\"");
        assert_eq!(serde_json::to_string(&SessionKind::Break).unwrap(), "\"break\"");
        assert_eq!(serde_json::to_string(&SessionKind::LongBreak).unwrap(), "\"long-break\"");
        let parsed: SessionKind = serde_json::from_str("\"focus\"").unwrap();
        assert_eq!(parsed, SessionKind::Focus);
        for kind in [SessionKind::Focus, SessionKind::Break, SessionKind::LongBreak] {
            assert_eq!(serde_json::to_string(&kind).unwrap(), format!("\"{}\"", kind.wire_name()));
        }
    }

    #[test]
    fn cadence_alternates_between_focus_and_break() {
        assert_eq!(SessionKind::Focus.next_in_cadence(), SessionKind::Break);
        assert_eq!(SessionKind::Break.next_in_cadence(), SessionKind::Focus);
        assert_eq!(SessionKind::LongBreak.next_in_cadence(), SessionKind::Focus);
    }

    #[test]
    fn default_cadence_is_classic_pomodoro() {
        let cadence = CadenceDurations::default();
        assert_eq!(cadence.for_kind(SessionKind::Focus), 1500);
        assert_eq!(cadence.for_kind(SessionKind::Break), 300);
        assert_eq!(cadence.for_kind(SessionKind::LongBreak), 900);
    }

    #[test]
    fn new_session_is_idle_and_full() {
        let s = TimerSession::new(SessionKind::Focus, 1500);
        assert_eq!(s.status, SessionStatus::Idle);
        assert_eq!(s.remaining_seconds, 1500);
        assert!(s.server_session_id.is_none());
        assert_eq!(s.elapsed_seconds(), 0);
    }

    #[test]
    fn snapshot_formatting() {
        let mut s = TimerSession::new(SessionKind::Focus, 1500);
        s.remaining_seconds = 754;
        let snap = s.snapshot();
        assert_eq!(snap.format_remaining(), "12:34");
        assert!((snap.progress() - 746.0 / 1500.0).abs() < 1e-9);
    }

    #[test]
    fn progress_update_omits_end_fields() {
        let mut s = TimerSession::new(SessionKind::Focus, 60);
        s.remaining_seconds = 45;
        let json = serde_json::to_value(UpdateSessionRequest::progress(&s)).unwrap();
        assert_eq!(json, serde_json::json!({ "duration_actual": 15 }));
    }

    #[test]
    fn create_request_carries_task() {
        let mut s = TimerSession::new(SessionKind::Focus, 1500);
        s.task = Some(TaskRef { id: 9, title: "Write report".into() });
        let json = serde_json::to_value(CreateSessionRequest::for_session(&s)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "session_type": "pomodoro",
                "duration_planned": 1500,
                "task_id": 9,
                "task_title": "Write report"
            })
        );
    }
}
