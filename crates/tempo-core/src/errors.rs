use crate::session::SessionStatus;

/// Failure of a call against the session REST API.
/// Classifies errors as conflict, fatal for the request, or retryable.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    // The user already has an active session on the server.
    #[error("session conflict: {0}")]
    Conflict(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // Retryable
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),

    #[error("malformed response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ServerError { .. } | Self::Network(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Conflict(_) => "conflict",
            Self::Unauthorized(_) => "unauthorized",
            Self::NotFound(_) => "not_found",
            Self::InvalidRequest(_) => "invalid_request",
            Self::ServerError { .. } => "server_error",
            Self::Network(_) => "network_error",
            Self::Decode(_) => "decode_error",
        }
    }

    /// Classify an HTTP status code into the appropriate error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            409 => Self::Conflict(body),
            401 | 403 => Self::Unauthorized(body),
            404 => Self::NotFound(body),
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }
}

/// Everything the synchronization engine can report.
///
/// Only conflicts, exhausted persistence and exhausted reconnects ever reach
/// the UI port; connection and protocol faults stay inside the transport.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum SyncError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("session conflict: {0}")]
    SessionConflict(String),

    #[error("session update not persisted after {attempts} attempts: {last_error}")]
    PersistenceRetryExhausted { attempts: u32, last_error: String },

    #[error("gave up reconnecting after {max_attempts} attempts; reconnect manually")]
    MaxRetriesExceeded { max_attempts: u32 },

    #[error("session api error: {0}")]
    Api(ApiError),

    #[error("cannot {action} a session that is {status}")]
    InvalidTransition {
        action: &'static str,
        status: SessionStatus,
    },

    #[error("planned duration must be greater than zero")]
    InvalidDuration,

    #[error("engine has shut down")]
    EngineStopped,
}

impl SyncError {
    /// The transport will not recover without a manual reconnect.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::MaxRetriesExceeded { .. })
    }

    /// Non-fatal conditions the UI shows as a warning.
    pub fn is_warning(&self) -> bool {
        matches!(self, Self::PersistenceRetryExhausted { .. })
    }

    /// Whether this error crosses the boundary to the UI collaborator.
    pub fn is_surfaced(&self) -> bool {
        matches!(
            self,
            Self::SessionConflict(_)
                | Self::PersistenceRetryExhausted { .. }
                | Self::MaxRetriesExceeded { .. }
                | Self::Api(_)
        )
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Protocol(_) => "protocol",
            Self::SessionConflict(_) => "session_conflict",
            Self::PersistenceRetryExhausted { .. } => "persistence_retry_exhausted",
            Self::MaxRetriesExceeded { .. } => "max_retries_exceeded",
            Self::Api(_) => "api",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::InvalidDuration => "invalid_duration",
            Self::EngineStopped => "engine_stopped",
        }
    }
}

impl From<ApiError> for SyncError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Conflict(body) => Self::SessionConflict(body),
            other => Self::Api(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ApiError::Network("reset".into()).is_retryable());
        assert!(ApiError::ServerError { status: 503, body: "busy".into() }.is_retryable());
        assert!(!ApiError::Conflict("active".into()).is_retryable());
        assert!(!ApiError::NotFound("gone".into()).is_retryable());
        assert!(!ApiError::Unauthorized("expired".into()).is_retryable());
    }

    #[test]
    fn from_status_mapping() {
        assert!(ApiError::from_status(409, "active session".into()).is_conflict());
        assert!(matches!(ApiError::from_status(401, String::new()), ApiError::Unauthorized(_)));
        assert!(matches!(ApiError::from_status(403, String::new()), ApiError::Unauthorized(_)));
        assert!(matches!(ApiError::from_status(404, String::new()), ApiError::NotFound(_)));
        assert!(ApiError::from_status(500, "internal".into()).is_retryable());
        assert!(ApiError::from_status(502, "bad gateway".into()).is_retryable());
        assert!(matches!(ApiError::from_status(422, "bad".into()), ApiError::InvalidRequest(_)));
    }

    #[test]
    fn conflict_converts_to_session_conflict() {
        let err: SyncError = ApiError::Conflict("already running".into()).into();
        assert_eq!(err, SyncError::SessionConflict("already running".into()));

        let err: SyncError = ApiError::Network("tcp".into()).into();
        assert!(matches!(err, SyncError::Api(ApiError::Network(_))));
    }

    #[test]
    fn surfaced_classification() {
        assert!(SyncError::SessionConflict("x".into()).is_surfaced());
        assert!(SyncError::MaxRetriesExceeded { max_attempts: 5 }.is_surfaced());
        let exhausted = SyncError::PersistenceRetryExhausted {
            attempts: 4,
            last_error: "x".into(),
        };
        assert!(exhausted.is_surfaced());
        assert!(!SyncError::Connection("refused".into()).is_surfaced());
        assert!(!SyncError::Protocol("bad json".into()).is_surfaced());
    }

    #[test]
    fn only_max_retries_is_fatal() {
        assert!(SyncError::MaxRetriesExceeded { max_attempts: 5 }.is_fatal());
        assert!(!SyncError::SessionConflict("x".into()).is_fatal());
        let exhausted = SyncError::PersistenceRetryExhausted {
            attempts: 1,
            last_error: "x".into(),
        };
        assert!(exhausted.is_warning());
    }

    #[test]
    fn invalid_transition_display() {
        let err = SyncError::InvalidTransition {
            action: "pause",
            status: SessionStatus::Idle,
        };
        assert_eq!(err.to_string(), "cannot pause a session that is idle");
        assert_eq!(err.error_kind(), "invalid_transition");
    }
}
