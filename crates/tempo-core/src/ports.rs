//! Capabilities the engine consumes from its host.

use async_trait::async_trait;
use secrecy::SecretString;

use crate::errors::{ApiError, SyncError};
use crate::ids::ServerSessionId;
use crate::session::{CreateSessionRequest, SessionSnapshot, UpdateSessionRequest};

/// Who the engine connects as. The token comes from the host's token store.
#[derive(Debug)]
pub struct Identity {
    pub user_id: String,
    pub token: Option<SecretString>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(SecretString::from(token.into()));
        self
    }
}

/// Desktop notification and sound playback.
pub trait NotificationPort: Send + Sync {
    fn notify(&self, title: &str, body: &str);
    fn play_alert(&self);
}

/// Rendering surface for session snapshots and surfaced errors.
pub trait UiPort: Send + Sync {
    fn render(&self, snapshot: &SessionSnapshot);
    fn report(&self, error: &SyncError);
}

/// Server-side session persistence.
#[async_trait]
pub trait SessionApi: Send + Sync {
    async fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> Result<ServerSessionId, ApiError>;

    async fn update_session(
        &self,
        id: ServerSessionId,
        update: &UpdateSessionRequest,
    ) -> Result<(), ApiError>;
}
