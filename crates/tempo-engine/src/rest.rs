use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tempo_core::{
    ApiError, CreateSessionRequest, ServerSessionId, SessionApi, UpdateSessionRequest,
};
use tracing::instrument;

const SESSIONS_PATH: &str = "/api/timer/sessions";

#[derive(Deserialize)]
struct CreatedSession {
    id: ServerSessionId,
}

/// [`SessionApi`] over the dashboard's REST endpoints.
pub struct HttpSessionApi {
    client: Client,
    base_url: String,
    token: Option<SecretString>,
}

impl HttpSessionApi {
    pub fn new(
        base_url: &str,
        token: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn sessions_url(&self) -> String {
        format!("{}{}", self.base_url, SESSIONS_PATH)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token.expose_secret()),
            None => req,
        }
    }
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    Err(ApiError::from_status(status, body))
}

#[async_trait]
impl SessionApi for HttpSessionApi {
    #[instrument(skip(self, request), fields(session_type = %request.session_type.wire_name()))]
    async fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> Result<ServerSessionId, ApiError> {
        let resp = self
            .authorize(self.client.post(self.sessions_url()))
            .json(request)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        let created: CreatedSession = check(resp)
            .await?
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        Ok(created.id)
    }

    #[instrument(skip(self, id, update), fields(id = %id))]
    async fn update_session(
        &self,
        id: ServerSessionId,
        update: &UpdateSessionRequest,
    ) -> Result<(), ApiError> {
        let url = format!("{}/{}", self.sessions_url(), id);
        let resp = self
            .authorize(self.client.put(url))
            .json(update)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        check(resp).await?;
        Ok(())
    }
}
