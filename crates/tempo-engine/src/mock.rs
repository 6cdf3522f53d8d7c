use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempo_core::{
    ApiError, CreateSessionRequest, NotificationPort, ServerSessionId, SessionApi,
    SessionSnapshot, SyncError, UiPort, UpdateSessionRequest,
};

/// Session API with scripted answers. Unscripted creates succeed with
/// increasing ids; unscripted updates succeed.
pub struct MockSessionApi {
    create_results: Mutex<VecDeque<Result<ServerSessionId, ApiError>>>,
    update_results: Mutex<VecDeque<Result<(), ApiError>>>,
    create_delay: Option<Duration>,
    next_id: AtomicI64,
    creates: Mutex<Vec<CreateSessionRequest>>,
    updates: Mutex<Vec<(ServerSessionId, UpdateSessionRequest)>>,
}

impl MockSessionApi {
    pub fn new() -> Self {
        Self {
            create_results: Mutex::new(VecDeque::new()),
            update_results: Mutex::new(VecDeque::new()),
            create_delay: None,
            next_id: AtomicI64::new(1),
            creates: Mutex::new(Vec::new()),
            updates: Mutex::new(Vec::new()),
        }
    }

    /// Hold every create response for `delay`.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    pub fn push_create(&self, result: Result<ServerSessionId, ApiError>) {
        self.create_results.lock().push_back(result);
    }

    pub fn push_update(&self, result: Result<(), ApiError>) {
        self.update_results.lock().push_back(result);
    }

    pub fn creates(&self) -> Vec<CreateSessionRequest> {
        self.creates.lock().clone()
    }

    /// Every update attempt, including failed ones.
    pub fn updates(&self) -> Vec<(ServerSessionId, UpdateSessionRequest)> {
        self.updates.lock().clone()
    }
}

impl Default for MockSessionApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionApi for MockSessionApi {
    async fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> Result<ServerSessionId, ApiError> {
        self.creates.lock().push(request.clone());
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.create_results.lock().pop_front();
        match scripted {
            Some(result) => result,
            None => Ok(ServerSessionId(self.next_id.fetch_add(1, Ordering::SeqCst))),
        }
    }

    async fn update_session(
        &self,
        id: ServerSessionId,
        update: &UpdateSessionRequest,
    ) -> Result<(), ApiError> {
        self.updates.lock().push((id, update.clone()));
        let scripted = self.update_results.lock().pop_front();
        scripted.unwrap_or(Ok(()))
    }
}

/// UI port that keeps everything it is shown.
#[derive(Default)]
pub struct RecordingUi {
    renders: Mutex<Vec<SessionSnapshot>>,
    reports: Mutex<Vec<SyncError>>,
}

impl RecordingUi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn renders(&self) -> Vec<SessionSnapshot> {
        self.renders.lock().clone()
    }

    pub fn last_render(&self) -> Option<SessionSnapshot> {
        self.renders.lock().last().cloned()
    }

    pub fn reports(&self) -> Vec<SyncError> {
        self.reports.lock().clone()
    }
}

impl UiPort for RecordingUi {
    fn render(&self, snapshot: &SessionSnapshot) {
        self.renders.lock().push(snapshot.clone());
    }

    fn report(&self, error: &SyncError) {
        self.reports.lock().push(error.clone());
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    notifications: Mutex<Vec<(String, String)>>,
    alerts: AtomicUsize,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<(String, String)> {
        self.notifications.lock().clone()
    }

    pub fn alert_count(&self) -> usize {
        self.alerts.load(Ordering::SeqCst)
    }
}

impl NotificationPort for RecordingNotifier {
    fn notify(&self, title: &str, body: &str) {
        self.notifications.lock().push((title.to_string(), body.to_string()));
    }

    fn play_alert(&self) {
        self.alerts.fetch_add(1, Ordering::SeqCst);
    }
}
