use std::sync::Arc;
use std::time::Duration;

use tempo_core::{
    ApiError, LocalSessionId, Message, NotificationPort, ServerSessionId, SessionApi, SyncError,
    TimerUpdate, UiPort, UpdateSessionRequest,
};
use tempo_transport::TransportManager;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::machine::{RemoteOutcome, SessionEffect, SessionStateMachine};

pub const COMPLETE_TITLE: &str = "Timer Complete!";

/// Answer to a create request, posted back to the engine's mailbox.
#[derive(Debug)]
pub struct CreateOutcome {
    pub local_id: LocalSessionId,
    pub result: Result<ServerSessionId, ApiError>,
}

/// Retry schedule for fire-and-forget session updates.
#[derive(Clone, Copy, Debug)]
pub struct PersistRetry {
    /// Retries after the first failed attempt.
    pub limit: u32,
    pub delay: Duration,
}

struct PersistJob {
    local_id: LocalSessionId,
    server_id: ServerSessionId,
    request: UpdateSessionRequest,
}

/// Executes the state machine's effects against the ports and merges
/// inbound realtime updates. Holds no session state of its own.
pub struct SyncCoordinator {
    api: Arc<dyn SessionApi>,
    ui: Arc<dyn UiPort>,
    notifier: Arc<dyn NotificationPort>,
    transport: Arc<TransportManager>,
    outcomes: mpsc::UnboundedSender<CreateOutcome>,
    persist: mpsc::UnboundedSender<PersistJob>,
}

impl SyncCoordinator {
    /// Spawns the persistence worker; must be called inside a tokio runtime.
    pub fn new(
        api: Arc<dyn SessionApi>,
        ui: Arc<dyn UiPort>,
        notifier: Arc<dyn NotificationPort>,
        transport: Arc<TransportManager>,
        outcomes: mpsc::UnboundedSender<CreateOutcome>,
        retry: PersistRetry,
    ) -> Self {
        let (persist, jobs) = mpsc::unbounded_channel();
        tokio::spawn(persistence_worker(
            Arc::clone(&api),
            Arc::clone(&ui),
            retry,
            jobs,
        ));
        Self {
            api,
            ui,
            notifier,
            transport,
            outcomes,
            persist,
        }
    }

    pub fn execute(&self, effects: Vec<SessionEffect>) {
        for effect in effects {
            match effect {
                SessionEffect::Create { local_id, request } => {
                    let api = Arc::clone(&self.api);
                    let outcomes = self.outcomes.clone();
                    tokio::spawn(async move {
                        let result = api.create_session(&request).await;
                        if outcomes.send(CreateOutcome { local_id, result }).is_err() {
                            debug!("engine gone before create completed");
                        }
                    });
                }
                SessionEffect::Update {
                    local_id,
                    server_id,
                    request,
                } => {
                    let job = PersistJob {
                        local_id,
                        server_id,
                        request,
                    };
                    if self.persist.send(job).is_err() {
                        warn!(session = %server_id, "persistence worker stopped, update dropped");
                    }
                }
                SessionEffect::Completed(snapshot) => {
                    let body = format!("Your {} session is finished.", snapshot.kind.wire_name());
                    self.notifier.notify(COMPLETE_TITLE, &body);
                    self.notifier.play_alert();
                }
                SessionEffect::Publish(update) => self.publish(&update),
            }
        }
    }

    /// Settle a create request. On failure the start is rolled back and the
    /// error is reported; there is no automatic retry.
    pub fn on_created(
        &self,
        machine: &mut SessionStateMachine,
        outcome: CreateOutcome,
    ) -> Result<ServerSessionId, SyncError> {
        match outcome.result {
            Ok(server_id) => {
                info!(session = %outcome.local_id, server_id = %server_id, "session created");
                let effects = machine.confirm_created(&outcome.local_id, server_id);
                self.execute(effects);
                self.render(machine);
                Ok(server_id)
            }
            Err(api_err) => {
                let err = SyncError::from(api_err);
                warn!(
                    session = %outcome.local_id,
                    error = %err,
                    kind = err.error_kind(),
                    "create rejected"
                );
                machine.reject_created(&outcome.local_id);
                self.render(machine);
                self.ui.report(&err);
                Err(err)
            }
        }
    }

    /// Merge an inbound `timer_update`. Malformed payloads are dropped.
    pub fn reconcile(
        &self,
        machine: &mut SessionStateMachine,
        message: &Message,
    ) -> Option<RemoteOutcome> {
        let (update, at) = match TimerUpdate::from_message(message) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(error = %err, "dropping timer_update");
                return None;
            }
        };
        let outcome = machine.apply_remote(&update, at);
        if outcome == RemoteOutcome::Applied {
            self.render(machine);
        }
        Some(outcome)
    }

    pub fn render(&self, machine: &SessionStateMachine) {
        self.ui.render(&machine.snapshot());
    }

    pub fn report(&self, error: &SyncError) {
        self.ui.report(error);
    }

    fn publish(&self, update: &TimerUpdate) {
        match Message::timer_update(update) {
            Ok(message) => {
                self.transport.send(&message);
            }
            Err(err) => warn!(error = %err, "failed to encode timer_update"),
        }
    }
}

/// Applies updates in the order they were issued. Each job is retried up to
/// `retry.limit` times; exhaustion is reported as a warning.
async fn persistence_worker(
    api: Arc<dyn SessionApi>,
    ui: Arc<dyn UiPort>,
    retry: PersistRetry,
    mut jobs: mpsc::UnboundedReceiver<PersistJob>,
) {
    while let Some(job) = jobs.recv().await {
        for attempt in 0..=retry.limit {
            match api.update_session(job.server_id, &job.request).await {
                Ok(()) => {
                    debug!(
                        session = %job.local_id,
                        server_id = %job.server_id,
                        "session update persisted"
                    );
                    break;
                }
                Err(e) if e.is_retryable() && attempt < retry.limit => {
                    let delay = retry.delay.saturating_mul(attempt + 1);
                    warn!(
                        server_id = %job.server_id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying session update"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    let err = SyncError::PersistenceRetryExhausted {
                        attempts: attempt + 1,
                        last_error: e.to_string(),
                    };
                    warn!(server_id = %job.server_id, error = %err, "giving up on session update");
                    ui.report(&err);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockSessionApi, RecordingNotifier, RecordingUi};
    use crate::ticker::Ticker;
    use serde_json::json;
    use tempo_core::{CadenceDurations, DeviceId, SessionKind, SessionStatus, SyncConfig};
    use tempo_transport::mock::ScriptedConnector;

    struct Harness {
        coordinator: SyncCoordinator,
        machine: SessionStateMachine,
        api: Arc<MockSessionApi>,
        ui: Arc<RecordingUi>,
        notifier: Arc<RecordingNotifier>,
        outcomes: mpsc::UnboundedReceiver<CreateOutcome>,
    }

    fn harness(api: MockSessionApi) -> Harness {
        let api = Arc::new(api);
        let ui = Arc::new(RecordingUi::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let transport = Arc::new(TransportManager::new(
            Arc::new(ScriptedConnector::new(vec![])),
            &SyncConfig::default(),
        ));
        let (outcome_tx, outcomes) = mpsc::unbounded_channel();
        let coordinator = SyncCoordinator::new(
            api.clone(),
            ui.clone(),
            notifier.clone(),
            transport,
            outcome_tx,
            PersistRetry {
                limit: 3,
                delay: Duration::from_millis(500),
            },
        );
        let (tick_tx, _tick_rx) = mpsc::unbounded_channel();
        let machine = SessionStateMachine::new(
            CadenceDurations::default(),
            Ticker::new(Duration::from_secs(1), tick_tx),
            DeviceId::new(),
        );
        Harness {
            coordinator,
            machine,
            api,
            ui,
            notifier,
            outcomes,
        }
    }

    fn server_error() -> ApiError {
        ApiError::ServerError {
            status: 503,
            body: "unavailable".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn create_effect_posts_outcome() {
        let mut h = harness(MockSessionApi::new());
        let effects = h.machine.start().unwrap();
        h.coordinator.execute(effects);

        let outcome = h.outcomes.recv().await.unwrap();
        assert_eq!(outcome.local_id, h.machine.session().local_id);
        let id = h.coordinator.on_created(&mut h.machine, outcome).unwrap();
        assert_eq!(h.machine.session().server_session_id, Some(id));
        assert_eq!(h.api.creates()[0].session_type, SessionKind::Focus);
    }

    #[tokio::test(start_paused = true)]
    async fn conflict_rolls_back_and_reports() {
        let api = MockSessionApi::new();
        api.push_create(Err(ApiError::Conflict("already running".into())));
        let mut h = harness(api);
        let effects = h.machine.start().unwrap();
        h.coordinator.execute(effects);

        let outcome = h.outcomes.recv().await.unwrap();
        let err = h.coordinator.on_created(&mut h.machine, outcome).unwrap_err();
        assert!(matches!(err, SyncError::SessionConflict(_)));
        assert_eq!(h.machine.session().status, SessionStatus::Idle);
        assert_eq!(h.machine.active_tick_handles(), 0);
        assert_eq!(h.ui.reports(), vec![err]);
        assert_eq!(h.ui.last_render().unwrap().status, SessionStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn persistence_gives_up_after_bounded_retries() {
        let api = MockSessionApi::new();
        for _ in 0..4 {
            api.push_update(Err(server_error()));
        }
        let h = harness(api);
        h.coordinator.execute(vec![SessionEffect::Update {
            local_id: LocalSessionId::new(),
            server_id: ServerSessionId(5),
            request: UpdateSessionRequest {
                duration_actual: 60,
                was_completed: Some(false),
                ended_at: None,
            },
        }]);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.api.updates().len(), 4);
        match h.ui.reports().as_slice() {
            [SyncError::PersistenceRetryExhausted { attempts, .. }] => assert_eq!(*attempts, 4),
            other => panic!("unexpected reports: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_update_failure_recovers() {
        let api = MockSessionApi::new();
        api.push_update(Err(ApiError::Network("reset".into())));
        let h = harness(api);
        h.coordinator.execute(vec![SessionEffect::Update {
            local_id: LocalSessionId::new(),
            server_id: ServerSessionId(5),
            request: UpdateSessionRequest {
                duration_actual: 10,
                was_completed: None,
                ended_at: None,
            },
        }]);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.api.updates().len(), 2);
        assert!(h.ui.reports().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_update_is_reported_immediately() {
        let api = MockSessionApi::new();
        api.push_update(Err(ApiError::NotFound("gone".into())));
        let h = harness(api);
        h.coordinator.execute(vec![SessionEffect::Update {
            local_id: LocalSessionId::new(),
            server_id: ServerSessionId(8),
            request: UpdateSessionRequest {
                duration_actual: 1,
                was_completed: Some(true),
                ended_at: None,
            },
        }]);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.api.updates().len(), 1);
        assert!(matches!(
            h.ui.reports().as_slice(),
            [SyncError::PersistenceRetryExhausted { attempts: 1, .. }]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn completion_notifies_and_plays_alert() {
        let mut h = harness(MockSessionApi::new());
        h.machine.configure(SessionKind::Focus, 1).unwrap();
        h.machine.start().unwrap();
        let effects = h.machine.tick();
        h.coordinator.execute(effects);

        assert_eq!(
            h.notifier.notifications(),
            vec![(
                "Timer Complete!".to_string(),
                "Your pomodoro session is finished.".to_string()
            )]
        );
        assert_eq!(h.notifier.alert_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_drops_malformed_updates() {
        let mut h = harness(MockSessionApi::new());
        let bad = Message::new("timer_update", json!({"status": "exploded"}));
        assert_eq!(h.coordinator.reconcile(&mut h.machine, &bad), None);

        let mut good = Message::new(
            "timer_update",
            json!({"status": "paused", "remaining_seconds": 100}),
        );
        good.server_timestamp = Some(chrono::Utc::now());
        assert_eq!(
            h.coordinator.reconcile(&mut h.machine, &good),
            Some(RemoteOutcome::Applied)
        );
        assert_eq!(h.ui.last_render().unwrap().remaining_seconds, 100);
    }
}
