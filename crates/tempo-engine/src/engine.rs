use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tempo_core::{
    CadenceDurations, DeviceId, Identity, LocalSessionId, Message, NotificationPort,
    ServerSessionId, SessionApi, SessionKind, SessionSnapshot, SyncConfig, SyncError, TaskRef,
    UiPort, TIMER_UPDATE,
};
use tempo_transport::{
    Callback, CallbackResult, ConnectionInfo, ConnectionState, Connector, SubscriptionHandle,
    TransportManager,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordinator::{CreateOutcome, PersistRetry, SyncCoordinator};
use crate::machine::SessionStateMachine;
use crate::ticker::{TickId, Ticker};

/// Host capabilities injected into the engine.
#[derive(Clone)]
pub struct EnginePorts {
    pub connector: Arc<dyn Connector>,
    pub api: Arc<dyn SessionApi>,
    pub notifier: Arc<dyn NotificationPort>,
    pub ui: Arc<dyn UiPort>,
}

#[derive(Debug)]
enum Transition {
    Configure { kind: SessionKind, planned_seconds: u32 },
    SelectMode(SessionKind),
    SetCadence(CadenceDurations),
    Pause,
    Resume,
    Stop,
    Reset,
    Acknowledge,
}

enum Command {
    Transition {
        transition: Transition,
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    Start {
        reply: oneshot::Sender<Result<ServerSessionId, SyncError>>,
    },
    AttachTask(Option<TaskRef>),
    Snapshot(oneshot::Sender<SessionSnapshot>),
    TickHandles(oneshot::Sender<usize>),
    Remote(Message),
}

/// One user's realtime timer engine.
///
/// Session state lives in a single actor task; every public method posts a
/// command to its mailbox, so mutations are serialized. Must be created
/// inside a tokio runtime.
pub struct SyncEngine {
    commands: mpsc::UnboundedSender<Command>,
    transport: Arc<TransportManager>,
    remote_callback: Callback,
    timer_subscription: Mutex<Option<SubscriptionHandle>>,
    device: DeviceId,
    cancel: CancellationToken,
    actor: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn new(config: &SyncConfig, ports: EnginePorts) -> Self {
        let device = DeviceId::new();
        let transport = Arc::new(TransportManager::new(ports.connector, config));
        let cancel = CancellationToken::new();

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();

        let coordinator = SyncCoordinator::new(
            ports.api,
            Arc::clone(&ports.ui),
            ports.notifier,
            Arc::clone(&transport),
            outcome_tx,
            PersistRetry {
                limit: config.persist_retry_limit,
                delay: config.persist_retry_delay(),
            },
        );
        let machine = SessionStateMachine::new(
            config.cadence,
            Ticker::new(config.tick_interval(), tick_tx),
            device.clone(),
        );
        let actor = Actor {
            machine,
            coordinator,
            pending_starts: HashMap::new(),
        };
        let actor = tokio::spawn(actor.run(command_rx, tick_rx, outcome_rx, cancel.clone()));

        tokio::spawn(watch_connection(
            transport.watch_state(),
            ports.ui,
            config.max_attempts,
            cancel.clone(),
        ));

        let forward = commands.clone();
        let remote_callback: Callback = Arc::new(move |message: &Message| -> CallbackResult {
            forward
                .send(Command::Remote(message.clone()))
                .map_err(|_| "engine stopped".into())
        });

        info!(device = %device, "sync engine started");
        Self {
            commands,
            transport,
            remote_callback,
            timer_subscription: Mutex::new(None),
            device,
            cancel,
            actor: Mutex::new(Some(actor)),
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device
    }

    // --- connection ---

    /// Connect as `identity` and listen for `timer_update`s.
    pub fn connect(&self, identity: &Identity) {
        let handle = self
            .transport
            .dispatcher()
            .subscribe(TIMER_UPDATE, Arc::clone(&self.remote_callback));
        *self.timer_subscription.lock() = Some(handle);
        self.transport.connect(identity);
    }

    /// Close the connection and drop all subscriptions. The local timer keeps
    /// running.
    pub fn disconnect(&self) {
        self.timer_subscription.lock().take();
        self.transport.disconnect();
    }

    pub fn send(&self, message: &Message) -> bool {
        self.transport.send(message)
    }

    pub fn subscribe(&self, topic: &str, callback: Callback) -> SubscriptionHandle {
        self.transport.dispatcher().subscribe(topic, callback)
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.transport.dispatcher().unsubscribe(handle)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        self.transport.info()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.transport.watch_state()
    }

    // --- session ---

    /// Start the current session. Runs locally at once; resolves when the
    /// server has acknowledged (or rejected, after rollback) the create.
    pub async fn start(&self) -> Result<ServerSessionId, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.post(Command::Start { reply })?;
        rx.await.map_err(|_| SyncError::EngineStopped)?
    }

    pub async fn configure(
        &self,
        kind: SessionKind,
        planned_seconds: u32,
    ) -> Result<(), SyncError> {
        self.transition(Transition::Configure {
            kind,
            planned_seconds,
        })
        .await
    }

    pub async fn select_mode(&self, kind: SessionKind) -> Result<(), SyncError> {
        self.transition(Transition::SelectMode(kind)).await
    }

    pub async fn set_cadence(&self, cadence: CadenceDurations) -> Result<(), SyncError> {
        self.transition(Transition::SetCadence(cadence)).await
    }

    pub async fn pause(&self) -> Result<(), SyncError> {
        self.transition(Transition::Pause).await
    }

    pub async fn resume(&self) -> Result<(), SyncError> {
        self.transition(Transition::Resume).await
    }

    pub async fn stop(&self) -> Result<(), SyncError> {
        self.transition(Transition::Stop).await
    }

    pub async fn reset(&self) -> Result<(), SyncError> {
        self.transition(Transition::Reset).await
    }

    pub async fn acknowledge(&self) -> Result<(), SyncError> {
        self.transition(Transition::Acknowledge).await
    }

    pub fn attach_task(&self, task: Option<TaskRef>) -> Result<(), SyncError> {
        self.post(Command::AttachTask(task))
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.post(Command::Snapshot(reply))?;
        rx.await.map_err(|_| SyncError::EngineStopped)
    }

    /// Live tick timers; 0 or 1.
    pub async fn active_tick_handles(&self) -> Result<usize, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.post(Command::TickHandles(reply))?;
        rx.await.map_err(|_| SyncError::EngineStopped)
    }

    /// Stop the actor, cancel the tick and close the connection. Pending
    /// `start` calls resolve with `EngineStopped`.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.disconnect();
        let actor = self.actor.lock().take();
        if let Some(actor) = actor {
            if let Err(e) = actor.await {
                warn!(error = %e, "engine actor ended abnormally");
            }
        }
        info!(device = %self.device, "sync engine stopped");
    }

    async fn transition(&self, transition: Transition) -> Result<(), SyncError> {
        let (reply, rx) = oneshot::channel();
        self.post(Command::Transition { transition, reply })?;
        rx.await.map_err(|_| SyncError::EngineStopped)?
    }

    fn post(&self, command: Command) -> Result<(), SyncError> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::EngineStopped);
        }
        self.commands.send(command).map_err(|_| SyncError::EngineStopped)
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Actor {
    machine: SessionStateMachine,
    coordinator: SyncCoordinator,
    pending_starts: HashMap<LocalSessionId, oneshot::Sender<Result<ServerSessionId, SyncError>>>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut ticks: mpsc::UnboundedReceiver<TickId>,
        mut outcomes: mpsc::UnboundedReceiver<CreateOutcome>,
        cancel: CancellationToken,
    ) {
        self.coordinator.render(&self.machine);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(outcome) = outcomes.recv() => self.on_created(outcome),
                Some(command) = commands.recv() => self.handle(command),
                Some(id) = ticks.recv() => self.on_tick(id),
            }
        }
        debug!(pending_starts = self.pending_starts.len(), "engine actor exiting");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Transition { transition, reply } => {
                let result = self.apply(transition);
                let _ = reply.send(result);
            }
            Command::Start { reply } => match self.machine.start() {
                Ok(effects) => {
                    let local_id = self.machine.session().local_id.clone();
                    self.pending_starts.insert(local_id, reply);
                    self.coordinator.execute(effects);
                    self.coordinator.render(&self.machine);
                }
                Err(err) => {
                    let _ = reply.send(Err(err));
                }
            },
            Command::AttachTask(task) => {
                self.machine.attach_task(task);
                self.coordinator.render(&self.machine);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.machine.snapshot());
            }
            Command::TickHandles(reply) => {
                let _ = reply.send(self.machine.active_tick_handles());
            }
            Command::Remote(message) => {
                self.coordinator.reconcile(&mut self.machine, &message);
            }
        }
    }

    fn apply(&mut self, transition: Transition) -> Result<(), SyncError> {
        debug!(?transition, "applying transition");
        let effects = match transition {
            Transition::Configure {
                kind,
                planned_seconds,
            } => self.machine.configure(kind, planned_seconds)?,
            Transition::SelectMode(kind) => self.machine.select_mode(kind)?,
            Transition::SetCadence(cadence) => {
                self.machine.set_cadence(cadence)?;
                Vec::new()
            }
            Transition::Pause => self.machine.pause()?,
            Transition::Resume => self.machine.resume()?,
            Transition::Stop => self.machine.stop()?,
            Transition::Reset => self.machine.reset()?,
            Transition::Acknowledge => {
                self.machine.acknowledge()?;
                Vec::new()
            }
        };
        self.coordinator.execute(effects);
        self.coordinator.render(&self.machine);
        Ok(())
    }

    fn on_created(&mut self, outcome: CreateOutcome) {
        let local_id = outcome.local_id.clone();
        let result = self.coordinator.on_created(&mut self.machine, outcome);
        if let Some(reply) = self.pending_starts.remove(&local_id) {
            let _ = reply.send(result);
        }
    }

    fn on_tick(&mut self, id: TickId) {
        let before = self.machine.snapshot();
        let effects = self.machine.on_tick(id);
        let changed = !effects.is_empty() || self.machine.snapshot() != before;
        self.coordinator.execute(effects);
        if changed {
            self.coordinator.render(&self.machine);
        }
    }
}

/// Tells the UI when the transport has given up.
async fn watch_connection(
    mut states: watch::Receiver<ConnectionState>,
    ui: Arc<dyn UiPort>,
    max_attempts: u32,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                debug!(state = %state, "connection state changed");
                if state == ConnectionState::Fatal {
                    ui.report(&SyncError::MaxRetriesExceeded { max_attempts });
                }
            }
        }
    }
}
