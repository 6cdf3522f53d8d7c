use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tempo_core::{
    CadenceDurations, CreateSessionRequest, DeviceId, LocalSessionId, ServerSessionId,
    SessionKind, SessionSnapshot, SessionStatus, SyncError, TaskRef, TimerSession, TimerUpdate,
    UpdateSessionRequest,
};
use tracing::{debug, info};

use crate::ticker::{TickHandle, TickId, Ticker};

/// Side effect requested by a transition. The coordinator executes these;
/// the state machine itself never performs I/O.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEffect {
    /// Persist a newly started session.
    Create {
        local_id: LocalSessionId,
        request: CreateSessionRequest,
    },
    /// Persist progress or the end of an acknowledged session.
    Update {
        local_id: LocalSessionId,
        server_id: ServerSessionId,
        request: UpdateSessionRequest,
    },
    /// The countdown reached zero.
    Completed(SessionSnapshot),
    /// Tell the user's other devices about the new local state.
    Publish(TimerUpdate),
}

/// Result of merging an inbound `timer_update`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteOutcome {
    Applied,
    /// Not newer than the last applied server update.
    Stale,
    /// Echo of a change made on this device.
    IgnoredOwn,
}

/// Local model of the user's single timer session.
///
/// Owns the countdown tick: at most one [`TickHandle`] is live, and only while
/// the session is `Running`.
pub struct SessionStateMachine {
    session: TimerSession,
    cadence: CadenceDurations,
    task: Option<TaskRef>,
    ticker: Ticker,
    tick: Option<TickHandle>,
    /// Session as it was before an unacknowledged `start`.
    pre_start: Option<TimerSession>,
    /// Server session id seen in a `timer_update` while a create was pending.
    pending_remote_id: Option<ServerSessionId>,
    /// Updates waiting for their session's create acknowledgement.
    deferred: HashMap<LocalSessionId, UpdateSessionRequest>,
    last_finished: Option<SessionSnapshot>,
    device: DeviceId,
}

impl SessionStateMachine {
    pub fn new(cadence: CadenceDurations, ticker: Ticker, device: DeviceId) -> Self {
        Self {
            session: TimerSession::new(SessionKind::Focus, cadence.focus_seconds),
            cadence,
            task: None,
            ticker,
            tick: None,
            pre_start: None,
            pending_remote_id: None,
            deferred: HashMap::new(),
            last_finished: None,
            device,
        }
    }

    pub fn session(&self) -> &TimerSession {
        &self.session
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.snapshot()
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    pub fn cadence(&self) -> CadenceDurations {
        self.cadence
    }

    /// Most recently completed or aborted session.
    pub fn last_finished(&self) -> Option<&SessionSnapshot> {
        self.last_finished.as_ref()
    }

    pub fn active_tick_handles(&self) -> usize {
        usize::from(self.tick.is_some())
    }

    /// Install a fresh `Idle` session. An active session is stopped first.
    pub fn configure(
        &mut self,
        kind: SessionKind,
        planned_seconds: u32,
    ) -> Result<Vec<SessionEffect>, SyncError> {
        if planned_seconds == 0 {
            return Err(SyncError::InvalidDuration);
        }
        let mut effects = Vec::new();
        if self.session.status.is_active() {
            effects.extend(self.stop()?);
        }
        self.replace_session(kind, planned_seconds);
        debug!(kind = %kind, planned_seconds, "session configured");
        Ok(effects)
    }

    /// Configure `kind` with its cadence duration.
    pub fn select_mode(&mut self, kind: SessionKind) -> Result<Vec<SessionEffect>, SyncError> {
        self.configure(kind, self.cadence.for_kind(kind))
    }

    /// Reconfigure the current kind from scratch.
    pub fn reset(&mut self) -> Result<Vec<SessionEffect>, SyncError> {
        self.configure(self.session.kind, self.session.planned_seconds)
    }

    /// New cadence durations; an `Idle` session picks up its new length.
    pub fn set_cadence(&mut self, cadence: CadenceDurations) -> Result<(), SyncError> {
        if cadence.focus_seconds == 0
            || cadence.break_seconds == 0
            || cadence.long_break_seconds == 0
        {
            return Err(SyncError::InvalidDuration);
        }
        self.cadence = cadence;
        if self.session.status == SessionStatus::Idle {
            self.replace_session(self.session.kind, cadence.for_kind(self.session.kind));
        }
        Ok(())
    }

    /// Attach (or clear) the task sent with the next create request.
    pub fn attach_task(&mut self, task: Option<TaskRef>) {
        self.task = task;
        if !self.session.status.is_active() {
            self.session.task = self.task.clone();
        }
    }

    pub fn start(&mut self) -> Result<Vec<SessionEffect>, SyncError> {
        match self.session.status {
            SessionStatus::Idle => {}
            SessionStatus::Completed | SessionStatus::Aborted => {
                self.replace_session(self.session.kind, self.session.planned_seconds);
            }
            status @ (SessionStatus::Running | SessionStatus::Paused) => {
                return Err(SyncError::InvalidTransition {
                    action: "start",
                    status,
                });
            }
        }

        self.pre_start = Some(self.session.clone());
        self.pending_remote_id = None;
        // Assigned only by the create acknowledgement.
        self.session.server_session_id = None;
        self.session.status = SessionStatus::Running;
        self.session.started_at = Some(Utc::now());
        self.start_tick();
        info!(
            session = %self.session.local_id,
            kind = %self.session.kind,
            planned_seconds = self.session.planned_seconds,
            "session started"
        );

        Ok(vec![
            SessionEffect::Create {
                local_id: self.session.local_id.clone(),
                request: CreateSessionRequest::for_session(&self.session),
            },
            self.publish(),
        ])
    }

    pub fn pause(&mut self) -> Result<Vec<SessionEffect>, SyncError> {
        self.expect_status("pause", SessionStatus::Running)?;
        self.cancel_tick();
        self.session.status = SessionStatus::Paused;
        debug!(
            session = %self.session.local_id,
            remaining = self.session.remaining_seconds,
            "session paused"
        );

        let mut effects = Vec::new();
        effects.extend(self.persist(UpdateSessionRequest::progress(&self.session)));
        effects.push(self.publish());
        Ok(effects)
    }

    pub fn resume(&mut self) -> Result<Vec<SessionEffect>, SyncError> {
        self.expect_status("resume", SessionStatus::Paused)?;
        self.session.status = SessionStatus::Running;
        self.start_tick();
        debug!(
            session = %self.session.local_id,
            remaining = self.session.remaining_seconds,
            "session resumed"
        );
        Ok(vec![self.publish()])
    }

    pub fn stop(&mut self) -> Result<Vec<SessionEffect>, SyncError> {
        if !self.session.status.is_active() {
            return Err(SyncError::InvalidTransition {
                action: "stop",
                status: self.session.status,
            });
        }
        self.cancel_tick();
        self.session.status = SessionStatus::Aborted;
        self.last_finished = Some(self.session.snapshot());
        info!(
            session = %self.session.local_id,
            elapsed = self.session.elapsed_seconds(),
            "session aborted"
        );

        let mut effects = Vec::new();
        effects.extend(self.persist(UpdateSessionRequest::ended(&self.session, false, Utc::now())));
        effects.push(self.publish());
        Ok(effects)
    }

    /// Count down one second. Ignored unless `Running`.
    pub fn tick(&mut self) -> Vec<SessionEffect> {
        if self.session.status != SessionStatus::Running {
            return Vec::new();
        }
        self.session.remaining_seconds = self.session.remaining_seconds.saturating_sub(1);
        if self.session.remaining_seconds > 0 {
            return Vec::new();
        }
        self.complete()
    }

    /// Tick signal from the timer task. Signals from a cancelled timer are
    /// discarded.
    pub fn on_tick(&mut self, id: TickId) -> Vec<SessionEffect> {
        match &self.tick {
            Some(handle) if handle.id() == id => self.tick(),
            _ => {
                debug!(?id, "discarding stale tick");
                Vec::new()
            }
        }
    }

    /// Replace a finished session with a fresh `Idle` one of the same kind.
    pub fn acknowledge(&mut self) -> Result<(), SyncError> {
        if !self.session.status.is_terminal() {
            return Err(SyncError::InvalidTransition {
                action: "acknowledge",
                status: self.session.status,
            });
        }
        self.replace_session(self.session.kind, self.session.planned_seconds);
        Ok(())
    }

    /// The server accepted the create for `local_id`. Returns any update
    /// that was waiting for the id.
    pub fn confirm_created(
        &mut self,
        local_id: &LocalSessionId,
        server_id: ServerSessionId,
    ) -> Vec<SessionEffect> {
        if self.session.local_id == *local_id {
            self.session.server_session_id = Some(server_id);
            self.pre_start = None;
            self.pending_remote_id = None;
        }
        match self.deferred.remove(local_id) {
            Some(request) => vec![SessionEffect::Update {
                local_id: local_id.clone(),
                server_id,
                request,
            }],
            None => Vec::new(),
        }
    }

    /// The server refused the create for `local_id`. Rolls the current
    /// session back to its pre-start state; returns whether it did.
    ///
    /// A `timer_update` applied after the start wins over the rollback: the
    /// server-reported state is kept and only the pending create is dropped.
    pub fn reject_created(&mut self, local_id: &LocalSessionId) -> bool {
        self.deferred.remove(local_id);
        if self.session.local_id != *local_id {
            return false;
        }
        let superseded = self
            .pre_start
            .as_ref()
            .is_some_and(|prev| self.session.last_server_sync_at > prev.last_server_sync_at);
        if superseded {
            self.pre_start = None;
            if self.session.server_session_id.is_none() {
                self.session.server_session_id = self.pending_remote_id.take();
            }
            info!(
                session = %local_id,
                status = %self.session.status,
                "create rejected, keeping server state"
            );
            return false;
        }
        self.pending_remote_id = None;
        self.cancel_tick();
        let watermark = self.session.last_server_sync_at;
        let mut restored = match self.pre_start.take() {
            Some(previous) => previous,
            None => self.fresh_session(self.session.kind, self.session.planned_seconds),
        };
        restored.last_server_sync_at = restored.last_server_sync_at.max(watermark);
        self.session = restored;
        info!(session = %local_id, "start rolled back");
        true
    }

    /// Merge a `timer_update` stamped `at`. Newer server state overwrites
    /// local state; older or equal updates are discarded.
    pub fn apply_remote(&mut self, update: &TimerUpdate, at: DateTime<Utc>) -> RemoteOutcome {
        if update.origin.as_ref() == Some(&self.device) {
            return RemoteOutcome::IgnoredOwn;
        }
        if let Some(last) = self.session.last_server_sync_at {
            if at <= last {
                debug!(%at, %last, "discarding stale timer_update");
                return RemoteOutcome::Stale;
            }
        }

        let foreign = match (update.session_id, self.session.server_session_id) {
            (Some(remote), Some(local)) => remote != local,
            _ => false,
        };
        if foreign {
            let kind = update.session_type.unwrap_or(self.session.kind);
            let planned = update
                .duration_planned
                .filter(|p| *p > 0)
                .unwrap_or_else(|| self.cadence.for_kind(kind));
            self.replace_session(kind, planned);
        }

        if self.pre_start.is_some() && update.session_id.is_some() {
            self.pending_remote_id = update.session_id;
        }
        let session = &mut self.session;
        if session.server_session_id.is_none() && self.pre_start.is_none() {
            session.server_session_id = update.session_id;
        }
        if let Some(planned) = update.duration_planned.filter(|p| *p > 0) {
            if foreign || session.server_session_id == update.session_id {
                session.planned_seconds = planned;
            }
        }
        session.status = update.status;
        session.remaining_seconds = update.remaining_seconds.min(session.planned_seconds);
        session.last_server_sync_at = Some(at);
        if session.status.is_active() && session.started_at.is_none() {
            session.started_at = Some(at);
        }
        let status = session.status;

        match status {
            SessionStatus::Running => {
                if self.tick.is_none() {
                    self.start_tick();
                }
            }
            _ => self.cancel_tick(),
        }
        if status.is_terminal() {
            self.last_finished = Some(self.session.snapshot());
        }
        info!(
            status = %status,
            remaining = self.session.remaining_seconds,
            "applied remote timer_update"
        );
        RemoteOutcome::Applied
    }

    fn complete(&mut self) -> Vec<SessionEffect> {
        self.cancel_tick();
        self.session.status = SessionStatus::Completed;
        let finished = self.session.snapshot();
        self.last_finished = Some(finished.clone());
        info!(session = %self.session.local_id, kind = %self.session.kind, "session completed");

        let mut effects = Vec::new();
        effects.extend(self.persist(UpdateSessionRequest::ended(&self.session, true, Utc::now())));
        effects.push(SessionEffect::Completed(finished));
        effects.push(self.publish());

        let next = self.session.kind.next_in_cadence();
        self.replace_session(next, self.cadence.for_kind(next));
        effects
    }

    /// Emit the update now if the server id is known, otherwise hold it
    /// until the create is acknowledged. A later update supersedes an
    /// earlier deferred one.
    fn persist(&mut self, request: UpdateSessionRequest) -> Option<SessionEffect> {
        let local_id = self.session.local_id.clone();
        match self.session.server_session_id {
            Some(server_id) => Some(SessionEffect::Update {
                local_id,
                server_id,
                request,
            }),
            None => {
                debug!(session = %local_id, "deferring update until create is acknowledged");
                self.deferred.insert(local_id, request);
                None
            }
        }
    }

    fn publish(&self) -> SessionEffect {
        let s = &self.session;
        SessionEffect::Publish(TimerUpdate {
            session_id: s.server_session_id,
            status: s.status,
            remaining_seconds: s.remaining_seconds,
            session_type: Some(s.kind),
            duration_planned: Some(s.planned_seconds),
            origin: Some(self.device.clone()),
            updated_at: Some(Utc::now()),
        })
    }

    fn expect_status(
        &self,
        action: &'static str,
        expected: SessionStatus,
    ) -> Result<(), SyncError> {
        if self.session.status == expected {
            Ok(())
        } else {
            Err(SyncError::InvalidTransition {
                action,
                status: self.session.status,
            })
        }
    }

    fn fresh_session(&self, kind: SessionKind, planned_seconds: u32) -> TimerSession {
        let mut session = TimerSession::new(kind, planned_seconds);
        session.task = self.task.clone();
        session.last_server_sync_at = self.session.last_server_sync_at;
        session
    }

    fn replace_session(&mut self, kind: SessionKind, planned_seconds: u32) {
        self.cancel_tick();
        self.pre_start = None;
        self.pending_remote_id = None;
        self.session = self.fresh_session(kind, planned_seconds);
    }

    fn start_tick(&mut self) {
        self.cancel_tick();
        self.tick = Some(self.ticker.spawn());
    }

    fn cancel_tick(&mut self) {
        // Dropping the handle cancels its task.
        self.tick = None;
    }
}
