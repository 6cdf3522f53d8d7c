use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Identity of one tick timer. Signals carrying an id other than the live
/// handle's are stale and must be ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TickId(u64);

/// A running periodic timer. Cancelled on drop.
#[derive(Debug)]
pub struct TickHandle {
    id: TickId,
    cancel: CancellationToken,
}

impl TickHandle {
    pub fn id(&self) -> TickId {
        self.id
    }
}

impl Drop for TickHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Spawns fixed-cadence tick timers that post their id into a channel.
pub struct Ticker {
    interval: Duration,
    signals: mpsc::UnboundedSender<TickId>,
    next_id: u64,
}

impl Ticker {
    pub fn new(interval: Duration, signals: mpsc::UnboundedSender<TickId>) -> Self {
        Self {
            interval,
            signals,
            next_id: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start a timer whose first signal fires one interval from now.
    /// Must be called inside a tokio runtime.
    pub fn spawn(&mut self) -> TickHandle {
        self.next_id += 1;
        let id = TickId(self.next_id);
        let cancel = CancellationToken::new();

        let token = cancel.clone();
        let period = self.interval;
        let signals = self.signals.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        if signals.send(id).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        TickHandle { id, cancel }
    }
}
