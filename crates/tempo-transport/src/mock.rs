use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::connector::{Connector, Link, TransportError};

/// One pre-programmed outcome of `Connector::connect`.
pub enum ConnectStep {
    /// Connection attempt fails with the given reason.
    Fail(String),
    /// Connection opens; frames pushed into the paired sender are received.
    /// Dropping the sender drops the connection.
    Open(mpsc::UnboundedReceiver<String>),
}

impl ConnectStep {
    pub fn fail(reason: &str) -> Self {
        Self::Fail(reason.to_string())
    }

    /// An open connection that stays up while the returned sender lives.
    pub fn open() -> (Self, mpsc::UnboundedSender<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::Open(rx), tx)
    }

    /// An open connection that delivers `frames` and then drops.
    pub fn open_then_drop(frames: Vec<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        for frame in frames {
            let _ = tx.send(frame);
        }
        Self::Open(rx)
    }
}

/// Connector that replays a script of steps, in order, for deterministic
/// reconnect tests. Once the script is exhausted every attempt fails.
pub struct ScriptedConnector {
    steps: Mutex<VecDeque<ConnectStep>>,
    calls: AtomicUsize,
    urls: Mutex<Vec<String>>,
    sent: Arc<Mutex<Vec<String>>>,
    pings: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    pub fn new(steps: Vec<ConnectStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            calls: AtomicUsize::new(0),
            urls: Mutex::new(Vec::new()),
            sent: Arc::new(Mutex::new(Vec::new())),
            pings: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Append more steps, e.g. before a manual reconnect.
    pub fn push(&self, step: ConnectStep) {
        self.steps.lock().push_back(step);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().clone()
    }

    /// Text frames written to any link opened by this connector.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Link>, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().push(url.to_string());
        let step = self.steps.lock().pop_front();
        match step {
            Some(ConnectStep::Open(inbound)) => Ok(Box::new(ScriptedLink {
                inbound,
                sent: Arc::clone(&self.sent),
                pings: Arc::clone(&self.pings),
            })),
            Some(ConnectStep::Fail(reason)) => Err(TransportError::Connect(reason)),
            None => Err(TransportError::Connect("script exhausted".into())),
        }
    }
}

struct ScriptedLink {
    inbound: mpsc::UnboundedReceiver<String>,
    sent: Arc<Mutex<Vec<String>>>,
    pings: Arc<AtomicUsize>,
}

#[async_trait]
impl Link for ScriptedLink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.sent.lock().push(text);
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}
