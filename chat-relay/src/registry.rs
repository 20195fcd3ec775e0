use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::{
    Mutex,
    mpsc::{self, error::TryRecvError, error::TrySendError},
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::debug;

pub type SessionId = u64;

/// Write side of a session as seen by the registry.
///
/// Lines are queued to the session's writer task, which writes and flushes
/// each one to the connection. Queuing never blocks, so a broadcast can hold
/// the registry lock while it fans out. The queue is bounded: a session that
/// stops draining it is evicted instead of buffering without limit.
#[derive(Debug)]
pub struct Outbound {
    tx: mpsc::Sender<Arc<str>>,
    evicted: CancellationToken,
    peer: Option<SocketAddr>,
}

/// Receiving end of an [`Outbound`], owned by the session's writer task.
#[derive(Debug)]
pub struct Outbox {
    lines: mpsc::Receiver<Arc<str>>,
    evicted: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The session has not drained its queue.
    Full,
    /// The session's writer task has already stopped.
    Closed,
}

impl Outbound {
    pub fn channel(peer: Option<SocketAddr>, capacity: usize) -> (Self, Outbox) {
        let (tx, lines) = mpsc::channel(capacity.max(1));
        let evicted = CancellationToken::new();
        let outbound = Self {
            tx,
            evicted: evicted.clone(),
            peer,
        };
        (outbound, Outbox { lines, evicted })
    }

    /// Queues one already-encoded line for this session.
    pub fn send_line(&self, line: Arc<str>) -> Result<(), DeliveryError> {
        self.tx.try_send(line).map_err(|err| match err {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Tells the writer task to drop the connection without flushing.
    fn evict(&self) {
        self.evicted.cancel();
    }
}

impl Outbox {
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        self.lines.recv().await
    }

    pub fn try_recv(&mut self) -> Result<Arc<str>, TryRecvError> {
        self.lines.try_recv()
    }

    /// Resolves once the registry has evicted this session.
    pub fn evicted(&self) -> WaitForCancellationFutureOwned {
        self.evicted.clone().cancelled_owned()
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.is_cancelled()
    }
}

/// Process-wide set of live sessions.
///
/// Registration, removal and the whole of a broadcast run under one lock, so
/// a broadcast sees either all or none of a concurrent register/unregister.
pub struct Registry {
    sessions: Mutex<HashMap<SessionId, Outbound>>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn register(&self, id: SessionId, outbound: Outbound) {
        let mut sessions = self.sessions.lock().await;
        sessions.insert(id, outbound);
    }

    /// Removes a session. Returns `false` if it was already gone.
    pub async fn unregister(&self, id: SessionId) -> bool {
        let mut sessions = self.sessions.lock().await;
        sessions.remove(&id).is_some()
    }

    /// Queues `line` to every registered session, the sender included.
    ///
    /// Returns how many sessions accepted the line. Sessions whose writer has
    /// stopped, or whose queue is full, are evicted on the spot and do not
    /// count.
    pub async fn broadcast(&self, line: &str) -> usize {
        let line: Arc<str> = Arc::from(line);
        let mut sessions = self.sessions.lock().await;

        let mut failed = Vec::new();
        for (id, outbound) in sessions.iter() {
            if let Err(err) = outbound.send_line(Arc::clone(&line)) {
                failed.push((*id, err));
            }
        }

        for (id, err) in failed {
            if let Some(outbound) = sessions.remove(&id) {
                outbound.evict();
                debug!(session = id, peer = ?outbound.peer(), reason = ?err, "evicted session");
            }
        }

        sessions.len()
    }

    /// Drops every outbox, which lets each writer task close its connection.
    pub async fn close_all(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        let count = sessions.len();
        sessions.clear();
        count
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, id: SessionId) -> bool {
        self.sessions.lock().await.contains_key(&id)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
