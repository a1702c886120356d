//! Concurrency-safe set of connected clients.
//!
//! Each entry holds the sending half of a bounded queue of encoded frames.
//! The queue's receiving half ([`Outbox`]) belongs to the connection that
//! owns the socket, so exactly one task ever writes to a given socket.
//!
//! Membership changes and broadcast iteration are serialised by a single
//! mutex. Broadcast only performs non-blocking `try_send` calls while holding
//! it, so no socket write ever happens under the lock. A recipient that
//! cannot keep up (queue full) or is already gone (queue closed) is evicted
//! during the broadcast that noticed it. Eviction cancels the entry's
//! [`CancellationToken`], which the owning connection watches, so the socket
//! is closed even while its writer is stuck on a peer that stopped reading.
//! A slow peer therefore loses its connection instead of slowing the fan-out
//! for everyone else.

use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    codec::{FrameCodec, FrameError},
    message::Message,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One connected peer as seen by the registry.
#[derive(Debug)]
pub struct ClientEntry {
    peer: SocketAddr,
    outbound: mpsc::Sender<Bytes>,
    eviction: CancellationToken,
}

impl ClientEntry {
    /// Creates an entry together with the queue its connection drains.
    pub fn new(peer: SocketAddr, outbound_capacity: usize) -> (Self, Outbox) {
        let (outbound, inbound) = mpsc::channel(outbound_capacity.max(1));
        let eviction = CancellationToken::new();
        let outbox = Outbox {
            frames: inbound,
            eviction: eviction.clone(),
        };
        (
            Self {
                peer,
                outbound,
                eviction,
            },
            outbox,
        )
    }

    fn evict(&self) {
        self.eviction.cancel();
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// False once the owning connection has dropped its [`Outbox`].
    pub fn is_alive(&self) -> bool {
        !self.outbound.is_closed()
    }
}

/// Receiving side of a client's outbound queue.
#[derive(Debug)]
pub struct Outbox {
    frames: mpsc::Receiver<Bytes>,
    eviction: CancellationToken,
}

impl Outbox {
    /// Next encoded frame, or `None` once the entry has left the registry and
    /// everything queued before that has been handed out.
    pub async fn next_frame(&mut self) -> Option<Bytes> {
        self.frames.recv().await
    }

    pub fn try_next_frame(&mut self) -> Option<Bytes> {
        self.frames.try_recv().ok()
    }

    /// Cancelled when a broadcast evicts this client. Plain unregistration
    /// leaves it untouched.
    pub fn eviction(&self) -> CancellationToken {
        self.eviction.clone()
    }

    pub fn is_evicted(&self) -> bool {
        self.eviction.is_cancelled()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationHandle {
    id: ClientId,
}

impl RegistrationHandle {
    pub fn id(&self) -> ClientId {
        self.id
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub evicted: Vec<ClientId>,
}

pub struct Registry {
    clients: Mutex<HashMap<ClientId, ClientEntry>>,
    codec: FrameCodec,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new(codec: FrameCodec) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            codec,
            next_id: AtomicU64::new(1),
        }
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<ClientId, ClientEntry>> {
        // Every critical section leaves the map consistent, so a panic in
        // another holder does not invalidate it.
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, entry: ClientEntry) -> RegistrationHandle {
        let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(client = %id, peer = %entry.peer, "client registered");
        self.clients().insert(id, entry);
        RegistrationHandle { id }
    }

    /// Registers `entry` and returns a guard that unregisters it when dropped.
    pub fn register_scoped(self: &Arc<Self>, entry: ClientEntry) -> Registration {
        let handle = self.register(entry);
        Registration {
            registry: Arc::clone(self),
            handle,
        }
    }

    /// Removes the entry. Returns `false` if it was already gone.
    pub fn unregister(&self, handle: &RegistrationHandle) -> bool {
        let removed = self.clients().remove(&handle.id);
        if let Some(entry) = &removed {
            debug!(client = %handle.id, peer = %entry.peer, "client unregistered");
        }
        removed.is_some()
    }

    pub fn contains(&self, handle: &RegistrationHandle) -> bool {
        self.clients().contains_key(&handle.id)
    }

    pub fn len(&self) -> usize {
        self.clients().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients().is_empty()
    }

    /// Queues `message` for every registered client except `excluding`.
    ///
    /// Never blocks. Clients whose queue is full or closed are removed and
    /// listed in the report; delivery to everyone else is unaffected.
    pub fn broadcast(
        &self,
        message: &Message,
        excluding: &RegistrationHandle,
    ) -> Result<BroadcastReport, FrameError> {
        let frame = self.codec.encode_frame(message)?;
        let mut report = BroadcastReport::default();

        self.clients().retain(|id, entry| {
            if *id == excluding.id {
                return true;
            }
            match entry.outbound.try_send(frame.clone()) {
                Ok(()) => {
                    report.delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    warn!(client = %id, peer = %entry.peer, "outbound queue full, evicting slow client");
                    entry.evict();
                    report.evicted.push(*id);
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(client = %id, peer = %entry.peer, "evicting closed client");
                    entry.evict();
                    report.evicted.push(*id);
                    false
                }
            }
        });

        Ok(report)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(FrameCodec::default())
    }
}

/// Scoped registration: the entry leaves the registry when this is dropped,
/// on every exit path of the owning connection.
pub struct Registration {
    registry: Arc<Registry>,
    handle: RegistrationHandle,
}

impl Registration {
    pub fn handle(&self) -> &RegistrationHandle {
        &self.handle
    }

    pub fn id(&self) -> ClientId {
        self.handle.id
    }

    pub fn broadcast(&self, message: &Message) -> Result<BroadcastReport, FrameError> {
        self.registry.broadcast(message, &self.handle)
    }

    /// Leaves the registry now instead of at drop. Safe to repeat.
    pub fn release(&self) -> bool {
        self.registry.unregister(&self.handle)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(&self.handle);
    }
}
