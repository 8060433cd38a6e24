//! Edge abstraction shared by every transport.
//!
//! An [`Edge`] is a live, bidirectional link to one remote transport
//! address. Concrete transports (UDP, TCP, ...) live outside this crate; the
//! only ones provided here are the in-memory transport used by tests and the
//! demo binary, and the path multiplexer which wraps another transport's edges.

use std::{
    collections::VecDeque,
    fmt::Display,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::node::{DataHandler, ReturnPath};

pub mod in_memory;
pub mod path;
mod transport_address;

pub use self::transport_address::{TransportAddress, TransportAddressError};

/// Inbound payloads an edge keeps while nobody is subscribed. Later ones are
/// dropped.
pub const MAX_PENDING_PAYLOADS: usize = 64;

pub type EdgeRef = Arc<dyn Edge>;

/// Callback invoked with a new edge accepted by an [`EdgeListener`].
pub type EdgeHandler = Arc<dyn Fn(EdgeRef) + Send + Sync>;

/// Invoked once when the edge it was registered on closes.
pub type CloseCallback = Box<dyn FnOnce(EdgeId) + Send>;

/// Process-unique identity of an edge, used as the key in every registry that
/// refers to edges.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct EdgeId(u64);

static NEXT_EDGE_ID: AtomicU64 = AtomicU64::new(1);

impl EdgeId {
    pub fn next() -> Self {
        EdgeId(NEXT_EDGE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for EdgeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "edge#{}", self.0)
    }
}

/// Token returned by [`Edge::on_close`], needed to deregister the callback.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct CloseListenerId(u64);

#[derive(Debug, thiserror::Error)]
pub enum EdgeError {
    #[error("{0} is closed")]
    Closed(EdgeId),
    #[error("nothing is listening at {0}")]
    Unreachable(TransportAddress),
    #[error("edge listener is not started")]
    NotStarted,
    #[error("edge listener can only be started once")]
    AlreadyStarted,
    #[error("failed while establishing edge, reason: {cause}")]
    CreationFailure {
        cause: std::borrow::Cow<'static, str>,
    },
}

/// A live transport-level link to a peer.
///
/// Implementations must make [`Edge::close`] idempotent and callable from any
/// thread; close callbacks run exactly once, after the edge is marked closed.
pub trait Edge: Send + Sync + std::fmt::Debug {
    fn id(&self) -> EdgeId;

    fn send(&self, payload: Bytes) -> Result<(), EdgeError>;

    /// Returns `true` only for the call which actually closed the edge.
    fn close(&self) -> bool;

    fn is_closed(&self) -> bool;

    /// Registers a callback for when this edge closes. Returns `None` without
    /// registering anything if the edge is already closed.
    fn on_close(&self, callback: CloseCallback) -> Option<CloseListenerId>;

    fn remove_close_listener(&self, listener: CloseListenerId) -> bool;

    /// Routes inbound payloads to `handler`, replacing any previous one.
    fn subscribe(&self, handler: Arc<dyn DataHandler>);

    fn unsubscribe(&self);

    fn local_address(&self) -> TransportAddress;

    fn remote_address(&self) -> TransportAddress;

    fn is_inbound(&self) -> bool;

    fn created_at(&self) -> Instant;

    /// Identifies the edge to introspection tools.
    fn to_uri(&self) -> String {
        self.remote_address().to_string()
    }
}

/// Produces edges of one transport, both outbound (`create_edge_to`) and
/// inbound (handed to the registered [`EdgeHandler`]).
pub trait EdgeListener: Send + Sync {
    fn start(&self) -> Result<(), EdgeError>;

    fn stop(&self);

    fn is_started(&self) -> bool;

    fn local_addresses(&self) -> Vec<TransportAddress>;

    fn create_edge_to(&self, remote: &TransportAddress)
        -> BoxFuture<'static, Result<EdgeRef, EdgeError>>;

    fn set_edge_handler(&self, handler: EdgeHandler);
}

/// Close bookkeeping and inbound delivery shared by the edge implementations
/// in this crate.
///
/// Payloads which arrive before anybody subscribed are kept and replayed on
/// [`EdgeLifecycle::subscribe`], so a freshly announced edge never loses its
/// first packet.
pub(crate) struct EdgeLifecycle {
    id: EdgeId,
    created_at: Instant,
    close: Mutex<CloseListeners>,
    inbox: Mutex<Inbox>,
}

#[derive(Default)]
struct CloseListeners {
    closed: bool,
    next_id: u64,
    callbacks: Vec<(CloseListenerId, CloseCallback)>,
}

#[derive(Default)]
struct Inbox {
    handler: Option<Arc<dyn DataHandler>>,
    pending: VecDeque<(Bytes, ReturnPath)>,
}

/// Callbacks taken from a lifecycle by the call which closed it.
pub(crate) struct PendingCloseCallbacks {
    id: EdgeId,
    callbacks: Vec<(CloseListenerId, CloseCallback)>,
}

impl PendingCloseCallbacks {
    pub fn fire(self) {
        for (_, callback) in self.callbacks {
            callback(self.id);
        }
    }
}

impl EdgeLifecycle {
    pub fn new() -> Self {
        Self {
            id: EdgeId::next(),
            created_at: Instant::now(),
            close: Mutex::new(CloseListeners::default()),
            inbox: Mutex::new(Inbox::default()),
        }
    }

    pub fn id(&self) -> EdgeId {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_closed(&self) -> bool {
        self.close.lock().closed
    }

    /// Marks the edge closed. Only the first caller gets the callbacks back;
    /// they must be fired once the transport specific teardown is done.
    pub fn begin_close(&self) -> Option<PendingCloseCallbacks> {
        let callbacks = {
            let mut close = self.close.lock();
            if close.closed {
                return None;
            }
            close.closed = true;
            std::mem::take(&mut close.callbacks)
        };
        // drop the handler so handler <-> edge reference cycles are broken
        let mut inbox = self.inbox.lock();
        inbox.handler = None;
        inbox.pending.clear();
        Some(PendingCloseCallbacks {
            id: self.id,
            callbacks,
        })
    }

    pub fn on_close(&self, callback: CloseCallback) -> Option<CloseListenerId> {
        let mut close = self.close.lock();
        if close.closed {
            return None;
        }
        close.next_id += 1;
        let id = CloseListenerId(close.next_id);
        close.callbacks.push((id, callback));
        Some(id)
    }

    pub fn remove_close_listener(&self, listener: CloseListenerId) -> bool {
        let mut close = self.close.lock();
        let before = close.callbacks.len();
        close.callbacks.retain(|(id, _)| *id != listener);
        close.callbacks.len() != before
    }

    pub fn subscribe(&self, handler: Arc<dyn DataHandler>) {
        let pending = {
            let mut inbox = self.inbox.lock();
            inbox.handler = Some(handler.clone());
            std::mem::take(&mut inbox.pending)
        };
        for (payload, from) in pending {
            Self::dispatch(self.id, &handler, payload, &from);
        }
    }

    pub fn unsubscribe(&self) {
        self.inbox.lock().handler = None;
    }

    /// Hands an inbound payload to the current handler, outside of any lock.
    pub fn deliver(&self, payload: Bytes, from: ReturnPath) {
        let handler = {
            let mut inbox = self.inbox.lock();
            match &inbox.handler {
                Some(handler) => handler.clone(),
                None => {
                    if self.is_closed() {
                        return;
                    }
                    if inbox.pending.len() >= MAX_PENDING_PAYLOADS {
                        tracing::debug!(edge = %self.id, "No subscriber and inbox full, dropping payload");
                    } else {
                        inbox.pending.push_back((payload, from));
                    }
                    return;
                }
            }
        };
        Self::dispatch(self.id, &handler, payload, &from);
    }

    fn dispatch(id: EdgeId, handler: &Arc<dyn DataHandler>, payload: Bytes, from: &ReturnPath) {
        if let Err(error) = handler.handle_data(payload, from) {
            tracing::debug!(edge = %id, %error, "Inbound payload rejected by handler");
        }
    }
}
