use std::sync::Arc;

use bytes::Bytes;

use crate::operations::forward::ForwardingSender;
use crate::ring::Address;
use crate::transport::{EdgeError, EdgeRef};

/// Hop limit used when the router has no better estimate for a destination.
pub const DEFAULT_TTL: u16 = 128;

/// Anything a payload can be written to: an edge or a routed path.
pub trait Sender: Send + Sync + std::fmt::Debug {
    fn send(&self, payload: Bytes) -> Result<(), SendError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    Edge(#[from] EdgeError),
    #[error("no route towards {0}")]
    NoRoute(Address),
    #[error("routing failed: {0}")]
    Routing(#[source] anyhow::Error),
}

/// A packet travelling across the overlay, hop by hop.
#[derive(Clone, Debug)]
pub struct RoutedPacket {
    pub source: Address,
    pub destination: Address,
    pub ttl: u16,
    pub payload: Bytes,
}

/// Delivers routed packets towards their destination address. Routing tables
/// and hop selection belong to the implementation.
pub trait Router: Send + Sync {
    fn route(&self, packet: RoutedPacket) -> Result<(), SendError>;

    fn default_ttl(&self, _destination: &Address) -> u16 {
        DEFAULT_TTL
    }
}

/// Sends payloads to a fixed destination through a [`Router`].
#[derive(Clone)]
pub struct RoutedSender {
    router: Arc<dyn Router>,
    source: Address,
    destination: Address,
    ttl: u16,
}

impl RoutedSender {
    pub fn new(router: Arc<dyn Router>, source: Address, destination: Address) -> Self {
        let ttl = router.default_ttl(&destination);
        Self {
            router,
            source,
            destination,
            ttl,
        }
    }

    /// The path back to the origin of `packet`, as seen from `local`.
    pub fn reply_to(router: Arc<dyn Router>, local: Address, packet: &RoutedPacket) -> Self {
        Self::new(router, local, packet.source)
    }

    pub fn source(&self) -> &Address {
        &self.source
    }

    pub fn destination(&self) -> &Address {
        &self.destination
    }

    pub fn router(&self) -> &Arc<dyn Router> {
        &self.router
    }
}

impl Sender for RoutedSender {
    fn send(&self, payload: Bytes) -> Result<(), SendError> {
        self.router.route(RoutedPacket {
            source: self.source,
            destination: self.destination,
            ttl: self.ttl,
            payload,
        })
    }
}

impl std::fmt::Debug for RoutedSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutedSender")
            .field("source", &self.source)
            .field("destination", &self.destination)
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// How an inbound payload reached this node, and therefore how to answer it.
#[derive(Clone, Debug)]
pub enum ReturnPath {
    /// Directly over a transport edge.
    Edge(EdgeRef),
    /// Routed through the overlay from its origin.
    Routed(RoutedSender),
    /// Relayed by an intermediate node on the origin's behalf.
    Forwarding(ForwardingSender),
}

impl ReturnPath {
    pub fn as_edge(&self) -> Option<&EdgeRef> {
        match self {
            ReturnPath::Edge(edge) => Some(edge),
            _ => None,
        }
    }
}

impl Sender for ReturnPath {
    fn send(&self, payload: Bytes) -> Result<(), SendError> {
        match self {
            ReturnPath::Edge(edge) => Ok(edge.send(payload)?),
            ReturnPath::Routed(routed) => routed.send(payload),
            ReturnPath::Forwarding(forwarding) => forwarding.send(payload),
        }
    }
}

impl std::fmt::Display for ReturnPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReturnPath::Edge(edge) => write!(f, "{}", edge.to_uri()),
            ReturnPath::Routed(routed) => write!(f, "routed({})", routed.destination),
            ReturnPath::Forwarding(forwarding) => write!(f, "{forwarding}"),
        }
    }
}
