use std::{convert::Infallible, fmt::Display, sync::Arc};

use arc_swap::ArcSwap;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use super::Address;
use crate::config::GlobalExecutor;
use crate::node::{rpc::RpcManager, rpc::RpcRequest, ReturnPath};
use crate::transport::EdgeRef;

const STATE_EVENT_CAPACITY: usize = 32;

/// Role a connection plays in the overlay.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum ConnectionType {
    Leaf,
    Structured,
    Unstructured,
    Unknown,
}

impl ConnectionType {
    pub const ALL: [ConnectionType; 4] = [
        ConnectionType::Leaf,
        ConnectionType::Structured,
        ConnectionType::Unstructured,
        ConnectionType::Unknown,
    ];

    /// Main type of a dotted connection type string, e.g. `structured.near`.
    /// Matching is case insensitive; anything unrecognised is `Unknown`.
    pub fn from_con_type(con_type: &str) -> Self {
        let main = con_type.split('.').next().unwrap_or_default();
        match main.to_ascii_lowercase().as_str() {
            "leaf" => ConnectionType::Leaf,
            "structured" => ConnectionType::Structured,
            "unstructured" => ConnectionType::Unstructured,
            _ => ConnectionType::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionType::Leaf => "leaf",
            ConnectionType::Structured => "structured",
            ConnectionType::Unstructured => "unstructured",
            ConnectionType::Unknown => "unknown",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last status a peer reported about itself. Opaque to this crate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusMessage(pub Bytes);

/// Link message the peer sent while the connection was negotiated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkMessage(pub Bytes);

/// Immutable snapshot of the mutable half of a [`Connection`].
#[derive(Clone, Debug)]
pub struct ConnectionState {
    edge: EdgeRef,
    status: Option<StatusMessage>,
    peer_link: Option<LinkMessage>,
    disconnected: bool,
}

impl ConnectionState {
    pub fn new(edge: EdgeRef, status: Option<StatusMessage>, peer_link: Option<LinkMessage>) -> Self {
        Self {
            edge,
            status,
            peer_link,
            disconnected: false,
        }
    }

    pub fn edge(&self) -> &EdgeRef {
        &self.edge
    }

    pub fn status(&self) -> Option<&StatusMessage> {
        self.status.as_ref()
    }

    pub fn peer_link(&self) -> Option<&LinkMessage> {
        self.peer_link.as_ref()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    fn as_disconnected(&self) -> Self {
        Self {
            disconnected: true,
            ..self.clone()
        }
    }
}

/// An `(old, new)` pair produced by every state replacement.
#[derive(Clone, Debug)]
pub struct StateChange {
    pub old: Arc<ConnectionState>,
    pub new: Arc<ConnectionState>,
}

impl StateChange {
    /// Whether the replacement actually swapped in a new snapshot.
    pub fn changed(&self) -> bool {
        !Arc::ptr_eq(&self.old, &self.new)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection to {0} is disconnected")]
    Disconnected(Address),
}

/// Stable introspection view of a connection. Crawlers depend on these keys.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub address: String,
    pub sender: String,
    #[serde(rename = "type")]
    pub con_type: String,
}

/// The overlay level relationship to one peer.
///
/// Identity (address, type, creation time) never changes. The state is an
/// atomically swapped snapshot; once it is disconnected every further
/// mutation fails with [`ConnectionError::Disconnected`].
pub struct Connection {
    address: Address,
    con_type: String,
    main_type: ConnectionType,
    created_at: DateTime<Utc>,
    state: ArcSwap<ConnectionState>,
    state_events: broadcast::Sender<StateChange>,
}

impl Connection {
    pub const DICT_KEYS: [&'static str; 3] = ["address", "sender", "type"];

    pub fn new(
        address: Address,
        con_type: impl Into<String>,
        edge: EdgeRef,
        status: Option<StatusMessage>,
        peer_link: Option<LinkMessage>,
    ) -> Self {
        let con_type = con_type.into();
        let (state_events, _) = broadcast::channel(STATE_EVENT_CAPACITY);
        Self {
            address,
            main_type: ConnectionType::from_con_type(&con_type),
            con_type,
            created_at: Utc::now(),
            state: ArcSwap::from_pointee(ConnectionState::new(edge, status, peer_link)),
            state_events,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn con_type(&self) -> &str {
        &self.con_type
    }

    pub fn main_type(&self) -> ConnectionType {
        self.main_type
    }

    /// Everything from the first `.` of the type string on, or `""`.
    pub fn sub_type(&self) -> &str {
        self.con_type
            .find('.')
            .map(|idx| &self.con_type[idx..])
            .unwrap_or_default()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> Arc<ConnectionState> {
        self.state.load_full()
    }

    pub fn edge(&self) -> EdgeRef {
        self.state.load().edge.clone()
    }

    pub fn is_disconnected(&self) -> bool {
        self.state.load().disconnected
    }

    /// Notified with every state replacement that changed something.
    pub fn subscribe_state(&self) -> broadcast::Receiver<StateChange> {
        self.state_events.subscribe()
    }

    /// Marks the connection disconnected. Repeated calls return `old == new`
    /// and notify nobody.
    pub fn abort(&self) -> StateChange {
        self.update(|current| {
            Ok::<_, Infallible>((!current.disconnected).then(|| current.as_disconnected()))
        })
        .unwrap_or_else(|never| match never {})
    }

    /// Aborts the connection and, if it was still live, tells the peer
    /// through `sys:link.Close`. The edge is closed once that call resolves,
    /// whatever the outcome, or right away when it cannot be sent.
    pub fn close(&self, rpc: &RpcManager, reason: &str) -> StateChange {
        let change = self.abort();
        if change.old.disconnected {
            return change;
        }
        let edge = change.new.edge.clone();
        let request = RpcRequest::LinkClose {
            reason: (!reason.is_empty()).then(|| reason.to_owned()),
        };
        match rpc.invoke(&ReturnPath::Edge(edge.clone()), request) {
            Ok(reply) => {
                let address = self.address;
                GlobalExecutor::spawn(async move {
                    if let Err(error) = reply.await {
                        tracing::debug!(%address, %error, "Close notification not acknowledged");
                    }
                    edge.close();
                });
            }
            Err(error) => {
                tracing::debug!(address = %self.address, %error, "Failed sending close notification");
                edge.close();
            }
        }
        change
    }

    /// Replaces the edge and the peer's link message. A connection held by a
    /// [`ConnectionTable`](super::ConnectionTable) must be moved with
    /// [`ConnectionTable::set_edge`](super::ConnectionTable::set_edge) so the
    /// table follows the new edge.
    pub fn set_edge(
        &self,
        edge: EdgeRef,
        peer_link: Option<LinkMessage>,
    ) -> Result<StateChange, ConnectionError> {
        self.update(|current| {
            self.ensure_live(current)?;
            Ok(Some(ConnectionState {
                edge: edge.clone(),
                peer_link: peer_link.clone(),
                ..current.clone()
            }))
        })
    }

    pub fn set_status(&self, status: StatusMessage) -> Result<StateChange, ConnectionError> {
        self.update(|current| {
            self.ensure_live(current)?;
            Ok(Some(ConnectionState {
                status: Some(status.clone()),
                ..current.clone()
            }))
        })
    }

    /// Replaces the whole state. Edge changes of a registered connection go
    /// through [`ConnectionTable::set_edge`](super::ConnectionTable::set_edge).
    pub fn set_state(&self, state: ConnectionState) -> Result<StateChange, ConnectionError> {
        self.update(|current| {
            self.ensure_live(current)?;
            Ok(Some(state.clone()))
        })
    }

    pub fn to_dictionary(&self) -> ConnectionInfo {
        ConnectionInfo {
            address: self.address.to_string(),
            sender: self.edge().to_uri(),
            con_type: self.con_type.clone(),
        }
    }

    fn ensure_live(&self, current: &ConnectionState) -> Result<(), ConnectionError> {
        if current.disconnected {
            Err(ConnectionError::Disconnected(self.address))
        } else {
            Ok(())
        }
    }

    /// Compare-and-swap loop around `derive`. Returning `Ok(None)` leaves the
    /// state as it is.
    fn update<E, F>(&self, derive: F) -> Result<StateChange, E>
    where
        F: Fn(&ConnectionState) -> Result<Option<ConnectionState>, E>,
    {
        loop {
            let current = self.state.load_full();
            let Some(next) = derive(&current)? else {
                return Ok(StateChange {
                    old: current.clone(),
                    new: current,
                });
            };
            let next = Arc::new(next);
            let previous = self.state.compare_and_swap(&current, next.clone());
            if Arc::ptr_eq(&*previous, &current) {
                let change = StateChange { old: current, new: next };
                tracing::trace!(address = %self.address, disconnected = change.new.disconnected, "Connection state replaced");
                let _ = self.state_events.send(change.clone());
                return Ok(change);
            }
        }
    }
}

impl Display for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.load();
        write!(
            f,
            "Connection: con_type: {}, address: {}, edge: {}, disconnected: {}",
            self.con_type,
            self.address,
            state.edge.to_uri(),
            state.disconnected
        )
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("con_type", &self.con_type)
            .field("edge", &self.state.load().edge.id())
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}
