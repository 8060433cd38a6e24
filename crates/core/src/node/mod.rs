//! The node: dispatch point, request-reply substrate, heartbeat and routed
//! senders, wired together by [`Node`].
//!
//! Every payload carries a one byte [`PayloadType`] tag. Edges attached to a
//! node feed the [`Dispatcher`], which hands the untagged payload to the
//! subscribers of that tag together with the [`ReturnPath`] to answer on.

use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;

use crate::config::GlobalExecutor;
use crate::operations::{Connector, Linker, PacketForwarder};
use crate::ring::{Address, Connection, ConnectionTable, TableError};
use crate::transport::EdgeRef;

pub mod dispatch;
pub mod heartbeat;
pub mod in_memory_impl;
pub mod rpc;
mod sender;

pub use self::dispatch::{DataHandler, DispatchError, Dispatcher, PayloadType, SubscriptionId};
pub use self::heartbeat::{Heartbeat, HeartbeatHandler, HeartbeatToken};
pub use self::in_memory_impl::MemoryRouter;
pub use self::sender::{
    ReturnPath, RoutedPacket, RoutedSender, Router, SendError, Sender, DEFAULT_TTL,
};

use self::rpc::{RpcFault, RpcHandler, RpcManager, RpcRequest, RpcService, RpcValue, INVALID_PARAMS};

/// How long the peer of a closed link keeps the edge open, so the
/// acknowledgement can leave before the edge goes away.
const LINK_CLOSE_LINGER: Duration = Duration::from_millis(500);

/// One overlay participant.
pub struct Node {
    address: Address,
    table: ConnectionTable,
    dispatcher: Arc<Dispatcher>,
    rpc: Arc<RpcManager>,
    heartbeat: Arc<Heartbeat>,
    forwarder: Arc<PacketForwarder>,
    router: Arc<dyn Router>,
}

impl Node {
    pub fn new(address: Address, router: Arc<dyn Router>) -> Arc<Self> {
        let table = ConnectionTable::new();
        let dispatcher = Arc::new(Dispatcher::new());
        let heartbeat = Arc::new(Heartbeat::new());

        let rpc = Arc::new(RpcManager::new(PayloadType::Rpc));
        rpc.add_handler(
            RpcService::Link,
            Arc::new(LinkService {
                table: table.clone(),
            }),
        );
        dispatcher.subscribe(PayloadType::Rpc, rpc.clone());
        heartbeat.subscribe(rpc.clone());

        let forwarder = Arc::new(PacketForwarder::new(
            address,
            router.clone(),
            dispatcher.clone(),
        ));
        dispatcher.subscribe(PayloadType::Forwarding, forwarder.clone());

        tracing::debug!(%address, "Node created");
        Arc::new(Self {
            address,
            table,
            dispatcher,
            rpc,
            heartbeat,
            forwarder,
            router,
        })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn table(&self) -> &ConnectionTable {
        &self.table
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn rpc(&self) -> &Arc<RpcManager> {
        &self.rpc
    }

    pub fn heartbeat(&self) -> &Arc<Heartbeat> {
        &self.heartbeat
    }

    pub fn forwarder(&self) -> &PacketForwarder {
        &self.forwarder
    }

    /// Starts ticking the heartbeat every `period`.
    pub fn start(&self, period: Duration) -> JoinHandle<()> {
        self.heartbeat.spawn(period)
    }

    /// Feeds everything `edge` receives into the dispatcher and tracks it as
    /// unconnected until a [`Connection`] is added for it.
    pub fn attach_edge(&self, edge: EdgeRef) -> Result<(), TableError> {
        edge.subscribe(self.dispatcher.clone());
        self.table.add_unconnected(edge)?;
        Ok(())
    }

    /// Entry point for packets the router delivers to this node.
    pub fn deliver_routed(&self, packet: RoutedPacket) -> Result<(), DispatchError> {
        let from = ReturnPath::Routed(RoutedSender::reply_to(
            self.router.clone(),
            self.address,
            &packet,
        ));
        self.dispatcher.announce(packet.payload, &from)
    }

    /// A sender routing to `destination` from this node.
    pub fn routed_sender(&self, destination: Address) -> RoutedSender {
        RoutedSender::new(self.router.clone(), self.address, destination)
    }

    /// A fresh connector bound to this node's heartbeat and dispatcher.
    pub fn connector(&self, linker: Arc<dyn Linker>) -> Arc<Connector> {
        Connector::new(self.heartbeat.clone(), self.dispatcher.clone(), linker)
    }

    /// Closes `connection`, notifying the peer.
    pub fn close_connection(&self, connection: &Connection, reason: &str) {
        let change = connection.close(&self.rpc, reason);
        if change.changed() {
            tracing::info!(address = %connection.address(), reason, "Connection closed");
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("address", &self.address)
            .field("connections", &self.table.total_count())
            .finish()
    }
}

/// Answers `sys:link.Close` from a peer that is tearing a link down.
struct LinkService {
    table: ConnectionTable,
}

impl RpcHandler for LinkService {
    fn handle_rpc(&self, caller: &ReturnPath, request: RpcRequest) -> Result<RpcValue, RpcFault> {
        let RpcRequest::LinkClose { reason } = request else {
            return Err(RpcFault::method_not_found(request.method()));
        };
        let Some(edge) = caller.as_edge() else {
            return Err(RpcFault::new(
                INVALID_PARAMS,
                format!("link close must arrive over an edge, got {caller}"),
            ));
        };
        match self.table.get_connection_by_edge(edge.id()) {
            Some(connection) => {
                connection.abort();
                tracing::info!(
                    address = %connection.address(),
                    reason = reason.as_deref().unwrap_or(""),
                    "Peer closed the connection"
                );
            }
            None => tracing::debug!(edge = %edge.id(), "Link close for an edge without connection"),
        }
        let edge = edge.clone();
        GlobalExecutor::spawn(async move {
            tokio::time::sleep(LINK_CLOSE_LINGER).await;
            edge.close();
        });
        Ok(RpcValue::Bool(true))
    }
}
