//! In-process demonstration: two hosts multiplex the configured paths over
//! one in-memory listener each. Every path on host `a` connects to its
//! sibling on host `b`, both sides register the resulting connection, and the
//! links are torn down again through `sys:link.Close`.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use ringlink::{
    config::{ConfigArgs, NodeConfig},
    node::{DataHandler, MemoryRouter, Node, PayloadType, ReturnPath, Sender},
    operations::{
        connect::{ConnectToMessage, ConnectionMessage, ConnectionMessageKind, Direction},
        Linker,
    },
    ring::{Address, Connection, ConnectionEvent, ConnectionTable},
    transport::{
        in_memory::MemoryNetwork,
        path::{join_path, PathEdgeListener, PathElManager},
        EdgeListener, EdgeRef, TransportAddress,
    },
};

const CON_TYPE: &str = "structured.demo";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// One overlay instance bound to a path.
struct PathNode {
    node: Arc<Node>,
    listener: Arc<PathEdgeListener>,
}

struct Host {
    name: &'static str,
    manager: Arc<PathElManager>,
    nodes: Vec<PathNode>,
}

impl Host {
    fn new(
        name: &'static str,
        network: &MemoryNetwork,
        router: &Arc<MemoryRouter>,
        config: &NodeConfig,
        first_address: Address,
    ) -> anyhow::Result<Self> {
        let manager = PathElManager::new(network.listener(name));
        let mut nodes = Vec::with_capacity(config.paths.len());
        for (idx, path) in config.paths.iter().enumerate() {
            let address = if idx == 0 { first_address } else { Address::random() };
            let node = Node::new(address, router.clone());
            router.register(&node);
            ringlink::tracing::spawn_connection_log(format!("{name}{path}"), node.table());
            node.start(config.heartbeat_period);

            let listener = manager.create_path(path)?;
            let attach = Arc::downgrade(&node);
            listener.set_edge_handler(Arc::new(move |edge: EdgeRef| {
                if let Some(node) = attach.upgrade() {
                    if let Err(error) = node.attach_edge(edge) {
                        tracing::warn!(%error, "Failed attaching inbound edge");
                    }
                }
            }));
            listener.start()?;
            nodes.push(PathNode { node, listener });
        }
        manager.start()?;
        Ok(Self {
            name,
            manager,
            nodes,
        })
    }

    fn address(&self) -> TransportAddress {
        self.manager
            .underlying()
            .local_addresses()
            .into_iter()
            .next()
            .unwrap_or_else(|| TransportAddress::new("ringlink.mem", self.name))
    }

    fn serve_connect_requests(&self) {
        for path_node in &self.nodes {
            let responder = Arc::new(ConnectResponder {
                address: *path_node.node.address(),
                table: path_node.node.table().clone(),
                addresses: path_node.listener.local_addresses(),
            });
            path_node
                .node
                .dispatcher()
                .subscribe(PayloadType::Connection, responder);
        }
    }
}

/// Accepts connect requests arriving over direct edges.
struct ConnectResponder {
    address: Address,
    table: ConnectionTable,
    addresses: Vec<TransportAddress>,
}

impl DataHandler for ConnectResponder {
    fn handle_data(&self, payload: Bytes, from: &ReturnPath) -> anyhow::Result<()> {
        let message = ConnectionMessage::from_payload(&payload)?;
        let ConnectionMessage {
            id,
            dir: Direction::Request,
            msg: ConnectionMessageKind::ConnectTo(request),
        } = message
        else {
            return Ok(());
        };
        let edge = from
            .as_edge()
            .context("connect request did not arrive over an edge")?;
        self.table.add(Arc::new(Connection::new(
            request.target,
            request.con_type.clone(),
            edge.clone(),
            None,
            None,
        )))?;
        let response = ConnectionMessage::response(
            id,
            ConnectToMessage {
                con_type: request.con_type,
                target: self.address,
                transport_addresses: self.addresses.clone(),
            },
        );
        from.send(response.to_packet()?)?;
        Ok(())
    }
}

/// Registers the connection once the peer answered.
struct EdgeLinker {
    edge: EdgeRef,
    table: ConnectionTable,
}

impl Linker for EdgeLinker {
    fn start_link(&self, response: &ConnectToMessage) -> anyhow::Result<()> {
        self.table.add(Arc::new(Connection::new(
            response.target,
            response.con_type.clone(),
            self.edge.clone(),
            None,
            None,
        )))?;
        Ok(())
    }
}

async fn connect(from: &PathNode, to: &PathNode, remote: TransportAddress) -> anyhow::Result<()> {
    let edge = from.listener.create_edge_to(&remote).await?;
    from.node.attach_edge(edge.clone())?;
    let mut events = from.node.table().subscribe();

    let connector = from.node.connector(Arc::new(EdgeLinker {
        edge: edge.clone(),
        table: from.node.table().clone(),
    }));
    let request_id = rand::random();
    let request = ConnectionMessage::request(
        request_id,
        ConnectToMessage {
            con_type: CON_TYPE.to_owned(),
            target: *from.node.address(),
            transport_addresses: from.listener.local_addresses(),
        },
    );
    let via: Arc<dyn Sender> = Arc::new(ReturnPath::Edge(edge));
    connector.connect(via, request.to_packet()?, request_id)?;

    let connected = tokio::time::timeout(CONNECT_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::Connected(args)) if args.address == *to.node.address() => {
                    break Ok(args.connection)
                }
                Ok(_) => continue,
                Err(error) => break Err(error),
            }
        }
    })
    .await
    .context("connect timed out")??;
    // the link is up, stop waiting for duplicate responses
    connector.cancel();
    tracing::info!(connection = %connected, "Link established");
    Ok(())
}

async fn run(config: NodeConfig) -> anyhow::Result<()> {
    let network = MemoryNetwork::new();
    let router = MemoryRouter::new();
    let host_a = Host::new("a", &network, &router, &config, config.address())?;
    let host_b = Host::new("b", &network, &router, &config, Address::random())?;
    host_b.serve_connect_requests();

    for (from, to) in host_a.nodes.iter().zip(&host_b.nodes) {
        let remote = join_path(&host_b.address(), to.listener.path());
        connect(from, to, remote).await?;
    }
    for path_node in host_a.nodes.iter().chain(&host_b.nodes) {
        println!("{}", path_node.node.table());
    }

    for path_node in &host_a.nodes {
        for connection in path_node.node.table().connections() {
            path_node.node.close_connection(&connection, "demo finished");
        }
    }
    tokio::time::sleep(Duration::from_secs(1)).await;
    let remaining: usize = host_a
        .nodes
        .iter()
        .chain(&host_b.nodes)
        .map(|path_node| path_node.node.table().total_count())
        .sum();
    tracing::info!(remaining, "Links closed");

    host_a.manager.stop();
    host_b.manager.stop();
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = ConfigArgs::parse();
    if args.version {
        println!("ringlink {}", args.current_version());
        return Ok(());
    }
    let config = args.build()?;
    ringlink::tracing::tracer::init_tracer(Some(config.log_level))?;
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;
    rt.block_on(run(config))
}
