//! Nodes wired through the in-process router: two hop forwarding and link
//! teardown.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use parking_lot::Mutex;
use ringlink::{
    node::{DataHandler, MemoryRouter, Node, PayloadType, ReturnPath, Sender},
    ring::{Address, Connection, ConnectionEvent, ConnectionType},
    transport::{in_memory::MemoryEdge, Edge, EdgeRef, TransportAddress},
};
use testresult::TestResult;

#[derive(Default)]
struct Inbox {
    received: Mutex<Vec<(Bytes, ReturnPath)>>,
}

impl DataHandler for Inbox {
    fn handle_data(&self, payload: Bytes, from: &ReturnPath) -> anyhow::Result<()> {
        self.received.lock().push((payload, from.clone()));
        Ok(())
    }
}

/// Replies `pong` to every data payload.
struct Echo;

impl DataHandler for Echo {
    fn handle_data(&self, _payload: Bytes, from: &ReturnPath) -> anyhow::Result<()> {
        from.send(PayloadType::Data.encode(b"pong"))?;
        Ok(())
    }
}

fn spawn_nodes(router: &Arc<MemoryRouter>, n: usize) -> Vec<Arc<Node>> {
    (0..n)
        .map(|_| {
            let node = Node::new(Address::random(), router.clone());
            router.register(&node);
            node
        })
        .collect()
}

#[test_log::test(tokio::test)]
async fn relayed_request_and_reply() -> TestResult {
    let router = MemoryRouter::new();
    let nodes = spawn_nodes(&router, 3);
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);
    let inbox_a = Arc::new(Inbox::default());
    a.dispatcher().subscribe(PayloadType::Data, inbox_a.clone());
    c.dispatcher().subscribe(PayloadType::Data, Arc::new(Echo));

    a.forwarder()
        .sender_via(*b.address(), *c.address())
        .send(PayloadType::Data.encode(b"ping"))?;

    let (payload, from) = inbox_a.received.lock().pop().expect("reply from c");
    assert_eq!(payload, Bytes::from_static(b"pong"));
    let ReturnPath::Forwarding(reply) = &from else {
        panic!("expected a forwarding return path, got {from}");
    };
    assert_eq!(reply.destination(), c.address());
    assert_eq!(reply.relay(), b.address());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn forwarding_to_unknown_node_fails_at_relay() -> TestResult {
    let router = MemoryRouter::new();
    let nodes = spawn_nodes(&router, 2);
    let inbox = Arc::new(Inbox::default());
    nodes[0].dispatcher().subscribe(PayloadType::Data, inbox.clone());

    // the relay cannot reach the destination, the failure stays there
    nodes[0]
        .forwarder()
        .sender_via(*nodes[1].address(), Address::random())
        .send(PayloadType::Data.encode(b"lost"))?;
    assert!(inbox.received.lock().is_empty());
    Ok(())
}

fn linked_pair(router: &Arc<MemoryRouter>) -> TestResult<(Arc<Node>, Arc<Node>, EdgeRef, EdgeRef)> {
    let nodes = spawn_nodes(router, 2);
    let (near, far) = MemoryEdge::pair(
        TransportAddress::new("ringlink.mem", "a"),
        TransportAddress::new("ringlink.mem", "b"),
    );
    let (near, far): (EdgeRef, EdgeRef) = (near, far);
    nodes[0].attach_edge(near.clone())?;
    nodes[1].attach_edge(far.clone())?;
    nodes[0].table().add(Arc::new(Connection::new(
        *nodes[1].address(),
        "structured.near",
        near.clone(),
        None,
        None,
    )))?;
    nodes[1].table().add(Arc::new(Connection::new(
        *nodes[0].address(),
        "structured.near",
        far.clone(),
        None,
        None,
    )))?;
    Ok((nodes[0].clone(), nodes[1].clone(), near, far))
}

#[test_log::test(tokio::test)]
async fn closing_a_connection_tears_down_both_sides() -> TestResult {
    let router = MemoryRouter::new();
    let (a, b, near, far) = linked_pair(&router)?;
    let remote = b
        .table()
        .get_connection(ConnectionType::Structured, a.address())
        .expect("b knows a");
    let mut events = a.table().subscribe();

    let local = a
        .table()
        .get_connection(ConnectionType::Structured, b.address())
        .expect("a knows b");
    a.close_connection(&local, "shutting down");
    assert!(local.is_disconnected());
    // the peer aborted its side while answering
    assert!(remote.is_disconnected());

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv()).await??;
    assert!(matches!(event, ConnectionEvent::Disconnected(args) if args.address == *b.address()));
    assert!(near.is_closed());
    assert!(far.is_closed());
    assert_eq!(a.table().total_count(), 0);
    assert_eq!(b.table().total_count(), 0);
    assert_eq!(a.rpc().pending_calls(), 0);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn closing_twice_notifies_once() -> TestResult {
    let router = MemoryRouter::new();
    let (a, b, _near, _far) = linked_pair(&router)?;
    let local = a
        .table()
        .get_connection(ConnectionType::Structured, b.address())
        .expect("a knows b");
    let mut changes = local.subscribe_state();
    a.close_connection(&local, "");
    a.close_connection(&local, "");
    let first = changes.recv().await?;
    assert!(first.new.is_disconnected());
    assert!(changes.try_recv().is_err());
    Ok(())
}
