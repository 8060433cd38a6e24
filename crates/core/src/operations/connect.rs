//! Outbound "connect to" handshake.
//!
//! A [`Connector`] sends one correlated request, resends it on heartbeat
//! ticks while no response arrived, and hands the first matching response to
//! a [`Linker`] which negotiates the actual link. Late duplicates are recorded
//! but never start a second link.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::node::{
    heartbeat::{Heartbeat, HeartbeatHandler, HeartbeatToken},
    DataHandler, Dispatcher, PayloadType, ReturnPath, SendError, Sender, SubscriptionId,
};
use crate::util::{SystemClock, TimeSource};

pub use self::messages::{ConnectToMessage, ConnectionMessage, ConnectionMessageKind, Direction};

/// Timeouts tolerated before the attempt is finished.
pub const MAX_TIMEOUTS: u32 = 3;
/// Time to wait for a response after each send.
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Negotiates the link once a peer answered the connect request.
pub trait Linker: Send + Sync {
    fn start_link(&self, response: &ConnectToMessage) -> anyhow::Result<()>;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConnectorState {
    Idle,
    AwaitingResponse,
    /// A response arrived and the link was started; duplicates are still
    /// collected until the attempt window closes.
    Linking,
    Completed,
    Exhausted,
    Failed,
    Cancelled,
}

impl ConnectorState {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            ConnectorState::Completed
                | ConnectorState::Exhausted
                | ConnectorState::Failed
                | ConnectorState::Cancelled
        )
    }
}

#[derive(Clone, Debug)]
pub struct ConnectorOutcome {
    pub state: ConnectorState,
    pub received: Vec<ConnectToMessage>,
}

impl ConnectorOutcome {
    pub fn is_success(&self) -> bool {
        !self.received.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("connector was already used for an attempt")]
    AlreadyStarted,
    #[error("failed sending connect request: {0}")]
    Send(#[from] SendError),
}

struct ConnectorInner {
    state: ConnectorState,
    sender: Option<Arc<dyn Sender>>,
    request: Bytes,
    request_id: u32,
    timeouts: u32,
    last_send: Option<Instant>,
    received: Vec<ConnectToMessage>,
    malformed: u64,
    heartbeat_token: Option<HeartbeatToken>,
    subscription: Option<SubscriptionId>,
    finish_listeners: Vec<oneshot::Sender<ConnectorOutcome>>,
}

enum TickAction {
    Wait,
    Resend(Arc<dyn Sender>, Bytes),
    Finish(ConnectorState),
}

pub struct Connector<T: TimeSource = SystemClock> {
    heartbeat: Arc<Heartbeat>,
    dispatcher: Arc<Dispatcher>,
    linker: Arc<dyn Linker>,
    time_source: T,
    inner: Mutex<ConnectorInner>,
}

impl Connector<SystemClock> {
    pub fn new(
        heartbeat: Arc<Heartbeat>,
        dispatcher: Arc<Dispatcher>,
        linker: Arc<dyn Linker>,
    ) -> Arc<Self> {
        Self::with_time_source(heartbeat, dispatcher, linker, SystemClock)
    }
}

impl<T> Connector<T>
where
    T: TimeSource + Send + Sync + 'static,
{
    pub fn with_time_source(
        heartbeat: Arc<Heartbeat>,
        dispatcher: Arc<Dispatcher>,
        linker: Arc<dyn Linker>,
        time_source: T,
    ) -> Arc<Self> {
        Arc::new(Self {
            heartbeat,
            dispatcher,
            linker,
            time_source,
            inner: Mutex::new(ConnectorInner {
                state: ConnectorState::Idle,
                sender: None,
                request: Bytes::new(),
                request_id: 0,
                timeouts: 0,
                last_send: None,
                received: Vec::new(),
                malformed: 0,
                heartbeat_token: None,
                subscription: None,
                finish_listeners: Vec::new(),
            }),
        })
    }

    /// Sends `request` (a full connection packet) through `sender` and starts
    /// waiting for the response correlated by `request_id`.
    pub fn connect(
        self: &Arc<Self>,
        sender: Arc<dyn Sender>,
        request: Bytes,
        request_id: u32,
    ) -> Result<(), ConnectorError> {
        {
            let mut inner = self.inner.lock();
            if inner.state != ConnectorState::Idle {
                return Err(ConnectorError::AlreadyStarted);
            }
            inner.state = ConnectorState::AwaitingResponse;
            inner.sender = Some(sender.clone());
            inner.request = request.clone();
            inner.request_id = request_id;
            inner.last_send = Some(self.time_source.now());
            inner.subscription = Some(
                self.dispatcher
                    .subscribe(PayloadType::Connection, self.clone()),
            );
            inner.heartbeat_token = Some(self.heartbeat.subscribe(self.clone()));
        }
        tracing::debug!(request_id, to = ?sender, "Sending connect request");
        if let Err(error) = sender.send(request) {
            tracing::debug!(request_id, %error, "Connect request could not be sent");
            self.finish(ConnectorState::Failed);
            return Err(error.into());
        }
        Ok(())
    }

    /// Ends the attempt early. Returns `false` if it had already finished.
    pub fn cancel(&self) -> bool {
        self.finish(ConnectorState::Cancelled)
    }

    /// Resolves once, when the attempt finishes.
    pub fn subscribe_finish(&self) -> oneshot::Receiver<ConnectorOutcome> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        if inner.state.is_finished() {
            let _ = tx.send(ConnectorOutcome {
                state: inner.state,
                received: inner.received.clone(),
            });
        } else {
            inner.finish_listeners.push(tx);
        }
        rx
    }

    pub fn state(&self) -> ConnectorState {
        self.inner.lock().state
    }

    /// Every response seen so far, duplicates included.
    pub fn received_ctms(&self) -> Vec<ConnectToMessage> {
        self.inner.lock().received.clone()
    }

    pub fn timeouts(&self) -> u32 {
        self.inner.lock().timeouts
    }

    /// Connection payloads which could not be decoded.
    pub fn malformed_count(&self) -> u64 {
        self.inner.lock().malformed
    }

    fn finish(&self, state: ConnectorState) -> bool {
        let (outcome, listeners, heartbeat_token, subscription) = {
            let mut inner = self.inner.lock();
            if inner.state.is_finished() {
                return false;
            }
            inner.state = state;
            inner.sender = None;
            (
                ConnectorOutcome {
                    state,
                    received: inner.received.clone(),
                },
                std::mem::take(&mut inner.finish_listeners),
                inner.heartbeat_token.take(),
                inner.subscription.take(),
            )
        };
        if let Some(token) = heartbeat_token {
            self.heartbeat.unsubscribe(token);
        }
        if let Some(subscription) = subscription {
            self.dispatcher
                .unsubscribe(PayloadType::Connection, subscription);
        }
        tracing::debug!(?state, responses = outcome.received.len(), "Connector finished");
        for listener in listeners {
            let _ = listener.send(outcome.clone());
        }
        true
    }
}

impl<T> HeartbeatHandler for Connector<T>
where
    T: TimeSource + Send + Sync + 'static,
{
    fn on_heartbeat(&self, now: Instant) {
        let action = {
            let mut inner = self.inner.lock();
            match inner.last_send {
                _ if inner.state.is_finished() => TickAction::Wait,
                Some(last) if now.saturating_duration_since(last) >= ATTEMPT_TIMEOUT => {
                    if inner.timeouts >= MAX_TIMEOUTS {
                        TickAction::Finish(if inner.received.is_empty() {
                            ConnectorState::Exhausted
                        } else {
                            ConnectorState::Completed
                        })
                    } else {
                        inner.last_send = Some(now);
                        inner.timeouts += 1;
                        match (&inner.sender, inner.received.is_empty()) {
                            (Some(sender), true) => {
                                TickAction::Resend(sender.clone(), inner.request.clone())
                            }
                            _ => TickAction::Wait,
                        }
                    }
                }
                _ => TickAction::Wait,
            }
        };
        match action {
            TickAction::Wait => {}
            TickAction::Resend(sender, request) => {
                tracing::debug!(to = ?sender, "Connect request timed out, resending");
                if let Err(error) = sender.send(request) {
                    tracing::debug!(%error, "Connect request resend failed");
                    self.finish(ConnectorState::Failed);
                }
            }
            TickAction::Finish(state) => {
                self.finish(state);
            }
        }
    }
}

impl<T> DataHandler for Connector<T>
where
    T: TimeSource + Send + Sync + 'static,
{
    fn handle_data(&self, payload: Bytes, from: &ReturnPath) -> anyhow::Result<()> {
        let message = match ConnectionMessage::from_payload(&payload) {
            Ok(message) => message,
            Err(error) => {
                let malformed = {
                    let mut inner = self.inner.lock();
                    inner.malformed += 1;
                    inner.malformed
                };
                tracing::debug!(%from, %error, malformed, "Ignoring malformed connection message");
                return Ok(());
            }
        };
        let ConnectionMessage {
            id,
            dir: Direction::Response,
            msg: ConnectionMessageKind::ConnectTo(response),
        } = message
        else {
            return Ok(());
        };
        let start_link = {
            let mut inner = self.inner.lock();
            if id != inner.request_id
                || inner.state == ConnectorState::Idle
                || inner.state.is_finished()
            {
                return Ok(());
            }
            inner.received.push(response.clone());
            let first = inner.state == ConnectorState::AwaitingResponse;
            if first {
                inner.state = ConnectorState::Linking;
            }
            first
        };
        if start_link {
            tracing::debug!(target = %response.target, con_type = %response.con_type, "Connect response received, linking");
            if let Err(error) = self.linker.start_link(&response) {
                tracing::warn!(%error, "Failed starting link");
            }
        } else {
            tracing::trace!(id, "Duplicate connect response");
        }
        Ok(())
    }
}

pub mod messages {
    use std::fmt::Display;

    use bytes::Bytes;
    use serde::{Deserialize, Serialize};

    use crate::node::PayloadType;
    use crate::ring::Address;
    use crate::transport::TransportAddress;

    #[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
    pub enum Direction {
        Request,
        Response,
    }

    /// Who to connect to, how, and as what.
    #[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
    pub struct ConnectToMessage {
        pub con_type: String,
        pub target: Address,
        pub transport_addresses: Vec<TransportAddress>,
    }

    #[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
    pub enum ConnectionMessageKind {
        ConnectTo(ConnectToMessage),
        Error { message: String },
    }

    #[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
    pub struct ConnectionMessage {
        pub id: u32,
        pub dir: Direction,
        pub msg: ConnectionMessageKind,
    }

    impl ConnectionMessage {
        pub fn request(id: u32, ctm: ConnectToMessage) -> Self {
            Self {
                id,
                dir: Direction::Request,
                msg: ConnectionMessageKind::ConnectTo(ctm),
            }
        }

        pub fn response(id: u32, ctm: ConnectToMessage) -> Self {
            Self {
                id,
                dir: Direction::Response,
                msg: ConnectionMessageKind::ConnectTo(ctm),
            }
        }

        /// The message as a tagged payload, ready to be sent.
        pub fn to_packet(&self) -> Result<Bytes, bincode::Error> {
            Ok(PayloadType::Connection.encode(&bincode::serialize(self)?))
        }

        /// Decodes a payload whose tag was already stripped.
        pub fn from_payload(payload: &[u8]) -> Result<Self, bincode::Error> {
            bincode::deserialize(payload)
        }
    }

    impl Display for ConnectionMessage {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match &self.msg {
                ConnectionMessageKind::ConnectTo(ctm) => {
                    write!(f, "ConnectTo(id: {}, {:?}, target: {})", self.id, self.dir, ctm.target)
                }
                ConnectionMessageKind::Error { message } => {
                    write!(f, "Error(id: {}, {:?}, {message})", self.id, self.dir)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::ring::Address;
    use crate::transport::in_memory::MemoryEdge;
    use crate::transport::TransportAddress;
    use crate::util::MockTimeSource;

    #[derive(Debug, Default)]
    struct CountingSender {
        sent: AtomicUsize,
    }

    impl Sender for CountingSender {
        fn send(&self, _payload: Bytes) -> Result<(), SendError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingLinker {
        started: AtomicUsize,
    }

    impl Linker for CountingLinker {
        fn start_link(&self, _response: &ConnectToMessage) -> anyhow::Result<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        clock: MockTimeSource,
        heartbeat: Arc<Heartbeat>,
        dispatcher: Arc<Dispatcher>,
        sender: Arc<CountingSender>,
        linker: Arc<CountingLinker>,
        connector: Arc<Connector<MockTimeSource>>,
        from: ReturnPath,
    }

    const REQUEST_ID: u32 = 42;

    fn ctm() -> ConnectToMessage {
        ConnectToMessage {
            con_type: "structured.near".into(),
            target: Address::random(),
            transport_addresses: vec!["ringlink.mem://peer/".parse().unwrap()],
        }
    }

    impl Harness {
        fn start() -> Self {
            let clock = MockTimeSource::new(Instant::now());
            let heartbeat = Arc::new(Heartbeat::new());
            let dispatcher = Arc::new(Dispatcher::new());
            let sender = Arc::new(CountingSender::default());
            let linker = Arc::new(CountingLinker::default());
            let connector = Connector::with_time_source(
                heartbeat.clone(),
                dispatcher.clone(),
                linker.clone(),
                clock.clone(),
            );
            let request = ConnectionMessage::request(REQUEST_ID, ctm())
                .to_packet()
                .unwrap();
            connector
                .connect(sender.clone(), request, REQUEST_ID)
                .unwrap();
            let (edge, _) = MemoryEdge::pair(
                TransportAddress::new("ringlink.mem", "a"),
                TransportAddress::new("ringlink.mem", "b"),
            );
            Self {
                clock,
                heartbeat,
                dispatcher,
                sender,
                linker,
                connector,
                from: ReturnPath::Edge(edge),
            }
        }

        fn tick_after(&self, millis: u64) {
            self.clock.advance_time(Duration::from_millis(millis));
            self.heartbeat.tick(self.clock.now());
        }

        fn respond(&self, id: u32) {
            let packet = ConnectionMessage::response(id, ctm()).to_packet().unwrap();
            self.dispatcher.announce(packet, &self.from).unwrap();
        }

        fn sends(&self) -> usize {
            self.sender.sent.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn unanswered_request_is_resent_then_exhausted() {
        let harness = Harness::start();
        let mut finished = harness.connector.subscribe_finish();
        assert_eq!(harness.sends(), 1);

        harness.tick_after(4_999);
        assert_eq!(harness.sends(), 1);
        harness.tick_after(1);
        assert_eq!(harness.sends(), 2);
        harness.tick_after(5_000);
        harness.tick_after(5_000);
        assert_eq!(harness.sends(), 4);
        assert!(finished.try_recv().is_err());

        harness.tick_after(5_000);
        assert_eq!(harness.sends(), 4);
        let outcome = finished.try_recv().expect("finished");
        assert_eq!(outcome.state, ConnectorState::Exhausted);
        assert!(!outcome.is_success());
        assert_eq!(harness.heartbeat.subscriber_count(), 0);
        assert_eq!(harness.dispatcher.subscriber_count(PayloadType::Connection), 0);

        harness.tick_after(5_000);
        assert_eq!(harness.sends(), 4);
        assert_eq!(harness.connector.state(), ConnectorState::Exhausted);
    }

    #[test]
    fn late_response_stops_resends_and_links_once() {
        let harness = Harness::start();
        harness.tick_after(5_000);
        harness.tick_after(5_000);
        assert_eq!(harness.sends(), 3);

        harness.respond(REQUEST_ID);
        assert_eq!(harness.linker.started.load(Ordering::SeqCst), 1);
        assert_eq!(harness.connector.state(), ConnectorState::Linking);

        harness.tick_after(5_000);
        assert_eq!(harness.sends(), 3);

        harness.respond(REQUEST_ID);
        assert_eq!(harness.connector.received_ctms().len(), 2);
        assert_eq!(harness.linker.started.load(Ordering::SeqCst), 1);

        let mut finished = harness.connector.subscribe_finish();
        harness.tick_after(5_000);
        let outcome = finished.try_recv().expect("finished");
        assert_eq!(outcome.state, ConnectorState::Completed);
        assert_eq!(outcome.received.len(), 2);
    }

    #[test]
    fn ignores_uncorrelated_and_malformed_input() {
        let harness = Harness::start();
        harness.respond(REQUEST_ID + 1);
        let request = ConnectionMessage::request(REQUEST_ID, ctm())
            .to_packet()
            .unwrap();
        harness.dispatcher.announce(request, &harness.from).unwrap();
        harness
            .dispatcher
            .announce(PayloadType::Connection.encode(&[0xFF, 0x00]), &harness.from)
            .unwrap();

        assert!(harness.connector.received_ctms().is_empty());
        assert_eq!(harness.connector.malformed_count(), 1);
        assert_eq!(harness.linker.started.load(Ordering::SeqCst), 0);
        assert_eq!(harness.connector.state(), ConnectorState::AwaitingResponse);
    }

    #[test]
    fn cancel_finishes_once() {
        let harness = Harness::start();
        let mut finished = harness.connector.subscribe_finish();
        assert!(harness.connector.cancel());
        assert!(!harness.connector.cancel());
        assert_eq!(
            finished.try_recv().expect("finished").state,
            ConnectorState::Cancelled
        );
        // late subscribers still learn the outcome
        let mut late = harness.connector.subscribe_finish();
        assert!(late.try_recv().is_ok());
        harness.tick_after(60_000);
        assert_eq!(harness.sends(), 1);
    }

    #[test]
    fn connector_is_single_use() {
        let harness = Harness::start();
        let again = harness.connector.connect(
            harness.sender.clone(),
            Bytes::from_static(b"x"),
            REQUEST_ID,
        );
        assert!(matches!(again, Err(ConnectorError::AlreadyStarted)));
    }
}
