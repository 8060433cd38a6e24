//! Protocols run on top of the node: the outbound connect handshake and two
//! hop packet forwarding.

pub mod connect;
pub mod forward;

pub use self::connect::{Connector, ConnectorOutcome, ConnectorState, Linker};
pub use self::forward::{ForwardingSender, PacketForwarder};
