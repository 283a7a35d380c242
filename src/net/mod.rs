pub mod channel;
pub mod events;
pub mod transport;

pub use channel::{ChannelTimings, ConnectionState, JoinOutcome, JoinRejection, SessionChannel};
pub use transport::{Connector, Link, TransportError, WsConnector};
