//! Realtime sync engine for collaborative UML class diagrams.
//!
//! A client joins a room on the realtime server, keeps a local copy of the
//! room's diagram, merges peer changes into it, and emits its own edits.
//! [`runtime::spawn_session`] is the entry point; everything below it is
//! synchronous and driven by that one task.

pub mod bus;
pub mod config;
pub mod emitter;
pub mod generate;
pub mod model;
pub mod net;
pub mod ports;
pub mod reconcile;
pub mod runtime;
pub mod session;
pub mod store;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use bus::{EventBus, SessionEvent};
pub use config::{ConfigError, SyncConfig};
pub use emitter::{ConnectRequest, EdgeChange, EmitError, NewNode, NodeChange};
pub use generate::{GenerationResult, ImportOutcome};
pub use model::{Edge, Node, Position, RelationKind, Snapshot, UserIdentity};
pub use net::{ConnectionState, Connector, WsConnector};
pub use runtime::{DiagramView, SessionHandle, spawn_session};
pub use session::DiagramSession;
