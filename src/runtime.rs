//! Session runtime: one task owns the session and its socket.
//!
//! ARCHITECTURE
//! ============
//! `spawn_session` starts a driver task and returns a cloneable
//! [`SessionHandle`]. Callers talk to the driver over an unbounded command
//! channel and read the diagram from a `watch` view, so no caller ever holds
//! a lock on the store.
//!
//! The driver loops through three phases:
//! 1. Connect: open a link while still serving commands and timers.
//! 2. Serve: `select!` over inbound frames, commands and the next session
//!    deadline; the outbox is flushed to the sink after every step.
//! 3. Back off: after a lost link, wait (doubling up to `reconnect_max`)
//!    and go back to 1. A successful connect resets the delay.
//!
//! ERROR HANDLING
//! ==============
//! Transport errors end the current link, never the driver. A frame that
//! fails to decode is logged and skipped. Frames that could not be written
//! go back to the session's pending queue. The driver stops on `shutdown` or
//! when every handle has been dropped.

use std::time::Duration;

use futures::{SinkExt, StreamExt, future};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, SessionEvent};
use crate::config::SyncConfig;
use crate::emitter::{ConnectRequest, EdgeChange, EmitError, NewNode, NodeChange};
use crate::generate::{GenerationResult, ImportOutcome};
use crate::model::{Edge, Node, Position, Snapshot, UserIdentity};
use crate::net::events::SaveOutcome;
use crate::net::transport::FrameSink;
use crate::net::{ConnectionState, Connector, Link, TransportError};
use crate::session::DiagramSession;

// =============================================================================
// VIEW
// =============================================================================

/// Read-only picture of the session published after every driver step.
#[derive(Clone, Debug, PartialEq)]
pub struct DiagramView {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub active_users: Vec<UserIdentity>,
    pub connection: ConnectionState,
    pub revision: u64,
    /// Frames waiting for the join to complete.
    pub pending: usize,
}

impl DiagramView {
    fn of(session: &DiagramSession) -> Self {
        Self {
            nodes: session.nodes().to_vec(),
            edges: session.edges().to_vec(),
            active_users: session.active_users().to_vec(),
            connection: session.connection(),
            revision: session.revision(),
            pending: session.pending_len(),
        }
    }
}

// =============================================================================
// COMMANDS
// =============================================================================

enum Command {
    NodesChange(Vec<NodeChange>),
    EdgesChange(Vec<EdgeChange>),
    Delete(Vec<String>),
    BoardData(Snapshot),
    RequestState,
    AddNode(NewNode, Position, oneshot::Sender<String>),
    UpdateNodeData(String, Value, oneshot::Sender<Result<(), EmitError>>),
    UpdateEdgeData(String, Value, oneshot::Sender<Result<(), EmitError>>),
    Connect(ConnectRequest, oneshot::Sender<Result<String, EmitError>>),
    AttachAssociation(String, String, oneshot::Sender<Result<String, EmitError>>),
    Generated(Box<GenerationResult>, oneshot::Sender<ImportOutcome>),
    Save(oneshot::Sender<SaveOutcome>),
    Shutdown,
}

// =============================================================================
// HANDLE
// =============================================================================

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    view: watch::Receiver<DiagramView>,
    bus: EventBus,
    save_timeout: Duration,
}

impl SessionHandle {
    #[must_use]
    pub fn nodes(&self) -> Vec<Node> {
        self.view.borrow().nodes.clone()
    }

    #[must_use]
    pub fn edges(&self) -> Vec<Edge> {
        self.view.borrow().edges.clone()
    }

    #[must_use]
    pub fn active_users(&self) -> Vec<UserIdentity> {
        self.view.borrow().active_users.clone()
    }

    #[must_use]
    pub fn view(&self) -> DiagramView {
        self.view.borrow().clone()
    }

    /// Receiver that wakes on every view change.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<DiagramView> {
        self.view.clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.bus.subscribe()
    }

    /// Resolve once the room join has been acknowledged.
    ///
    /// # Errors
    ///
    /// [`EmitError::SessionClosed`] if the driver stops first.
    pub async fn wait_joined(&self) -> Result<(), EmitError> {
        let mut view = self.view.clone();
        view.wait_for(|v| v.connection == ConnectionState::Joined)
            .await
            .map(|_| ())
            .map_err(|_| EmitError::SessionClosed)
    }

    /// # Errors
    ///
    /// [`EmitError::SessionClosed`] if the driver has stopped.
    pub fn on_nodes_change(&self, changes: Vec<NodeChange>) -> Result<(), EmitError> {
        self.send(Command::NodesChange(changes))
    }

    /// # Errors
    ///
    /// [`EmitError::SessionClosed`] if the driver has stopped.
    pub fn on_edges_change(&self, changes: Vec<EdgeChange>) -> Result<(), EmitError> {
        self.send(Command::EdgesChange(changes))
    }

    /// # Errors
    ///
    /// [`EmitError::SessionClosed`] if the driver has stopped.
    pub fn delete_elements(&self, ids: Vec<String>) -> Result<(), EmitError> {
        self.send(Command::Delete(ids))
    }

    /// # Errors
    ///
    /// [`EmitError::SessionClosed`] if the driver has stopped.
    pub fn update_board_data(&self, snapshot: Snapshot) -> Result<(), EmitError> {
        self.send(Command::BoardData(snapshot))
    }

    /// # Errors
    ///
    /// [`EmitError::SessionClosed`] if the driver has stopped.
    pub fn request_state(&self) -> Result<(), EmitError> {
        self.send(Command::RequestState)
    }

    /// Stop the driver. Queued frames are flushed if a link is open.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    /// Create a node and return its id.
    ///
    /// # Errors
    ///
    /// [`EmitError::SessionClosed`] if the driver has stopped.
    pub async fn add_node(&self, node: NewNode, position: Position) -> Result<String, EmitError> {
        self.request(|tx| Command::AddNode(node, position, tx)).await
    }

    /// # Errors
    ///
    /// Unknown node, a patch that does not fit the node, or a closed session.
    pub async fn update_node_data(&self, id: impl Into<String>, patch: Value) -> Result<(), EmitError> {
        let id = id.into();
        self.request(|tx| Command::UpdateNodeData(id, patch, tx)).await?
    }

    /// # Errors
    ///
    /// Unknown edge, a patch that does not fit the edge, or a closed session.
    pub async fn update_edge_data(&self, id: impl Into<String>, patch: Value) -> Result<(), EmitError> {
        let id = id.into();
        self.request(|tx| Command::UpdateEdgeData(id, patch, tx)).await?
    }

    /// Draw a relationship and return the new edge id.
    ///
    /// # Errors
    ///
    /// Unknown endpoint or a closed session.
    pub async fn connect(&self, request: ConnectRequest) -> Result<String, EmitError> {
        self.request(|tx| Command::Connect(request, tx)).await?
    }

    /// Attach an association class to a relationship; returns the class node id.
    ///
    /// # Errors
    ///
    /// Unknown relationship or a closed session.
    pub async fn attach_association_class(
        &self,
        edge_id: impl Into<String>,
        class_name: impl Into<String>,
    ) -> Result<String, EmitError> {
        let (edge_id, class_name) = (edge_id.into(), class_name.into());
        self.request(|tx| Command::AttachAssociation(edge_id, class_name, tx)).await?
    }

    /// # Errors
    ///
    /// [`EmitError::SessionClosed`] if the driver has stopped.
    pub async fn apply_generated(&self, result: GenerationResult) -> Result<ImportOutcome, EmitError> {
        self.request(|tx| Command::Generated(Box::new(result), tx)).await
    }

    /// Persist the current diagram and wait for the server's `stateSaved`.
    ///
    /// Never fails: a missing answer within `save_timeout` yields
    /// `{success: false, error: "timeout"}`.
    pub async fn save_state(&self) -> SaveOutcome {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Save(tx)).is_err() {
            return SaveOutcome::failed("session closed");
        }
        match tokio::time::timeout(self.save_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => SaveOutcome::failed("session closed"),
            Err(_) => {
                warn!(timeout = ?self.save_timeout, "save not acknowledged in time");
                SaveOutcome::timeout()
            }
        }
    }

    fn send(&self, command: Command) -> Result<(), EmitError> {
        self.commands.send(command).map_err(|_| EmitError::SessionClosed)
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, EmitError> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx))?;
        rx.await.map_err(|_| EmitError::SessionClosed)
    }
}

// =============================================================================
// DRIVER
// =============================================================================

/// Start a session for `config` over links opened by `connector`.
pub fn spawn_session<C: Connector>(config: SyncConfig, connector: C) -> SessionHandle {
    let bus = EventBus::new();
    let session = DiagramSession::new(config.clone(), bus.clone());
    let (commands, rx) = mpsc::unbounded_channel();
    let (view_tx, view) = watch::channel(DiagramView::of(&session));

    info!(room_id = %config.room_id, server_url = %config.server_url, "session starting");
    let driver = Driver {
        session,
        commands: rx,
        view: view_tx,
        backoff: Backoff::new(config.reconnect_initial, config.reconnect_max),
    };
    tokio::spawn(driver.run(connector));

    SessionHandle { commands, view, bus, save_timeout: config.save_timeout }
}

enum Exit {
    Shutdown,
    Lost(TransportError),
}

struct Driver {
    session: DiagramSession,
    commands: mpsc::UnboundedReceiver<Command>,
    view: watch::Sender<DiagramView>,
    backoff: Backoff,
}

impl Driver {
    async fn run<C: Connector>(mut self, connector: C) {
        loop {
            self.session.on_transport_connecting();
            self.publish_view();

            let link = match self.open(&connector).await {
                Ok(Some(link)) => link,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "connect failed");
                    if !self.back_off().await {
                        break;
                    }
                    continue;
                }
            };

            self.backoff.reset();
            info!(room_id = %self.session.room_id(), "connected; joining room");
            self.session.on_transport_connected(Instant::now());

            let exit = self.serve(link).await;
            self.session.on_transport_closed();
            self.publish_view();
            match exit {
                Exit::Shutdown => break,
                Exit::Lost(e) => {
                    warn!(error = %e, pending = self.session.pending_len(), "connection lost");
                    if !self.back_off().await {
                        break;
                    }
                }
            }
        }
        info!(room_id = %self.session.room_id(), "session stopped");
    }

    /// Open a link. `Ok(None)` means the driver was told to stop meanwhile.
    async fn open<C: Connector>(&mut self, connector: &C) -> Result<Option<Link>, TransportError> {
        let mut attempt = connector.connect();
        loop {
            tokio::select! {
                result = &mut attempt => return result.map(Some),
                command = self.commands.recv() => {
                    if !self.apply(command) {
                        return Ok(None);
                    }
                }
                () = sleep_until_opt(self.session.next_deadline()) => {
                    self.session.poll_timers(Instant::now());
                    self.publish_view();
                }
            }
        }
    }

    async fn serve(&mut self, link: Link) -> Exit {
        let Link { mut sink, mut stream } = link;
        loop {
            if let Err(e) = self.flush(&mut sink).await {
                return Exit::Lost(e);
            }
            self.publish_view();

            tokio::select! {
                inbound = stream.next() => match inbound {
                    Some(Ok(frame)) => self.session.handle_frame(&frame, Instant::now()),
                    Some(Err(TransportError::Codec(e))) => warn!(error = %e, "undecodable frame skipped"),
                    Some(Err(e)) => return Exit::Lost(e),
                    None => return Exit::Lost(TransportError::Closed),
                },
                command = self.commands.recv() => {
                    if !self.apply(command) {
                        if let Err(e) = self.flush(&mut sink).await {
                            debug!(error = %e, "final flush failed");
                        }
                        let _ = sink.close().await;
                        return Exit::Shutdown;
                    }
                }
                () = sleep_until_opt(self.session.next_deadline()) => {
                    self.session.poll_timers(Instant::now());
                }
            }
        }
    }

    /// Wait out the current backoff delay. Returns false on shutdown.
    async fn back_off(&mut self) -> bool {
        let delay = self.backoff.next_delay();
        debug!(delay = ?delay, "reconnecting after delay");
        let until = Instant::now() + delay;
        loop {
            tokio::select! {
                () = tokio::time::sleep_until(until) => return true,
                command = self.commands.recv() => {
                    if !self.apply(command) {
                        return false;
                    }
                }
                () = sleep_until_opt(self.session.next_deadline()) => {
                    self.session.poll_timers(Instant::now());
                    self.publish_view();
                }
            }
        }
    }

    async fn flush(&mut self, sink: &mut FrameSink) -> Result<(), TransportError> {
        while let Some(frame) = self.session.pop_outbox() {
            if let Err(e) = sink.send(frame.clone()).await {
                self.session.return_unsent(frame);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Apply one command. Returns false when the driver should stop.
    fn apply(&mut self, command: Option<Command>) -> bool {
        let Some(command) = command else {
            debug!("all session handles dropped");
            return false;
        };
        let session = &mut self.session;
        match command {
            Command::NodesChange(changes) => session.on_nodes_change(changes),
            Command::EdgesChange(changes) => session.on_edges_change(changes),
            Command::Delete(ids) => session.delete_elements(ids),
            Command::BoardData(snapshot) => session.update_board_data(snapshot),
            Command::RequestState => session.request_state(),
            Command::AddNode(node, position, tx) => {
                let _ = tx.send(session.add_node(node, position));
            }
            Command::UpdateNodeData(id, patch, tx) => {
                let _ = tx.send(session.update_node_data(&id, &patch));
            }
            Command::UpdateEdgeData(id, patch, tx) => {
                let _ = tx.send(session.update_edge_data(&id, &patch));
            }
            Command::Connect(request, tx) => {
                let _ = tx.send(session.connect(request));
            }
            Command::AttachAssociation(edge_id, class_name, tx) => {
                let _ = tx.send(session.attach_association_class(&edge_id, &class_name));
            }
            Command::Generated(result, tx) => {
                let _ = tx.send(session.apply_generated(*result));
            }
            Command::Save(tx) => session.save_state(tx),
            Command::Shutdown => return false,
        }
        self.publish_view();
        true
    }

    fn publish_view(&self) {
        let next = DiagramView::of(&self.session);
        self.view.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending::<()>().await,
    }
}

/// Doubling reconnect delay.
#[derive(Debug)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max, current: initial }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
#[path = "runtime_test.rs"]
mod tests;
