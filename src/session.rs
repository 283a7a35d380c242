//! One client's diagram session: store, channel, roster and event bus.
//!
//! ARCHITECTURE
//! ============
//! `DiagramSession` is owned by exactly one task (see `runtime`), so the store
//! needs no locks. Inbound frames enter through `handle_frame`; local edits
//! enter through the emitter methods in `emitter.rs`. Both paths end in the
//! store and publish on the session's `EventBus`.
//!
//! ERROR HANDLING
//! ==============
//! Malformed inbound payloads are logged, published as `MergeFailed`, and
//! otherwise ignored. The store is never left half-merged.

use std::collections::{HashSet, VecDeque};

use frames::Frame;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, SessionEvent};
use crate::config::SyncConfig;
use crate::model::{Edge, Node, UserIdentity};
use crate::net::events::{ChangeKind, Inbound, SaveAck, SaveOutcome};
use crate::net::{ChannelTimings, ConnectionState, JoinOutcome, SessionChannel};
use crate::reconcile::{self, Collection, MergeReport, ReconcileError};
use crate::store::DiagramStore;

/// How many inbound frame ids are remembered for replay detection.
const SEEN_FRAME_CAPACITY: usize = 1024;

pub struct DiagramSession {
    pub(crate) store: DiagramStore,
    pub(crate) channel: SessionChannel,
    pub(crate) identity: UserIdentity,
    pub(crate) bus: EventBus,
    pub(crate) config: SyncConfig,
    roster: Vec<UserIdentity>,
    save_waiters: Vec<oneshot::Sender<SaveOutcome>>,
    pub(crate) persist_at: Option<Instant>,
    seen: SeenFrames,
}

impl DiagramSession {
    #[must_use]
    pub fn new(config: SyncConfig, bus: EventBus) -> Self {
        let timings = ChannelTimings {
            join_timeout: config.join_timeout,
            join_retry: config.join_retry,
            queue_cap: config.queue_cap,
        };
        Self {
            store: DiagramStore::new(),
            channel: SessionChannel::new(config.room_id.clone(), config.identity.clone(), timings),
            identity: config.identity.clone(),
            bus,
            config,
            roster: Vec::new(),
            save_waiters: Vec::new(),
            persist_at: None,
            seen: SeenFrames::default(),
        }
    }

    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        self.store.nodes()
    }

    #[must_use]
    pub fn edges(&self) -> &[Edge] {
        self.store.edges()
    }

    #[must_use]
    pub fn active_users(&self) -> &[UserIdentity] {
        &self.roster
    }

    #[must_use]
    pub fn revision(&self) -> u64 {
        self.store.revision()
    }

    #[must_use]
    pub fn connection(&self) -> ConnectionState {
        self.channel.state()
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.channel.pending_len()
    }

    #[must_use]
    pub fn room_id(&self) -> &str {
        self.channel.room_id()
    }

    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    // =========================================================================
    // TRANSPORT
    // =========================================================================

    pub fn on_transport_connecting(&mut self) {
        self.channel.on_connecting();
    }

    pub fn on_transport_connected(&mut self, now: Instant) {
        self.channel.on_connected(now);
    }

    pub fn on_transport_closed(&mut self) {
        self.channel.on_disconnected();
    }

    /// Earliest instant at which `poll_timers` has work.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.channel.next_deadline(), self.persist_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn poll_timers(&mut self, now: Instant) {
        if let Some(outcome) = self.channel.poll_timers(now) {
            self.on_join_outcome(outcome);
        }
        if self.persist_at.is_some_and(|at| now >= at) {
            self.persist_at = None;
            self.persist();
        }
    }

    pub fn pop_outbox(&mut self) -> Option<Frame> {
        self.channel.pop_outbox()
    }

    pub fn return_unsent(&mut self, frame: Frame) {
        self.channel.return_unsent(frame);
    }

    fn on_join_outcome(&mut self, outcome: JoinOutcome) {
        match outcome {
            JoinOutcome::Joined { flushed } => {
                debug!(room_id = %self.room_id(), flushed, "pending frames released");
            }
            JoinOutcome::Rejected(rejection) => {
                self.bus.publish(SessionEvent::JoinRejected(rejection));
            }
        }
    }

    // =========================================================================
    // INBOUND
    // =========================================================================

    /// Process one inbound frame.
    pub fn handle_frame(&mut self, frame: &Frame, now: Instant) {
        if frame.status.is_reply()
            && let Some(outcome) = self.channel.on_reply(frame, now)
        {
            self.on_join_outcome(outcome);
            return;
        }

        if !self.seen.insert(&frame.id) {
            debug!(frame_id = %frame.id, event = %frame.event, "duplicate frame ignored");
            return;
        }

        let event = match Inbound::from_frame(frame) {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!(event = %frame.event, "unhandled event");
                return;
            }
            Err(e) => {
                self.merge_failed(&frame.event, &e.to_string());
                return;
            }
        };

        if event.origin().is_some_and(|origin| origin.is_same_user(&self.identity)) {
            debug!(event = %frame.event, "own change echoed back; skipped");
            return;
        }

        self.dispatch(&frame.event, event);
    }

    fn dispatch(&mut self, name: &str, event: Inbound) {
        match event {
            Inbound::InitialState { state }
            | Inbound::StateUpdated { new_state: state }
            | Inbound::DiagramUpdated { state, .. } => {
                let result = reconcile::apply_full(&mut self.store, &state);
                self.after_merge(name, result, true);
            }
            Inbound::ChangeReceived { tipo, elemento, .. } => {
                let result = match ChangeKind::parse(&tipo) {
                    Some(ChangeKind::Nodes) => reconcile::apply_collection(&mut self.store, Collection::Nodes, &elemento),
                    Some(ChangeKind::Edges) => reconcile::apply_collection(&mut self.store, Collection::Edges, &elemento),
                    Some(ChangeKind::AddNode | ChangeKind::UpdateNode) => {
                        reconcile::apply_elements(&mut self.store, &elemento)
                    }
                    None => Err(ReconcileError::Shape("a known change tipo")),
                };
                self.after_merge(name, result, false);
            }
            Inbound::ElementOperated { operacion, elemento, .. } => {
                let result = if operacion.as_deref() == Some("delete") {
                    reconcile::apply_delete(&mut self.store, &elemento)
                } else {
                    reconcile::apply_elements(&mut self.store, &elemento)
                };
                self.after_merge(name, result, false);
            }
            Inbound::UsersConnected { users } => {
                self.roster = users;
                self.roster_changed();
            }
            Inbound::UserJoined { user } => {
                if !self.roster.iter().any(|u| same_presence(u, &user)) {
                    self.roster.push(user);
                }
                self.roster_changed();
            }
            Inbound::UserLeft { user_id } => {
                self.roster
                    .retain(|u| u.id.as_deref() != Some(user_id.as_str()) && u.email.as_deref() != Some(user_id.as_str()));
                self.roster_changed();
            }
            Inbound::StateSaved(ack) => self.resolve_save(ack),
        }
    }

    fn after_merge(&mut self, name: &str, result: Result<MergeReport, ReconcileError>, full: bool) {
        match result {
            Ok(report) => {
                debug!(event = %name, nodes = report.nodes, edges = report.edges, "inbound merged");
                let revision = self.store.revision();
                if full {
                    self.bus.publish(SessionEvent::SnapshotReplaced { revision });
                }
                self.bus.publish(SessionEvent::StateChanged { revision });
            }
            Err(e) => self.merge_failed(name, &e.to_string()),
        }
    }

    fn merge_failed(&self, event: &str, error: &str) {
        warn!(%event, %error, "inbound payload ignored");
        self.bus.publish(SessionEvent::MergeFailed { event: event.to_owned(), error: error.to_owned() });
    }

    fn roster_changed(&self) {
        info!(room_id = %self.room_id(), users = self.roster.len(), "roster updated");
        self.bus.publish(SessionEvent::RosterChanged { users: self.roster.clone() });
    }

    // =========================================================================
    // SAVE ACKS
    // =========================================================================

    /// Register a waiter for the next `stateSaved` of this room and send the
    /// save request.
    pub fn save_state(&mut self, waiter: oneshot::Sender<SaveOutcome>) {
        self.save_waiters.retain(|w| !w.is_closed());
        self.save_waiters.push(waiter);
        self.persist();
    }

    fn resolve_save(&mut self, ack: SaveAck) {
        if ack.room_id.as_deref().is_some_and(|room| room != self.room_id()) {
            debug!(room = ?ack.room_id, "save ack for another room ignored");
            return;
        }
        let outcome = SaveOutcome::from(ack);
        info!(room_id = %self.room_id(), success = outcome.success, waiters = self.save_waiters.len(), "state saved");
        for waiter in self.save_waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
        self.bus.publish(SessionEvent::Saved(outcome));
    }
}

/// Presence entries without id or email fall back to name comparison.
fn same_presence(a: &UserIdentity, b: &UserIdentity) -> bool {
    if a.is_same_user(b) {
        return true;
    }
    let anonymous = |u: &UserIdentity| u.id.is_none() && u.email.is_none();
    anonymous(a) && anonymous(b) && a.name == b.name
}

/// Bounded memory of recently seen inbound frame ids.
#[derive(Debug, Default)]
struct SeenFrames {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SeenFrames {
    /// Returns false when `id` was already seen.
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == SEEN_FRAME_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id.to_owned());
        self.ids.insert(id.to_owned());
        true
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
