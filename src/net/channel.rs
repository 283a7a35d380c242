//! Session channel: join/leave state machine and pending-emit queue.
//!
//! DESIGN
//! ======
//! The channel does no I/O. The runtime tells it about transport events
//! (`on_connected`, `on_disconnected`, inbound replies, timer ticks) and
//! drains `outbox` into the socket. Keeping it synchronous means the whole
//! handshake can be unit tested with explicit instants.
//!
//! The join request is written straight to the outbox, never to the pending
//! queue. Application frames submitted before the join is acknowledged wait
//! in the pending queue and are moved to the outbox, in submission order,
//! when the acknowledgement arrives.
//!
//! ERROR HANDLING
//! ==============
//! A rejected or timed-out join leaves the channel in `Joining` with no
//! request in flight; a new join goes out after `join_retry`. A disconnect
//! keeps the pending queue (and returns unsent outbox frames to its head) so
//! a later join replays them. Replayed frames keep their ids, which receivers
//! may use to drop duplicates.

use std::collections::VecDeque;
use std::time::Duration;

use frames::{Frame, Status};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::model::UserIdentity;
use crate::net::events;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Joining,
    Joined,
}

/// Why a join attempt did not succeed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JoinRejection {
    /// The server answered with an error or `ok: false`.
    Refused(String),
    TimedOut,
}

/// Result of feeding a reply or timer tick to the channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined { flushed: usize },
    Rejected(JoinRejection),
}

/// Timing knobs for the join handshake.
#[derive(Clone, Copy, Debug)]
pub struct ChannelTimings {
    pub join_timeout: Duration,
    pub join_retry: Duration,
    pub queue_cap: usize,
}

#[derive(Debug)]
pub struct SessionChannel {
    room_id: String,
    identity: UserIdentity,
    timings: ChannelTimings,
    state: ConnectionState,
    pending: VecDeque<Frame>,
    outbox: VecDeque<Frame>,
    join_request: Option<String>,
    join_deadline: Option<Instant>,
    retry_at: Option<Instant>,
}

impl SessionChannel {
    #[must_use]
    pub fn new(room_id: impl Into<String>, identity: UserIdentity, timings: ChannelTimings) -> Self {
        Self {
            room_id: room_id.into(),
            identity,
            timings,
            state: ConnectionState::Disconnected,
            pending: VecDeque::new(),
            outbox: VecDeque::new(),
            join_request: None,
            join_deadline: None,
            retry_at: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn is_joined(&self) -> bool {
        self.state == ConnectionState::Joined
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    // =========================================================================
    // TRANSPORT EVENTS
    // =========================================================================

    pub fn on_connecting(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    /// Transport is up: send the join request and start the ack deadline.
    pub fn on_connected(&mut self, now: Instant) {
        self.send_join(now);
    }

    /// Transport lost: forget the handshake, keep everything unsent.
    pub fn on_disconnected(&mut self) {
        let was = self.state;
        self.state = ConnectionState::Disconnected;
        self.join_request = None;
        self.join_deadline = None;
        self.retry_at = None;

        // Unsent outbox frames go back to the head of the pending queue. The
        // join request itself is rebuilt on the next connect.
        let unsent: Vec<Frame> = self.outbox.drain(..).filter(|f| f.event != events::JOIN_ROOM).collect();
        for frame in unsent.into_iter().rev() {
            self.pending.push_front(frame);
        }
        self.enforce_cap();
        info!(room_id = %self.room_id, ?was, pending = self.pending.len(), "channel disconnected");
    }

    /// Feed an inbound reply frame. Returns an outcome when it answers the
    /// in-flight join request.
    pub fn on_reply(&mut self, frame: &Frame, now: Instant) -> Option<JoinOutcome> {
        let request_id = self.join_request.as_deref()?;
        if !frame.is_reply_to(request_id) {
            return None;
        }
        self.join_request = None;
        self.join_deadline = None;

        let ok = frame.data.get("ok").and_then(serde_json::Value::as_bool);
        if frame.status == Status::Done && ok != Some(false) {
            return Some(self.complete_join());
        }

        let reason = frame
            .data
            .get("message")
            .or_else(|| frame.data.get("error"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or("join refused")
            .to_owned();
        Some(self.reject(JoinRejection::Refused(reason), now))
    }

    /// Advance timers: expire an unanswered join, re-send after the retry
    /// delay.
    pub fn poll_timers(&mut self, now: Instant) -> Option<JoinOutcome> {
        if self.join_deadline.is_some_and(|deadline| now >= deadline) {
            self.join_request = None;
            self.join_deadline = None;
            return Some(self.reject(JoinRejection::TimedOut, now));
        }
        if self.state == ConnectionState::Joining && self.retry_at.is_some_and(|at| now >= at) {
            self.send_join(now);
        }
        None
    }

    /// Earliest instant at which `poll_timers` has work to do.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.join_deadline, self.retry_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // =========================================================================
    // OUTBOUND
    // =========================================================================

    /// Submit an application frame. Sent when joined, queued otherwise.
    /// Returns the frame dropped from the queue head on overflow.
    pub fn submit(&mut self, frame: Frame) -> Option<Frame> {
        if self.is_joined() {
            self.outbox.push_back(frame);
            return None;
        }
        self.pending.push_back(frame);
        self.enforce_cap()
    }

    /// Take the next frame ready for the transport.
    pub fn pop_outbox(&mut self) -> Option<Frame> {
        self.outbox.pop_front()
    }

    /// Put back a frame the transport failed to write.
    pub fn return_unsent(&mut self, frame: Frame) {
        self.outbox.push_front(frame);
    }

    pub fn drain_outbox(&mut self) -> Vec<Frame> {
        self.outbox.drain(..).collect()
    }

    fn send_join(&mut self, now: Instant) {
        let join = events::join_room(&self.room_id, &self.identity);
        self.join_request = Some(join.id.clone());
        self.join_deadline = Some(now + self.timings.join_timeout);
        self.retry_at = None;
        self.state = ConnectionState::Joining;
        self.outbox.push_back(join);
        info!(room_id = %self.room_id, user = %self.identity.label(), "join requested");
    }

    fn complete_join(&mut self) -> JoinOutcome {
        self.state = ConnectionState::Joined;
        self.retry_at = None;
        let flushed = self.pending.len();
        self.outbox.extend(self.pending.drain(..));
        info!(room_id = %self.room_id, flushed, "joined room");
        JoinOutcome::Joined { flushed }
    }

    fn reject(&mut self, rejection: JoinRejection, now: Instant) -> JoinOutcome {
        self.state = ConnectionState::Joining;
        self.retry_at = Some(now + self.timings.join_retry);
        warn!(
            room_id = %self.room_id,
            reason = ?rejection,
            pending = self.pending.len(),
            "join not acknowledged; edits stay local until rejoin"
        );
        JoinOutcome::Rejected(rejection)
    }

    fn enforce_cap(&mut self) -> Option<Frame> {
        let mut dropped = None;
        while self.pending.len() > self.timings.queue_cap {
            dropped = self.pending.pop_front();
            if let Some(frame) = &dropped {
                warn!(
                    room_id = %self.room_id,
                    event = %frame.event,
                    cap = self.timings.queue_cap,
                    "pending queue full; dropped oldest frame"
                );
            }
        }
        dropped
    }
}

#[cfg(test)]
#[path = "channel_test.rs"]
mod tests;
