//! Per-peer reliability engine: stop-and-wait with retransmission.
//!
//! The protocol adds reliability on top of a lossy transport with three
//! mechanisms, all per peer and per direction:
//!
//! - every non-ACK frame is acknowledged by echoing its sequence number;
//! - at most one frame is on the wire at a time; further sends queue in
//!   an outbox and drain as acknowledgements arrive;
//! - an unacknowledged frame is retransmitted every second, up to
//!   [`MAX_ATTEMPTS_RESEND`] retries, after which the peer is declared
//!   gone.
//!
//! [`ReliableLink`] is a pure state machine: it owns no socket and no
//! timer. Callers write the bytes a [`Transmit`] carries and arrange for
//! [`ReliableLink::on_timer`] to be called [`RETRANSMIT_INTERVAL`] after
//! each (re)transmission — the event loops in the client and server do
//! this by posting a `(peer, seq)` key back to themselves from a spawned
//! sleep. Keeping the engine synchronous keeps the stop-and-wait rules in
//! one place and testable without a runtime.
//!
//! Sequence counters are unbounded `u64`s internally and are masked to
//! the 12-bit wire width on encode, so they are monotonic for the life of
//! the link and cannot overflow in any realistic session.

use crate::codec::{Frame, MessageType, Payload, SEQ_MASK};
use std::collections::BTreeMap;
use std::time::Duration;

/// Maximum number of retransmissions of a single frame before the peer is
/// considered unreachable (8 transmissions in total).
pub const MAX_ATTEMPTS_RESEND: u8 = 7;

/// Delay between a transmission and its retransmission check.
pub const RETRANSMIT_INTERVAL: Duration = Duration::from_secs(1);

/// A frame waiting in the outbox for its acknowledgement.
#[derive(Debug, Clone)]
struct Pending {
    /// Encoded frame, kept verbatim so retransmissions are byte-identical.
    bytes: Vec<u8>,
    kind: MessageType,
    /// Transmissions so far; 0 while queued behind the in-flight frame.
    attempts: u8,
}

/// An order to put `bytes` on the wire.
///
/// The caller must also schedule a retransmission check for `seq` in
/// [`RETRANSMIT_INTERVAL`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub seq: u64,
    pub bytes: Vec<u8>,
}

/// What an inbound non-ACK sequence number means for this link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// In order: process the frame.
    Deliver,
    /// Already processed — the peer retransmitted because our ACK was
    /// lost. Re-ACK and drop.
    Duplicate,
    /// Ahead of what we expect. Stop-and-wait prevents this in normal
    /// operation; ACK and drop.
    OutOfOrder,
}

/// Result of absorbing an inbound ACK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckOutcome {
    /// The type of the frame the ACK settled, if it matched the window.
    /// Senders key follow-up actions on this (e.g. the client reacting to
    /// its SELECT_MOVIE being acknowledged).
    pub acked: Option<MessageType>,
    /// The next queued frame, now cleared to go on the wire.
    pub next: Option<Transmit>,
}

/// What to do when a retransmission timer fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerAction {
    /// The frame was acknowledged in the meantime; nothing to do.
    Settled,
    /// Put these bytes on the wire again and reschedule.
    Resend(Vec<u8>),
    /// The retry budget is spent; the peer is gone.
    Exhausted,
}

/// Stop-and-wait reliability state for one peer.
#[derive(Debug, Default)]
pub struct ReliableLink {
    /// Sequence the next enqueued frame will carry.
    next_outbound: u64,
    /// Lowest outbound sequence not yet acknowledged (exclusive window edge).
    acked_up_to: u64,
    /// Sequence the next in-order inbound frame must carry.
    expected_inbound: u64,
    outbox: BTreeMap<u64, Pending>,
}

impl ReliableLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes `payload` under the next sequence number and stores it in
    /// the outbox.
    ///
    /// Returns a [`Transmit`] when the window is free — i.e. this frame
    /// is now in flight. Otherwise the frame waits its turn and `None` is
    /// returned; [`ReliableLink::handle_ack`] will surface it later.
    ///
    /// ACK frames never pass through here: they echo the peer's sequence
    /// number, are not retransmitted, and are built directly with
    /// [`ack_bytes`].
    pub fn enqueue(&mut self, payload: Payload) -> Option<Transmit> {
        let seq = self.next_outbound;
        let kind = payload.message_type();
        debug_assert!(kind != MessageType::Ack, "ACKs are not tracked");

        let bytes = Frame::new(wire_seq(seq), payload).encode();
        let in_window = seq == self.acked_up_to;
        self.outbox.insert(
            seq,
            Pending {
                bytes: bytes.clone(),
                kind,
                attempts: u8::from(in_window),
            },
        );
        self.next_outbound += 1;

        in_window.then_some(Transmit { seq, bytes })
    }

    /// Absorbs an inbound ACK.
    ///
    /// Only an ACK matching the window edge settles anything; a stale or
    /// stray ACK is ignored. Settling removes the pending entry (which is
    /// what cancels its retransmission timer), advances the window, and
    /// releases the next queued frame if there is one.
    pub fn handle_ack(&mut self, wire: u16) -> AckOutcome {
        if wire_seq(self.acked_up_to) != wire & SEQ_MASK {
            return AckOutcome { acked: None, next: None };
        }
        let Some(pending) = self.outbox.remove(&self.acked_up_to) else {
            return AckOutcome { acked: None, next: None };
        };
        self.acked_up_to += 1;

        let next = self.outbox.get_mut(&self.acked_up_to).map(|queued| {
            queued.attempts = 1;
            Transmit {
                seq: self.acked_up_to,
                bytes: queued.bytes.clone(),
            }
        });

        AckOutcome {
            acked: Some(pending.kind),
            next,
        }
    }

    /// Classifies an inbound non-ACK sequence number, advancing the
    /// expected counter when the frame is in order.
    ///
    /// The caller must have emitted the ACK for `wire` already — every
    /// received non-ACK frame is acknowledged, even duplicates, or a peer
    /// whose ACK was lost would retransmit forever.
    pub fn classify_inbound(&mut self, wire: u16) -> Inbound {
        let expected = wire_seq(self.expected_inbound);
        let wire = wire & SEQ_MASK;
        if wire == expected {
            self.expected_inbound += 1;
            Inbound::Deliver
        } else if wire < expected {
            Inbound::Duplicate
        } else {
            Inbound::OutOfOrder
        }
    }

    /// Handles a retransmission timer for `seq`.
    ///
    /// The timer key may be stale: the frame may have been acknowledged
    /// (and removed) since the timer was scheduled, which is how timers
    /// are cancelled in this design. Existence in the outbox is re-checked
    /// here, never assumed.
    pub fn on_timer(&mut self, seq: u64) -> TimerAction {
        let Some(pending) = self.outbox.get_mut(&seq) else {
            return TimerAction::Settled;
        };
        if pending.attempts == 0 {
            // Queued but never transmitted: a timer for it cannot be live.
            return TimerAction::Settled;
        }
        if pending.attempts > MAX_ATTEMPTS_RESEND {
            return TimerAction::Exhausted;
        }
        pending.attempts += 1;
        TimerAction::Resend(pending.bytes.clone())
    }

    /// Sequence expected on the next in-order inbound frame.
    pub fn expected_inbound(&self) -> u64 {
        self.expected_inbound
    }

    /// Number of frames waiting in the outbox (in flight plus queued).
    pub fn outstanding(&self) -> usize {
        self.outbox.len()
    }

    /// Number of frames actually on the wire — 1 or 0 by construction.
    pub fn in_flight(&self) -> usize {
        self.outbox.values().filter(|p| p.attempts > 0).count()
    }
}

/// Builds the bytes of an ACK echoing an inbound sequence number.
pub fn ack_bytes(wire: u16) -> Vec<u8> {
    Frame::new(wire, Payload::Ack).encode()
}

fn wire_seq(seq: u64) -> u16 {
    (seq as u16) & SEQ_MASK
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
