use std::collections::BTreeMap;
use std::collections::VecDeque;

use crate::message::Message;

/// Width of the duplicate-suppression window, in sequence numbers.
const SEQUENCE_WINDOW_SIZE: u16 = 1024;

/// Number of prior sequences acknowledged by a packet header's ack bitfield,
/// one bit per sequence counting back from `last_acked_sequence`.
const ACK_BITFIELD_BITS: u32 = 32;

/// True if `s1` is sequenced after `s2`, accounting for 16-bit wraparound.
///
/// Standard half-range comparison: the two sequences are never more than
/// `u16::MAX / 2` apart in the window this crate actually uses them in, so
/// picking whichever of `s1 - s2` / `s2 - s1` is "small" tells you the order.
pub fn sequence_greater_than(s1: u16, s2: u16) -> bool {
    let half = 1u16 << 15;
    (s1 > s2 && s1 - s2 <= half) || (s1 < s2 && s2 - s1 > half)
}

/// Sliding window over the last `SEQUENCE_WINDOW_SIZE` received sequence
/// numbers, used to drop duplicates (retransmitted or re-ordered-in-from the
/// OS) without retaining unbounded history.
struct SequenceBuffer {
    seen: Vec<bool>,
    latest: Option<u16>,
}

impl SequenceBuffer {
    fn new() -> Self {
        SequenceBuffer {
            seen: vec![false; SEQUENCE_WINDOW_SIZE as usize],
            latest: None,
        }
    }

    fn slot(sequence: u16) -> usize {
        (sequence % SEQUENCE_WINDOW_SIZE) as usize
    }

    /// Marks `sequence` seen; returns `false` if it was already recorded
    /// (a duplicate) or falls outside the trailing window (stale).
    fn insert(&mut self, sequence: u16) -> bool {
        match self.latest {
            None => {
                self.latest = Some(sequence);
                self.seen[Self::slot(sequence)] = true;
                true
            }
            Some(latest) => {
                if sequence_greater_than(sequence, latest) {
                    let gap = sequence.wrapping_sub(latest);
                    let mut s = latest.wrapping_add(1);
                    let steps = gap.min(SEQUENCE_WINDOW_SIZE);
                    for _ in 0..steps {
                        self.seen[Self::slot(s)] = false;
                        s = s.wrapping_add(1);
                    }
                    self.latest = Some(sequence);
                    self.seen[Self::slot(sequence)] = true;
                    true
                } else {
                    let age = latest.wrapping_sub(sequence);
                    if age >= SEQUENCE_WINDOW_SIZE {
                        return false;
                    }
                    let slot = Self::slot(sequence);
                    if self.seen[slot] {
                        false
                    } else {
                        self.seen[slot] = true;
                        true
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChannelKind {
    UnreliableUnordered = 0,
    ReliableOrdered = 1,
}

impl ChannelKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ChannelKind::UnreliableUnordered),
            1 => Some(ChannelKind::ReliableOrdered),
            _ => None,
        }
    }
}

/// Best-effort, no ordering guarantee. Duplicates (a resend the OS happened
/// to also deliver once already) are dropped; everything else is handed up
/// as soon as it arrives.
pub struct UnreliableUnorderedChannel {
    next_local_sequence: u16,
    outgoing: VecDeque<Message>,
    dedup: SequenceBuffer,
}

impl UnreliableUnorderedChannel {
    pub fn new() -> Self {
        UnreliableUnorderedChannel {
            next_local_sequence: 0,
            outgoing: VecDeque::new(),
            dedup: SequenceBuffer::new(),
        }
    }

    pub fn enqueue(&mut self, message: Message) {
        self.outgoing.push_back(message);
    }

    /// Assigns the next local sequence and pops one message for sending.
    pub fn next_to_send(&mut self) -> Option<Message> {
        let mut message = self.outgoing.pop_front()?;
        message.header.sequence = self.next_local_sequence;
        self.next_local_sequence = self.next_local_sequence.wrapping_add(1);
        Some(message)
    }

    /// Pops the front message only if it fits `budget`; leaves the queue
    /// untouched otherwise so the caller can start a new packet instead of
    /// losing the message.
    fn next_to_send_if_fits(&mut self, budget: usize) -> Option<Message> {
        if self.outgoing.front()?.serialized_size() > budget {
            return None;
        }
        self.next_to_send()
    }

    /// Drops and returns the front message if it can never fit any packet
    /// (`max_packet_size`), so callers don't spin on it forever; the caller
    /// is responsible for releasing it back to the `MessageFactory`.
    fn drop_oversized_head(&mut self, max_packet_size: usize) -> Option<Message> {
        let size = self.outgoing.front()?.serialized_size();
        if size > max_packet_size {
            self.outgoing.pop_front()
        } else {
            None
        }
    }

    /// Returns `Some(message)` unless `sequence` is a duplicate.
    pub fn receive(&mut self, sequence: u16, message: Message) -> Option<Message> {
        if self.dedup.insert(sequence) {
            Some(message)
        } else {
            None
        }
    }

    /// Drains every message still queued (unsent, since this channel retains
    /// nothing once sent), for the caller to release back to the factory
    /// when the owning channel is torn down.
    pub fn drain(&mut self) -> Vec<Message> {
        self.outgoing.drain(..).collect()
    }
}

impl Default for UnreliableUnorderedChannel {
    fn default() -> Self {
        Self::new()
    }
}

struct InFlightMessage {
    message: Message,
    sequence: u16,
    sent_at: f32,
    retransmit_count: u32,
}

/// Reliable, strictly in-order delivery with retransmission.
///
/// Sends are tracked until acknowledged (via the packet header's
/// `last_acked_sequence` + `ack_bitfield`, decoded by the owning `Peer` and
/// handed to `on_ack`) and resent once `rto` elapses without an ack. RTT is
/// sampled with an EWMA on every ack, and `rto` tracks a multiple of the
/// smoothed RTT, floored at the configured initial value so a single fast
/// sample can't collapse the timeout to near zero.
///
/// Receiving buffers early arrivals until the gap they're waiting on fills
/// in, so callers only ever see messages in sequence order, matching the
/// original's per-channel ordering guarantee.
pub struct ReliableOrderedChannel {
    next_local_sequence: u16,
    next_expected_remote: u16,
    highest_remote_seen: Option<u16>,
    remote_dedup: SequenceBuffer,
    pending_send: VecDeque<Message>,
    in_flight: Vec<InFlightMessage>,
    reorder_buffer: BTreeMap<u16, Message>,
    /// Total number of messages ever released from `reorder_buffer` to a
    /// caller, i.e. the length of the contiguous delivered history. Lets
    /// `ack_info` tell "delivered" apart from "received but still buffered
    /// behind a gap" without conflating the two like `remote_dedup` does.
    delivered_count: u64,
    /// `ack_info()` as of the last packet actually sent on this channel, so
    /// `needs_ack_flush` can tell a freshly-delivered message apart from one
    /// already reported, instead of re-sending the same ack forever.
    last_reported_ack: Option<(u16, u32)>,
    clock: f32,
    rtt: f32,
    rto: f32,
    rto_initial: f32,
}

impl ReliableOrderedChannel {
    pub fn new(rto_initial: f32) -> Self {
        ReliableOrderedChannel {
            next_local_sequence: 0,
            next_expected_remote: 0,
            highest_remote_seen: None,
            remote_dedup: SequenceBuffer::new(),
            pending_send: VecDeque::new(),
            in_flight: Vec::new(),
            reorder_buffer: BTreeMap::new(),
            delivered_count: 0,
            last_reported_ack: None,
            clock: 0.0,
            rtt: rto_initial,
            rto: rto_initial,
            rto_initial,
        }
    }

    pub fn enqueue(&mut self, message: Message) {
        self.pending_send.push_back(message);
    }

    pub fn tick(&mut self, dt: f32) {
        self.clock += dt;
    }

    /// Services the oldest unacked entry whose retransmit deadline has
    /// elapsed first, and only falls back to popping a fresh message from
    /// `pending_send` when nothing is due for retransmission — matching
    /// spec.md §4.5's stated priority. A saturated outbound queue must not
    /// starve overdue retransmits behind an endless stream of new sends.
    pub fn next_to_send(&mut self) -> Option<Message> {
        for entry in self.in_flight.iter_mut() {
            if self.clock - entry.sent_at >= self.rto {
                entry.sent_at = self.clock;
                entry.retransmit_count += 1;
                return Some(entry.message.clone());
            }
        }

        if let Some(mut message) = self.pending_send.pop_front() {
            let sequence = self.next_local_sequence;
            self.next_local_sequence = self.next_local_sequence.wrapping_add(1);
            message.header.sequence = sequence;
            self.in_flight.push(InFlightMessage {
                message: message.clone(),
                sequence,
                sent_at: self.clock,
                retransmit_count: 0,
            });
            return Some(message);
        }
        None
    }

    /// Budget-aware variant of `next_to_send`: only commits (marks a
    /// retransmit candidate as re-sent, or pops/re-stamps a pending message)
    /// when the message actually fits `budget`, so a packet-full condition
    /// mid tick starts a fresh packet instead of silently losing the slot.
    /// Same elapsed-retransmit-first priority as `next_to_send`.
    fn next_to_send_if_fits(&mut self, budget: usize) -> Option<Message> {
        let ready = self
            .in_flight
            .iter()
            .find(|entry| self.clock - entry.sent_at >= self.rto && entry.message.serialized_size() <= budget)
            .map(|entry| entry.sequence);
        if let Some(sequence) = ready {
            let entry = self.in_flight.iter_mut().find(|e| e.sequence == sequence)?;
            entry.sent_at = self.clock;
            entry.retransmit_count += 1;
            return Some(entry.message.clone());
        }

        if let Some(front) = self.pending_send.front() {
            if front.serialized_size() > budget {
                return None;
            }
            return self.next_to_send();
        }
        None
    }

    /// Drops and returns the next pending message if it can never fit any
    /// packet, so the caller doesn't spin on it forever; the caller is
    /// responsible for releasing it back to the `MessageFactory`.
    fn drop_oversized_head(&mut self, max_packet_size: usize) -> Option<Message> {
        let size = self.pending_send.front()?.serialized_size();
        if size > max_packet_size {
            self.pending_send.pop_front()
        } else {
            None
        }
    }

    /// Sequence number to report as `last_acked_sequence` for outbound
    /// packets on this channel, plus the trailing ack bitfield.
    ///
    /// `last_acked_sequence` is the highest *contiguously delivered*
    /// sequence (`next_expected_remote - 1`), not merely the highest one
    /// ever seen on the wire: an early arrival sitting in `reorder_buffer`
    /// behind a gap has been received but not yet handed to the ready
    /// queue, and spec.md §8's "no false positives" invariant requires a
    /// message be acked only once delivered. Because delivery here only
    /// ever advances contiguously from sequence 0, every sequence at or
    /// below `last_acked_sequence` is guaranteed delivered, so the bitfield
    /// just needs to stop short of sequences that predate the channel's
    /// first delivery (`delivered_count`).
    pub fn ack_info(&self) -> (u16, u32) {
        if self.delivered_count == 0 {
            return (0, 0);
        }
        let last = self.next_expected_remote.wrapping_sub(1);
        let mut bitfield = 0u32;
        for bit in 0..ACK_BITFIELD_BITS {
            if (bit as u64) < self.delivered_count.saturating_sub(1) {
                bitfield |= 1 << bit;
            }
        }
        (last, bitfield)
    }

    /// True if `ack_info()` has moved on from what the last sent packet on
    /// this channel reported, so an otherwise-empty flush still owes the
    /// remote a standalone ack datagram.
    pub fn needs_ack_flush(&self) -> bool {
        self.delivered_count > 0 && self.last_reported_ack != Some(self.ack_info())
    }

    /// Records the current `ack_info()` as reported, called once a packet
    /// carrying it has actually been sent.
    pub fn mark_ack_reported(&mut self) {
        self.last_reported_ack = Some(self.ack_info());
    }

    /// Frees in-flight entries acked by `last_acked_sequence`/`ack_bitfield`,
    /// samples RTT from whichever newly-acked entry was sent most recently,
    /// and returns the retired messages for the caller to release back to
    /// the `MessageFactory`.
    pub fn on_ack(&mut self, last_acked_sequence: u16, ack_bitfield: u32) -> Vec<Message> {
        let mut sample_rtt = None;
        let mut acked = Vec::new();
        let mut still_in_flight = Vec::with_capacity(self.in_flight.len());
        for entry in self.in_flight.drain(..) {
            let is_acked = entry.sequence == last_acked_sequence || {
                let age = last_acked_sequence.wrapping_sub(entry.sequence);
                age >= 1 && age <= ACK_BITFIELD_BITS && (ack_bitfield & (1 << (age - 1))) != 0
            };
            if is_acked {
                let elapsed = self.clock - entry.sent_at;
                sample_rtt = Some(sample_rtt.map_or(elapsed, |s: f32| s.max(elapsed)));
                acked.push(entry.message);
            } else {
                still_in_flight.push(entry);
            }
        }
        self.in_flight = still_in_flight;

        if let Some(sample) = sample_rtt {
            const ALPHA: f32 = 0.125;
            self.rtt = self.rtt * (1.0 - ALPHA) + sample * ALPHA;
            self.rto = (self.rtt * 2.0).max(self.rto_initial);
        }
        acked
    }

    /// Records `sequence` as received (for future ack bitfields), buffers the
    /// message for in-order delivery, and returns every message that is now
    /// contiguous starting at the next expected sequence.
    pub fn receive(&mut self, sequence: u16, message: Message) -> Vec<Message> {
        let is_new = match self.highest_remote_seen {
            None => true,
            Some(latest) => sequence_greater_than(sequence, latest) || {
                let age = latest.wrapping_sub(sequence);
                age < SEQUENCE_WINDOW_SIZE
            },
        };
        if !is_new {
            return Vec::new();
        }
        if self.highest_remote_seen.is_none() || sequence_greater_than(sequence, self.highest_remote_seen.unwrap()) {
            self.highest_remote_seen = Some(sequence);
        }
        if !self.remote_dedup.insert(sequence) {
            return Vec::new();
        }

        // Already delivered (before the next expected sequence): drop.
        if sequence != self.next_expected_remote && sequence_greater_than(self.next_expected_remote, sequence) {
            return Vec::new();
        }

        self.reorder_buffer.insert(sequence, message);

        let mut ready = Vec::new();
        while let Some(next) = self.reorder_buffer.remove(&self.next_expected_remote) {
            ready.push(next);
            self.next_expected_remote = self.next_expected_remote.wrapping_add(1);
            self.delivered_count += 1;
        }
        ready
    }

    /// Drains every message still held by this channel (both unsent and
    /// in-flight awaiting ack), for the caller to release back to the
    /// factory when the owning channel is torn down (spec.md §5: "released
    /// ... on channel drop").
    pub fn drain(&mut self) -> Vec<Message> {
        let mut out: Vec<Message> = self.pending_send.drain(..).collect();
        out.extend(self.in_flight.drain(..).map(|entry| entry.message));
        out
    }
}

/// Dispatches by `ChannelKind` without trait objects, per the crate's
/// tagged-enum-over-dyn-trait convention.
pub enum Channel {
    UnreliableUnordered(UnreliableUnorderedChannel),
    ReliableOrdered(ReliableOrderedChannel),
}

impl Channel {
    pub fn new(kind: ChannelKind, rto_initial: f32) -> Self {
        match kind {
            ChannelKind::UnreliableUnordered => {
                Channel::UnreliableUnordered(UnreliableUnorderedChannel::new())
            }
            ChannelKind::ReliableOrdered => {
                Channel::ReliableOrdered(ReliableOrderedChannel::new(rto_initial))
            }
        }
    }

    pub fn kind(&self) -> ChannelKind {
        match self {
            Channel::UnreliableUnordered(_) => ChannelKind::UnreliableUnordered,
            Channel::ReliableOrdered(_) => ChannelKind::ReliableOrdered,
        }
    }

    pub fn enqueue(&mut self, message: Message) {
        match self {
            Channel::UnreliableUnordered(c) => c.enqueue(message),
            Channel::ReliableOrdered(c) => c.enqueue(message),
        }
    }

    pub fn tick(&mut self, dt: f32) {
        if let Channel::ReliableOrdered(c) = self {
            c.tick(dt);
        }
    }

    pub fn next_to_send(&mut self) -> Option<Message> {
        match self {
            Channel::UnreliableUnordered(c) => c.next_to_send(),
            Channel::ReliableOrdered(c) => c.next_to_send(),
        }
    }

    /// Only pops/commits a message when it fits `budget`; see
    /// `ReliableOrderedChannel::next_to_send_if_fits`.
    pub fn next_to_send_if_fits(&mut self, budget: usize) -> Option<Message> {
        match self {
            Channel::UnreliableUnordered(c) => c.next_to_send_if_fits(budget),
            Channel::ReliableOrdered(c) => c.next_to_send_if_fits(budget),
        }
    }

    /// Drops the channel's head-of-line message if it can never fit any
    /// packet; the caller releases it back to the `MessageFactory`.
    pub fn drop_oversized_head(&mut self, max_packet_size: usize) -> Option<Message> {
        match self {
            Channel::UnreliableUnordered(c) => c.drop_oversized_head(max_packet_size),
            Channel::ReliableOrdered(c) => c.drop_oversized_head(max_packet_size),
        }
    }

    /// Every message this channel is still holding (unsent or in-flight),
    /// for the caller to release back to the factory on teardown.
    pub fn drain(&mut self) -> Vec<Message> {
        match self {
            Channel::UnreliableUnordered(c) => c.drain(),
            Channel::ReliableOrdered(c) => c.drain(),
        }
    }

    /// Messages ready for dispatch to the application, in delivery order.
    pub fn receive(&mut self, sequence: u16, message: Message) -> Vec<Message> {
        match self {
            Channel::UnreliableUnordered(c) => c.receive(sequence, message).into_iter().collect(),
            Channel::ReliableOrdered(c) => c.receive(sequence, message),
        }
    }

    pub fn ack_info(&self) -> (u16, u32) {
        match self {
            Channel::UnreliableUnordered(_) => (0, 0),
            Channel::ReliableOrdered(c) => c.ack_info(),
        }
    }

    /// Whether this channel has an ack the remote hasn't been told about
    /// yet. Always `false` for `UnreliableUnordered`, which has no ack
    /// bookkeeping to report.
    pub fn needs_ack_flush(&self) -> bool {
        match self {
            Channel::UnreliableUnordered(_) => false,
            Channel::ReliableOrdered(c) => c.needs_ack_flush(),
        }
    }

    /// Marks this channel's current `ack_info()` as sent.
    pub fn mark_ack_reported(&mut self) {
        if let Channel::ReliableOrdered(c) = self {
            c.mark_ack_reported();
        }
    }

    /// Retired (acked) messages, for the caller to release back to the
    /// `MessageFactory`. Always empty for `UnreliableUnordered`, which
    /// retains nothing past a single send.
    pub fn on_ack(&mut self, last_acked_sequence: u16, ack_bitfield: u32) -> Vec<Message> {
        match self {
            Channel::UnreliableUnordered(_) => Vec::new(),
            Channel::ReliableOrdered(c) => c.on_ack(last_acked_sequence, ack_bitfield),
        }
    }
}
