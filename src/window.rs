use crate::packet_header::{
    reconstruct_highest_ack, reconstruct_send_seq, MAX_ACK_MASK_SIZE, MAX_PACKET_WINDOW_SIZE,
    PACKET_WINDOW_MASK,
};
use tracing::debug;

/// Sliding-window bookkeeping for one connection: the send/receive sequence
///  counters, the receive-side ack bitmask, and the per-slot record of what
///  `last_seq_recvd` was when each in-flight packet went out.
///
/// All sequence arithmetic is modulo 2^32; "ahead/behind" is always a wrapping
///  difference against a window-local reference, so the protocol keeps working
///  when the random initial sequences sit just below the wrap point.
pub struct PacketWindow {
    initial_send_seq: u32,
    initial_recv_seq: u32,

    /// sequence of the most recently emitted data packet
    last_send_seq: u32,
    /// greatest sequence the peer has confirmed seeing (delivered or dropped)
    highest_acked_seq: u32,
    /// greatest sequence received from the peer
    last_seq_recvd: u32,
    /// greatest sequence whose ack status we know the peer has observed
    last_recv_ack_ack: u32,

    /// bit 0 of word 0 is `last_seq_recvd`; higher bits are older packets.
    ///  A set bit means the packet at that offset was a received data packet.
    ack_mask: [u32; MAX_ACK_MASK_SIZE],
    /// `last_seq_recvd` at the time each in-flight packet was sent, indexed by
    ///  `seq & PACKET_WINDOW_MASK`
    last_seq_recvd_at_send: [u32; MAX_PACKET_WINDOW_SIZE as usize],
}

/// A received prelude whose sequences passed window validation, extended to
///  full 32-bit values.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IncomingSequences {
    pub send_seq: u32,
    pub highest_ack: u32,
}

impl PacketWindow {
    pub fn new(initial_send_seq: u32) -> PacketWindow {
        PacketWindow {
            initial_send_seq,
            initial_recv_seq: 0,
            last_send_seq: initial_send_seq,
            highest_acked_seq: initial_send_seq,
            last_seq_recvd: 0,
            last_recv_ack_ack: 0,
            ack_mask: [0; MAX_ACK_MASK_SIZE],
            last_seq_recvd_at_send: [0; MAX_PACKET_WINDOW_SIZE as usize],
        }
    }

    /// Installs the peer's initial send sequence, exchanged at handshake.
    pub fn set_initial_recv_sequence(&mut self, sequence: u32) {
        self.initial_recv_seq = sequence;
        self.last_seq_recvd = sequence;
        self.last_recv_ack_ack = sequence;
    }

    pub fn initial_send_sequence(&self) -> u32 {
        self.initial_send_seq
    }

    pub fn initial_recv_sequence(&self) -> u32 {
        self.initial_recv_seq
    }

    pub fn last_send_sequence(&self) -> u32 {
        self.last_send_seq
    }

    pub fn next_send_sequence(&self) -> u32 {
        self.last_send_seq.wrapping_add(1)
    }

    pub fn highest_acked_sequence(&self) -> u32 {
        self.highest_acked_seq
    }

    pub fn last_sequence_received(&self) -> u32 {
        self.last_seq_recvd
    }

    pub fn last_recv_ack_ack(&self) -> u32 {
        self.last_recv_ack_ack
    }

    pub fn has_unacked_sent_packets(&self) -> bool {
        self.last_send_seq != self.highest_acked_seq
    }

    /// Number of data packets in flight.
    pub fn in_flight(&self) -> u32 {
        self.last_send_seq.wrapping_sub(self.highest_acked_seq)
    }

    /// True if no further data packet may be written. Two slots of the window
    ///  are reserved so the partial-sequence reconstruction on the receive side
    ///  can never be ambiguous.
    pub fn window_full(&self) -> bool {
        self.in_flight() >= MAX_PACKET_WINDOW_SIZE - 2
    }

    /// Allocates the sequence for an outgoing data packet and records the
    ///  current receive position in its window slot.
    ///
    /// Callers check `window_full` first; overflowing the window is a
    ///  programmer error.
    pub fn allocate_send_sequence(&mut self) -> u32 {
        assert!(!self.window_full(), "send window overflow");
        self.last_send_seq = self.last_send_seq.wrapping_add(1);
        self.last_seq_recvd_at_send[(self.last_send_seq & PACKET_WINDOW_MASK) as usize] =
            self.last_seq_recvd;
        self.last_send_seq
    }

    /// Number of ack bytes that cover everything the peer has not yet seen an
    ///  ack for.
    pub fn ack_byte_count(&self) -> u32 {
        (self.last_seq_recvd.wrapping_sub(self.last_recv_ack_ack) + 7) >> 3
    }

    pub fn ack_mask(&self) -> &[u32; MAX_ACK_MASK_SIZE] {
        &self.ack_mask
    }

    /// Validates and reconstructs the partial sequences of a received prelude.
    ///  `None` means the packet is outside the window (out of order beyond the
    ///  mask horizon, or acking something never sent) and must be dropped.
    pub fn validate_incoming(
        &self,
        partial_send_seq: u32,
        partial_highest_ack: u32,
    ) -> Option<IncomingSequences> {
        let send_seq = reconstruct_send_seq(partial_send_seq, self.last_seq_recvd);
        if send_seq.wrapping_sub(self.last_seq_recvd) > MAX_PACKET_WINDOW_SIZE - 1 {
            debug!(
                "sequence {} outside receive window at {} - dropping",
                send_seq, self.last_seq_recvd
            );
            return None;
        }

        let highest_ack = reconstruct_highest_ack(partial_highest_ack, self.highest_acked_seq);
        if highest_ack.wrapping_sub(self.highest_acked_seq)
            > self.last_send_seq.wrapping_sub(self.highest_acked_seq)
        {
            debug!(
                "ack {} beyond last sent sequence {} - dropping",
                highest_ack, self.last_send_seq
            );
            return None;
        }

        Some(IncomingSequences {
            send_seq,
            highest_ack,
        })
    }

    /// Shifts the ack mask up by the sequence delta of a newly accepted packet,
    ///  NACK-ing every skipped sequence, and records whether the new packet was
    ///  a data packet in bit 0. Does not advance `last_seq_recvd`; the caller
    ///  does that after walking the notifies.
    ///
    /// A zero shift is a stale duplicate of the current head; the mask already
    ///  reflects it.
    pub fn shift_ack_mask(&mut self, pk_send_seq: u32, is_data_packet: bool) {
        let mut shift = pk_send_seq.wrapping_sub(self.last_seq_recvd);
        if shift == 0 {
            return;
        }

        // beyond a whole word, move word-wise first
        while shift > 32 {
            for i in (1..MAX_ACK_MASK_SIZE).rev() {
                self.ack_mask[i] = self.ack_mask[i - 1];
            }
            self.ack_mask[0] = 0;
            shift -= 32;
        }

        let mut carried = is_data_packet as u32;
        for word in &mut self.ack_mask {
            let next_carry = if shift == 32 { *word } else { *word >> (32 - shift) };
            *word = (*word << (shift & 31)) | carried;
            if shift == 32 {
                *word = carried;
            }
            carried = next_carry;
        }
    }

    pub fn set_last_sequence_received(&mut self, sequence: u32) {
        self.last_seq_recvd = sequence;
    }

    pub fn set_highest_acked_sequence(&mut self, sequence: u32) {
        self.highest_acked_seq = sequence;
    }

    /// Records that a delivered packet proves the peer saw our ack state as of
    ///  that packet's send time.
    pub fn advance_recv_ack_ack_for(&mut self, notify_index: u32) {
        self.last_recv_ack_ack =
            self.last_seq_recvd_at_send[(notify_index & PACKET_WINDOW_MASK) as usize];
    }

    /// The peer's window has slid past what we can represent; clamp so the ack
    ///  byte count stays within the mask.
    pub fn clamp_recv_ack_ack(&mut self, pk_send_seq: u32) {
        if pk_send_seq.wrapping_sub(self.last_recv_ack_ack) > MAX_PACKET_WINDOW_SIZE {
            self.last_recv_ack_ack = pk_send_seq.wrapping_sub(MAX_PACKET_WINDOW_SIZE);
        }
    }

    /// Reads the delivered/dropped bit for `notify_index` out of a received ack
    ///  mask whose bit 0 corresponds to `pk_highest_ack`.
    pub fn delivered_bit(
        pk_ack_mask: &[u32; MAX_ACK_MASK_SIZE],
        pk_highest_ack: u32,
        notify_index: u32,
    ) -> bool {
        let offset = pk_highest_ack.wrapping_sub(notify_index);
        let bit = offset & 0x1F;
        let word = (offset >> 5) as usize;
        (pk_ack_mask[word] >> bit) & 1 != 0
    }
}
