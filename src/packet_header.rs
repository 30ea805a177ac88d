use crate::bit_stream::BitStream;
use anyhow::bail;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Packet window size is `2^MAX_PACKET_WINDOW_SIZE_SHIFT` sequence numbers.
pub const MAX_PACKET_WINDOW_SIZE_SHIFT: u32 = 5;
pub const MAX_PACKET_WINDOW_SIZE: u32 = 1 << MAX_PACKET_WINDOW_SIZE_SHIFT;
pub const PACKET_WINDOW_MASK: u32 = MAX_PACKET_WINDOW_SIZE - 1;

/// Each ack word covers 32 packets.
pub const MAX_ACK_MASK_SIZE: usize = 1 << (MAX_PACKET_WINDOW_SIZE_SHIFT - 5);
pub const MAX_ACK_BYTE_COUNT: u32 = (MAX_ACK_MASK_SIZE as u32) << 2;

/// Bit width of the partial send sequence carried in each header.
pub const SEQUENCE_NUMBER_BIT_SIZE: usize = 11;
pub const SEQUENCE_NUMBER_WINDOW_SIZE: u32 = 1 << SEQUENCE_NUMBER_BIT_SIZE;
pub const SEQUENCE_NUMBER_MASK: u32 = SEQUENCE_NUMBER_WINDOW_SIZE.wrapping_neg();

/// Bit width of the partial highest-received-sequence carried in each header.
pub const ACK_SEQUENCE_NUMBER_BIT_SIZE: usize = 10;
pub const ACK_SEQUENCE_NUMBER_WINDOW_SIZE: u32 = 1 << ACK_SEQUENCE_NUMBER_BIT_SIZE;
pub const ACK_SEQUENCE_NUMBER_MASK: u32 = ACK_SEQUENCE_NUMBER_WINDOW_SIZE.wrapping_neg();

pub const PACKET_HEADER_BIT_SIZE: usize =
    3 + SEQUENCE_NUMBER_BIT_SIZE + ACK_SEQUENCE_NUMBER_BIT_SIZE;
pub const PACKET_HEADER_BYTE_SIZE: usize = (PACKET_HEADER_BIT_SIZE + 7) >> 3;
/// Zero-filled bits padding the prelude to a byte boundary. 0 with the default
///  field widths; receivers reject any non-zero pad.
pub const PACKET_HEADER_PAD_BITS: usize = (PACKET_HEADER_BYTE_SIZE << 3) - PACKET_HEADER_BIT_SIZE;

/// Maximum saturating value of the 8-ms-unit send delay field.
pub const MAX_SEND_DELAY_MS: u64 = 2047;

#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PacketType {
    /// Carries an application payload and advances the send sequence.
    Data = 0,
    /// Liveness probe; elicits an ack, does not advance the send sequence.
    Ping = 1,
    /// Ack-state-only response to a ping or a half-full receive window.
    Ack = 2,
}

/// The clear 3-byte part of every packet: type, partial send sequence, partial
///  highest-received sequence. Everything after it is inside the encryption
///  envelope, so the prelude must carry enough to reconstruct the cipher
///  counter before decryption.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PacketPrelude {
    pub packet_type: PacketType,
    /// low `SEQUENCE_NUMBER_BIT_SIZE` bits of the send sequence
    pub partial_send_seq: u32,
    /// low `ACK_SEQUENCE_NUMBER_BIT_SIZE` bits of the highest received sequence
    pub partial_highest_ack: u32,
}

impl PacketPrelude {
    pub fn for_packet(packet_type: PacketType, send_seq: u32, highest_ack: u32) -> PacketPrelude {
        PacketPrelude {
            packet_type,
            partial_send_seq: send_seq & !SEQUENCE_NUMBER_MASK,
            partial_highest_ack: highest_ack & !ACK_SEQUENCE_NUMBER_MASK,
        }
    }

    pub fn ser(&self, stream: &mut BitStream) {
        stream.write_integer(u8::from(self.packet_type) as u32, 2);
        stream.write_integer(self.partial_send_seq & 0x1F, 5);
        stream.write_bool(true);
        stream.write_integer(
            self.partial_send_seq >> 5,
            SEQUENCE_NUMBER_BIT_SIZE - 5,
        );
        stream.write_integer(self.partial_highest_ack, ACK_SEQUENCE_NUMBER_BIT_SIZE);
        stream.write_integer(0, PACKET_HEADER_PAD_BITS);
    }

    pub fn deser(stream: &mut BitStream) -> anyhow::Result<PacketPrelude> {
        let raw_type = stream.read_integer(2)?;
        let seq_low = stream.read_integer(5)?;
        let data_packet_flag = stream.read_bool()?;
        let seq_high = stream.read_integer(SEQUENCE_NUMBER_BIT_SIZE - 5)?;
        let partial_highest_ack = stream.read_integer(ACK_SEQUENCE_NUMBER_BIT_SIZE)?;
        let pad = stream.read_integer(PACKET_HEADER_PAD_BITS)?;

        if !data_packet_flag {
            bail!("not a notification protocol packet");
        }
        if pad != 0 {
            bail!("non-zero header padding");
        }
        let packet_type = match PacketType::try_from(raw_type as u8) {
            Ok(t) => t,
            Err(_) => bail!("invalid packet type {}", raw_type),
        };

        Ok(PacketPrelude {
            packet_type,
            partial_send_seq: seq_low | (seq_high << 5),
            partial_highest_ack,
        })
    }
}

/// Extends a partial send sequence to 32 bits against the receiver's highest
///  received sequence, assuming it lies at or ahead of the reference (the
///  window validity check happens at the caller against the packet window).
pub fn reconstruct_send_seq(partial: u32, last_seq_recvd: u32) -> u32 {
    let mut seq = partial | (last_seq_recvd & SEQUENCE_NUMBER_MASK);
    if seq < last_seq_recvd {
        seq = seq.wrapping_add(SEQUENCE_NUMBER_WINDOW_SIZE);
    }
    seq
}

/// Extends a partial highest-ack to 32 bits against the local highest acked
///  sequence.
pub fn reconstruct_highest_ack(partial: u32, highest_acked_seq: u32) -> u32 {
    let mut ack = partial | (highest_acked_seq & ACK_SEQUENCE_NUMBER_MASK);
    if ack < highest_acked_seq {
        ack = ack.wrapping_add(ACK_SEQUENCE_NUMBER_WINDOW_SIZE);
    }
    ack
}
