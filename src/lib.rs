//! A secure notification transport layered on top of UDP.
//!
//! This protocol gives applications an authenticated, encrypted, session-oriented
//!  channel on which every transmitted packet is eventually reported as DELIVERED
//!  or DROPPED, in send order, without stream-level retransmission: the protocol
//!  reports loss, it does not repair it. Applications that need a payload to
//!  arrive re-send it themselves, informed by the per-packet reports.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving single-datagram *packets* - there is
//!   no fragmentation, no multi-stream multiplexing, no in-order payload delivery
//! * Every data packet produces exactly one DELIVERED or DROPPED notification,
//!   and notifications arrive in strict send order
//! * Headers are bit-packed: the full 32-bit sequence numbers travel as 11-bit
//!   (send) and 10-bit (ack) partial values and are reconstructed against the
//!   receiver's window position
//! * Packets are bound to their sequence numbers by the encryption envelope: the
//!   cipher keystream is seeded from `(send_seq, highest_ack, packet_type, 0)`,
//!   so a replayed or tampered datagram fails verification and is dropped
//! * Sends are paced against a negotiated fixed rate; a millisecond credit
//!   accumulator smooths jitter in the driver's tick cadence
//! * Liveness is tracked by a ping/ack sub-protocol with a retry budget
//!
//! ## Packet layout
//!
//! Every packet starts with a 3-byte bit-packed header, transmitted in the clear:
//!
//! ```ascii
//! bit  0- 1: packet type (00 data, 01 ping, 10 ack)
//! bit  2- 6: send sequence, low 5 bits
//! bit  7   : always 1 (distinguishes protocol traffic at the socket layer)
//! bit  8-13: send sequence, bits 5..11
//! bit 14-23: highest received sequence, low 10 bits
//! ```
//!
//! Everything from byte 3 onward is the encrypted region:
//!
//! ```ascii
//! ranged int [0,4] : ack byte count
//! 0..4 bytes       : ack bitmask, low word first, bit 0 = last received sequence
//! 8 bits           : send delay since last received data packet, in 8 ms units
//! data packets only:
//!   1 bit            : rate-changed flag
//!   4 ranged ints    : new rate parameters (present iff the flag is set)
//!   payload bytes
//! 5 bytes          : message signature (truncated SHA-256 over the plaintext)
//! ```
//!
//! The signature is computed over the whole plaintext packet, appended, and then
//!  the region is encrypted in place. Connections without an installed session
//!  cipher (pre-handshake) send the region as plaintext without a signature.
//!
//! ## Driving the protocol
//!
//! The connection core is single-threaded and never blocks: a driver calls
//!  [`connection::Connection::tick`] at its own cadence (typically 10-100 Hz) and
//!  [`connection::Connection::receive_datagram`] for every datagram the socket
//!  delivers, then drains [`connection::Connection::poll_event`].
//!  [`end_point::EndPoint`] is a ready-made tokio driver that does exactly this
//!  for a fleet of connections sharing one UDP socket.
//!
//! Connection establishment (challenge / client puzzle / key exchange) is an
//!  external collaborator: it owns the handshake wire format and installs the
//!  session cipher and initial sequence numbers through the methods in the
//!  "handshake collaborator surface" section of [`connection::Connection`].

pub mod bit_stream;
pub mod cipher;
pub mod config;
pub mod connection;
pub mod end_point;
pub mod envelope;
pub mod event;
pub mod notify;
pub mod packet_header;
pub mod random;
pub mod rate;
pub mod socket;
pub mod window;

#[cfg(test)]
pub(crate) mod test_util;
