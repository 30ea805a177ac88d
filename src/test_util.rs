//! In-memory plumbing for driving connection pairs in tests: a socket that
//!  captures datagrams for manual ferrying (so tests control ordering and
//!  loss), a deterministic randomness stub, and constructors for wired-up
//!  connection pairs sharing a session key.

use crate::cipher::{SymmetricCipher, BLOCK_SIZE, KEY_SIZE};
use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::event::ConnectionEvent;
use crate::random::NetRandom;
use crate::socket::{DatagramSocket, SendResult, MAX_DATAGRAM_SIZE};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

pub const TEST_KEY: [u8; KEY_SIZE] = [0x5C; KEY_SIZE];
pub const TEST_IV: [u8; BLOCK_SIZE] = [0xA3; BLOCK_SIZE];

pub fn peer_addr(n: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, n], 9000))
}

/// Captures outgoing datagrams instead of sending them; tests take and ferry
///  them by hand.
pub struct CapturingSocket {
    sent: Mutex<Vec<Vec<u8>>>,
}

impl CapturingSocket {
    pub fn new() -> Arc<CapturingSocket> {
        Arc::new(CapturingSocket {
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }
}

impl DatagramSocket for CapturingSocket {
    fn send_to(&self, _to: SocketAddr, packet: &[u8]) -> SendResult {
        self.sent.lock().unwrap().push(packet.to_vec());
        SendResult::Sent
    }

    fn send_to_delayed(&self, to: SocketAddr, packet: &[u8], _delay_ms: u32) {
        // latency is the ferrying test's concern; capture immediately
        self.send_to(to, packet);
    }

    fn max_datagram_size(&self) -> usize {
        MAX_DATAGRAM_SIZE
    }
}

/// Deterministic [`NetRandom`]: a fixed initial sequence and a fixed unit
///  float (1.0 keeps every simulated-loss coin flip on the "delivered" side).
pub struct StubRandom {
    pub integer: u32,
    pub unit_float: f32,
}

impl NetRandom for StubRandom {
    fn random_integer(&mut self) -> u32 {
        self.integer
    }

    fn random_unit_float(&mut self) -> f32 {
        self.unit_float
    }

    fn random_buffer(&mut self, out: &mut [u8]) {
        out.fill(0xAB);
    }
}

pub struct TestEnd {
    pub conn: Connection,
    pub wire: Arc<CapturingSocket>,
}

/// A connection that has not started connecting yet, with a pinned initial
///  send sequence.
pub fn unconnected_end(peer: SocketAddr, initial_send_seq: u32) -> TestEnd {
    unconnected_end_with(
        peer,
        StubRandom {
            integer: initial_send_seq,
            unit_float: 1.0,
        },
    )
}

pub fn unconnected_end_with(peer: SocketAddr, random: StubRandom) -> TestEnd {
    let wire = CapturingSocket::new();
    let conn = Connection::new(ConnectionConfig::default(), peer, wire.clone(), Box::new(random))
        .expect("default config is valid");
    TestEnd { conn, wire }
}

/// Two established connections sharing a session key, as the handshake
///  collaborator would leave them: `a` sends with `seq_a` and expects `seq_b`
///  from its peer, and vice versa.
pub fn connected_pair(seq_a: u32, seq_b: u32) -> (TestEnd, TestEnd) {
    let mut a = unconnected_end(peer_addr(2), seq_a);
    let mut b = unconnected_end(peer_addr(1), seq_b);

    a.conn.begin_connect();
    a.conn
        .install_session(SymmetricCipher::new(&TEST_KEY, &TEST_IV), seq_b);
    a.conn.handshake_complete(0);

    b.conn
        .install_session(SymmetricCipher::new(&TEST_KEY, &TEST_IV), seq_a);
    b.conn.handshake_complete(0);

    for end in [&mut a, &mut b] {
        assert_eq!(
            end.conn.poll_event(),
            Some(ConnectionEvent::Established)
        );
    }
    (a, b)
}

pub fn drain_events(conn: &mut Connection) -> Vec<ConnectionEvent> {
    let mut events = Vec::new();
    while let Some(event) = conn.poll_event() {
        events.push(event);
    }
    events
}

/// The `(sequence, delivered)` pairs of every queued notify event, in order.
pub fn drain_notifies(conn: &mut Connection) -> Vec<(u32, bool)> {
    drain_events(conn)
        .into_iter()
        .filter_map(|e| match e {
            ConnectionEvent::PacketNotify {
                sequence,
                delivered,
                ..
            } => Some((sequence, delivered)),
            _ => None,
        })
        .collect()
}
