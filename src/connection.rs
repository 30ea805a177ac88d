use crate::bit_stream::BitStream;
use crate::cipher::SymmetricCipher;
use crate::config::ConnectionConfig;
use crate::envelope;
use crate::envelope::MESSAGE_SIGNATURE_BYTES;
use crate::event::ConnectionEvent;
use crate::notify::{NotifyQueue, PacketNotify};
use crate::packet_header::{
    PacketPrelude, PacketType, MAX_ACK_BYTE_COUNT, MAX_ACK_MASK_SIZE, MAX_PACKET_WINDOW_SIZE,
    MAX_SEND_DELAY_MS, PACKET_HEADER_BYTE_SIZE,
};
use crate::random::NetRandom;
use crate::rate::{NetRate, RateController};
use crate::socket::{DatagramSocket, SendResult};
use crate::window::PacketWindow;
use anyhow::bail;
use bytes::Bytes;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Worst-case non-payload bytes in a data packet: the clear prelude, the ack
///  block + send delay + rate block rounded up to whole bytes, and the
///  trailing signature.
const MAX_PACKET_OVERHEAD_BYTES: usize = PACKET_HEADER_BYTE_SIZE + 13 + MESSAGE_SIGNATURE_BYTES;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// Initial state - not connected.
    NotConnected,
    /// A challenge request is out, awaiting the response.
    AwaitingChallengeResponse,
    /// Arranged connection, neither side has heard from the other yet.
    SendingPunchPackets,
    /// Working on the challenge response's client puzzle.
    ComputingPuzzleSolution,
    /// Puzzle solved and connect request sent, awaiting the response.
    AwaitingConnectResponse,
    /// The handshake timed out.
    ConnectTimedOut,
    /// The remote host rejected the connect request.
    ConnectRejected,
    /// Session established.
    Connected,
    /// Either side shut the session down.
    Disconnected,
    /// The keep-alive retry budget ran out.
    TimedOut,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::ConnectTimedOut
                | ConnectionState::ConnectRejected
                | ConnectionState::Disconnected
                | ConnectionState::TimedOut
        )
    }
}

/// One endpoint of the notification protocol.
///
/// The connection is a synchronous state machine with no I/O of its own beyond
///  handing finished datagrams to the injected socket: a driver calls
///  [`tick`](Connection::tick) at its own cadence and
///  [`receive_datagram`](Connection::receive_datagram) per incoming datagram,
///  then drains [`poll_event`](Connection::poll_event). Concurrent access is
///  not supported; drivers serialize at the connection boundary.
///
/// The handshake collaborator owns everything up to `Connected`: it performs
///  the challenge/puzzle/key exchange on the wire, then installs the session
///  through [`install_session`](Connection::install_session) and
///  [`handshake_complete`](Connection::handshake_complete).
pub struct Connection {
    peer_addr: SocketAddr,
    socket: Arc<dyn DatagramSocket>,
    random: Box<dyn NetRandom>,
    state: ConnectionState,

    window: PacketWindow,
    notify_queue: NotifyQueue,
    rate: RateController,
    cipher: Option<SymmetricCipher>,

    /// exponentially smoothed round trip time, milliseconds
    round_trip_time: f32,
    /// receipt time of the last fresh data packet; the send-delay field of
    ///  outgoing packets measures against this
    last_packet_recv_time_ms: u64,

    ping_timeout_ms: u64,
    ping_retry_count: u32,
    ping_send_count: u32,
    /// 0 means "refresh on the next timeout check"
    last_ping_send_time_ms: u64,

    simulated_packet_loss: f32,
    simulated_latency_ms: u32,

    /// handshake bookkeeping, owned by the collaborator
    connect_send_count: u32,
    connect_last_send_time_ms: u64,

    outgoing: VecDeque<(Bytes, Option<Bytes>)>,
    events: VecDeque<ConnectionEvent>,
}

impl Connection {
    pub fn new(
        config: ConnectionConfig,
        peer_addr: SocketAddr,
        socket: Arc<dyn DatagramSocket>,
        mut random: Box<dyn NetRandom>,
    ) -> anyhow::Result<Connection> {
        config.validate()?;

        let initial_send_seq = random.random_integer();
        let max_datagram_size = socket.max_datagram_size() as u32;

        Ok(Connection {
            peer_addr,
            socket,
            random,
            state: ConnectionState::NotConnected,
            window: PacketWindow::new(initial_send_seq),
            notify_queue: NotifyQueue::new(),
            rate: RateController::new(config.initial_rate, max_datagram_size),
            cipher: None,
            round_trip_time: 0.0,
            last_packet_recv_time_ms: 0,
            ping_timeout_ms: config.ping_timeout_ms,
            ping_retry_count: config.ping_retry_count,
            ping_send_count: 0,
            last_ping_send_time_ms: 0,
            simulated_packet_loss: config.simulated_packet_loss,
            simulated_latency_ms: config.simulated_latency_ms,
            connect_send_count: 0,
            connect_last_send_time_ms: 0,
            outgoing: VecDeque::new(),
            events: VecDeque::new(),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Running average packet round trip time, milliseconds.
    pub fn round_trip_time(&self) -> f32 {
        self.round_trip_time
    }

    pub fn one_way_time(&self) -> f32 {
        self.round_trip_time * 0.5
    }

    pub fn window_full(&self) -> bool {
        self.window.window_full()
    }

    pub fn has_unacked_sent_packets(&self) -> bool {
        self.window.has_unacked_sent_packets()
    }

    pub fn next_send_sequence(&self) -> u32 {
        self.window.next_send_sequence()
    }

    pub fn last_send_sequence(&self) -> u32 {
        self.window.last_send_sequence()
    }

    pub fn initial_send_sequence(&self) -> u32 {
        self.window.initial_send_sequence()
    }

    pub fn initial_recv_sequence(&self) -> u32 {
        self.window.initial_recv_sequence()
    }

    /// Millisecond pause the pacer currently leaves between data packets.
    pub fn packet_send_period_ms(&self) -> u32 {
        self.rate.packet_send_period_ms()
    }

    /// Byte budget per paced data packet.
    pub fn packet_send_size(&self) -> u32 {
        self.rate.packet_send_size()
    }

    pub fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.events.pop_front()
    }

    // ---- tuning surface -------------------------------------------------

    pub fn set_ping_timeouts(&mut self, period_ms: u64, retry_count: u32) -> anyhow::Result<()> {
        if period_ms == 0 {
            bail!("ping timeout must be positive");
        }
        if retry_count == 0 {
            bail!("ping retry count must be positive");
        }
        self.ping_timeout_ms = period_ms;
        self.ping_retry_count = retry_count;
        Ok(())
    }

    pub fn set_simulated_net_params(&mut self, packet_loss: f32, latency_ms: u32) {
        self.simulated_packet_loss = packet_loss.clamp(0.0, 1.0);
        self.simulated_latency_ms = latency_ms;
    }

    pub fn set_fixed_rate_parameters(
        &mut self,
        min_packet_send_period: u32,
        min_packet_recv_period: u32,
        max_send_bandwidth: u32,
        max_recv_bandwidth: u32,
    ) {
        self.rate.set_local_rate(NetRate {
            min_packet_send_period,
            min_packet_recv_period,
            max_send_bandwidth,
            max_recv_bandwidth,
        });
    }

    // ---- handshake collaborator surface ---------------------------------

    /// Kicks off an outgoing connection: the collaborator takes it from here.
    pub fn begin_connect(&mut self) {
        debug_assert_eq!(self.state, ConnectionState::NotConnected);
        self.state = ConnectionState::AwaitingChallengeResponse;
    }

    /// Kicks off an arranged (NAT-punched) connection.
    pub fn begin_arranged_connect(&mut self) {
        debug_assert_eq!(self.state, ConnectionState::NotConnected);
        self.state = ConnectionState::SendingPunchPackets;
    }

    /// Pre-connected transitions driven by the handshake collaborator.
    pub fn set_state(&mut self, state: ConnectionState) {
        trace!("connection {:?}: state {:?} -> {:?}", self.peer_addr, self.state, state);
        self.state = state;
    }

    pub fn record_connect_send(&mut self, now_ms: u64) {
        self.connect_send_count += 1;
        self.connect_last_send_time_ms = now_ms;
    }

    pub fn connect_send_count(&self) -> u32 {
        self.connect_send_count
    }

    pub fn connect_last_send_time_ms(&self) -> u64 {
        self.connect_last_send_time_ms
    }

    /// Installs the session cipher and the peer's initial send sequence, both
    ///  produced by the key exchange.
    pub fn install_session(&mut self, cipher: SymmetricCipher, initial_recv_seq: u32) {
        self.cipher = Some(cipher);
        self.window.set_initial_recv_sequence(initial_recv_seq);
    }

    /// The handshake finished: the session goes live and pacing starts.
    pub fn handshake_complete(&mut self, now_ms: u64) {
        self.state = ConnectionState::Connected;
        self.rate.reset(now_ms);
        self.ping_send_count = 0;
        self.last_ping_send_time_ms = now_ms;
        self.events.push_back(ConnectionEvent::Established);
    }

    /// The handshake gave up (its own timeout) or the remote host said no.
    pub fn connect_failed(&mut self, timed_out: bool, reason: Bytes) {
        if timed_out {
            self.state = ConnectionState::ConnectTimedOut;
            self.events.push_back(ConnectionEvent::TimedOut { reason });
        } else {
            self.state = ConnectionState::ConnectRejected;
            self.events.push_back(ConnectionEvent::Disconnected { reason });
        }
        self.drain_notifies_as_dropped();
    }

    /// Local teardown. The collaborator notifies the peer on the wire; this
    ///  side just stops, reporting everything still in flight as dropped.
    pub fn disconnect(&mut self, reason: Bytes) {
        if self.state.is_terminal() {
            return;
        }
        debug!("connection {:?}: local disconnect", self.peer_addr);
        self.state = ConnectionState::Disconnected;
        self.events.push_back(ConnectionEvent::Disconnected { reason });
        self.drain_notifies_as_dropped();
    }

    /// The peer sent a disconnect through the handshake collaborator.
    pub fn peer_disconnected(&mut self, reason: Bytes) {
        if self.state.is_terminal() {
            return;
        }
        debug!("connection {:?}: peer disconnect", self.peer_addr);
        self.state = ConnectionState::Disconnected;
        self.events.push_back(ConnectionEvent::Disconnected { reason });
        self.drain_notifies_as_dropped();
    }

    // ---- driver surface -------------------------------------------------

    /// Queues a payload for the pacer; `tick` emits one queued payload per
    ///  negotiated send period.
    pub fn queue_payload(&mut self, payload: Bytes) {
        self.outgoing.push_back((payload, None));
    }

    /// Like [`queue_payload`](Connection::queue_payload), with an opaque
    ///  extension handed back in the packet's notify event.
    pub fn queue_payload_tagged(&mut self, payload: Bytes, extension: Bytes) {
        self.outgoing.push_back((payload, Some(extension)));
    }

    /// Number of payloads waiting for a send slot.
    pub fn queued_payload_count(&self) -> usize {
        self.outgoing.len()
    }

    /// Writes and sends one data packet immediately, bypassing the pacer.
    ///  Requires an established session and a free window slot; the returned
    ///  sequence identifies the later notify event.
    pub fn send_data_packet(
        &mut self,
        now_ms: u64,
        payload: &[u8],
        extension: Option<Bytes>,
    ) -> anyhow::Result<(SendResult, u32)> {
        if self.state != ConnectionState::Connected {
            bail!("cannot send in state {:?}", self.state);
        }
        if self.window.window_full() {
            bail!("send window is full");
        }
        let max_payload = self.max_payload_size();
        if payload.len() > max_payload {
            bail!(
                "payload of {} bytes exceeds the current {}-byte budget",
                payload.len(),
                max_payload
            );
        }

        let ack_byte_count = self.window.ack_byte_count();
        let sequence = self.window.allocate_send_sequence();

        let mut stream = BitStream::with_capacity(
            MAX_PACKET_OVERHEAD_BYTES + payload.len(),
        );
        PacketPrelude::for_packet(
            PacketType::Data,
            sequence,
            self.window.last_sequence_received(),
        )
        .ser(&mut stream);
        self.write_ack_block(&mut stream, now_ms, ack_byte_count);

        let rate_changed = self.rate.write_rate_info(&mut stream);
        self.notify_queue.push(PacketNotify {
            send_time_ms: now_ms,
            rate_changed,
            extension,
        });

        stream.write_bytes(payload);
        self.seal(&mut stream, PacketType::Data, sequence);

        trace!(
            "connection {:?}: SEND data {} - {} bytes",
            self.peer_addr,
            sequence,
            stream.byte_length()
        );
        let result = self.send_packet(&mut stream);
        Ok((result, sequence))
    }

    /// One step of the cooperative driver loop: keep-alive first, then at most
    ///  one paced data packet from the outgoing queue.
    pub fn tick(&mut self, now_ms: u64) {
        if self.state != ConnectionState::Connected {
            return;
        }

        if self.check_timeout(now_ms) {
            debug!("connection {:?}: keep-alive exhausted, timing out", self.peer_addr);
            self.state = ConnectionState::TimedOut;
            self.events.push_back(ConnectionEvent::TimedOut {
                reason: Bytes::new(),
            });
            self.drain_notifies_as_dropped();
            return;
        }

        if self.rate.check_send_gate(now_ms)
            && !self.window.window_full()
            && !self.outgoing.is_empty()
        {
            let (payload, extension) = self.outgoing.pop_front().expect("checked non-empty");
            match self.send_data_packet(now_ms, &payload, extension) {
                Ok(_) => self.rate.mark_sent(now_ms),
                Err(e) => warn!("connection {:?}: dropping queued payload: {}", self.peer_addr, e),
            }
        }
    }

    /// Feeds one received datagram through the protocol. Malformed, stale,
    ///  out-of-window and cryptographically invalid datagrams are dropped with
    ///  no observable effect.
    pub fn receive_datagram(&mut self, now_ms: u64, bytes: &[u8]) {
        if self.state != ConnectionState::Connected {
            debug!(
                "connection {:?}: datagram in state {:?} - dropping",
                self.peer_addr, self.state
            );
            return;
        }
        if self.simulated_packet_loss > 0.0
            && self.random.random_unit_float() < self.simulated_packet_loss
        {
            debug!("connection {:?}: RECVDROP (simulated)", self.peer_addr);
            return;
        }

        let mut stream = BitStream::from_bytes(bytes);
        let prelude = match PacketPrelude::deser(&mut stream) {
            Ok(p) => p,
            Err(e) => {
                debug!("connection {:?}: undecodable header ({}) - dropping", self.peer_addr, e);
                return;
            }
        };
        let seqs = match self
            .window
            .validate_incoming(prelude.partial_send_seq, prelude.partial_highest_ack)
        {
            Some(s) => s,
            None => return,
        };

        if let Some(cipher) = &mut self.cipher {
            cipher.setup_counter(
                seqs.send_seq,
                seqs.highest_ack,
                u8::from(prelude.packet_type) as u32,
                0,
            );
            if envelope::decrypt_and_verify(&mut stream, PACKET_HEADER_BYTE_SIZE, cipher).is_err()
            {
                debug!("connection {:?}: packet failed crypto - dropping", self.peer_addr);
                return;
            }
        }

        let (pk_ack_mask, pk_send_delay_ms) = match Self::read_ack_block(&mut stream) {
            Ok(x) => x,
            Err(e) => {
                debug!("connection {:?}: undecodable ack block ({}) - dropping", self.peer_addr, e);
                return;
            }
        };

        trace!(
            "connection {:?}: RECV {:?} {} acking {}",
            self.peer_addr,
            prelude.packet_type,
            seqs.send_seq,
            seqs.highest_ack
        );

        // shift up the ack mask by the sequence delta, NACK-ing every skipped
        // packet
        self.window
            .shift_ack_mask(seqs.send_seq, prelude.packet_type == PacketType::Data);

        // resolve notifies, oldest first; the FIFO is authoritative for which
        // record each walked index refers to
        let notify_count = seqs
            .highest_ack
            .wrapping_sub(self.window.highest_acked_sequence());
        for i in 1..=notify_count {
            let notify_index = self.window.highest_acked_sequence().wrapping_add(i);
            let delivered =
                PacketWindow::delivered_bit(&pk_ack_mask, seqs.highest_ack, notify_index);
            self.handle_notify(now_ms, notify_index, delivered, pk_send_delay_ms);
        }
        self.window.set_highest_acked_sequence(seqs.highest_ack);

        // the peer knows more about its window than we do
        self.window.clamp_recv_ack_ack(seqs.send_seq);

        // any valid packet proves the peer is alive
        self.keep_alive_refresh();

        let prev_last_seq = self.window.last_sequence_received();
        self.window.set_last_sequence_received(seqs.send_seq);

        if prelude.packet_type == PacketType::Data && prev_last_seq != seqs.send_seq {
            self.last_packet_recv_time_ms = now_ms;
            self.read_data_packet_body(&mut stream, seqs.send_seq);
        }

        // ack back any ping, and keep the peer's bitmask horizon fresh once
        // half the window is unconfirmed
        if prelude.packet_type == PacketType::Ping
            || seqs.send_seq.wrapping_sub(self.window.last_recv_ack_ack())
                > MAX_PACKET_WINDOW_SIZE / 2
        {
            self.send_ack_packet(now_ms);
        }
    }

    // ---- internals ------------------------------------------------------

    /// Payload budget left by the negotiated packet size after worst-case
    ///  protocol overhead.
    fn max_payload_size(&self) -> usize {
        let packet_budget =
            (self.rate.packet_send_size() as usize).min(self.socket.max_datagram_size());
        packet_budget.saturating_sub(MAX_PACKET_OVERHEAD_BYTES)
    }

    fn write_ack_block(&mut self, stream: &mut BitStream, now_ms: u64, ack_byte_count: u32) {
        debug_assert!(ack_byte_count <= MAX_ACK_BYTE_COUNT);
        stream.write_ranged_u32(ack_byte_count, 0, MAX_ACK_BYTE_COUNT);

        let word_count = ((ack_byte_count + 3) >> 2) as usize;
        let mask = self.window.ack_mask();
        for i in 0..word_count {
            let bits = if i == word_count - 1 {
                (ack_byte_count as usize - i * 4) * 8
            } else {
                32
            };
            let word = if bits == 32 {
                mask[i]
            } else {
                mask[i] & ((1 << bits) - 1)
            };
            stream.write_integer(word, bits);
        }

        let send_delay = now_ms
            .saturating_sub(self.last_packet_recv_time_ms)
            .min(MAX_SEND_DELAY_MS);
        stream.write_integer((send_delay >> 3) as u32, 8);
    }

    fn read_ack_block(stream: &mut BitStream) -> anyhow::Result<([u32; MAX_ACK_MASK_SIZE], u64)> {
        let ack_byte_count = stream.read_ranged_u32(0, MAX_ACK_BYTE_COUNT)?;

        let mut mask = [0u32; MAX_ACK_MASK_SIZE];
        let word_count = ((ack_byte_count + 3) >> 2) as usize;
        for (i, word) in mask.iter_mut().enumerate().take(word_count) {
            let bits = if i == word_count - 1 {
                (ack_byte_count as usize - i * 4) * 8
            } else {
                32
            };
            *word = stream.read_integer(bits)?;
        }

        let send_delay_ms = ((stream.read_integer(8)? as u64) << 3) + 4;
        Ok((mask, send_delay_ms))
    }

    fn read_data_packet_body(&mut self, stream: &mut BitStream, sequence: u32) {
        if let Err(e) = self.rate.read_rate_info(stream) {
            warn!("connection {:?}: truncated rate block ({})", self.peer_addr, e);
            return;
        }

        let payload_len = stream.remaining_bytes();
        match stream.read_bytes(payload_len) {
            Ok(payload) => self.events.push_back(ConnectionEvent::Packet {
                sequence,
                payload: Bytes::from(payload),
            }),
            Err(e) => warn!("connection {:?}: truncated payload ({})", self.peer_addr, e),
        }
    }

    fn handle_notify(&mut self, now_ms: u64, notify_index: u32, delivered: bool, pk_send_delay_ms: u64) {
        let note = match self.notify_queue.pop() {
            Some(note) => note,
            None => {
                warn!(
                    "connection {:?}: ack walk outran the notify queue at {}",
                    self.peer_addr, notify_index
                );
                return;
            }
        };

        trace!(
            "connection {:?}: NOTIFY {} {}",
            self.peer_addr,
            notify_index,
            if delivered { "RECVD" } else { "DROPPED" }
        );

        if note.rate_changed && !delivered {
            // the rate change never arrived; carry it on the next data packet
            self.rate.mark_rate_changed();
        }

        if delivered {
            let sample =
                (now_ms as i64 - (note.send_time_ms + pk_send_delay_ms) as i64) as f32;
            self.round_trip_time = self.round_trip_time * 0.9 + sample * 0.1;
            if self.round_trip_time < 0.0 {
                self.round_trip_time = 0.0;
            }
            self.window.advance_recv_ack_ack_for(notify_index);
        }

        self.events.push_back(ConnectionEvent::PacketNotify {
            sequence: notify_index,
            delivered,
            extension: note.extension,
        });
    }

    fn keep_alive_refresh(&mut self) {
        self.last_ping_send_time_ms = 0;
        self.ping_send_count = 0;
    }

    /// Sends a ping when one is due; true means the retry budget is exhausted
    ///  and the connection must transition to timed out.
    fn check_timeout(&mut self, now_ms: u64) -> bool {
        if self.last_ping_send_time_ms == 0 {
            self.last_ping_send_time_ms = now_ms;
        }

        if now_ms.saturating_sub(self.last_ping_send_time_ms) > self.ping_timeout_ms {
            self.last_ping_send_time_ms = now_ms;
            self.ping_send_count += 1;
            self.send_ping_packet(now_ms);
            if self.ping_send_count >= self.ping_retry_count {
                return true;
            }
        }
        false
    }

    fn send_ping_packet(&mut self, now_ms: u64) {
        trace!("connection {:?}: send ping {}", self.peer_addr, self.window.last_send_sequence());
        self.send_control_packet(now_ms, PacketType::Ping);
    }

    fn send_ack_packet(&mut self, now_ms: u64) {
        trace!("connection {:?}: send ack {}", self.peer_addr, self.window.last_send_sequence());
        self.send_control_packet(now_ms, PacketType::Ack);
    }

    /// Ping and ack packets reuse the last data sequence and allocate no
    ///  notify record.
    fn send_control_packet(&mut self, now_ms: u64, packet_type: PacketType) {
        let ack_byte_count = self.window.ack_byte_count();
        let sequence = self.window.last_send_sequence();

        let mut stream = BitStream::with_capacity(MAX_PACKET_OVERHEAD_BYTES);
        PacketPrelude::for_packet(packet_type, sequence, self.window.last_sequence_received())
            .ser(&mut stream);
        self.write_ack_block(&mut stream, now_ms, ack_byte_count);
        self.seal(&mut stream, packet_type, sequence);

        self.send_packet(&mut stream);
    }

    fn seal(&mut self, stream: &mut BitStream, packet_type: PacketType, sequence: u32) {
        if let Some(cipher) = &mut self.cipher {
            cipher.setup_counter(
                sequence,
                self.window.last_sequence_received(),
                u8::from(packet_type) as u32,
                0,
            );
            envelope::hash_and_encrypt(stream, PACKET_HEADER_BYTE_SIZE, cipher);
        }
    }

    fn send_packet(&mut self, stream: &mut BitStream) -> SendResult {
        if self.simulated_packet_loss > 0.0
            && self.random.random_unit_float() < self.simulated_packet_loss
        {
            debug!(
                "connection {:?}: SENDDROP (simulated) - {}",
                self.peer_addr,
                self.window.last_send_sequence()
            );
            // the datagram "entered the network" and was lost there
            return SendResult::Sent;
        }

        if self.simulated_latency_ms > 0 {
            self.socket
                .send_to_delayed(self.peer_addr, stream.as_bytes(), self.simulated_latency_ms);
            return SendResult::Sent;
        }
        self.socket.send_to(self.peer_addr, stream.as_bytes())
    }

    #[cfg(test)]
    pub(crate) fn window(&self) -> &PacketWindow {
        &self.window
    }

    fn drain_notifies_as_dropped(&mut self) {
        let base = self.window.highest_acked_sequence();
        let drained: Vec<PacketNotify> = self.notify_queue.drain().collect();
        for (i, note) in drained.into_iter().enumerate() {
            if note.rate_changed {
                self.rate.mark_rate_changed();
            }
            self.events.push_back(ConnectionEvent::PacketNotify {
                sequence: base.wrapping_add(i as u32 + 1),
                delivered: false,
                extension: note.extension,
            });
        }
        self.window
            .set_highest_acked_sequence(self.window.last_send_sequence());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{connected_pair, drain_events, drain_notifies, peer_addr, TestEnd};
    use rstest::rstest;

    fn deliver(from: &TestEnd, to: &mut TestEnd, now_ms: u64) -> usize {
        let packets = from.wire.take();
        let count = packets.len();
        for packet in packets {
            to.conn.receive_datagram(now_ms, &packet);
        }
        count
    }

    /// S1 - clean delivery: eight packets across, eight DELIVERED notifies in
    ///  send order on one side, eight payload events in sequence order on the
    ///  other.
    #[test]
    fn test_clean_delivery() {
        let (mut a, mut b) = connected_pair(1000, 2000);

        let mut sent_seqs = Vec::new();
        for i in 0u8..8 {
            let (result, seq) = a
                .conn
                .send_data_packet(10, &[b'0' + i], None)
                .unwrap();
            assert_eq!(result, SendResult::Sent);
            sent_seqs.push(seq);
        }
        assert_eq!(sent_seqs, (1001..=1008).collect::<Vec<u32>>());

        assert_eq!(deliver(&a, &mut b, 20), 8);
        let packets: Vec<(u32, Vec<u8>)> = drain_events(&mut b.conn)
            .into_iter()
            .filter_map(|e| match e {
                ConnectionEvent::Packet { sequence, payload } => Some((sequence, payload.to_vec())),
                _ => None,
            })
            .collect();
        assert_eq!(
            packets,
            (0u8..8).map(|i| (1001 + i as u32, vec![b'0' + i])).collect::<Vec<_>>()
        );

        b.conn.send_ack_packet(30);
        deliver(&b, &mut a, 40);

        assert_eq!(
            drain_notifies(&mut a.conn),
            (1001..=1008).map(|seq| (seq, true)).collect::<Vec<_>>()
        );
        assert!(!a.conn.has_unacked_sent_packets());
    }

    /// S2 - reordered receive: the window only moves forward, so datagrams
    ///  arriving behind the head are discarded and NACK-ed; notifies still
    ///  come out in strict send order.
    #[test]
    fn test_reordered_receive() {
        let (mut a, mut b) = connected_pair(100, 900);

        for i in 0u8..5 {
            a.conn.send_data_packet(10, &[b'1' + i], None).unwrap();
        }
        let packets = a.wire.take();
        assert_eq!(packets.len(), 5);

        // arrival order 3, 1, 2, 5, 4
        for idx in [2usize, 0, 1, 4, 3] {
            b.conn.receive_datagram(20, &packets[idx]);
        }

        let received: Vec<u32> = drain_events(&mut b.conn)
            .into_iter()
            .filter_map(|e| match e {
                ConnectionEvent::Packet { sequence, .. } => Some(sequence),
                _ => None,
            })
            .collect();
        assert_eq!(received, vec![103, 105]);

        b.conn.send_ack_packet(30);
        deliver(&b, &mut a, 40);

        assert_eq!(
            drain_notifies(&mut a.conn),
            vec![(101, false), (102, false), (103, true), (104, false), (105, true)]
        );
    }

    /// S3 - dropped middle packet: DELIVERED, DELIVERED, DROPPED, DELIVERED,
    ///  DELIVERED, in strict order.
    #[test]
    fn test_dropped_middle() {
        let (mut a, mut b) = connected_pair(100, 900);

        for i in 0u8..5 {
            a.conn.send_data_packet(10, &[b'1' + i], None).unwrap();
        }
        let packets = a.wire.take();
        for (idx, packet) in packets.iter().enumerate() {
            if idx != 2 {
                b.conn.receive_datagram(20, packet);
            }
        }

        b.conn.send_ack_packet(30);
        deliver(&b, &mut a, 40);

        assert_eq!(
            drain_notifies(&mut a.conn),
            vec![(101, true), (102, true), (103, false), (104, true), (105, true)]
        );
    }

    /// S4 - keep-alive timeout: with 5000 ms / 5 retries and a silent peer the
    ///  connection times out around 25 s, emits exactly one timeout event, and
    ///  reports everything in flight as DROPPED.
    #[test]
    fn test_keep_alive_timeout() {
        let (mut a, _b) = connected_pair(100, 900);
        a.conn.set_ping_timeouts(5000, 5).unwrap();

        a.conn.send_data_packet(10, b"in flight", None).unwrap();
        drain_events(&mut a.conn);

        let mut timed_out_at = None;
        let mut now = 0u64;
        while now <= 30_000 {
            a.conn.tick(now);
            if a.conn.state() == ConnectionState::TimedOut {
                timed_out_at = Some(now);
                break;
            }
            now += 100;
        }

        let timed_out_at = timed_out_at.expect("connection never timed out");
        assert!(
            (24_000..27_000).contains(&timed_out_at),
            "timed out at {} ms",
            timed_out_at
        );

        let events = drain_events(&mut a.conn);
        assert_eq!(
            events,
            vec![
                ConnectionEvent::TimedOut { reason: Bytes::new() },
                ConnectionEvent::PacketNotify {
                    sequence: 101,
                    delivered: false,
                    extension: None
                },
            ]
        );

        // terminal: further ticks emit nothing, sends are refused
        a.conn.tick(now + 1000);
        assert!(a.conn.poll_event().is_none());
        assert!(a.conn.send_data_packet(now + 1000, b"x", None).is_err());
    }

    /// S5 - a rate change rides a data packet; if that packet drops, the next
    ///  data packet carries the change again.
    #[test]
    fn test_rate_change_rearms_on_drop() {
        let (mut a, mut b) = connected_pair(100, 900);

        // drain the initial rate-change arming so the test starts clean
        a.conn.send_data_packet(5, b"warmup", None).unwrap();
        deliver(&a, &mut b, 6);
        b.conn.send_ack_packet(7);
        deliver(&b, &mut a, 8);
        drain_events(&mut a.conn);
        drain_events(&mut b.conn);

        a.conn.set_fixed_rate_parameters(96, 200, 2500, 2500);

        // the packet carrying the rate block is lost
        a.conn.send_data_packet(10, b"lost", None).unwrap();
        a.wire.take();

        // a later packet arrives and NACKs it
        a.conn.send_data_packet(20, b"arrives", None).unwrap();
        deliver(&a, &mut b, 30);
        b.conn.send_ack_packet(40);
        deliver(&b, &mut a, 50);

        assert_eq!(
            drain_notifies(&mut a.conn),
            vec![(102, false), (103, true)]
        );

        // the re-armed change goes out on the next data packet; B adopts the
        // new recv period into its negotiated send period
        assert_eq!(b.conn.packet_send_period_ms(), 96);
        a.conn.send_data_packet(60, b"retry", None).unwrap();
        deliver(&a, &mut b, 70);
        assert_eq!(b.conn.packet_send_period_ms(), 200);
    }

    /// S6 - sequence wraparound: the window and the notifies work unchanged
    ///  across the 2^32 boundary.
    #[test]
    fn test_sequence_wraparound() {
        let (mut a, mut b) = connected_pair(0xFFFF_FFF0, 500);

        let mut notified = Vec::new();
        for batch in 0..2 {
            for i in 0..16u8 {
                a.conn
                    .send_data_packet(10 + batch, &[batch as u8 * 16 + i], None)
                    .unwrap();
            }
            deliver(&a, &mut b, 20 + batch);
            b.conn.send_ack_packet(30 + batch);
            deliver(&b, &mut a, 40 + batch);
            notified.extend(drain_notifies(&mut a.conn));
        }

        let expected: Vec<(u32, bool)> = (1..=32u32)
            .map(|i| (0xFFFF_FFF0u32.wrapping_add(i), true))
            .collect();
        assert_eq!(notified, expected);
        assert_eq!(a.conn.last_send_sequence(), 0x0000_0010);
        assert!(!a.conn.has_unacked_sent_packets());
        assert!(!a.conn.window_full());
    }

    /// Crypto binding end to end: a tampered datagram is dropped with no
    ///  observable effect on the receiver.
    #[test]
    fn test_tampered_datagram_is_ignored() {
        let (mut a, mut b) = connected_pair(100, 900);

        a.conn.send_data_packet(10, b"authentic", None).unwrap();
        let mut packets = a.wire.take();
        let packet = &mut packets[0];
        let last = packet.len() - 1;
        packet[last] ^= 0x10;

        b.conn.receive_datagram(20, packet);
        assert!(b.conn.poll_event().is_none());
        assert_eq!(b.conn.initial_recv_sequence(), 100);
        assert_eq!(b.conn.window().last_sequence_received(), 100);
    }

    /// A replay of the window head decrypts (same counter) but delivers no
    ///  second payload event; its sequence is no longer "new".
    #[test]
    fn test_replayed_datagram_is_ignored() {
        let (mut a, mut b) = connected_pair(100, 900);

        a.conn.send_data_packet(10, b"original", None).unwrap();
        let packets = a.wire.take();

        b.conn.receive_datagram(20, &packets[0]);
        let first = drain_events(&mut b.conn);
        assert_eq!(first.len(), 1);

        b.conn.receive_datagram(30, &packets[0]);
        assert!(b.conn.poll_event().is_none());
    }

    /// Pings elicit acks; ping/ack packets do not advance the send sequence
    ///  and allocate no notify record.
    #[test]
    fn test_ping_elicits_ack() {
        let (mut a, mut b) = connected_pair(100, 900);

        a.conn.send_ping_packet(10);
        assert_eq!(a.conn.last_send_sequence(), 100);

        deliver(&a, &mut b, 20);
        assert!(b.conn.poll_event().is_none());

        // the elicited ack refreshes A's keep-alive
        assert_eq!(deliver(&b, &mut a, 30), 1);
        assert_eq!(a.conn.last_send_sequence(), 100);
        assert!(a.conn.poll_event().is_none());
    }

    /// Receiving more than half a window without acking back triggers an
    ///  unsolicited ack to keep the peer's bitmask horizon fresh.
    #[test]
    fn test_half_window_triggers_ack() {
        let (mut a, mut b) = connected_pair(100, 900);

        for i in 0..17u8 {
            a.conn.send_data_packet(10, &[i], None).unwrap();
        }
        deliver(&a, &mut b, 20);

        // B acked on its own once the gap passed half the window
        assert_eq!(deliver(&b, &mut a, 30), 1);
        let notifies = drain_notifies(&mut a.conn);
        assert_eq!(notifies.len(), 17);
        assert!(notifies.iter().all(|&(_, delivered)| delivered));
    }

    /// The pacer emits queued payloads one per negotiated period.
    #[test]
    fn test_tick_paces_queued_payloads() {
        let (mut a, mut b) = connected_pair(100, 900);

        a.conn.queue_payload(Bytes::from_static(b"first"));
        a.conn.queue_payload(Bytes::from_static(b"second"));

        a.conn.tick(100);
        assert_eq!(a.wire.take().len(), 1);
        assert_eq!(a.conn.queued_payload_count(), 1);

        // same period: nothing
        a.conn.tick(150);
        assert_eq!(a.wire.take().len(), 0);

        a.conn.tick(200);
        assert_eq!(a.wire.take().len(), 1);
        assert_eq!(a.conn.queued_payload_count(), 0);

        // both eventually arrive
        a.conn.send_data_packet(300, b"flush", None).unwrap();
        deliver(&a, &mut b, 310);
        let payloads: Vec<Vec<u8>> = drain_events(&mut b.conn)
            .into_iter()
            .filter_map(|e| match e {
                ConnectionEvent::Packet { payload, .. } => Some(payload.to_vec()),
                _ => None,
            })
            .collect();
        assert_eq!(payloads, vec![b"first".to_vec(), b"second".to_vec(), b"flush".to_vec()]);
    }

    /// Window bound: sends are refused once `MAX_PACKET_WINDOW_SIZE - 2`
    ///  packets are unacknowledged, and resume after an ack.
    #[test]
    fn test_window_full_refuses_sends() {
        let (mut a, mut b) = connected_pair(100, 900);

        for _ in 0..MAX_PACKET_WINDOW_SIZE - 2 {
            a.conn.send_data_packet(10, b"fill", None).unwrap();
        }
        assert!(a.conn.window_full());
        assert!(a.conn.send_data_packet(10, b"overflow", None).is_err());

        deliver(&a, &mut b, 20);
        b.conn.send_ack_packet(30);
        deliver(&b, &mut a, 40);

        assert!(!a.conn.window_full());
        a.conn.send_data_packet(50, b"resumed", None).unwrap();
    }

    /// Notify totality under random loss: every sent packet gets exactly one
    ///  report, in exact send order, whatever was lost.
    #[rstest]
    #[case::every_third(3)]
    #[case::every_second(2)]
    fn test_notify_totality_under_loss(#[case] drop_every: usize) {
        let (mut a, mut b) = connected_pair(7000, 9000);

        let mut sent = 0u32;
        let mut all_notifies = Vec::new();
        for round in 0..4u64 {
            let now = 100 * round;
            for i in 0..8usize {
                a.conn.send_data_packet(now, &[i as u8], None).unwrap();
                sent += 1;
            }
            for (idx, packet) in a.wire.take().iter().enumerate() {
                if (idx + round as usize) % drop_every != 0 {
                    b.conn.receive_datagram(now + 10, packet);
                }
            }
            b.conn.send_ack_packet(now + 20);
            deliver(&b, &mut a, now + 30);
            all_notifies.extend(drain_notifies(&mut a.conn));
        }

        // a loss-free flush resolves whatever tail was still in flight
        a.conn.send_data_packet(500, b"flush", None).unwrap();
        sent += 1;
        deliver(&a, &mut b, 510);
        b.conn.send_ack_packet(520);
        deliver(&b, &mut a, 530);
        all_notifies.extend(drain_notifies(&mut a.conn));

        assert_eq!(all_notifies.len(), sent as usize);
        let sequences: Vec<u32> = all_notifies.iter().map(|&(seq, _)| seq).collect();
        assert_eq!(sequences, (7001..7001 + sent).collect::<Vec<u32>>());
    }

    /// RTT converges on the transit delay reported through send times and the
    ///  peer's send-delay field.
    #[test]
    fn test_rtt_estimation() {
        let (mut a, mut b) = connected_pair(100, 900);
        assert_eq!(a.conn.round_trip_time(), 0.0);

        for round in 0..20u64 {
            let send_time = 1000 * round;
            a.conn.send_data_packet(send_time, b"probe", None).unwrap();
            deliver(&a, &mut b, send_time + 30);
            b.conn.send_ack_packet(send_time + 30);
            // the ack claims ~30 ms processing delay on B, so the sample is
            // the full 60 ms round trip
            deliver(&b, &mut a, send_time + 60);
        }

        let rtt = a.conn.round_trip_time();
        assert!((20.0..70.0).contains(&rtt), "rtt {} out of range", rtt);
        assert_eq!(a.conn.one_way_time(), rtt * 0.5);
    }

    #[test]
    fn test_disconnect_drains_notifies() {
        let (mut a, _b) = connected_pair(100, 900);

        a.conn.send_data_packet(10, b"pending-1", None).unwrap();
        a.conn.send_data_packet(10, b"pending-2", None).unwrap();
        drain_events(&mut a.conn);

        a.conn.disconnect(Bytes::from_static(b"shutting down"));
        assert_eq!(a.conn.state(), ConnectionState::Disconnected);

        let events = drain_events(&mut a.conn);
        assert_eq!(
            events,
            vec![
                ConnectionEvent::Disconnected { reason: Bytes::from_static(b"shutting down") },
                ConnectionEvent::PacketNotify { sequence: 101, delivered: false, extension: None },
                ConnectionEvent::PacketNotify { sequence: 102, delivered: false, extension: None },
            ]
        );

        // idempotent
        a.conn.disconnect(Bytes::new());
        assert!(a.conn.poll_event().is_none());
    }

    #[test]
    fn test_handshake_surface_transitions() {
        let (mut a, _b) = connected_pair(100, 900);
        assert!(a.conn.is_established());
        assert_eq!(a.conn.initial_send_sequence(), 100);
        assert_eq!(a.conn.initial_recv_sequence(), 900);

        let mut fresh = crate::test_util::unconnected_end(peer_addr(9), 555);
        assert_eq!(fresh.conn.state(), ConnectionState::NotConnected);
        fresh.conn.begin_connect();
        assert_eq!(fresh.conn.state(), ConnectionState::AwaitingChallengeResponse);
        fresh.conn.set_state(ConnectionState::ComputingPuzzleSolution);
        fresh.conn.record_connect_send(123);
        assert_eq!(fresh.conn.connect_send_count(), 1);
        assert_eq!(fresh.conn.connect_last_send_time_ms(), 123);

        fresh
            .conn
            .connect_failed(true, Bytes::from_static(b"no response"));
        assert_eq!(fresh.conn.state(), ConnectionState::ConnectTimedOut);
        assert_eq!(
            drain_events(&mut fresh.conn),
            vec![ConnectionEvent::TimedOut { reason: Bytes::from_static(b"no response") }]
        );

        // pre-connected datagrams belong to the handshake, not the core
        fresh.conn.receive_datagram(10, &[0x80, 0, 0]);
        assert!(fresh.conn.poll_event().is_none());
    }

    #[rstest]
    #[case::zero_period(0, 5)]
    #[case::zero_retries(5000, 0)]
    fn test_bad_ping_timeouts_rejected(#[case] period: u64, #[case] retries: u32) {
        let (mut a, _b) = connected_pair(100, 900);
        assert!(a.conn.set_ping_timeouts(period, retries).is_err());
    }

    /// A socket-level send failure surfaces in the result; the notify record
    ///  is queued regardless and resolves like any other loss.
    #[test]
    fn test_socket_send_failure_is_reported() {
        use crate::socket::MockDatagramSocket;
        use crate::test_util::{StubRandom, TEST_IV, TEST_KEY};

        let mut socket = MockDatagramSocket::new();
        socket.expect_max_datagram_size().return_const(1472usize);
        socket
            .expect_send_to()
            .times(1)
            .returning(|_, _| SendResult::Dropped);

        let mut conn = Connection::new(
            ConnectionConfig::default(),
            peer_addr(3),
            Arc::new(socket),
            Box::new(StubRandom { integer: 42, unit_float: 1.0 }),
        )
        .unwrap();
        conn.install_session(SymmetricCipher::new(&TEST_KEY, &TEST_IV), 7);
        conn.handshake_complete(0);
        drain_events(&mut conn);

        let (result, sequence) = conn.send_data_packet(10, b"x", None).unwrap();
        assert_eq!(result, SendResult::Dropped);
        assert_eq!(sequence, 43);
        assert!(conn.has_unacked_sent_packets());
    }

    /// Simulated loss eats the datagram before the socket while the protocol
    ///  believes it entered the network.
    #[test]
    fn test_simulated_send_loss() {
        use crate::test_util::{unconnected_end_with, StubRandom, TEST_IV, TEST_KEY};

        let mut a = unconnected_end_with(
            peer_addr(5),
            StubRandom { integer: 100, unit_float: 0.0 },
        );
        a.conn
            .install_session(SymmetricCipher::new(&TEST_KEY, &TEST_IV), 900);
        a.conn.handshake_complete(0);
        drain_events(&mut a.conn);

        a.conn.set_simulated_net_params(0.5, 0);
        let (result, _) = a.conn.send_data_packet(10, b"x", None).unwrap();
        assert_eq!(result, SendResult::Sent);
        assert!(a.wire.take().is_empty());
        assert!(a.conn.has_unacked_sent_packets());
    }

    /// Simulated latency reroutes sends through the delayed path.
    #[test]
    fn test_simulated_latency_uses_delayed_sends() {
        use crate::socket::MockDatagramSocket;
        use crate::test_util::{StubRandom, TEST_IV, TEST_KEY};

        let mut socket = MockDatagramSocket::new();
        socket.expect_max_datagram_size().return_const(1472usize);
        socket
            .expect_send_to_delayed()
            .withf(|_, _, delay_ms| *delay_ms == 40)
            .times(1)
            .returning(|_, _, _| ());

        let mut conn = Connection::new(
            ConnectionConfig::default(),
            peer_addr(4),
            Arc::new(socket),
            Box::new(StubRandom { integer: 7, unit_float: 1.0 }),
        )
        .unwrap();
        conn.install_session(SymmetricCipher::new(&TEST_KEY, &TEST_IV), 70);
        conn.handshake_complete(0);
        drain_events(&mut conn);

        conn.set_simulated_net_params(0.0, 40);
        let (result, _) = conn.send_data_packet(10, b"probe", None).unwrap();
        assert_eq!(result, SendResult::Sent);
    }

    /// The extension attached at send time comes back in the notify event.
    #[test]
    fn test_notify_extension_round_trip() {
        let (mut a, mut b) = connected_pair(100, 900);

        a.conn
            .send_data_packet(10, b"tagged", Some(Bytes::from_static(b"move #17")))
            .unwrap();
        deliver(&a, &mut b, 20);
        b.conn.send_ack_packet(30);
        deliver(&b, &mut a, 40);

        assert_eq!(
            drain_events(&mut a.conn),
            vec![ConnectionEvent::PacketNotify {
                sequence: 101,
                delivered: true,
                extension: Some(Bytes::from_static(b"move #17")),
            }]
        );
    }
}
