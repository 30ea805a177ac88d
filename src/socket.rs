use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{error, trace};

/// Assumed UDP payload capacity. Full Ethernet frames without optional IP
///  headers give `1500 - 20 - 8` for IPv4; routes with smaller MTUs are the
///  application's problem since this protocol never fragments.
pub const MAX_DATAGRAM_SIZE: usize = 1472;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SendResult {
    Sent,
    /// The datagram did not enter the network (socket error, or the simulated
    ///  loss hook ate it). The notification protocol treats this exactly like
    ///  in-flight loss.
    Dropped,
}

/// Non-blocking datagram sending, abstracted so the connection core stays free
///  of I/O and tests can capture traffic.
#[cfg_attr(test, mockall::automock)]
pub trait DatagramSocket: Send + Sync + 'static {
    fn send_to(&self, to: SocketAddr, packet: &[u8]) -> SendResult;

    /// Sends after a delay; only used by the latency simulation hook.
    fn send_to_delayed(&self, to: SocketAddr, packet: &[u8], delay_ms: u32);

    fn max_datagram_size(&self) -> usize;
}

impl DatagramSocket for Arc<UdpSocket> {
    fn send_to(&self, to: SocketAddr, packet: &[u8]) -> SendResult {
        trace!("UDP socket: sending {} bytes to {:?}", packet.len(), to);

        match self.try_send_to(packet, to) {
            Ok(_) => SendResult::Sent,
            Err(e) => {
                error!("error sending UDP packet to {:?}: {}", to, e);
                SendResult::Dropped
            }
        }
    }

    fn send_to_delayed(&self, to: SocketAddr, packet: &[u8], delay_ms: u32) {
        let socket = self.clone();
        let packet = packet.to_vec();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms as u64)).await;
            if let SendResult::Dropped = socket.send_to(to, &packet) {
                error!("error sending delayed UDP packet to {:?}", to);
            }
        });
    }

    fn max_datagram_size(&self) -> usize {
        MAX_DATAGRAM_SIZE
    }
}
