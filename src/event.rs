use bytes::Bytes;

/// One-way notifications from a connection to the hosting application, queued
///  on the connection and drained by the driver after every `tick` /
///  `receive_datagram`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConnectionEvent {
    /// The handshake finished and the session is live.
    Established,
    /// The peer or the local side terminated the session.
    Disconnected { reason: Bytes },
    /// The keep-alive retry budget ran out.
    TimedOut { reason: Bytes },
    /// A data packet arrived with a payload for the application.
    Packet { sequence: u32, payload: Bytes },
    /// The fate of one previously sent data packet, reported in strict send
    ///  order: exactly one of these per data packet, `delivered` false meaning
    ///  the peer NACK-ed it (or the connection died with it in flight).
    PacketNotify {
        sequence: u32,
        delivered: bool,
        extension: Option<Bytes>,
    },
}
