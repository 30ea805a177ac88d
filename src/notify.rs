use crate::packet_header::MAX_PACKET_WINDOW_SIZE;
use bytes::Bytes;
use std::collections::VecDeque;

/// What was recorded about one in-flight data packet, resolved to DELIVERED or
///  DROPPED when the peer's ack for it arrives (or the connection dies).
#[derive(Clone, Debug)]
pub struct PacketNotify {
    /// driver clock at the moment the packet entered the socket
    pub send_time_ms: u64,
    /// this packet carried a rate change; re-arm the change if it drops
    pub rate_changed: bool,
    /// application-opaque extension attached at send time and handed back in
    ///  the notify event
    pub extension: Option<Bytes>,
}

/// FIFO of pending notify records, one per in-flight data packet, oldest first.
///
/// The queue is authoritative for which packet an ack refers to: records are
///  popped strictly in send order, one per walked notify index, regardless of
///  what the ack bitmask claims. Its length always equals
///  `last_send_seq - highest_acked_seq`.
pub struct NotifyQueue {
    queue: VecDeque<PacketNotify>,
}

impl NotifyQueue {
    pub fn new() -> NotifyQueue {
        NotifyQueue {
            queue: VecDeque::with_capacity(MAX_PACKET_WINDOW_SIZE as usize),
        }
    }

    pub fn push(&mut self, notify: PacketNotify) {
        debug_assert!(self.queue.len() < MAX_PACKET_WINDOW_SIZE as usize);
        self.queue.push_back(notify);
    }

    /// Pops the record for the oldest unresolved packet.
    pub fn pop(&mut self) -> Option<PacketNotify> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drains every pending record in send order; used when the connection
    ///  terminates and everything still in flight must be reported DROPPED.
    pub fn drain(&mut self) -> impl Iterator<Item = PacketNotify> + '_ {
        self.queue.drain(..)
    }
}

impl Default for NotifyQueue {
    fn default() -> Self {
        Self::new()
    }
}
