use crate::bit_stream::BitStream;
use tracing::trace;

/// The default send/receive bandwidth - 2.5 KB per second.
pub const DEFAULT_FIXED_BANDWIDTH: u32 = 2500;
/// The default delay between packet sends - roughly 10 packets per second.
pub const DEFAULT_FIXED_SEND_PERIOD: u32 = 96;
/// Upper bound for the bandwidth fields of the rate-change wire block.
pub const MAX_FIXED_BANDWIDTH: u32 = 65535;
/// Upper bound for the period fields of the rate-change wire block.
pub const MAX_FIXED_SEND_PERIOD: u32 = 2047;

/// Ceiling for the send-delay credit accumulator.
const MAX_SEND_DELAY_CREDIT_MS: u64 = 1000;

/// One side's rate preferences. The send fields bound what this host emits;
///  the recv fields are what it asks the peer to respect.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NetRate {
    /// minimum millisecond delay (maximum rate) between packet sends
    pub min_packet_send_period: u32,
    /// minimum millisecond delay the remote host should allow between sends
    pub min_packet_recv_period: u32,
    /// bytes per second this host may send
    pub max_send_bandwidth: u32,
    /// bytes per second max the remote host should send
    pub max_recv_bandwidth: u32,
}

impl Default for NetRate {
    fn default() -> Self {
        NetRate {
            min_packet_send_period: DEFAULT_FIXED_SEND_PERIOD,
            min_packet_recv_period: DEFAULT_FIXED_SEND_PERIOD,
            max_send_bandwidth: DEFAULT_FIXED_BANDWIDTH,
            max_recv_bandwidth: DEFAULT_FIXED_BANDWIDTH,
        }
    }
}

/// Fixed-rate transmission pacing: the negotiated period/size derived from both
///  sides' [`NetRate`]s, and the credit accumulator that smooths out driver
///  tick jitter.
pub struct RateController {
    local_rate: NetRate,
    remote_rate: NetRate,
    /// the local rate changed and the peer has not confirmed seeing it yet
    local_rate_changed: bool,

    current_packet_send_period: u32,
    current_packet_send_size: u32,
    max_datagram_size: u32,

    send_delay_credit_ms: u64,
    last_update_time_ms: u64,
}

impl RateController {
    pub fn new(local_rate: NetRate, max_datagram_size: u32) -> RateController {
        let mut controller = RateController {
            local_rate,
            remote_rate: NetRate::default(),
            local_rate_changed: true,
            current_packet_send_period: 0,
            current_packet_send_size: 0,
            max_datagram_size,
            send_delay_credit_ms: 0,
            last_update_time_ms: 0,
        };
        controller.compute_negotiated_rate();
        controller
    }

    pub fn local_rate(&self) -> NetRate {
        self.local_rate
    }

    pub fn packet_send_period_ms(&self) -> u32 {
        self.current_packet_send_period
    }

    pub fn packet_send_size(&self) -> u32 {
        self.current_packet_send_size
    }

    pub fn set_local_rate(&mut self, rate: NetRate) {
        self.local_rate = rate;
        self.local_rate_changed = true;
        self.compute_negotiated_rate();
    }

    pub fn set_remote_rate(&mut self, rate: NetRate) {
        self.remote_rate = rate;
        self.compute_negotiated_rate();
    }

    /// Re-arms the rate-change wire block, e.g. when the packet that carried it
    ///  was dropped.
    pub fn mark_rate_changed(&mut self) {
        self.local_rate_changed = true;
    }

    /// Anchors the pacing clock when the session goes live: the first data
    ///  packet may go out immediately, with no startup credit burst.
    pub fn reset(&mut self, now_ms: u64) {
        self.send_delay_credit_ms = 0;
        self.last_update_time_ms = now_ms.saturating_sub(self.current_packet_send_period as u64);
    }

    fn compute_negotiated_rate(&mut self) {
        self.current_packet_send_period = self
            .local_rate
            .min_packet_send_period
            .max(self.remote_rate.min_packet_recv_period);

        let max_bandwidth = self
            .local_rate
            .max_send_bandwidth
            .min(self.remote_rate.max_recv_bandwidth);
        let send_size =
            (max_bandwidth as f32 * self.current_packet_send_period as f32 * 0.001) as u32;
        self.current_packet_send_size = send_size.min(self.max_datagram_size);

        trace!(
            "negotiated rate: period {} ms, packet size {} bytes",
            self.current_packet_send_period,
            self.current_packet_send_size
        );
    }

    /// The pacing gate: returns whether a data packet may be sent at `now`,
    ///  banking up to a second of slack so a late tick does not permanently
    ///  lose send slots. The caller still has to check the window and its
    ///  outgoing queue, and call [`Self::mark_sent`] if it actually sends.
    pub fn check_send_gate(&mut self, now_ms: u64) -> bool {
        let period = self.current_packet_send_period as u64;
        if now_ms.saturating_sub(self.last_update_time_ms) + self.send_delay_credit_ms < period {
            return false;
        }

        self.send_delay_credit_ms =
            (now_ms + self.send_delay_credit_ms).saturating_sub(self.last_update_time_ms + period);
        if self.send_delay_credit_ms > MAX_SEND_DELAY_CREDIT_MS {
            self.send_delay_credit_ms = MAX_SEND_DELAY_CREDIT_MS;
        }
        true
    }

    pub fn mark_sent(&mut self, now_ms: u64) {
        self.last_update_time_ms = now_ms;
    }

    /// Writes the rate block of a data packet: a changed flag, then the four
    ///  rate fields iff the flag is set. Returns the flag so it can be mirrored
    ///  into the packet's notify record.
    pub fn write_rate_info(&mut self, stream: &mut BitStream) -> bool {
        let rate_changed = self.local_rate_changed;
        self.local_rate_changed = false;

        stream.write_bool(rate_changed);
        if rate_changed {
            stream.write_ranged_u32(self.local_rate.max_recv_bandwidth, 0, MAX_FIXED_BANDWIDTH);
            stream.write_ranged_u32(self.local_rate.max_send_bandwidth, 0, MAX_FIXED_BANDWIDTH);
            stream.write_ranged_u32(self.local_rate.min_packet_recv_period, 1, MAX_FIXED_SEND_PERIOD);
            stream.write_ranged_u32(self.local_rate.min_packet_send_period, 1, MAX_FIXED_SEND_PERIOD);
        }
        rate_changed
    }

    /// Reads the rate block of a received data packet, adopting the peer's new
    ///  rate if the changed flag is set.
    pub fn read_rate_info(&mut self, stream: &mut BitStream) -> anyhow::Result<()> {
        if stream.read_bool()? {
            let remote = NetRate {
                max_recv_bandwidth: stream.read_ranged_u32(0, MAX_FIXED_BANDWIDTH)?,
                max_send_bandwidth: stream.read_ranged_u32(0, MAX_FIXED_BANDWIDTH)?,
                min_packet_recv_period: stream.read_ranged_u32(1, MAX_FIXED_SEND_PERIOD)?,
                min_packet_send_period: stream.read_ranged_u32(1, MAX_FIXED_SEND_PERIOD)?,
            };
            trace!("peer rate change: {:?}", remote);
            self.set_remote_rate(remote);
        }
        Ok(())
    }
}
