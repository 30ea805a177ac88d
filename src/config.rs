use crate::rate::NetRate;
use anyhow::bail;
use std::net::SocketAddr;
use std::time::Duration;

/// Default milliseconds to wait before sending a ping packet.
pub const DEFAULT_PING_TIMEOUT_MS: u64 = 5000;
/// Default number of unacknowledged pings to send before timing out.
pub const DEFAULT_PING_RETRY_COUNT: u32 = 10;

/// Per-connection tuning. Everything here can also be adjusted after
///  construction through the setters on `Connection`.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// time to wait between keep-alive pings
    pub ping_timeout_ms: u64,
    /// unacknowledged pings before the connection times out
    pub ping_retry_count: u32,

    /// initial local rate preferences, re-negotiable at runtime
    pub initial_rate: NetRate,

    /// fraction of packets to drop on send and receive, for testing
    pub simulated_packet_loss: f32,
    /// additional delay applied to every send, for testing
    pub simulated_latency_ms: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            ping_timeout_ms: DEFAULT_PING_TIMEOUT_MS,
            ping_retry_count: DEFAULT_PING_RETRY_COUNT,
            initial_rate: NetRate::default(),
            simulated_packet_loss: 0.0,
            simulated_latency_ms: 0,
        }
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ping_timeout_ms == 0 {
            bail!("ping timeout must be positive");
        }
        if self.ping_retry_count == 0 {
            bail!("ping retry count must be positive");
        }
        if !(0.0..=1.0).contains(&self.simulated_packet_loss) {
            bail!(
                "simulated packet loss {} outside [0, 1]",
                self.simulated_packet_loss
            );
        }
        Ok(())
    }
}

/// Configuration for the tokio endpoint driver.
#[derive(Clone, Debug)]
pub struct EndPointConfig {
    pub bind_addr: SocketAddr,
    /// cadence at which every connection's `tick` runs
    pub tick_interval: Duration,
    pub connection: ConnectionConfig,
}

impl EndPointConfig {
    pub fn new(bind_addr: SocketAddr) -> EndPointConfig {
        EndPointConfig {
            bind_addr,
            tick_interval: Duration::from_millis(20),
            connection: ConnectionConfig::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tick_interval.is_zero() {
            bail!("tick interval must be positive");
        }
        self.connection.validate()
    }
}
