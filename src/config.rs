use std::net::SocketAddr;
use std::time::Duration;

/// Well-known TFTP port.
pub const DEFAULT_PORT: u16 = 69;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,

    /// How long a read transfer waits for an ack before resending the outstanding block.
    pub retry_interval: Duration,
    /// How long a single block may stay unacknowledged, retries included, before the read
    ///  transfer is abandoned.
    pub transfer_timeout: Duration,

    /// Sessions idle for longer than this are reaped. `None` turns the reaper off.
    pub session_idle_timeout: Option<Duration>,
    pub reap_interval: Duration,

    /// Refuse all write requests.
    pub read_only: bool,
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> ServerConfig {
        ServerConfig {
            bind_addr,
            retry_interval: Duration::from_secs(3),
            transfer_timeout: Duration::from_secs(15),
            session_idle_timeout: Some(Duration::from_secs(60)),
            reap_interval: Duration::from_secs(10),
            read_only: false,
        }
    }
}
