// A TFTP server modeled on RFC 1350.
//
// A transfer begins with a read request (RRQ) or write request (WRQ) sent to the well-known
// port. The file then moves in DATA packets of 512 bytes, each acknowledged by an ACK before the
// next one is sent. A DATA packet shorter than 512 bytes (possibly empty) ends the transfer.
//
// All packets travel over UDP and may be lost or duplicated. The sender of a DATA packet keeps it
// for retransmission until it is acked; a duplicated DATA packet is acked again without being
// applied twice.
//
// Every client is served from the one listening socket and identified by its source address
// (its transfer identifier, TID) for the duration of one transfer.
//
// TFTP header is a 2-byte opcode field:
//
// opcode   operation
// 1        Read req (RRQ)    | 0x01 | Filename | 0x00 | Mode | 0x00
// 2        Write req (WRQ)   | 0x02 | Filename | 0x00 | Mode | 0x00
// 3        Data (DATA)       | 0x03 | Block # (2 bytes) | Data (0-512 bytes)
// 4        ACK               | 0x04 | Block # (2 bytes)
// 5        ERROR             | 0x05 | ErrorCode (2 bytes) | ErrMsg | 0x00
//
// A WRQ is acknowledged with ACK block 0; an RRQ is answered with DATA block 1.
//
// Error codes
//
// 0    Not defined, see msg
// 1    File not found
// 2    Access violation
// 3    Disk full / alloc exceeded
// 4    Illegal TFTP op
// 5    Unknown TID
// 6    File already exists
// 7    No such user
//
// Server options:
// - Bind address
// - Retry interval and per-block timeout
// - Idle session reaping
// - Filesystem root (in-memory storage otherwise)
// - Disable writes

pub mod config;
pub mod server;
pub mod storage;
pub mod tftp;
pub mod tracker;
pub mod transfer;

use clap::Parser;
use config::ServerConfig;
use server::Server;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use storage::{DirStorage, MemoryStorage, Storage};

use anyhow::{Context, Result};

#[derive(Parser, Debug)]
#[command(version, about = "TFTP server (RFC 1350)")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value_t = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config::DEFAULT_PORT)))]
    bind: SocketAddr,

    /// Serve and store files under this directory. Files live in memory when omitted.
    #[arg(long)]
    root: Option<PathBuf>,

    /// Milliseconds to wait for an ack before resending a data block.
    #[arg(long, default_value_t = 3_000)]
    retry_ms: u64,

    /// Milliseconds a data block may stay unacknowledged before the read is abandoned.
    #[arg(long, default_value_t = 15_000)]
    timeout_ms: u64,

    /// Seconds of inactivity after which a session is reaped. 0 disables reaping.
    #[arg(long, default_value_t = 60)]
    idle_timeout_secs: u64,

    #[arg(long, default_value_t = 10)]
    reap_interval_secs: u64,

    /// Refuse write requests.
    #[arg(long)]
    read_only: bool,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        let mut config = ServerConfig::new(self.bind);
        config.retry_interval = Duration::from_millis(self.retry_ms);
        config.transfer_timeout = Duration::from_millis(self.timeout_ms);
        config.session_idle_timeout = match self.idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        config.reap_interval = Duration::from_secs(self.reap_interval_secs.max(1));
        config.read_only = self.read_only;
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let storage: Arc<dyn Storage> = match &args.root {
        Some(root) => {
            log::info!("Serving files from {:#?}", root);
            Arc::new(DirStorage::new(root))
        }
        None => {
            log::info!("Serving files from memory");
            Arc::new(MemoryStorage::new())
        }
    };

    let server = Server::bind(args.server_config(), storage)
        .with_context(|| format!("Couldn't bind {}", args.bind))?;
    let _reaper = server.spawn_reaper();

    tokio::select! {
        _ = server.run() => {}
        res = tokio::signal::ctrl_c() => {
            res.context("Couldn't listen for Ctrl-C")?;
            log::info!("Shutting down");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_to_config() {
        let args = Args::parse_from([
            "tftpd",
            "--bind",
            "127.0.0.1:6969",
            "--retry-ms",
            "250",
            "--idle-timeout-secs",
            "0",
            "--read-only",
        ]);
        let config = args.server_config();

        assert_eq!(config.bind_addr, "127.0.0.1:6969".parse().unwrap());
        assert_eq!(config.retry_interval, Duration::from_millis(250));
        assert_eq!(config.transfer_timeout, Duration::from_secs(15));
        assert_eq!(config.session_idle_timeout, None);
        assert!(config.read_only);
    }

    #[test]
    fn test_default_args() {
        let config = Args::parse_from(["tftpd"]).server_config();
        assert_eq!(config.bind_addr.port(), config::DEFAULT_PORT);
        assert_eq!(config.session_idle_timeout, Some(Duration::from_secs(60)));
        assert!(!config.read_only);
    }
}
