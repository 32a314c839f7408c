// The dispatch loop and the per-datagram handlers.
//
// All clients talk to the one well-known socket; a client is identified by its source address
// for the whole transfer. The loop receives a datagram, peeks at its opcode and hands it to a
// fresh task right away, so reception never waits on handler work. Every handler is terminal:
// it either answers the peer (possibly with an ERROR packet) or logs and drops. Nothing is
// propagated back to the loop.

use crate::config::ServerConfig;
use crate::storage::Storage;
use crate::tftp::{self, ErrorCode, FileMode, Packet, TftpResult, TftpSocket};
use crate::tracker::{Admission, Direction, SessionTracker, TransferRequest};
use crate::transfer;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Everything a handler task needs. Cheap to clone, one clone per datagram.
#[derive(Clone)]
pub struct RequestHandler {
    sock: Arc<TftpSocket>,
    tracker: Arc<SessionTracker>,
    config: Arc<ServerConfig>,
}

impl RequestHandler {
    pub fn tracker(&self) -> &Arc<SessionTracker> {
        &self.tracker
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Decodes a datagram and routes it. Undecodable datagrams are dropped without a reply,
    /// their source can't be trusted to be a real peer.
    pub async fn handle_datagram(&self, buf: Vec<u8>, src: SocketAddr) {
        let packet = match Packet::parse_from_buf(&buf) {
            Ok(packet) => packet,
            Err(e) => {
                log::debug!("Dropping datagram from {}: {}", src, e);
                return;
            }
        };

        match packet {
            Packet::ReadReq { path, mode } => {
                self.handle_read(src, TransferRequest { file: path, mode }).await
            }
            Packet::WriteReq { path, mode } => {
                self.handle_write(src, TransferRequest { file: path, mode }).await
            }
            Packet::Data { block, data } => self.handle_data(src, block, data).await,
            Packet::Ack { block } => self.handle_ack(src, block).await,
            Packet::Error { code, message } => self.handle_error(src, code, &message),
        }
    }

    pub async fn handle_read(&self, addr: SocketAddr, request: TransferRequest) {
        log::info!("Read request from {} for '{}' ({:?})", addr, request.file, request.mode);
        if request.mode == FileMode::Mail {
            self.send_error(addr, ErrorCode::Undefined, "mail mode is not supported".to_string(), true).await;
            return;
        }

        match self.tracker.begin_read(addr, request).await {
            Ok(session) => transfer::send_file(self, session).await,
            Err(e) => {
                log::info!("Refusing read by {}: {}", addr, e);
                self.send_error(addr, e.error_code(), e.to_string(), true).await;
            }
        }
    }

    pub async fn handle_write(&self, addr: SocketAddr, request: TransferRequest) {
        log::info!("Write request from {} for '{}' ({:?})", addr, request.file, request.mode);
        if self.config.read_only {
            self.send_error(addr, ErrorCode::AccessViolation, "server is read-only".to_string(), true).await;
            return;
        }
        if request.mode == FileMode::Mail {
            self.send_error(addr, ErrorCode::Undefined, "mail mode is not supported".to_string(), true).await;
            return;
        }

        // A repeated request only lost its Ack(0); it gets the same answer as the first one.
        match self.tracker.begin_write(addr, request).await {
            Ok(Admission::New(_)) | Ok(Admission::Repeated(_)) => {
                self.send_packet(&Packet::Ack { block: 0 }, addr).await
            }
            Err(e) => {
                log::info!("Refusing write by {}: {}", addr, e);
                self.send_error(addr, e.error_code(), e.to_string(), true).await;
            }
        }
    }

    pub async fn handle_data(&self, addr: SocketAddr, block: u16, data: Vec<u8>) {
        match self.tracker.lookup(addr, Direction::Write).await {
            Some(session) => transfer::receive_block(self, session, block, data).await,
            None => {
                log::debug!("Data block {} from {} matches no write", block, addr);
                self.send_error(addr, ErrorCode::UnknownTid, "unknown transfer ID".to_string(), false).await;
            }
        }
    }

    pub async fn handle_ack(&self, addr: SocketAddr, block: u16) {
        if self.tracker.clear_error_pending(addr) {
            log::debug!("{} acknowledged our error packet", addr);
            return;
        }

        match self.tracker.lookup(addr, Direction::Read).await {
            Some(session) => session.signal_ack(block),
            None => {
                log::debug!("Ack {} from {} matches no read", block, addr);
                self.send_error(addr, ErrorCode::UnknownTid, "unknown transfer ID".to_string(), false).await;
            }
        }
    }

    /// Errors from peers are informational, they trigger no recovery.
    pub fn handle_error(&self, addr: SocketAddr, code: ErrorCode, message: &str) {
        log::warn!("{} reported error {:?} ({}): '{}'", addr, code, code.code(), message);
    }

    /// Sends an ERROR packet. With `ack_expected`, the peer is remembered first so its ack of
    /// this error is not taken for the ack of a data block.
    pub async fn send_error(&self, addr: SocketAddr, code: ErrorCode, message: String, ack_expected: bool) {
        if ack_expected {
            self.tracker.mark_error_pending(addr);
        }
        log::debug!("Sending error {:?} '{}' to {}", code, message, addr);
        // Error packet is sent as a courtesy, we don't care how it goes.
        self.send_packet(&Packet::Error { code, message }, addr).await;
    }

    pub async fn send_packet(&self, packet: &Packet, addr: SocketAddr) {
        if let Err(e) = self.sock.send(packet, addr).await {
            log::warn!("Unable to send {:?} to {}: {}", packet.op_code(), addr, e);
        }
    }

    pub async fn send_raw(&self, buf: &[u8], addr: SocketAddr) -> TftpResult<()> {
        self.sock.send_raw(buf, addr).await
    }
}

/// The TFTP server: one socket, one session tracker, one task per datagram.
pub struct Server {
    handler: RequestHandler,
}

impl Server {
    pub fn bind(config: ServerConfig, storage: Arc<dyn Storage>) -> TftpResult<Server> {
        let sock = TftpSocket::bind(config.bind_addr)?;
        log::info!("Listening on {}", sock.local_addr()?);

        Ok(Server {
            handler: RequestHandler {
                sock: Arc::new(sock),
                tracker: Arc::new(SessionTracker::new(storage)),
                config: Arc::new(config),
            },
        })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        self.handler.sock.local_addr()
    }

    pub fn tracker(&self) -> Arc<SessionTracker> {
        self.handler.tracker.clone()
    }

    /// Receives datagrams until the task is dropped.
    pub async fn run(&self) {
        loop {
            let (buf, src) = match self.handler.sock.recv().await {
                Ok(received) => received,
                Err(e) => {
                    log::warn!("Unable to receive datagram: {}", e);
                    continue;
                }
            };

            // Routing only needs the opcode; garbage is dropped before a task is spent on it.
            match tftp::peek_op_code(&buf) {
                Ok(op) => log::trace!("Got {:?} from {}", op, src),
                Err(e) => {
                    log::debug!("Dropping datagram from {}: {}", src, e);
                    continue;
                }
            }

            let handler = self.handler.clone();
            tokio::spawn(async move { handler.handle_datagram(buf, src).await });
        }
    }

    /// Starts the background sweep of idle sessions, unless the configuration disables it.
    pub fn spawn_reaper(&self) -> Option<JoinHandle<()>> {
        let max_idle = self.handler.config.session_idle_timeout?;
        let every = self.handler.config.reap_interval;
        let tracker = self.tracker();

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let report = tracker.reap_stale(max_idle).await;
                if report != Default::default() {
                    log::info!("Reaped idle state: {:?}", report);
                }
            }
        }))
    }
}
