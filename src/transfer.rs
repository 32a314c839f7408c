// The per-session transfer state machines.
//
// A read transfer is driven by one task, the one that admitted the request. It walks the file in
// DATA_BUFFER_SIZE blocks and, for each block, sends it and then waits for whichever comes first:
// an ack through the session's signaling slot, the retry interval (resend), or the block timeout
// (give up). The timers belong to the wait of a single block and are dropped as soon as it ends,
// so a late timer can never fire into the wait of a later block.
//
// A write transfer has no task of its own. Each inbound DATA datagram is handled by its own task,
// and the session lock orders them: validate, ack, append, advance. The ack goes out before the
// append so the client can put the next block on the wire while this one is committed; the next
// datagram queues on the lock until that commit is done.

use crate::server::RequestHandler;
use crate::tftp::{ErrorCode, Packet, DATA_BUFFER_SIZE};
use crate::tracker::{Session, Signal};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};

/// One DATA block a read transfer sends.
#[derive(Debug, PartialEq)]
pub struct OutgoingBlock<'a> {
    pub number: u16,
    pub payload: &'a [u8],
}

/// Slices file content into the blocks of a read transfer, always ending with an empty block.
pub struct ReadBlocks<'a> {
    content: &'a [u8],
    index: usize,
    finished: bool,
}

impl<'a> ReadBlocks<'a> {
    pub fn new(content: &'a [u8]) -> ReadBlocks<'a> {
        ReadBlocks { content, index: 0, finished: false }
    }
}

impl<'a> Iterator for ReadBlocks<'a> {
    type Item = OutgoingBlock<'a>;

    fn next(&mut self) -> Option<OutgoingBlock<'a>> {
        if self.finished {
            return None;
        }

        let content = self.content;
        let start = self.index * DATA_BUFFER_SIZE;
        let payload: &'a [u8] = if start < content.len() {
            &content[start..content.len().min(start + DATA_BUFFER_SIZE)]
        } else {
            &[]
        };
        // Block numbers roll over past 65535.
        let number = (self.index as u16).wrapping_add(1);
        self.index += 1;

        if payload.is_empty() {
            self.finished = true;
        }

        Some(OutgoingBlock { number, payload })
    }
}

/// Whether an ack for `acked` covers the outstanding block. Acks at or ahead of it count, using
/// serial number arithmetic so the check survives block number rollover.
pub fn acknowledges(acked: u16, outstanding: u16) -> bool {
    acked.wrapping_sub(outstanding) < 0x8000
}

/// How a write session treats an inbound DATA block.
#[derive(Debug, PartialEq)]
pub enum DataDisposition {
    /// The expected next block: ack, append and advance.
    Next,
    /// A resend of the block written last: ack again, change nothing.
    Duplicate,
    /// Neither of the above, the transfer has a hole.
    OutOfSequence { expected: u16 },
    /// The session ended while this datagram waited for it.
    Closed,
}

pub fn classify_data(last_block: u16, block: u16, closed: bool) -> DataDisposition {
    if block == last_block {
        DataDisposition::Duplicate
    } else if closed {
        DataDisposition::Closed
    } else if block == last_block.wrapping_add(1) {
        DataDisposition::Next
    } else {
        DataDisposition::OutOfSequence { expected: last_block.wrapping_add(1) }
    }
}

#[derive(Debug, PartialEq)]
enum BlockOutcome {
    Acked,
    TimedOut,
    Cancelled,
    SendFailed,
}

/// Streams the session's file to its client, then removes the session.
pub async fn send_file(handler: &RequestHandler, session: Arc<Session>) {
    let addr = session.addr();
    let tracker = handler.tracker();

    let content = match tracker.storage().read(session.file()).await {
        Ok(content) => content,
        Err(e) => {
            log::warn!("Could not load '{}' for {}: {}", session.file(), addr, e);
            tracker.remove_session(&session).await;
            handler.send_error(addr, e.error_code(), e.to_string(), false).await;
            return;
        }
    };

    // Subscribe before the first block goes out, so no ack can slip past.
    let mut signals = session.subscribe();
    for block in ReadBlocks::new(&content) {
        let outcome = if session.is_closed() {
            BlockOutcome::Cancelled
        } else {
            send_block(handler, &session, &mut signals, &block).await
        };

        match outcome {
            BlockOutcome::Acked => continue,
            BlockOutcome::TimedOut => {
                session.lock().await.timed_out = true;
                log::warn!(
                    "Read of '{}' by {} timed out at block {}",
                    session.file(),
                    addr,
                    block.number
                );
                // A replacement read of the same peer must not see this error.
                if tracker.remove_session(&session).await {
                    handler.send_error(addr, ErrorCode::Undefined, "timeout".to_string(), false).await;
                }
                return;
            }
            BlockOutcome::Cancelled => {
                log::info!(
                    "Read of '{}' by {} was cancelled at block {}",
                    session.file(),
                    addr,
                    block.number
                );
                return;
            }
            BlockOutcome::SendFailed => {
                tracker.remove_session(&session).await;
                return;
            }
        }
    }

    tracker.remove_session(&session).await;
    log::info!(
        "Sent '{}' ({} bytes, {:?}) to {}",
        session.file(),
        content.len(),
        session.mode(),
        addr
    );
}

async fn send_block(
    handler: &RequestHandler,
    session: &Session,
    signals: &mut watch::Receiver<Signal>,
    block: &OutgoingBlock<'_>,
) -> BlockOutcome {
    let addr = session.addr();
    let config = handler.config();
    let packet = Packet::Data { block: block.number, data: block.payload.to_vec() }.serialize();

    {
        let mut state = session.lock().await;
        state.block_acknowledged = false;
        state.touch();
    }

    log::debug!(
        "Sending block {} ({} bytes) of '{}' to {}",
        block.number,
        block.payload.len(),
        session.file(),
        addr
    );
    if let Err(e) = handler.send_raw(&packet, addr).await {
        log::warn!("Unable to send block {} to {}: {}", block.number, addr, e);
        return BlockOutcome::SendFailed;
    }

    let timeout = sleep(config.transfer_timeout);
    tokio::pin!(timeout);
    let mut retry = interval_at(Instant::now() + config.retry_interval, config.retry_interval);
    retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = signals.changed() => {
                if changed.is_err() {
                    return BlockOutcome::Cancelled;
                }
                let signal = *signals.borrow_and_update();
                match signal {
                    Signal::Ack(acked) if acknowledges(acked, block.number) => {
                        let mut state = session.lock().await;
                        state.block_acknowledged = true;
                        state.last_block = block.number;
                        state.touch();
                        log::debug!("{} acked block {} of '{}'", addr, block.number, session.file());
                        return BlockOutcome::Acked;
                    }
                    Signal::Ack(stale) => {
                        log::trace!(
                            "Ignoring ack {} from {} while block {} is outstanding",
                            stale,
                            addr,
                            block.number
                        );
                    }
                    Signal::Cancel => return BlockOutcome::Cancelled,
                    Signal::Idle => {}
                }
            }
            _ = retry.tick() => {
                log::debug!("No ack for block {} from {}, resending", block.number, addr);
                if let Err(e) = handler.send_raw(&packet, addr).await {
                    log::warn!("Unable to resend block {} to {}: {}", block.number, addr, e);
                }
            }
            _ = &mut timeout => return BlockOutcome::TimedOut,
        }
    }
}

/// Applies one inbound DATA block to a write session.
pub async fn receive_block(handler: &RequestHandler, session: Arc<Session>, block: u16, data: Vec<u8>) {
    let addr = session.addr();
    let tracker = handler.tracker();

    let mut state = session.lock().await;
    match classify_data(state.last_block, block, session.is_closed()) {
        DataDisposition::Duplicate => {
            log::debug!("{} resent block {} of '{}', acking again", addr, block, session.file());
            handler.send_packet(&Packet::Ack { block }, addr).await;
        }
        DataDisposition::Closed => {
            handler.send_error(addr, ErrorCode::UnknownTid, "unknown transfer ID".to_string(), false).await;
        }
        DataDisposition::OutOfSequence { expected } => {
            log::warn!(
                "{} sent block {} of '{}' but block {} is expected",
                addr,
                block,
                session.file(),
                expected
            );
            handler
                .send_error(addr, ErrorCode::Undefined, "missing data block in sequence".to_string(), false)
                .await;
        }
        DataDisposition::Next => {
            handler.send_packet(&Packet::Ack { block }, addr).await;

            if let Err(e) = tracker.storage().append(session.file(), &data).await {
                // The ack is already out, so the file can't be trusted anymore.
                if !tracker.remove_session(&session).await {
                    // Replaced or reaped meanwhile, whoever did that discarded the file.
                    log::debug!("Dropping block {} of '{}' from {}: {}", block, session.file(), addr, e);
                    return;
                }
                log::error!("Failed to store block {} of '{}' from {}: {}", block, session.file(), addr, e);
                if let Err(e) = tracker.storage().remove(session.file()).await {
                    log::warn!("Could not discard corrupt file '{}': {}", session.file(), e);
                }
                let code = match e.error_code() {
                    ErrorCode::Undefined => ErrorCode::DiskFull,
                    code => code,
                };
                handler.send_error(addr, code, format!("Failed to store block {block}: {e}"), false).await;
                return;
            }

            state.last_block = block;
            state.touch();
            log::debug!(
                "Stored block {} ({} bytes) of '{}' from {}",
                block,
                data.len(),
                session.file(),
                addr
            );

            if data.len() < DATA_BUFFER_SIZE {
                tracker.remove_session(&session).await;
                log::info!("Received '{}' from {} in {} blocks", session.file(), addr, block);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_of_short_file() {
        let blocks: Vec<_> = ReadBlocks::new(b"AB").collect();
        assert_eq!(
            blocks,
            vec![
                OutgoingBlock { number: 1, payload: b"AB" },
                OutgoingBlock { number: 2, payload: b"" },
            ]
        );
    }

    #[test]
    fn test_blocks_of_empty_file() {
        let blocks: Vec<_> = ReadBlocks::new(b"").collect();
        assert_eq!(blocks, vec![OutgoingBlock { number: 1, payload: b"" }]);
    }

    #[test]
    fn test_blocks_of_exact_multiple() {
        let content = vec![0x78; DATA_BUFFER_SIZE * 2];
        let blocks: Vec<_> = ReadBlocks::new(&content).collect();

        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].payload.len(), DATA_BUFFER_SIZE);
        assert_eq!(blocks[1].payload.len(), DATA_BUFFER_SIZE);
        // The terminal block is what tells the client the file ended.
        assert_eq!(blocks[2], OutgoingBlock { number: 3, payload: b"" });
    }

    #[test]
    fn test_blocks_concatenate_to_content() {
        let content: Vec<u8> = (0..1300u32).map(|i| (i % 251) as u8).collect();
        let blocks: Vec<_> = ReadBlocks::new(&content).collect();

        let numbers: Vec<u16> = blocks.iter().map(|b| b.number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
        assert!(blocks.iter().all(|b| b.payload.len() <= DATA_BUFFER_SIZE));
        assert_eq!(blocks.iter().flat_map(|b| b.payload.iter().copied()).collect::<Vec<u8>>(), content);
    }

    #[test]
    fn test_block_numbers_roll_over() {
        let content = vec![0u8; DATA_BUFFER_SIZE * 65536 + 1];
        let mut blocks = ReadBlocks::new(&content).skip(65534);
        assert_eq!(blocks.next().map(|b| b.number), Some(65535));
        assert_eq!(blocks.next().map(|b| b.number), Some(0));
        assert_eq!(blocks.next().map(|b| b.number), Some(1));
    }

    #[test]
    fn test_acknowledges() {
        assert!(acknowledges(4, 4));
        assert!(acknowledges(5, 4));
        assert!(!acknowledges(3, 4));
        assert!(!acknowledges(0, 4));
        // Rollover: 0 comes right after 65535.
        assert!(acknowledges(0, 65535));
        assert!(!acknowledges(65535, 0));
    }

    #[test]
    fn test_classify_data() {
        assert_eq!(classify_data(0, 1, false), DataDisposition::Next);
        assert_eq!(classify_data(0, 0, false), DataDisposition::Duplicate);
        assert_eq!(classify_data(3, 3, false), DataDisposition::Duplicate);
        assert_eq!(classify_data(3, 5, false), DataDisposition::OutOfSequence { expected: 4 });
        assert_eq!(classify_data(3, 2, false), DataDisposition::OutOfSequence { expected: 4 });
        assert_eq!(classify_data(65535, 0, false), DataDisposition::Next);
    }

    #[test]
    fn test_classify_data_after_close() {
        // A resent final block is still acked, anything else belongs to no transfer.
        assert_eq!(classify_data(7, 7, true), DataDisposition::Duplicate);
        assert_eq!(classify_data(7, 8, true), DataDisposition::Closed);
    }
}
