// Session bookkeeping shared by every handler task.
//
// The tracker owns two address-keyed session maps, one per transfer direction, behind a single
// coarse lock. That lock only covers admission and removal (the check-then-insert of a new
// session), never a block transfer, so unrelated transfers do not contend on it. Each session
// carries its own lock which serializes the state transitions of that one transfer.
//
// A third map remembers the addresses we sent an error to and expect an ack back from, so the
// ack handler can tell "acking our error" apart from "acking a data block".

use crate::storage::{Storage, StorageError};
use crate::tftp::{ErrorCode, FileMode};
use std::collections::HashMap;
use std::error;
use std::fmt;
use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction { Read, Write }

/// What a client asked for in its RRQ or WRQ.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    pub file: String,
    pub mode: FileMode,
}

/// Contents of a session's signaling slot. Only the latest value is kept.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Signal {
    Idle,
    Ack(u16),
    /// The session was closed from outside the task driving it.
    Cancel,
}

/// Mutable state of one transfer, guarded by the session lock.
#[derive(Debug)]
pub struct TransferState {
    /// Last block fully processed: acked for a read, written for a write.
    pub last_block: u16,
    pub block_acknowledged: bool,
    pub timed_out: bool,
    pub last_activity: Instant,
}

impl TransferState {
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// Server-side state for one in-progress read or write of one client address.
#[derive(Debug)]
pub struct Session {
    addr: SocketAddr,
    request: TransferRequest,
    direction: Direction,
    state: Mutex<TransferState>,
    closed: AtomicBool,
    signal: watch::Sender<Signal>,
}

impl Session {
    fn new(addr: SocketAddr, request: TransferRequest, direction: Direction) -> Session {
        let (signal, _) = watch::channel(Signal::Idle);
        Session {
            addr,
            request,
            direction,
            state: Mutex::new(TransferState {
                last_block: 0,
                block_acknowledged: false,
                timed_out: false,
                last_activity: Instant::now(),
            }),
            closed: AtomicBool::new(false),
            signal,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn file(&self) -> &str {
        &self.request.file
    }

    pub fn mode(&self) -> FileMode {
        self.request.mode
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    fn lock_name(&self) -> &'static str {
        match self.direction {
            Direction::Read => "read session",
            Direction::Write => "write session",
        }
    }

    /// Takes the per-session lock. The release is logged when the guard drops.
    pub async fn lock(&self) -> TrackedGuard<'_, TransferState> {
        log::trace!("Waiting for {} lock of {}", self.lock_name(), self.addr);
        let guard = self.state.lock().await;
        TrackedGuard::acquired(self.lock_name(), Some(self.addr), guard)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Marks the session finished and wakes the task driving it, if it is waiting.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            log::debug!("Closing {} of {} for '{}'", self.lock_name(), self.addr, self.request.file);
            self.signal.send_replace(Signal::Cancel);
        }
    }

    /// Drops an ack into the signaling slot, overwriting any ack not yet consumed. A pending
    /// `Cancel` is never overwritten.
    pub fn signal_ack(&self, block: u16) {
        self.signal.send_if_modified(|slot| match *slot {
            Signal::Cancel => false,
            _ => {
                *slot = Signal::Ack(block);
                true
            }
        });
    }

    /// Subscribes to the signaling slot. Values sent before this call are not observed.
    pub fn subscribe(&self) -> watch::Receiver<Signal> {
        self.signal.subscribe()
    }

    fn is_idle(&self, now: Instant, max_idle: Duration) -> bool {
        // A held lock means a handler is working on the session right now.
        match self.state.try_lock() {
            Ok(state) => now.saturating_duration_since(state.last_activity) > max_idle,
            Err(_) => false,
        }
    }

    /// Whether a write session has taken in any data block. A busy session counts as started.
    fn has_started(&self) -> bool {
        match self.state.try_lock() {
            Ok(state) => state.last_block != 0,
            Err(_) => true,
        }
    }
}

/// A mutex guard that logs when it is released, whichever path drops it.
#[derive(Debug)]
pub struct TrackedGuard<'a, T> {
    name: &'static str,
    peer: Option<SocketAddr>,
    guard: MutexGuard<'a, T>,
}

impl<'a, T> TrackedGuard<'a, T> {
    fn acquired(name: &'static str, peer: Option<SocketAddr>, guard: MutexGuard<'a, T>) -> Self {
        log::trace!("Acquired {} lock {:?}", name, peer);
        TrackedGuard { name, peer, guard }
    }
}

impl<T> Deref for TrackedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for TrackedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for TrackedGuard<'_, T> {
    fn drop(&mut self) {
        log::trace!("Released {} lock {:?}", self.name, self.peer);
    }
}

#[derive(Debug)]
pub enum TrackerError {
    WriteInProgress,
    FileNotFound(String),
    FileAlreadyExists(String),
    Storage(StorageError),
}

impl TrackerError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            TrackerError::WriteInProgress => ErrorCode::Undefined,
            TrackerError::FileNotFound(_) => ErrorCode::FileNotFound,
            TrackerError::FileAlreadyExists(_) => ErrorCode::FileAlreadyExists,
            TrackerError::Storage(e) => e.error_code(),
        }
    }
}

impl error::Error for TrackerError {}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TrackerError::WriteInProgress => write!(f, "File write is in progress."),
            TrackerError::FileNotFound(_) => write!(f, "File not found."),
            TrackerError::FileAlreadyExists(_) => write!(f, "File already exists."),
            TrackerError::Storage(e) => write!(f, "{}", e),
        }
    }
}

impl From<StorageError> for TrackerError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::AlreadyExists(name) => TrackerError::FileAlreadyExists(name),
            StorageError::NotFound(name) => TrackerError::FileNotFound(name),
            e => TrackerError::Storage(e),
        }
    }
}

/// How a write request was admitted.
#[derive(Debug)]
pub enum Admission {
    /// A fresh session with a newly created, empty file.
    New(Arc<Session>),
    /// The peer asked again for the write it already has and that has not started yet.
    Repeated(Arc<Session>),
}

impl Admission {
    pub fn into_session(self) -> Arc<Session> {
        match self {
            Admission::New(session) | Admission::Repeated(session) => session,
        }
    }
}

/// What one sweep of `reap_stale` cleaned up.
#[derive(Debug, Default, PartialEq)]
pub struct ReapReport {
    pub reads: usize,
    pub writes: usize,
    pub errors_pending: usize,
}

#[derive(Debug, Default)]
struct SessionMaps {
    reads: HashMap<SocketAddr, Arc<Session>>,
    writes: HashMap<SocketAddr, Arc<Session>>,
}

impl SessionMaps {
    fn of(&mut self, direction: Direction) -> &mut HashMap<SocketAddr, Arc<Session>> {
        match direction {
            Direction::Read => &mut self.reads,
            Direction::Write => &mut self.writes,
        }
    }
}

pub struct SessionTracker {
    storage: Arc<dyn Storage>,
    sessions: Mutex<SessionMaps>,
    errors_pending: std::sync::Mutex<HashMap<SocketAddr, Instant>>,
}

impl SessionTracker {
    pub fn new(storage: Arc<dyn Storage>) -> SessionTracker {
        SessionTracker {
            storage,
            sessions: Mutex::new(SessionMaps::default()),
            errors_pending: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    async fn lock_sessions(&self) -> TrackedGuard<'_, SessionMaps> {
        TrackedGuard::acquired("session maps", None, self.sessions.lock().await)
    }

    /// Admits a read of `request.file` by `addr`. Reads are refused while the same peer has a
    /// write in progress. A previous read session of the peer is replaced and cancelled.
    pub async fn begin_read(
        &self,
        addr: SocketAddr,
        request: TransferRequest,
    ) -> Result<Arc<Session>, TrackerError> {
        let mut maps = self.lock_sessions().await;

        if maps.writes.contains_key(&addr) {
            return Err(TrackerError::WriteInProgress);
        }
        if !self.storage.exists(&request.file).await? {
            return Err(TrackerError::FileNotFound(request.file));
        }

        let session = Arc::new(Session::new(addr, request, Direction::Read));
        if let Some(previous) = maps.reads.insert(addr, session.clone()) {
            log::warn!("New read request from {} replaces its read of '{}'", addr, previous.file());
            previous.close();
        }
        drop(maps);

        self.clear_error_pending(addr);
        log::info!("Admitted read of '{}' by {}", session.file(), addr);
        Ok(session)
    }

    /// Admits a write of a new file. The file is created empty while the admission lock is
    /// still held, so two concurrent requests for one name cannot both succeed.
    ///
    /// A request for the file the peer is already writing, before any block arrived, is a resend
    /// whose Ack(0) got lost and yields `Admission::Repeated`. Any other write the peer had is
    /// replaced, and its partial file discarded.
    pub async fn begin_write(
        &self,
        addr: SocketAddr,
        request: TransferRequest,
    ) -> Result<Admission, TrackerError> {
        let mut maps = self.lock_sessions().await;

        if let Some(current) = maps.writes.get(&addr) {
            if current.file() == request.file && !current.has_started() {
                log::debug!("Repeated write request from {} for '{}'", addr, request.file);
                return Ok(Admission::Repeated(current.clone()));
            }
        }

        if self.storage.exists(&request.file).await? {
            return Err(TrackerError::FileAlreadyExists(request.file));
        }
        self.storage.create(&request.file).await?;

        let session = Arc::new(Session::new(addr, request, Direction::Write));
        if let Some(previous) = maps.writes.insert(addr, session.clone()) {
            log::warn!("New write request from {} replaces its write of '{}'", addr, previous.file());
            previous.close();
            if let Err(e) = self.storage.remove(previous.file()).await {
                log::warn!("Could not discard partial file '{}': {}", previous.file(), e);
            }
        }
        drop(maps);

        self.clear_error_pending(addr);
        log::info!("Admitted write of '{}' by {}", session.file(), addr);
        Ok(Admission::New(session))
    }

    pub async fn lookup(&self, addr: SocketAddr, direction: Direction) -> Option<Arc<Session>> {
        self.lock_sessions().await.of(direction).get(&addr).cloned()
    }

    /// Removes and closes whatever session `addr` has in `direction`. Handlers still holding the
    /// session keep a valid value; they only see it closed.
    pub async fn remove(&self, addr: SocketAddr, direction: Direction) -> Option<Arc<Session>> {
        let removed = self.lock_sessions().await.of(direction).remove(&addr);
        if let Some(session) = &removed {
            session.close();
        }
        removed
    }

    /// Removes `session`, but only if it is still the one registered for its address. Returns
    /// whether it was.
    pub async fn remove_session(&self, session: &Arc<Session>) -> bool {
        session.close();

        let mut maps = self.lock_sessions().await;
        let map = maps.of(session.direction());
        let registered = map
            .get(&session.addr())
            .is_some_and(|current| Arc::ptr_eq(current, session));
        if registered {
            map.remove(&session.addr());
        }
        registered
    }

    pub fn mark_error_pending(&self, addr: SocketAddr) {
        self.errors_pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr, Instant::now());
    }

    /// Forgets the pending error of `addr`, returning whether there was one.
    pub fn clear_error_pending(&self, addr: SocketAddr) -> bool {
        self.errors_pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&addr)
            .is_some()
    }

    /// Drops sessions and pending errors that saw no activity for longer than `max_idle`.
    /// A reaped write also loses its partially written file.
    pub async fn reap_stale(&self, max_idle: Duration) -> ReapReport {
        let now = Instant::now();
        let mut report = ReapReport::default();

        let mut maps = self.lock_sessions().await;
        for direction in [Direction::Read, Direction::Write] {
            let map = maps.of(direction);
            let stale: Vec<SocketAddr> = map
                .iter()
                .filter(|(_, session)| session.is_idle(now, max_idle))
                .map(|(addr, _)| *addr)
                .collect();

            for addr in stale {
                let Some(session) = map.remove(&addr) else { continue };
                session.close();
                log::warn!("Reaping idle {:?} session of {} for '{}'", direction, addr, session.file());

                match direction {
                    Direction::Read => report.reads += 1,
                    Direction::Write => {
                        report.writes += 1;
                        if let Err(e) = self.storage.remove(session.file()).await {
                            log::warn!("Could not discard partial file '{}': {}", session.file(), e);
                        }
                    }
                }
            }
        }
        drop(maps);

        let mut pending = self.errors_pending.lock().unwrap_or_else(PoisonError::into_inner);
        let before = pending.len();
        pending.retain(|_, marked| now.saturating_duration_since(*marked) <= max_idle);
        report.errors_pending = before - pending.len();

        report
    }
}
