//! Client side: many concurrent calls multiplexed over one connection.
//!
//! A [`Session`] owns two background threads:
//! - the supervisor runs the reader loop, resolving RESPONSE/ERROR envelopes
//!   through the correlation table; when the connection drops it fails every
//!   call issued on it with `ConnectionLost` and, if the reconnect policy
//!   allows, re-establishes the connection with bounded exponential backoff.
//! - the reaper expires calls whose deadline passed, whether or not the
//!   connection is healthy.
//!
//! Calls issued while reconnecting wait in a bounded queue and are sent once
//! the new connection is up; beyond the bound they fail with `Overloaded`.

use std::collections::{HashSet, VecDeque};
use std::io::ErrorKind;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use courier_frame::{
    is_reserved, Envelope, EnvelopeKind, FrameError, FrameReader, LIST_OPERATIONS,
};
use courier_transport::{IpcStream, UnixDomainSocket};
use tracing::{debug, info, trace, warn};

use crate::config::SessionConfig;
use crate::connection::{Connection, ConnectionState};
use crate::correlation::{deadline_after, CompletionSlot, CorrelationTable};
use crate::error::{CourierError, RemoteError, Result};
use crate::handshake::{framed_handshake, handshake_client_with_config};
use crate::registry::OperationInfo;
use crate::typed::{decode_body, encode_body, Operation};

const MIN_SCAN_INTERVAL: Duration = Duration::from_millis(1);

struct QueuedCall {
    call_id: u64,
    envelope: Envelope,
}

enum Link {
    Up(Arc<Connection>),
    Connecting(VecDeque<QueuedCall>),
    Closed,
}

enum Route {
    Send(Arc<Connection>, Envelope),
    Queued,
    Rejected(CourierError),
}

struct Established {
    reader: FrameReader<IpcStream>,
    conn: Arc<Connection>,
    peer_version: String,
}

struct SessionShared {
    path: PathBuf,
    config: SessionConfig,
    table: CorrelationTable,
    link: Mutex<Link>,
    closing: Mutex<bool>,
    closing_signal: Condvar,
    peer_version: Mutex<String>,
    known_operations: RwLock<Option<HashSet<u32>>>,
}

impl SessionShared {
    fn link(&self) -> MutexGuard<'_, Link> {
        lock(&self.link)
    }

    fn is_closing(&self) -> bool {
        *lock(&self.closing)
    }

    /// Sleep for `delay` unless the session starts closing. Returns `true` if
    /// it did.
    fn sleep_unless_closing(&self, delay: Duration) -> bool {
        let closing = lock(&self.closing);
        let (closing, _) = self
            .closing_signal
            .wait_timeout_while(closing, delay, |closing| !*closing)
            .unwrap_or_else(PoisonError::into_inner);
        *closing
    }

    fn current_connection(&self) -> Option<Arc<Connection>> {
        match &*self.link() {
            Link::Up(conn) => Some(Arc::clone(conn)),
            _ => None,
        }
    }

    /// Queue a request for the writer; any failure resolves the call instead
    /// of returning.
    fn transmit(&self, conn: &Connection, envelope: Envelope) {
        let call_id = envelope.call_id;
        let err = match conn.send(envelope) {
            Ok(()) => return,
            Err(err @ (CourierError::Frame(FrameError::FrameTooLarge { .. })
            | CourierError::Overloaded(_))) => err,
            Err(err) => {
                debug!(connection_id = conn.id(), call_id, error = %err, "connection writer is gone");
                CourierError::ConnectionLost
            }
        };
        conn.untrack(call_id);
        self.table.resolve(call_id, Err(err));
    }
}

/// Handle to a call issued with [`Session::start_call`].
#[derive(Debug)]
pub struct PendingReply {
    slot: CompletionSlot,
}

impl PendingReply {
    pub fn call_id(&self) -> u64 {
        self.slot.call_id()
    }

    /// Block until the call resolves.
    pub fn wait(self) -> Result<Bytes> {
        self.slot.wait()
    }

    /// The outcome, if the call already resolved.
    pub fn try_take(&self) -> Option<Result<Bytes>> {
        self.slot.try_take()
    }
}

/// A client connection to one daemon endpoint.
///
/// `Session` is `Sync`; share it behind an `Arc` to issue calls from many
/// threads. Dropping it closes it.
pub struct Session {
    shared: Arc<SessionShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stop_reaper: Mutex<Option<mpsc::Sender<()>>>,
}

impl Session {
    /// Connect to the daemon at `path` with default configuration.
    pub fn connect(path: impl AsRef<Path>) -> Result<Self> {
        Self::connect_with_config(path, SessionConfig::default())
    }

    /// Connect with explicit configuration.
    ///
    /// Makes a single connection attempt; the reconnect policy only applies
    /// to a connection lost after it was established.
    pub fn connect_with_config(path: impl AsRef<Path>, config: SessionConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let Established {
            reader,
            conn,
            peer_version,
        } = establish(&path, &config)?;
        info!(
            path = ?path,
            connection_id = conn.id(),
            peer_version = %peer_version,
            "session connected"
        );

        let shared = Arc::new(SessionShared {
            path,
            config,
            table: CorrelationTable::new(),
            link: Mutex::new(Link::Up(Arc::clone(&conn))),
            closing: Mutex::new(false),
            closing_signal: Condvar::new(),
            peer_version: Mutex::new(peer_version),
            known_operations: RwLock::new(None),
        });

        let (stop_tx, stop_rx) = mpsc::channel();
        let session = Session {
            shared: Arc::clone(&shared),
            threads: Mutex::new(Vec::with_capacity(2)),
            stop_reaper: Mutex::new(Some(stop_tx)),
        };

        let supervisor = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("courier-session".to_string())
                .spawn(move || supervise(shared, reader, conn))?
        };
        lock(&session.threads).push(supervisor);

        let reaper = thread::Builder::new()
            .name("courier-reaper".to_string())
            .spawn(move || reap(shared, stop_rx))?;
        lock(&session.threads).push(reaper);

        if session.shared.config.validate_operations {
            let known = session
                .operations()?
                .into_iter()
                .map(|op| op.id)
                .collect::<HashSet<_>>();
            debug!(operations = known.len(), "fetched daemon operations");
            *session
                .shared
                .known_operations
                .write()
                .unwrap_or_else(PoisonError::into_inner) = Some(known);
        }

        Ok(session)
    }

    /// Issue a call and block until it resolves, times out, or the
    /// connection is lost.
    pub fn call(
        &self,
        operation_id: u32,
        body: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Bytes> {
        self.start_call(operation_id, body, timeout)?.wait()
    }

    /// Issue a call without waiting for it.
    pub fn start_call(
        &self,
        operation_id: u32,
        body: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<PendingReply> {
        self.check_operation(operation_id)?;

        let shared = &self.shared;
        let call_id = shared.table.next_call_id();
        let slot = shared.table.register(call_id, deadline_after(timeout))?;
        let envelope = Envelope::request(call_id, operation_id, body);

        let route = {
            let mut link = shared.link();
            match &mut *link {
                Link::Up(conn) => {
                    conn.track(call_id);
                    Route::Send(Arc::clone(conn), envelope)
                }
                Link::Connecting(queue) if queue.len() >= shared.config.max_queued_calls => {
                    Route::Rejected(CourierError::Overloaded(shared.config.max_queued_calls))
                }
                Link::Connecting(queue) => {
                    queue.push_back(QueuedCall { call_id, envelope });
                    Route::Queued
                }
                Link::Closed => Route::Rejected(CourierError::SessionClosed),
            }
        };

        match route {
            Route::Send(conn, envelope) => {
                trace!(call_id, operation_id, connection_id = conn.id(), "sending call");
                shared.transmit(&conn, envelope);
            }
            Route::Queued => trace!(call_id, operation_id, "queued call while connecting"),
            Route::Rejected(err) => {
                shared.table.forget(call_id);
                debug!(call_id, operation_id, error = %err, "call rejected");
                return Err(err);
            }
        }

        Ok(PendingReply { slot })
    }

    /// Call a typed operation with the default timeout.
    pub fn invoke<O: Operation>(&self, request: &O::Request) -> Result<O::Response> {
        self.invoke_with_timeout::<O>(request, self.shared.config.default_timeout)
    }

    pub fn invoke_with_timeout<O: Operation>(
        &self,
        request: &O::Request,
        timeout: Duration,
    ) -> Result<O::Response> {
        let reply = self.call(O::ID, encode_body(request)?, timeout)?;
        decode_body(&reply)
    }

    /// Stop waiting for `call_id`. A response arriving later is discarded.
    ///
    /// Returns `false` if the call had already resolved.
    pub fn cancel(&self, call_id: u64) -> bool {
        let cancelled = self.shared.table.cancel(call_id);
        if cancelled {
            if let Some(conn) = self.shared.current_connection() {
                conn.untrack(call_id);
            }
        }
        cancelled
    }

    /// Operations registered on the daemon.
    pub fn operations(&self) -> Result<Vec<OperationInfo>> {
        let body = self.call(
            LIST_OPERATIONS,
            Bytes::new(),
            self.shared.config.default_timeout,
        )?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Close the connection and fail outstanding calls with `SessionClosed`.
    pub fn close(&self) {
        {
            let mut closing = lock(&self.shared.closing);
            if *closing {
                return;
            }
            *closing = true;
            self.shared.closing_signal.notify_all();
        }
        drop(lock(&self.stop_reaper).take());

        let previous = mem::replace(&mut *self.shared.link(), Link::Closed);
        if let Link::Up(conn) = previous {
            conn.close();
        }
        let failed = self.shared.table.fail_all(|| CourierError::SessionClosed);

        let threads: Vec<JoinHandle<()>> = lock(&self.threads).drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                warn!("session thread panicked");
            }
        }
        info!(path = ?self.shared.path, failed, "session closed");
    }

    pub fn state(&self) -> ConnectionState {
        match &*self.shared.link() {
            Link::Up(conn) => conn.state(),
            Link::Connecting(_) => ConnectionState::Connecting,
            Link::Closed => ConnectionState::Closed,
        }
    }

    /// Daemon-assigned id of the current connection.
    pub fn connection_id(&self) -> Option<u64> {
        self.shared.current_connection().map(|conn| conn.id())
    }

    /// Protocol version announced by the daemon.
    pub fn protocol_version(&self) -> String {
        lock(&self.shared.peer_version).clone()
    }

    /// Calls registered and not yet resolved.
    pub fn pending_calls(&self) -> usize {
        self.shared.table.len()
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    fn check_operation(&self, operation_id: u32) -> Result<()> {
        if is_reserved(operation_id) {
            return Ok(());
        }
        let known = self
            .shared
            .known_operations
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        match &*known {
            Some(ops) if !ops.contains(&operation_id) => Err(CourierError::Remote(
                RemoteError::unknown_operation(operation_id),
            )),
            _ => Ok(()),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn establish(path: &Path, config: &SessionConfig) -> Result<Established> {
    let stream = UnixDomainSocket::connect(path)?;
    let control = stream.try_clone()?;
    let (reader, writer, handshake) =
        framed_handshake(stream, &config.handshake, &config.frame, |reader, writer| {
            handshake_client_with_config(reader, writer, &config.handshake)
        })?;

    let conn = Arc::new(Connection::new(
        handshake.connection_id,
        writer,
        control,
        config.outbound_queue_depth,
    )?);
    conn.transition(ConnectionState::Established);

    Ok(Established {
        reader,
        conn,
        peer_version: handshake.peer_version,
    })
}

fn supervise(shared: Arc<SessionShared>, mut reader: FrameReader<IpcStream>, mut conn: Arc<Connection>) {
    loop {
        let cause = read_responses(&shared, &mut reader, &conn);
        conn.close();
        if shared.is_closing() {
            debug!(connection_id = conn.id(), "reader stopped; session closing");
            return;
        }
        warn!(connection_id = conn.id(), error = %cause, "connection lost");

        let reconnecting = shared.config.reconnect.is_enabled();
        {
            let mut link = shared.link();
            if matches!(*link, Link::Closed) {
                return;
            }
            *link = if reconnecting {
                Link::Connecting(VecDeque::new())
            } else {
                Link::Closed
            };
        }

        let lost = shared
            .table
            .fail_calls(conn.take_calls(), || CourierError::ConnectionLost);
        if lost > 0 {
            debug!(connection_id = conn.id(), lost, "failed calls on lost connection");
        }

        if !reconnecting {
            info!(path = ?shared.path, "session closed after connection loss");
            return;
        }

        match reconnect(&shared) {
            Some(established) => {
                reader = established.reader;
                conn = established.conn;
            }
            None => {
                let closing = shared.is_closing();
                let previous = mem::replace(&mut *shared.link(), Link::Closed);
                if let Link::Connecting(queue) = previous {
                    let failed = shared.table.fail_calls(
                        queue.into_iter().map(|queued| queued.call_id),
                        || {
                            if closing {
                                CourierError::SessionClosed
                            } else {
                                CourierError::ConnectionLost
                            }
                        },
                    );
                    debug!(failed, "failed queued calls");
                }
                return;
            }
        }
    }
}

/// Feed responses to the correlation table until the connection fails.
fn read_responses(
    shared: &SessionShared,
    reader: &mut FrameReader<IpcStream>,
    conn: &Connection,
) -> CourierError {
    loop {
        let envelope = match reader.read_envelope() {
            Ok(envelope) => envelope,
            Err(FrameError::Io(err))
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(err) => return err.into(),
        };

        let call_id = envelope.call_id;
        let outcome = match envelope.kind {
            EnvelopeKind::Response => Ok(envelope.body),
            EnvelopeKind::Error => Err(CourierError::Remote(RemoteError::from_body(
                &envelope.body,
            ))),
            EnvelopeKind::Request { operation_id } => {
                return CourierError::Frame(FrameError::MalformedFrame(format!(
                    "daemon sent a request (call {call_id}, operation {operation_id})"
                )));
            }
        };

        conn.untrack(call_id);
        shared.table.resolve(call_id, outcome);
    }
}

fn reconnect(shared: &SessionShared) -> Option<Established> {
    let policy = &shared.config.reconnect;
    for attempt in 1..=policy.max_retries {
        let delay = policy.backoff(attempt);
        if shared.sleep_unless_closing(delay) {
            return None;
        }

        match establish(&shared.path, &shared.config) {
            Ok(established) => {
                return if install(shared, &established) {
                    Some(established)
                } else {
                    established.conn.close();
                    None
                };
            }
            Err(err @ CourierError::IncompatibleProtocol { .. }) => {
                warn!(path = ?shared.path, error = %err, "daemon is incompatible; not reconnecting");
                return None;
            }
            Err(err) => {
                warn!(
                    path = ?shared.path,
                    attempt,
                    max_retries = policy.max_retries,
                    error = %err,
                    "reconnect attempt failed"
                );
            }
        }
    }
    warn!(path = ?shared.path, attempts = policy.max_retries, "giving up reconnecting");
    None
}

/// Make `established` the live connection and flush queued calls onto it.
fn install(shared: &SessionShared, established: &Established) -> bool {
    let conn = &established.conn;
    let ready: Vec<QueuedCall> = {
        let mut link = shared.link();
        if shared.is_closing() || matches!(*link, Link::Closed) {
            return false;
        }
        let queue = match mem::replace(&mut *link, Link::Up(Arc::clone(conn))) {
            Link::Connecting(queue) => queue,
            _ => VecDeque::new(),
        };
        // Calls that timed out or were cancelled while queued are skipped.
        let ready: Vec<QueuedCall> = queue
            .into_iter()
            .filter(|queued| shared.table.contains(queued.call_id))
            .collect();
        for queued in &ready {
            conn.track(queued.call_id);
        }
        ready
    };

    *lock(&shared.peer_version) = established.peer_version.clone();
    info!(
        path = ?shared.path,
        connection_id = conn.id(),
        flushed = ready.len(),
        "reconnected"
    );
    for queued in ready {
        shared.transmit(conn, queued.envelope);
    }
    true
}

fn reap(shared: Arc<SessionShared>, stop: mpsc::Receiver<()>) {
    let interval = shared.config.expiry_scan_interval.max(MIN_SCAN_INTERVAL);
    loop {
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }

        let expired = shared.table.expire_due(Instant::now());
        if !expired.is_empty() {
            if let Some(conn) = shared.current_connection() {
                conn.untrack_all(&expired);
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
