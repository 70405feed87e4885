//! Daemon side: accept connections and dispatch requests to handlers.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use courier_frame::{Envelope, EnvelopeKind, FrameError, FrameReader};
use courier_transport::{IpcStream, UnixDomainSocket};
use tracing::{debug, info, trace, warn};

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionState};
use crate::error::{CourierError, ErrorCode, HandlerError, RemoteError, Result};
use crate::handshake::{framed_handshake, handshake_server_with_config};
use crate::pool::{Job, JobSender, WorkerPool};
use crate::registry::{CallContext, DispatchRegistry, Handler, OperationInfo};
use crate::typed::Operation;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);
/// Time idle workers get to observe the closed job queue once the drain
/// deadline has passed.
const WORKER_EXIT_GRACE: Duration = Duration::from_millis(100);

struct ServerShared {
    path: PathBuf,
    drain_timeout: Duration,
    shutting_down: AtomicBool,
    drain_deadline: Mutex<Option<Instant>>,
    next_connection_id: AtomicU64,
    connections: Mutex<HashMap<u64, Arc<Connection>>>,
}

impl ServerShared {
    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Deadline for draining: the shutdown's if one started, otherwise a
    /// fresh one for a single connection.
    fn drain_deadline(&self) -> Instant {
        let deadline = *lock(&self.drain_deadline);
        deadline.unwrap_or_else(|| Instant::now() + self.drain_timeout)
    }

    /// Returns `false` if the daemon is already shutting down.
    fn register(&self, conn: &Arc<Connection>) -> bool {
        let mut connections = lock(&self.connections);
        if self.is_shutting_down() {
            return false;
        }
        connections.insert(conn.id(), Arc::clone(conn));
        true
    }

    fn unregister(&self, connection_id: u64) {
        lock(&self.connections).remove(&connection_id);
    }
}

/// A daemon bound to a local endpoint.
///
/// Register handlers, then call [`Server::serve`]. Use a [`ServerHandle`]
/// obtained beforehand to stop it from another thread.
pub struct Server {
    socket: UnixDomainSocket,
    config: ServerConfig,
    registry: DispatchRegistry,
    shared: Arc<ServerShared>,
}

impl Server {
    /// Bind `path` with default configuration.
    pub fn listen(path: impl AsRef<Path>) -> Result<Self> {
        Self::listen_with_config(path, ServerConfig::default())
    }

    /// Bind `path`. Fails with [`CourierError::AddressInUse`] if another
    /// daemon is live on it; a stale socket file is replaced.
    pub fn listen_with_config(path: impl AsRef<Path>, config: ServerConfig) -> Result<Self> {
        let socket = UnixDomainSocket::bind_with_mode(path, config.socket_mode)?;
        let shared = Arc::new(ServerShared {
            path: socket.path().to_path_buf(),
            drain_timeout: config.drain_timeout,
            shutting_down: AtomicBool::new(false),
            drain_deadline: Mutex::new(None),
            next_connection_id: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
        });
        Ok(Self {
            socket,
            registry: DispatchRegistry::with_policy(config.duplicate_policy),
            config,
            shared,
        })
    }

    pub fn register<H: Handler>(&mut self, operation_id: u32, handler: H) -> Result<()> {
        self.registry.register(operation_id, handler)
    }

    pub fn register_named<H: Handler>(
        &mut self,
        operation_id: u32,
        name: impl Into<String>,
        handler: H,
    ) -> Result<()> {
        self.registry.register_named(operation_id, name, handler)
    }

    /// Register a typed operation. See [`DispatchRegistry::register_operation`].
    pub fn register_operation<O, F>(&mut self, handler: F) -> Result<()>
    where
        O: Operation,
        F: Fn(&CallContext, O::Request) -> std::result::Result<O::Response, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.registry.register_operation::<O, F>(handler)
    }

    pub fn operations(&self) -> Vec<OperationInfo> {
        self.registry.operations()
    }

    pub fn path(&self) -> &Path {
        self.socket.path()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Accept and serve connections until [`ServerHandle::shutdown`].
    ///
    /// Returns once every connection has drained and the socket file is
    /// removed.
    pub fn serve(self) -> Result<()> {
        let Server {
            socket,
            config,
            registry,
            shared,
        } = self;
        let config = Arc::new(config);
        let registry = Arc::new(registry);
        let pool = WorkerPool::new(config.worker_threads, config.job_queue_depth)?;
        let jobs = pool.sender();

        info!(
            path = ?shared.path,
            operations = registry.len(),
            workers = config.worker_threads,
            "daemon serving"
        );

        let mut connection_threads: Vec<JoinHandle<()>> = Vec::new();
        loop {
            let stream = match socket.accept() {
                Ok(stream) => stream,
                Err(err) => {
                    if shared.is_shutting_down() {
                        break;
                    }
                    warn!(path = ?shared.path, error = %err, "accept failed");
                    thread::sleep(ACCEPT_ERROR_BACKOFF);
                    continue;
                }
            };
            if shared.is_shutting_down() {
                break;
            }

            let connection_id = shared.next_connection_id.fetch_add(1, Ordering::Relaxed);
            let worker = ConnectionWorker {
                shared: Arc::clone(&shared),
                registry: Arc::clone(&registry),
                config: Arc::clone(&config),
                jobs: jobs.clone(),
            };
            match thread::Builder::new()
                .name(format!("courier-conn-{connection_id}"))
                .spawn(move || worker.run(stream, connection_id))
            {
                Ok(handle) => connection_threads.push(handle),
                Err(err) => warn!(connection_id, error = %err, "failed to spawn connection thread"),
            }
            connection_threads.retain(|handle| !handle.is_finished());
        }

        let deadline = shared.drain_deadline();
        drop(jobs);
        for handle in connection_threads {
            if handle.join().is_err() {
                warn!("connection thread panicked");
            }
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        let drained = pool.shutdown(remaining.max(WORKER_EXIT_GRACE));
        drop(socket);
        info!(path = ?shared.path, drained, "daemon stopped");
        Ok(())
    }
}

/// Cloneable control handle for a running [`Server`].
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<ServerShared>,
}

impl ServerHandle {
    /// Stop accepting connections and drain the open ones.
    ///
    /// Each connection stops reading, finishes its in-flight calls, writes
    /// their replies and closes. The whole drain shares one `drain_timeout`
    /// deadline. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut deadline = lock(&self.shared.drain_deadline);
            if self.shared.shutting_down.swap(true, Ordering::SeqCst) {
                return;
            }
            *deadline = Some(Instant::now() + self.shared.drain_timeout);
        }
        info!(path = ?self.shared.path, "daemon shutting down");

        // Wake the accept loop.
        if let Err(err) = UnixDomainSocket::connect(&self.shared.path) {
            debug!(path = ?self.shared.path, error = %err, "wake-up connect failed");
        }

        let connections: Vec<Arc<Connection>> =
            lock(&self.shared.connections).values().cloned().collect();
        for conn in connections {
            conn.transition(ConnectionState::Draining);
            conn.shutdown_read();
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.is_shutting_down()
    }

    /// Connections past the handshake and not yet closed.
    pub fn active_connections(&self) -> usize {
        lock(&self.shared.connections).len()
    }
}

/// In-flight handler count for one connection.
#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        *lock(&self.count) += 1;
        InFlightGuard(Arc::clone(self))
    }

    /// Wait until no handler is running. Returns the count left at timeout.
    fn wait_idle(&self, timeout: Duration) -> usize {
        let count = lock(&self.count);
        let (count, _) = self
            .idle
            .wait_timeout_while(count, timeout, |count| *count > 0)
            .unwrap_or_else(PoisonError::into_inner);
        *count
    }
}

struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut count = lock(&self.0.count);
        *count = count.saturating_sub(1);
        self.0.idle.notify_all();
    }
}

struct ConnectionWorker {
    shared: Arc<ServerShared>,
    registry: Arc<DispatchRegistry>,
    config: Arc<ServerConfig>,
    jobs: JobSender,
}

impl ConnectionWorker {
    fn run(self, stream: IpcStream, connection_id: u64) {
        if let Some((uid, gid, pid)) = stream.peer_credentials() {
            debug!(connection_id, pid, uid, gid, "peer credentials");
        }

        let (mut reader, conn) = match self.accept(stream, connection_id) {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(connection_id, error = %err, "handshake failed");
                return;
            }
        };
        if !self.shared.register(&conn) {
            debug!(connection_id, "daemon shutting down; dropping new connection");
            conn.close();
            return;
        }
        info!(connection_id, "connection established");

        let in_flight = Arc::new(InFlight::default());
        let reason = self.read_requests(&mut reader, &conn, &in_flight);
        debug!(connection_id, reason = %reason, "connection reader stopped");

        conn.transition(ConnectionState::Draining);
        let deadline = self.shared.drain_deadline();
        let abandoned = in_flight.wait_idle(deadline.saturating_duration_since(Instant::now()));
        if abandoned > 0 {
            warn!(connection_id, abandoned, "drain timed out; discarding in-flight calls");
        } else if !conn.flush(deadline.saturating_duration_since(Instant::now())) {
            warn!(connection_id, "drain timed out; discarding queued replies");
        }
        conn.close();
        self.shared.unregister(connection_id);
        info!(connection_id, "connection closed");
    }

    fn accept(
        &self,
        stream: IpcStream,
        connection_id: u64,
    ) -> Result<(FrameReader<IpcStream>, Arc<Connection>)> {
        let control = stream.try_clone()?;
        let handshake = &self.config.handshake;
        let (reader, writer, result) =
            framed_handshake(stream, handshake, &self.config.frame, |reader, writer| {
                handshake_server_with_config(reader, writer, connection_id, handshake)
            })?;
        debug!(connection_id, peer_version = %result.peer_version, "handshake complete");

        let conn = Arc::new(Connection::new(
            connection_id,
            writer,
            control,
            self.config.outbound_queue_depth,
        )?);
        conn.transition(ConnectionState::Established);
        Ok((reader, conn))
    }

    /// Read requests and hand them to the pool until the connection fails or
    /// stops reading.
    fn read_requests(
        &self,
        reader: &mut FrameReader<IpcStream>,
        conn: &Arc<Connection>,
        in_flight: &Arc<InFlight>,
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
            let operation_id = match envelope.kind {
                EnvelopeKind::Request { operation_id } => operation_id,
                kind => {
                    return CourierError::Frame(FrameError::MalformedFrame(format!(
                        "client sent {kind:?} for call {call_id}"
                    )));
                }
            };

            if self.shared.is_shutting_down() || conn.state() == ConnectionState::Draining {
                trace!(connection_id = conn.id(), call_id, "refusing request while draining");
                send_reply(conn, Envelope::error(call_id, RemoteError::shutting_down().to_body()));
                continue;
            }

            let ctx = CallContext {
                connection_id: conn.id(),
                call_id,
                operation_id,
            };
            trace!(connection_id = ctx.connection_id, call_id, operation_id, "dispatching");

            let registry = Arc::clone(&self.registry);
            let reply_to = Arc::clone(conn);
            let guard = in_flight.enter();
            let job: Job = Box::new(move || {
                let _guard = guard;
                let reply = match registry.dispatch(&ctx, envelope.body) {
                    Ok(body) => Envelope::response(ctx.call_id, body),
                    Err(err) => Envelope::error(ctx.call_id, err.to_body()),
                };
                send_reply(&reply_to, reply);
            });

            if self.jobs.submit(job).is_err() {
                send_reply(conn, Envelope::error(call_id, RemoteError::shutting_down().to_body()));
            }
        }
    }
}

/// Queue a reply. Failures only affect this call and are logged; a client
/// whose reply queue is full is not reading and gets disconnected.
fn send_reply(conn: &Connection, reply: Envelope) {
    let call_id = reply.call_id;
    match conn.send(reply) {
        Ok(()) => {}
        Err(CourierError::Frame(FrameError::FrameTooLarge { size, max })) => {
            warn!(connection_id = conn.id(), call_id, size, max, "response exceeds frame limit");
            let err = RemoteError::new(
                ErrorCode::Application,
                format!("response of {size} bytes exceeds the {max} byte frame limit"),
            );
            if let Err(err) = conn.send(Envelope::error(call_id, err.to_body())) {
                debug!(connection_id = conn.id(), call_id, error = %err, "dropping reply");
            }
        }
        Err(err @ CourierError::Overloaded(_)) => {
            warn!(connection_id = conn.id(), call_id, error = %err, "client is not reading replies; closing connection");
            conn.close();
        }
        Err(err) => debug!(connection_id = conn.id(), call_id, error = %err, "dropping reply"),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use bytes::Bytes;
    use courier_frame::FrameWriter;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::config::{DuplicatePolicy, ReconnectPolicy, SessionConfig};
    use crate::handshake::{handshake_client, HandshakeConfig};
    use crate::registry::HandlerResult;
    use crate::session::Session;
    use crate::test_support::TempSocket;

    const ECHO: u32 = 1;
    const SLOW: u32 = 2;
    const PANICS: u32 = 3;

    #[derive(Debug, Serialize, Deserialize)]
    struct AddRequest {
        a: i64,
        b: i64,
    }

    struct Add;

    impl Operation for Add {
        const ID: u32 = 10;
        const NAME: &'static str = "add";
        type Request = AddRequest;
        type Response = i64;
    }

    fn client_config() -> SessionConfig {
        SessionConfig {
            reconnect: ReconnectPolicy::disabled(),
            ..SessionConfig::default()
        }
    }

    fn echo_server(sock: &TempSocket) -> Server {
        let mut server = Server::listen(sock.path()).unwrap();
        server
            .register_named(ECHO, "echo", |_: &CallContext, body: Bytes| -> HandlerResult {
                Ok(body)
            })
            .unwrap();
        server
    }

    fn start(server: Server) -> (ServerHandle, JoinHandle<Result<()>>) {
        let handle = server.handle();
        let join = thread::spawn(move || server.serve());
        (handle, join)
    }

    /// A handshaken client speaking raw envelopes.
    fn raw_client(path: &Path) -> (FrameReader<IpcStream>, FrameWriter<IpcStream>) {
        let stream = UnixDomainSocket::connect(path).unwrap();
        let mut reader = FrameReader::new(stream.try_clone().unwrap());
        let mut writer = FrameWriter::new(stream);
        handshake_client(&mut reader, &mut writer).unwrap();
        (reader, writer)
    }

    fn stop(handle: ServerHandle, join: JoinHandle<Result<()>>) {
        handle.shutdown();
        join.join().unwrap().unwrap();
    }

    #[test]
    fn concurrent_calls_resolve_exactly_once() {
        let sock = TempSocket::new("concurrent");
        let (handle, join) = start(echo_server(&sock));

        let session = Arc::new(Session::connect_with_config(sock.path(), client_config()).unwrap());
        let callers: Vec<_> = (0..32u32)
            .map(|i| {
                let session = Arc::clone(&session);
                thread::spawn(move || {
                    let body = Bytes::from(format!("call-{i}"));
                    let reply = session
                        .call(ECHO, body.clone(), Duration::from_secs(10))
                        .unwrap();
                    assert_eq!(reply, body);
                })
            })
            .collect();
        for caller in callers {
            caller.join().unwrap();
        }
        assert_eq!(session.pending_calls(), 0);

        drop(session);
        stop(handle, join);
    }

    #[test]
    fn unknown_operation_is_an_error_not_a_disconnect() {
        let sock = TempSocket::new("unknown");
        let (handle, join) = start(echo_server(&sock));

        let session = Session::connect_with_config(sock.path(), client_config()).unwrap();
        let err = session
            .call(999, Bytes::new(), Duration::from_secs(5))
            .unwrap_err();
        assert_eq!(err.remote_code(), Some(ErrorCode::UnknownOperation));

        let reply = session
            .call(ECHO, &b"still here"[..], Duration::from_secs(5))
            .unwrap();
        assert_eq!(reply, Bytes::from_static(b"still here"));

        drop(session);
        stop(handle, join);
    }

    #[test]
    fn handler_panic_is_reported_to_caller() {
        let sock = TempSocket::new("panic");
        let mut server = echo_server(&sock);
        server
            .register(PANICS, |_: &CallContext, _: Bytes| -> HandlerResult {
                panic!("handler blew up")
            })
            .unwrap();
        let (handle, join) = start(server);

        let session = Session::connect_with_config(sock.path(), client_config()).unwrap();
        let err = session
            .call(PANICS, Bytes::new(), Duration::from_secs(5))
            .unwrap_err();
        assert_eq!(err.remote_code(), Some(ErrorCode::HandlerPanicked));

        assert!(session.call(ECHO, Bytes::new(), Duration::from_secs(5)).is_ok());

        drop(session);
        stop(handle, join);
    }

    #[test]
    fn typed_operation_roundtrip() {
        let sock = TempSocket::new("typed");
        let mut server = echo_server(&sock);
        server
            .register_operation::<Add, _>(|_, req: AddRequest| Ok(req.a + req.b))
            .unwrap();
        let (handle, join) = start(server);

        let session = Session::connect_with_config(sock.path(), client_config()).unwrap();
        let sum = session.invoke::<Add>(&AddRequest { a: 40, b: 2 }).unwrap();
        assert_eq!(sum, 42);

        let err = session
            .call(Add::ID, &b"not json"[..], Duration::from_secs(5))
            .unwrap_err();
        assert_eq!(err.remote_code(), Some(ErrorCode::MalformedRequest));

        drop(session);
        stop(handle, join);
    }

    #[test]
    fn operations_are_listed_and_validated() {
        let sock = TempSocket::new("ops");
        let (handle, join) = start(echo_server(&sock));

        let config = SessionConfig {
            validate_operations: true,
            ..client_config()
        };
        let session = Session::connect_with_config(sock.path(), config).unwrap();
        let ops = session.operations().unwrap();
        let names: Vec<&str> = ops.iter().map(|op| op.name.as_str()).collect();
        assert_eq!(names, vec!["echo", "list_operations"]);

        let err = session
            .call(77, Bytes::new(), Duration::from_secs(5))
            .unwrap_err();
        assert_eq!(err.remote_code(), Some(ErrorCode::UnknownOperation));
        assert_eq!(session.pending_calls(), 0);

        drop(session);
        stop(handle, join);
    }

    #[test]
    fn second_daemon_reports_address_in_use() {
        let sock = TempSocket::new("in-use");
        let _first = Server::listen(sock.path()).unwrap();
        let second = Server::listen(sock.path());
        assert!(matches!(second, Err(CourierError::AddressInUse { .. })));
    }

    #[test]
    fn duplicate_registration_follows_policy() {
        let sock = TempSocket::new("dupes");
        let mut server = echo_server(&sock);
        let err = server
            .register(ECHO, |_: &CallContext, _: Bytes| -> HandlerResult { Ok(Bytes::new()) })
            .unwrap_err();
        assert!(matches!(err, CourierError::DuplicateOperation(ECHO)));
        drop(server);

        let sock = TempSocket::new("dupes-replace");
        let config = ServerConfig {
            duplicate_policy: DuplicatePolicy::Replace,
            ..ServerConfig::default()
        };
        let mut server = Server::listen_with_config(sock.path(), config).unwrap();
        server
            .register(ECHO, |_: &CallContext, _: Bytes| -> HandlerResult { Ok(Bytes::new()) })
            .unwrap();
        server
            .register(ECHO, |_: &CallContext, _: Bytes| -> HandlerResult {
                Ok(Bytes::from_static(b"second"))
            })
            .unwrap();
        let (handle, join) = start(server);

        let session = Session::connect_with_config(sock.path(), client_config()).unwrap();
        let reply = session.call(ECHO, Bytes::new(), Duration::from_secs(5)).unwrap();
        assert_eq!(reply, Bytes::from_static(b"second"));

        drop(session);
        stop(handle, join);
    }

    #[test]
    fn incompatible_client_is_refused() {
        let sock = TempSocket::new("old-client");
        let (handle, join) = start(echo_server(&sock));

        let config = SessionConfig {
            handshake: HandshakeConfig {
                protocol_version: "2.0".to_string(),
                ..HandshakeConfig::default()
            },
            ..client_config()
        };
        let result = Session::connect_with_config(sock.path(), config);
        assert!(matches!(
            result,
            Err(CourierError::IncompatibleProtocol { .. })
        ));

        stop(handle, join);
    }

    #[test]
    fn shutdown_finishes_in_flight_calls() {
        let sock = TempSocket::new("drain");
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let started_tx = Mutex::new(started_tx);

        let mut server = echo_server(&sock);
        server
            .register(SLOW, move |_: &CallContext, body: Bytes| -> HandlerResult {
                let _ = lock(&started_tx).send(());
                thread::sleep(Duration::from_millis(150));
                Ok(body)
            })
            .unwrap();
        let path = server.path().to_path_buf();
        let (handle, join) = start(server);

        let session = Session::connect_with_config(sock.path(), client_config()).unwrap();
        let pending = session
            .start_call(SLOW, &b"finish me"[..], Duration::from_secs(10))
            .unwrap();
        started_rx.recv().unwrap();
        assert_eq!(handle.active_connections(), 1);

        let started = Instant::now();
        handle.shutdown();
        assert!(handle.is_shutting_down());

        assert_eq!(pending.wait().unwrap(), Bytes::from_static(b"finish me"));
        join.join().unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(handle.active_connections(), 0);
        assert!(!path.exists());
    }

    #[test]
    fn client_that_never_reads_does_not_stall_other_connections() {
        let sock = TempSocket::new("stalled-client");
        let (handle, join) = start(echo_server(&sock));

        let (stalled_reader, mut stalled_writer) = raw_client(sock.path());
        for call_id in 1..=8 {
            stalled_writer
                .send_envelope(&Envelope::request(call_id, ECHO, vec![7u8; 2 * 1024 * 1024]))
                .unwrap();
        }

        let session = Session::connect_with_config(sock.path(), client_config()).unwrap();
        let reply = session
            .call(ECHO, &b"healthy"[..], Duration::from_secs(2))
            .unwrap();
        assert_eq!(reply, Bytes::from_static(b"healthy"));

        drop((stalled_reader, stalled_writer));
        drop(session);
        stop(handle, join);
    }

    #[test]
    fn requests_read_while_draining_get_shutting_down() {
        let sock = TempSocket::new("refuse");
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let started_tx = Mutex::new(started_tx);
        let release_rx = Mutex::new(release_rx);

        let config = ServerConfig {
            worker_threads: 1,
            job_queue_depth: 1,
            ..ServerConfig::default()
        };
        let mut server = Server::listen_with_config(sock.path(), config).unwrap();
        server
            .register(ECHO, |_: &CallContext, body: Bytes| -> HandlerResult { Ok(body) })
            .unwrap();
        server
            .register(SLOW, move |_: &CallContext, body: Bytes| -> HandlerResult {
                let _ = lock(&started_tx).send(());
                let _ = lock(&release_rx).recv();
                Ok(body)
            })
            .unwrap();
        let (handle, join) = start(server);

        let (mut reader, mut writer) = raw_client(sock.path());
        writer
            .send_envelope(&Envelope::request(1, SLOW, &b"in flight"[..]))
            .unwrap();
        started_rx.recv().unwrap();

        // The only worker is busy: 2 waits in the job queue, 3 blocks the
        // reader, and 4 stays buffered until after shutdown.
        for call_id in 2..=4 {
            writer
                .send_envelope(&Envelope::request(call_id, ECHO, &b"later"[..]))
                .unwrap();
        }
        handle.shutdown();
        release_tx.send(()).unwrap();

        let mut replies = HashMap::new();
        for _ in 0..4 {
            let reply = reader.read_envelope().unwrap();
            assert!(replies.insert(reply.call_id, reply).is_none());
        }

        let first = &replies[&1];
        assert_eq!(first.kind, EnvelopeKind::Response);
        assert_eq!(first.body, Bytes::from_static(b"in flight"));

        let last = &replies[&4];
        assert_eq!(last.kind, EnvelopeKind::Error);
        assert_eq!(
            RemoteError::from_body(&last.body).code,
            ErrorCode::ShuttingDown
        );

        for call_id in [2, 3] {
            let reply = &replies[&call_id];
            match reply.kind {
                EnvelopeKind::Response => assert_eq!(reply.body, Bytes::from_static(b"later")),
                _ => assert_eq!(
                    RemoteError::from_body(&reply.body).code,
                    ErrorCode::ShuttingDown
                ),
            }
        }

        join.join().unwrap().unwrap();
        assert!(matches!(reader.read_envelope(), Err(FrameError::ConnectionClosed)));
    }

    #[test]
    fn shutdown_shares_one_drain_deadline() {
        let sock = TempSocket::new("deadline");
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let started_tx = Mutex::new(started_tx);

        let config = ServerConfig {
            drain_timeout: Duration::from_millis(300),
            ..ServerConfig::default()
        };
        let mut server = Server::listen_with_config(sock.path(), config).unwrap();
        server
            .register(SLOW, move |_: &CallContext, _: Bytes| -> HandlerResult {
                let _ = lock(&started_tx).send(());
                thread::sleep(Duration::from_secs(3));
                Ok(Bytes::new())
            })
            .unwrap();
        let (handle, join) = start(server);

        let session = Session::connect_with_config(sock.path(), client_config()).unwrap();
        let pending = session
            .start_call(SLOW, Bytes::new(), Duration::from_secs(10))
            .unwrap();
        started_rx.recv().unwrap();

        let started = Instant::now();
        handle.shutdown();
        join.join().unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_millis(600));
        assert!(matches!(pending.wait(), Err(CourierError::ConnectionLost)));
    }

    #[test]
    fn shutdown_is_idempotent() {
        let sock = TempSocket::new("idempotent");
        let (handle, join) = start(echo_server(&sock));
        handle.shutdown();
        handle.shutdown();
        join.join().unwrap().unwrap();
    }
}
