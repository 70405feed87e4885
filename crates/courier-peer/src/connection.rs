use std::collections::HashSet;
use std::fmt;
use std::net::Shutdown;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use courier_frame::{Envelope, FrameError, FrameWriter};
use courier_transport::IpcStream;
use tracing::{debug, trace, warn};

use crate::error::{CourierError, Result};

/// Lifecycle of one physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Established,
    /// In-flight work finishes; no new requests are accepted.
    Draining,
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Established)
                | (Connecting, Closed)
                | (Established, Draining)
                | (Established, Closed)
                | (Draining, Closed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Established => "established",
            ConnectionState::Draining => "draining",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One physical connection: its outbound queue, state, and the call ids it
/// carries.
///
/// The read half is owned by whichever thread runs the reader loop, which
/// keeps the frame decoder's buffer. The write half belongs to a dedicated
/// writer thread fed by a bounded queue, so [`Connection::send`] never blocks
/// on a peer that stops reading; once the queue is full, sends fail with
/// `Overloaded`. A write error shuts the socket down, which the reader sees as
/// connection loss. The connection only records call ids; pending calls
/// themselves live in the correlation table.
pub struct Connection {
    id: u64,
    outbound: Mutex<Option<SyncSender<Envelope>>>,
    queue_depth: usize,
    max_payload_size: usize,
    writer_done: Mutex<Option<Receiver<()>>>,
    control: IpcStream,
    state: Mutex<ConnectionState>,
    calls: Mutex<HashSet<u64>>,
}

impl Connection {
    /// Hand the write half of a stream to a writer thread. `control` is a
    /// clone used for shutdown; at most `queue_depth` envelopes wait to be
    /// written.
    pub fn new(
        id: u64,
        writer: FrameWriter<IpcStream>,
        control: IpcStream,
        queue_depth: usize,
    ) -> Result<Self> {
        let queue_depth = queue_depth.max(1);
        let max_payload_size = writer.config().max_payload_size;
        let (outbound, queued) = mpsc::sync_channel(queue_depth);
        let (done_tx, done_rx) = mpsc::channel();
        thread::Builder::new()
            .name(format!("courier-writer-{id}"))
            .spawn(move || {
                let _done = done_tx;
                write_loop(id, writer, queued);
            })?;

        Ok(Self {
            id,
            outbound: Mutex::new(Some(outbound)),
            queue_depth,
            max_payload_size,
            writer_done: Mutex::new(Some(done_rx)),
            control,
            state: Mutex::new(ConnectionState::Connecting),
            calls: Mutex::new(HashSet::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    /// Move to `next` if the transition is valid; returns whether it happened.
    pub fn transition(&self, next: ConnectionState) -> bool {
        let mut state = lock(&self.state);
        if !state.can_transition_to(next) {
            trace!(connection_id = self.id, from = %*state, to = %next, "ignored transition");
            return false;
        }
        debug!(connection_id = self.id, from = %*state, to = %next, "connection state");
        *state = next;
        true
    }

    /// Queue one envelope for writing as a single frame.
    ///
    /// Fails with `FrameTooLarge` without touching the stream, `Overloaded`
    /// when the queue is full, and `ConnectionLost` once the writer stopped.
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        let size = envelope.encoded_len();
        if size > self.max_payload_size {
            return Err(FrameError::FrameTooLarge {
                size,
                max: self.max_payload_size,
            }
            .into());
        }

        let outbound = lock(&self.outbound);
        let Some(sender) = outbound.as_ref() else {
            return Err(CourierError::ConnectionLost);
        };
        match sender.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(CourierError::Overloaded(self.queue_depth)),
            Err(TrySendError::Disconnected(_)) => Err(CourierError::ConnectionLost),
        }
    }

    /// Record that `call_id` was issued on this connection.
    pub fn track(&self, call_id: u64) {
        lock(&self.calls).insert(call_id);
    }

    pub fn untrack(&self, call_id: u64) {
        lock(&self.calls).remove(&call_id);
    }

    pub fn untrack_all(&self, call_ids: &[u64]) {
        let mut calls = lock(&self.calls);
        for call_id in call_ids {
            calls.remove(call_id);
        }
    }

    /// Take every call id still recorded on this connection.
    pub fn take_calls(&self) -> Vec<u64> {
        lock(&self.calls).drain().collect()
    }

    pub fn tracked_calls(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Stop reading: a reader blocked on this connection wakes with EOF.
    pub fn shutdown_read(&self) {
        if let Err(err) = self.control.shutdown(Shutdown::Read) {
            debug!(connection_id = self.id, error = %err, "shutdown(read) failed");
        }
    }

    /// Stop accepting envelopes and wait up to `timeout` for the queued ones
    /// to be written. Returns whether the writer finished in time.
    pub fn flush(&self, timeout: Duration) -> bool {
        drop(lock(&self.outbound).take());
        let Some(done) = lock(&self.writer_done).take() else {
            return true;
        };
        match done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => false,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        }
    }

    /// Tear down both directions and mark the connection closed. Envelopes
    /// still queued are dropped.
    pub fn close(&self) {
        drop(lock(&self.outbound).take());
        if let Err(err) = self.control.shutdown(Shutdown::Both) {
            debug!(connection_id = self.id, error = %err, "shutdown failed");
        }
        self.transition(ConnectionState::Closed);
    }
}

fn write_loop(id: u64, mut writer: FrameWriter<IpcStream>, queued: Receiver<Envelope>) {
    for envelope in queued {
        match writer.send_envelope(&envelope) {
            Ok(()) => trace!(
                connection_id = id,
                call_id = envelope.call_id,
                kind = ?envelope.kind,
                len = envelope.body.len(),
                "sent envelope"
            ),
            Err(err) => {
                warn!(connection_id = id, call_id = envelope.call_id, error = %err, "write failed; closing connection");
                if let Err(err) = writer.get_ref().shutdown(Shutdown::Both) {
                    debug!(connection_id = id, error = %err, "shutdown failed");
                }
                return;
            }
        }
    }
    trace!(connection_id = id, "writer finished");
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("tracked_calls", &self.tracked_calls())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use bytes::Bytes;
    use courier_frame::{FrameConfig, FrameReader};

    use super::*;

    fn connection_pair(queue_depth: usize) -> (Connection, FrameReader<IpcStream>) {
        let (local, remote) = IpcStream::pair().unwrap();
        let control = local.try_clone().unwrap();
        let conn = Connection::new(1, FrameWriter::new(local), control, queue_depth).unwrap();
        (conn, FrameReader::new(remote))
    }

    #[test]
    fn valid_lifecycle() {
        let (conn, _peer) = connection_pair(8);
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(conn.transition(ConnectionState::Established));
        assert!(conn.transition(ConnectionState::Draining));
        assert!(conn.transition(ConnectionState::Closed));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn invalid_transitions_are_refused() {
        let (conn, _peer) = connection_pair(8);
        assert!(!conn.transition(ConnectionState::Draining));
        conn.transition(ConnectionState::Closed);
        assert!(!conn.transition(ConnectionState::Established));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn send_writes_whole_envelopes() {
        let (conn, mut peer) = connection_pair(16);
        let conn = Arc::new(conn);

        let writers: Vec<_> = (0..8u64)
            .map(|i| {
                let conn = Arc::clone(&conn);
                thread::spawn(move || {
                    conn.send(Envelope::request(i, 1, Bytes::from(vec![i as u8; 4096])))
                        .unwrap();
                })
            })
            .collect();

        let mut seen = Vec::new();
        for _ in 0..8 {
            let env = peer.read_envelope().unwrap();
            assert!(env.body.iter().all(|b| *b == env.call_id as u8));
            seen.push(env.call_id);
        }
        for handle in writers {
            handle.join().unwrap();
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn send_does_not_block_on_a_peer_that_never_reads() {
        let (conn, _peer) = connection_pair(2);
        let big = Bytes::from(vec![0u8; 4 * 1024 * 1024]);

        let started = Instant::now();
        let mut outcomes = Vec::new();
        for call_id in 0..4 {
            outcomes.push(conn.send(Envelope::request(call_id, 1, big.clone())));
        }
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(outcomes.iter().any(|outcome| matches!(outcome, Err(CourierError::Overloaded(2)))));

        conn.close();
        assert!(matches!(
            conn.send(Envelope::request(9, 1, Bytes::new())),
            Err(CourierError::ConnectionLost)
        ));
    }

    #[test]
    fn oversized_envelope_is_rejected_before_queueing() {
        let (local, remote) = IpcStream::pair().unwrap();
        let control = local.try_clone().unwrap();
        let cfg = FrameConfig {
            max_payload_size: 32,
            ..FrameConfig::default()
        };
        let conn = Connection::new(1, FrameWriter::with_config(local, cfg), control, 4).unwrap();
        let mut peer = FrameReader::new(remote);

        let err = conn
            .send(Envelope::response(1, vec![0u8; 64]))
            .unwrap_err();
        assert!(matches!(
            err,
            CourierError::Frame(FrameError::FrameTooLarge { max: 32, .. })
        ));

        conn.send(Envelope::response(2, &b"fits"[..])).unwrap();
        assert_eq!(peer.read_envelope().unwrap().call_id, 2);
    }

    #[test]
    fn flush_writes_queued_envelopes_before_returning() {
        let (conn, mut peer) = connection_pair(8);
        for call_id in 0..3 {
            conn.send(Envelope::response(call_id, &b"queued"[..])).unwrap();
        }

        let reader = thread::spawn(move || {
            (0..3)
                .map(|_| peer.read_envelope().unwrap().call_id)
                .collect::<Vec<_>>()
        });
        assert!(conn.flush(Duration::from_secs(5)));
        assert_eq!(reader.join().unwrap(), vec![0, 1, 2]);
        assert!(matches!(
            conn.send(Envelope::response(3, Bytes::new())),
            Err(CourierError::ConnectionLost)
        ));
    }

    #[test]
    fn tracks_call_ids() {
        let (conn, _peer) = connection_pair(8);
        conn.track(1);
        conn.track(2);
        conn.track(3);
        conn.untrack(2);
        conn.untrack_all(&[3]);
        assert_eq!(conn.take_calls(), vec![1]);
        assert_eq!(conn.tracked_calls(), 0);
    }

    #[test]
    fn close_ends_the_peer_stream() {
        let (conn, mut peer) = connection_pair(8);
        conn.transition(ConnectionState::Established);
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(
            peer.read_frame(),
            Err(FrameError::ConnectionClosed)
        ));
    }
}
