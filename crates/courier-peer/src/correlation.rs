//! Pending-call bookkeeping for the client side.
//!
//! The table is the single owner of every pending call. Resolution (by a
//! response, a timeout, cancellation, or connection loss) removes the entry
//! under the table lock before the outcome is delivered, so each call is
//! resolved exactly once no matter how many of those events race.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::error::{CourierError, Result};

/// Terminal result of one call.
pub type Outcome = Result<Bytes>;

/// Far enough out that no scan ever reaches it.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Deadline `timeout` from now, saturating instead of overflowing `Instant`.
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

struct PendingCall {
    deadline: Instant,
    timeout: Duration,
    sender: SyncSender<Outcome>,
}

#[derive(Default)]
struct TableInner {
    pending: HashMap<u64, PendingCall>,
    deadlines: BTreeSet<(Instant, u64)>,
}

impl TableInner {
    fn remove(&mut self, call_id: u64) -> Option<PendingCall> {
        let call = self.pending.remove(&call_id)?;
        self.deadlines.remove(&(call.deadline, call_id));
        Some(call)
    }
}

/// Maps outstanding call ids to the callers waiting on them.
pub struct CorrelationTable {
    inner: Mutex<TableInner>,
    next_id: AtomicU64,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Next session-generated call id (monotonic from 1).
    pub fn next_call_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a pending call resolving no later than `deadline`.
    ///
    /// Fails with [`CourierError::DuplicateCallId`] if `call_id` is still pending.
    pub fn register(&self, call_id: u64, deadline: Instant) -> Result<CompletionSlot> {
        let (sender, receiver) = mpsc::sync_channel(1);
        let timeout = deadline.saturating_duration_since(Instant::now());

        let mut inner = self.lock();
        if inner.pending.contains_key(&call_id) {
            return Err(CourierError::DuplicateCallId(call_id));
        }
        inner.deadlines.insert((deadline, call_id));
        inner.pending.insert(
            call_id,
            PendingCall {
                deadline,
                timeout,
                sender,
            },
        );
        trace!(call_id, pending = inner.pending.len(), "registered call");

        Ok(CompletionSlot { call_id, receiver })
    }

    /// Deliver `outcome` to the caller waiting on `call_id`.
    ///
    /// Returns `false` when no such call is pending (late or duplicate
    /// response); the outcome is discarded.
    pub fn resolve(&self, call_id: u64, outcome: Outcome) -> bool {
        let call = self.lock().remove(call_id);
        match call {
            Some(call) => {
                deliver(call_id, call.sender, outcome);
                true
            }
            None => {
                debug!(call_id, "no pending call; discarding outcome");
                false
            }
        }
    }

    /// Resolve every call whose deadline is at or before `now` with `Timeout`.
    pub fn expire_due(&self, now: Instant) -> Vec<u64> {
        let expired: Vec<(u64, PendingCall)> = {
            let mut inner = self.lock();
            let due: Vec<u64> = inner
                .deadlines
                .iter()
                .take_while(|(deadline, _)| *deadline <= now)
                .map(|(_, call_id)| *call_id)
                .collect();
            due.into_iter()
                .filter_map(|call_id| inner.remove(call_id).map(|call| (call_id, call)))
                .collect()
        };

        let mut ids = Vec::with_capacity(expired.len());
        for (call_id, call) in expired {
            debug!(call_id, timeout = ?call.timeout, "call timed out");
            deliver(call_id, call.sender, Err(CourierError::Timeout(call.timeout)));
            ids.push(call_id);
        }
        ids
    }

    /// Resolve `call_id` with `Cancelled` if it is still pending.
    pub fn cancel(&self, call_id: u64) -> bool {
        let call = self.lock().remove(call_id);
        match call {
            Some(call) => {
                debug!(call_id, "call cancelled");
                deliver(call_id, call.sender, Err(CourierError::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Drop a pending call without notifying its slot.
    pub(crate) fn forget(&self, call_id: u64) -> bool {
        self.lock().remove(call_id).is_some()
    }

    /// Resolve each still-pending id in `ids` with the error built by `error`.
    pub fn fail_calls<I, F>(&self, ids: I, error: F) -> usize
    where
        I: IntoIterator<Item = u64>,
        F: Fn() -> CourierError,
    {
        let failed: Vec<(u64, PendingCall)> = {
            let mut inner = self.lock();
            ids.into_iter()
                .filter_map(|call_id| inner.remove(call_id).map(|call| (call_id, call)))
                .collect()
        };

        let count = failed.len();
        for (call_id, call) in failed {
            deliver(call_id, call.sender, Err(error()));
        }
        count
    }

    /// Resolve every pending call with the error built by `error`.
    pub fn fail_all<F>(&self, error: F) -> usize
    where
        F: Fn() -> CourierError,
    {
        let drained: Vec<(u64, PendingCall)> = {
            let mut inner = self.lock();
            inner.deadlines.clear();
            inner.pending.drain().collect()
        };

        let count = drained.len();
        for (call_id, call) in drained {
            deliver(call_id, call.sender, Err(error()));
        }
        count
    }

    pub fn contains(&self, call_id: u64) -> bool {
        self.lock().pending.contains_key(&call_id)
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Earliest deadline among pending calls.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.lock().deadlines.first().map(|(deadline, _)| *deadline)
    }

    fn lock(&self) -> MutexGuard<'_, TableInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

fn deliver(call_id: u64, sender: SyncSender<Outcome>, outcome: Outcome) {
    // The slot holds exactly one value and is only ever sent to once.
    if sender.try_send(outcome).is_err() {
        trace!(call_id, "caller no longer waiting");
    }
}

/// Single-assignment slot a caller waits on for its call's outcome.
#[derive(Debug)]
pub struct CompletionSlot {
    call_id: u64,
    receiver: Receiver<Outcome>,
}

impl CompletionSlot {
    pub fn call_id(&self) -> u64 {
        self.call_id
    }

    /// Block until the call resolves.
    pub fn wait(self) -> Outcome {
        self.receiver
            .recv()
            .unwrap_or(Err(CourierError::SessionClosed))
    }

    /// Take the outcome if the call has already resolved.
    pub fn try_take(&self) -> Option<Outcome> {
        match self.receiver.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(CourierError::SessionClosed)),
        }
    }
}
