use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of threads executing handler jobs from a bounded queue.
///
/// Submitting blocks once `queue_depth` jobs are waiting, which pushes back
/// on the connection readers feeding the pool.
pub(crate) struct WorkerPool {
    sender: SyncSender<Job>,
    workers: Vec<JoinHandle<()>>,
    live: Arc<(Mutex<usize>, Condvar)>,
}

/// Cloneable handle for submitting jobs.
#[derive(Clone)]
pub(crate) struct JobSender {
    sender: SyncSender<Job>,
}

impl JobSender {
    /// Queue a job, blocking while the queue is full. Returns the job back if
    /// the pool has shut down.
    pub(crate) fn submit(&self, job: Job) -> Result<(), Job> {
        match self.sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => {
                debug!("worker queue full; waiting");
                self.sender.send(job).map_err(|err| err.0)
            }
            Err(TrySendError::Disconnected(job)) => Err(job),
        }
    }
}

impl WorkerPool {
    pub(crate) fn new(threads: usize, queue_depth: usize) -> std::io::Result<Self> {
        let threads = threads.max(1);
        let (sender, receiver) = mpsc::sync_channel::<Job>(queue_depth.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let live = Arc::new((Mutex::new(0usize), Condvar::new()));

        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let receiver = Arc::clone(&receiver);
            let worker_live = Arc::clone(&live);
            *live.0.lock().unwrap_or_else(PoisonError::into_inner) += 1;
            let spawned = thread::Builder::new()
                .name(format!("courier-worker-{index}"))
                .spawn(move || {
                    let _live = LiveGuard(worker_live);
                    worker_loop(&receiver);
                });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    *live.0.lock().unwrap_or_else(PoisonError::into_inner) -= 1;
                    return Err(err);
                }
            }
        }

        Ok(Self {
            sender,
            workers,
            live,
        })
    }

    pub(crate) fn sender(&self) -> JobSender {
        JobSender {
            sender: self.sender.clone(),
        }
    }

    /// Stop accepting jobs and wait up to `timeout` for queued work to finish.
    ///
    /// Workers still busy after the timeout are left detached. Returns
    /// whether every worker exited in time.
    pub(crate) fn shutdown(self, timeout: Duration) -> bool {
        let WorkerPool {
            sender,
            workers,
            live: counter,
        } = self;
        drop(sender);

        let deadline = Instant::now() + timeout;
        let (count, idle) = &*counter;
        let mut live = count.lock().unwrap_or_else(PoisonError::into_inner);
        while *live > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            live = idle
                .wait_timeout(live, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        let stragglers = *live;
        drop(live);

        if stragglers > 0 {
            warn!(stragglers, "workers still busy after drain timeout; detaching");
            return false;
        }
        for worker in workers {
            let _ = worker.join();
        }
        true
    }
}

fn worker_loop(receiver: &Mutex<Receiver<Job>>) {
    loop {
        let job = {
            let receiver = receiver.lock().unwrap_or_else(PoisonError::into_inner);
            receiver.recv()
        };
        match job {
            Ok(job) => job(),
            Err(_) => break,
        }
    }
}

struct LiveGuard(Arc<(Mutex<usize>, Condvar)>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        let (count, idle) = &*self.0;
        let mut live = count.lock().unwrap_or_else(PoisonError::into_inner);
        *live = live.saturating_sub(1);
        idle.notify_all();
    }
}
