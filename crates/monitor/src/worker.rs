//! Worker task queue
//!
//! Every state-machine transition and every listener callback runs on one
//! dedicated thread. Host broadcasts, permission results and poll ticks are
//! posted here as jobs, which serializes them without the monitor tables
//! needing anything stronger than short-lived locks.
//!
//! The thread drives a current-thread Tokio runtime so that immediate jobs
//! (an async channel) and delayed jobs (a deadline heap) can be awaited
//! together in one `select!`.

use async_channel::{Receiver, Sender};
use common::{Error, Result};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum WorkerCommand {
    Run(Job),
    RunAt(Instant, Job),
    Shutdown,
}

/// Owner of the worker thread
///
/// Dropping the owner (or calling [`Worker::shutdown`]) stops the thread after
/// it has drained the jobs that were already queued. Delayed jobs that have
/// not come due are discarded.
pub struct Worker {
    handle: WorkerHandle,
    thread: Option<JoinHandle<()>>,
}

/// Cloneable handle for posting jobs onto a [`Worker`]
#[derive(Clone)]
pub struct WorkerHandle {
    tx: Sender<WorkerCommand>,
    thread_id: ThreadId,
    name: Arc<str>,
}

impl Worker {
    /// Spawn a named worker thread
    pub fn spawn(name: &str) -> Result<Self> {
        let (tx, rx) = async_channel::unbounded();
        let thread_name = name.to_string();

        let thread = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || run_thread(&thread_name, rx))?;

        let handle = WorkerHandle {
            tx,
            thread_id: thread.thread().id(),
            name: Arc::from(name),
        };

        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    /// Handle for posting jobs
    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    /// Stop the thread and wait for it to exit
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };

        // Closed channel means the thread already exited
        let _ = self.handle.tx.try_send(WorkerCommand::Shutdown);

        if self.handle.is_worker_thread() {
            // Joining ourselves would deadlock; the loop exits on its own
            warn!("Worker '{}' dropped from its own thread", self.handle.name);
            return;
        }

        if thread.join().is_err() {
            error!("Worker '{}' thread panicked", self.handle.name);
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl WorkerHandle {
    /// Queue a job to run as soon as possible
    pub fn post<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx
            .try_send(WorkerCommand::Run(Box::new(job)))
            .map_err(|_| Error::WorkerStopped)
    }

    /// Queue a job to run once `delay` has elapsed
    pub fn post_delayed<F>(&self, delay: Duration, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = Instant::now() + delay;
        self.tx
            .try_send(WorkerCommand::RunAt(deadline, Box::new(job)))
            .map_err(|_| Error::WorkerStopped)
    }

    /// Run a job on the worker and block until it has finished
    ///
    /// Runs inline when called from the worker thread itself.
    pub fn run_sync<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_worker_thread() {
            job();
            return Ok(());
        }

        let (done_tx, done_rx) = async_channel::bounded(1);
        self.post(move || {
            job();
            let _ = done_tx.try_send(());
        })?;

        // A panicking job drops the sender without sending
        done_rx.recv_blocking().map_err(|_| Error::WorkerStopped)
    }

    /// Whether the calling thread is this worker's thread
    pub fn is_worker_thread(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    /// Thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the worker still accepts jobs
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}

struct Scheduled {
    deadline: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Equal deadlines run in posting order
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

fn run_thread(name: &str, rx: Receiver<WorkerCommand>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start worker '{}' runtime: {}", name, e);
            return;
        }
    };

    info!("Worker '{}' started", name);
    runtime.block_on(run_loop(rx));
    info!("Worker '{}' stopped", name);
}

async fn run_loop(rx: Receiver<WorkerCommand>) {
    let mut timers: BinaryHeap<Reverse<Scheduled>> = BinaryHeap::new();
    let mut seq: u64 = 0;

    loop {
        let now = Instant::now();
        while timers.peek().is_some_and(|Reverse(next)| next.deadline <= now) {
            if let Some(Reverse(due)) = timers.pop() {
                run_job(due.job);
            }
        }

        let command = match timers.peek() {
            Some(Reverse(next)) => {
                let deadline = tokio::time::Instant::from_std(next.deadline);
                tokio::select! {
                    command = rx.recv() => command,
                    _ = tokio::time::sleep_until(deadline) => continue,
                }
            }
            None => rx.recv().await,
        };

        match command {
            Ok(WorkerCommand::Run(job)) => run_job(job),
            Ok(WorkerCommand::RunAt(deadline, job)) => {
                seq += 1;
                timers.push(Reverse(Scheduled { deadline, seq, job }));
            }
            Ok(WorkerCommand::Shutdown) | Err(_) => {
                debug!("Discarding {} pending delayed jobs", timers.len());
                break;
            }
        }
    }

    rx.close();
}

fn run_job(job: Job) {
    // A panicking listener must not take the worker down with it
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job));
    if let Err(e) = result {
        error!("Panic in worker job: {:?}", e);
    }
}
