use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::VecDeque;
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// The pool refuses new work.
const SHUTDOWN: u64 = 1 << 63;

/// Queued work is discarded instead of executed.
const ABORT: u64 = 1 << 62;

const THREADS_SHIFT: u32 = 32;
const THREADS_MASK: u64 = ((1 << 30) - 1) << THREADS_SHIFT;
const BACKLOG_MASK: u64 = u32::MAX as u64;

/// How often `shutdown_and_wait` re-checks the state word.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(2);

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

#[inline]
fn pack(flags: u64, threads: u64, backlog: i32) -> u64 {
    flags | ((threads << THREADS_SHIFT) & THREADS_MASK) | (backlog as u32 as u64)
}

#[inline]
fn unpack(word: u64) -> (u64, u64, i32) {
    let flags = word & (SHUTDOWN | ABORT);
    let threads = (word & THREADS_MASK) >> THREADS_SHIFT;
    let backlog = (word & BACKLOG_MASK) as u32 as i32;
    (flags, threads, backlog)
}

type Job = Box<dyn FnOnce() + Send>;
type PanicHandler = Box<dyn Fn(Box<dyn Any + Send>) + Send + Sync>;

/// A capped pool of background workers that spin up on demand and retire
/// themselves after an idle timeout.
///
/// There is no manager thread. All coordination lives in one atomic word
/// packing the shutdown and abort flags, the live-thread count, and the
/// backlog (queued work minus idle workers); every decision — spawn a worker
/// on submit, let an idle worker expire — is a single compare-and-swap
/// transition of that word, so the races between them resolve by whichever
/// transition lands first.
///
/// A task that panics is routed to the pool's panic handler. The default
/// handler logs the failure and aborts the whole pool: these pools run batch
/// pipelines where partial completion is unsafe, so failing fast beats
/// limping on.
///
/// # Examples
///
/// ```
/// use scurry::WorkerPool;
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// let pool = WorkerPool::new(4, "example");
/// let done = Arc::new(AtomicUsize::new(0));
/// for _ in 0..100 {
///     let done = Arc::clone(&done);
///     pool.submit(move || {
///         done.fetch_add(1, Ordering::Relaxed);
///     })
///     .unwrap();
/// }
/// pool.shutdown_and_wait();
/// assert_eq!(done.load(Ordering::Relaxed), 100);
/// ```
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    state: AtomicU64,
    queue: Mutex<VecDeque<Job>>,
    available: Condvar,
    max_threads: usize,
    idle_timeout: Duration,
    name: String,
    handler: Option<PanicHandler>,
    next_worker: AtomicUsize,
}

impl WorkerPool {
    /// Creates a pool running at most `max_threads` workers, named
    /// `"<name>-<n>"`.
    pub fn new(max_threads: usize, name: impl Into<String>) -> Self {
        assert!(max_threads > 0, "a pool needs at least one worker");
        Self {
            shared: Arc::new(PoolShared {
                state: AtomicU64::new(0),
                queue: Mutex::new(VecDeque::new()),
                available: Condvar::new(),
                max_threads,
                idle_timeout: DEFAULT_IDLE_TIMEOUT,
                name: name.into(),
                handler: None,
                next_worker: AtomicUsize::new(0),
            }),
        }
    }

    /// Sets how long an idle worker waits for work before retiring.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        let shared = Arc::get_mut(&mut self.shared)
            .expect("configure the pool before submitting work to it");
        shared.idle_timeout = idle_timeout;
        self
    }

    /// Replaces the default panic policy (log and abort the pool) with
    /// `handler`. The handler receives the panic payload; the pool keeps
    /// running.
    pub fn with_panic_handler<H>(mut self, handler: H) -> Self
    where
        H: Fn(Box<dyn Any + Send>) + Send + Sync + 'static,
    {
        let shared = Arc::get_mut(&mut self.shared)
            .expect("configure the pool before submitting work to it");
        shared.handler = Some(Box::new(handler));
        self
    }

    /// Queues `job` for execution, spawning a worker if none is idle and the
    /// pool is below its thread cap.
    ///
    /// Fire-and-forget: a failing job surfaces only through the pool's panic
    /// handler, never through this call.
    pub fn submit<F>(&self, job: F) -> Result<(), Rejected>
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = &self.shared;
        let mut spawn;
        let mut state = shared.state.load(Ordering::SeqCst);
        loop {
            if state & (SHUTDOWN | ABORT) != 0 {
                return Err(Rejected { _priv: () });
            }
            let (flags, threads, backlog) = unpack(state);
            // a negative backlog means an idle worker is already waiting for
            // this job; otherwise add a worker, capacity permitting
            spawn = backlog >= 0 && (threads as usize) < shared.max_threads;
            let new = pack(flags, threads + spawn as u64, backlog + 1);
            match shared
                .state
                .compare_exchange(state, new, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(current) => state = current,
            }
        }

        {
            // re-check under the queue lock: a shutdown that lands after our
            // accounting CAS but before the push must not strand the job
            let mut queue = shared.queue.lock();
            if shared.state.load(Ordering::SeqCst) & (SHUTDOWN | ABORT) != 0 {
                drop(queue);
                update_state(shared, |flags, threads, backlog| {
                    (flags, threads - spawn as u64, backlog - 1)
                });
                return Err(Rejected { _priv: () });
            }
            queue.push_back(Box::new(job));
        }
        shared.available.notify_one();

        if spawn {
            spawn_worker(shared);
        }
        Ok(())
    }

    /// Stops accepting new work. Already-queued jobs still run; workers exit
    /// once the queue is drained.
    pub fn shutdown(&self) {
        self.shared.state.fetch_or(SHUTDOWN, Ordering::SeqCst);
        self.shared.available.notify_all();
    }

    /// Stops accepting new work and discards the queue. A job that is
    /// already running is not interrupted.
    pub fn shutdown_now(&self) {
        abort_pool(&self.shared);
    }

    /// Shuts down, then blocks until every queued job has run and every
    /// worker has exited.
    pub fn shutdown_and_wait(&self) {
        self.shutdown();
        loop {
            let (_, threads, backlog) = unpack(self.shared.state.load(Ordering::SeqCst));
            if threads == 0 && backlog == 0 {
                return;
            }
            thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    /// Whether the pool has stopped accepting work.
    pub fn is_shutdown(&self) -> bool {
        self.shared.state.load(Ordering::SeqCst) & SHUTDOWN != 0
    }

    /// Whether the pool discarded its queue, either through
    /// [`shutdown_now`](WorkerPool::shutdown_now) or the default panic
    /// policy.
    pub fn is_aborted(&self) -> bool {
        self.shared.state.load(Ordering::SeqCst) & ABORT != 0
    }

    /// The number of currently live workers.
    pub fn live_threads(&self) -> usize {
        let (_, threads, _) = unpack(self.shared.state.load(Ordering::SeqCst));
        threads as usize
    }
}

fn spawn_worker(shared: &Arc<PoolShared>) {
    let n = shared.next_worker.fetch_add(1, Ordering::Relaxed);
    let name = format!("{}-{}", shared.name, n);
    let worker = Arc::clone(shared);
    let spawned = thread::Builder::new()
        .name(name)
        .spawn(move || worker_loop(worker));
    if let Err(e) = spawned {
        log::error!("worker pool {:?}: failed to spawn a worker: {}", shared.name, e);
        // give the thread slot back; a later submit will try again
        update_state(shared, |flags, threads, backlog| {
            (flags, threads - 1, backlog)
        });
    }
}

/// Apply `f` to the unpacked state word until the CAS lands, returning the
/// word that was replaced.
fn update_state<F>(shared: &PoolShared, f: F) -> u64
where
    F: Fn(u64, u64, i32) -> (u64, u64, i32),
{
    let mut state = shared.state.load(Ordering::SeqCst);
    loop {
        let (flags, threads, backlog) = unpack(state);
        let (flags, threads, backlog) = f(flags, threads, backlog);
        match shared.state.compare_exchange(
            state,
            pack(flags, threads, backlog),
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(old) => return old,
            Err(current) => state = current,
        }
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        // one transition: this worker is now idle
        update_state(&shared, |flags, threads, backlog| {
            (flags, threads, backlog - 1)
        });

        loop {
            match poll(&shared) {
                Some(job) => {
                    // taking a job removes one queued item and one idle
                    // worker, which cancel out in the backlog; no transition
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                        match &shared.handler {
                            Some(handler) => handler(payload),
                            None => {
                                log::error!(
                                    "worker pool {:?}: task panicked; aborting the pool",
                                    shared.name
                                );
                                abort_pool(&shared);
                            }
                        }
                    }
                    break;
                }
                None => {
                    if try_retire(&shared) {
                        return;
                    }
                    // a job was queued against our idle slot between the
                    // timeout and the retire attempt; poll again
                }
            }
        }
    }
}

/// Wait up to the idle timeout for a job. Returns `None` on timeout, or
/// immediately once the pool is draining.
fn poll(shared: &PoolShared) -> Option<Job> {
    let deadline = Instant::now() + shared.idle_timeout;
    let mut queue = shared.queue.lock();
    loop {
        let state = shared.state.load(Ordering::SeqCst);
        if state & ABORT != 0 {
            return None;
        }
        if let Some(job) = queue.pop_front() {
            return Some(job);
        }
        if state & SHUTDOWN != 0 {
            // the queue is drained and no more work is coming
            return None;
        }
        let timeout = deadline.saturating_duration_since(Instant::now());
        if timeout.is_zero() {
            return None;
        }
        let _ = shared.available.wait_for(&mut queue, timeout);
    }
}

/// Try to exit: give up the thread slot and the idle mark in one transition.
/// Refused while the backlog says work is expected and the pool is live, in
/// which case the worker must poll again instead of stranding the work.
fn try_retire(shared: &PoolShared) -> bool {
    let mut state = shared.state.load(Ordering::SeqCst);
    loop {
        let (flags, threads, backlog) = unpack(state);
        if flags == 0 && backlog + 1 > 0 {
            return false;
        }
        match shared.state.compare_exchange(
            state,
            pack(flags, threads - 1, backlog + 1),
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => return true,
            Err(current) => state = current,
        }
    }
}

fn abort_pool(shared: &PoolShared) {
    shared.state.fetch_or(SHUTDOWN | ABORT, Ordering::SeqCst);
    let discarded = {
        let mut queue = shared.queue.lock();
        let discarded = queue.len();
        queue.clear();
        discarded
    };
    if discarded > 0 {
        // the discarded jobs were counted into the backlog at submit time
        update_state(shared, |flags, threads, backlog| {
            (flags, threads, backlog - discarded as i32)
        });
        log::debug!(
            "worker pool {:?}: discarded {} queued tasks",
            shared.name,
            discarded
        );
    }
    shared.available.notify_all();
}

/// The error returned by [`WorkerPool::submit`] after the pool has shut
/// down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rejected {
    _priv: (),
}

impl Display for Rejected {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "the pool is shut down and no longer accepts work")
    }
}

impl Error for Rejected {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_round_trips() {
        for &backlog in &[0, 1, -1, i32::MIN + 1, i32::MAX] {
            for &threads in &[0u64, 1, 4, (1 << 30) - 1] {
                for &flags in &[0, SHUTDOWN, ABORT, SHUTDOWN | ABORT] {
                    assert_eq!(unpack(pack(flags, threads, backlog)), (flags, threads, backlog));
                }
            }
        }
    }

    #[test]
    fn negative_backlog_stays_out_of_thread_bits() {
        let word = pack(0, 3, -2);
        let (_, threads, backlog) = unpack(word);
        assert_eq!(threads, 3);
        assert_eq!(backlog, -2);
    }

    #[test]
    fn submit_runs_a_job() {
        let pool = WorkerPool::new(1, "test");
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        pool.submit(move || {
            r.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        pool.shutdown_and_wait();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn submit_after_shutdown_is_rejected() {
        let pool = WorkerPool::new(1, "test");
        pool.shutdown();
        assert!(pool.submit(|| {}).is_err());
    }
}
