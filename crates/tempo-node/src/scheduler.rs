//! Delayed and repeating task execution on a single logical timeline.
//!
//! [`SingleThreadedScheduler`] owns one tokio task that keeps every queued job
//! ordered by `(due instant, submission sequence)` and runs due jobs one after
//! another, so scheduled work never overlaps with other scheduled work.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// One-shot unit of scheduled work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;
/// Unit of work run on every period of a repeating schedule.
pub type RepeatingTask = Box<dyn FnMut() + Send + 'static>;

/// Stand-in deadline for delays too large to add to an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

const SCHEDULED: u8 = 0;
const RUNNING: u8 = 1;
const DONE: u8 = 2;
const CANCELLED: u8 = 3;

/// Handle to a scheduled task.
#[derive(Debug, Clone)]
pub struct Cancellable {
    state: Arc<AtomicU8>,
    repeating: bool,
}

impl Cancellable {
    fn new(repeating: bool) -> Self {
        Self {
            state: Arc::new(AtomicU8::new(SCHEDULED)),
            repeating,
        }
    }

    fn terminated() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(CANCELLED)),
            repeating: false,
        }
    }

    /// Prevents any further execution.
    ///
    /// Returns `true` when this call stopped a run from happening: a one-shot
    /// task that has not started yet, or a repeating task that was still live.
    pub fn cancel(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let cancellable = match current {
                SCHEDULED => true,
                RUNNING => self.repeating,
                _ => false,
            };
            if !cancellable {
                return false;
            }
            match self.state.compare_exchange(
                current,
                CANCELLED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Whether the task has completed or been cancelled.
    pub fn is_terminated(&self) -> bool {
        matches!(self.state.load(Ordering::Acquire), DONE | CANCELLED)
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    fn begin_run(&self) -> bool {
        self.state
            .compare_exchange(SCHEDULED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn finish_run(&self) {
        let _ = self
            .state
            .compare_exchange(RUNNING, DONE, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Re-arms a repeating task; fails if it was cancelled while running.
    fn rearm(&self) -> bool {
        self.state
            .compare_exchange(RUNNING, SCHEDULED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Executes tasks after a delay, off the caller's thread of control.
pub trait Scheduler: Send + Sync + 'static {
    /// Runs `task` once after `delay`.
    fn schedule(&self, task: Task, delay: Duration) -> Cancellable;

    /// Runs `task` after `initial_delay` and then every `period` until cancelled.
    fn schedule_repeating(
        &self,
        task: RepeatingTask,
        initial_delay: Duration,
        period: Duration,
    ) -> Cancellable;
}

enum JobKind {
    Once(Task),
    Repeating { task: RepeatingTask, period: Duration },
}

struct Job {
    handle: Cancellable,
    kind: JobKind,
}

struct Submission {
    due: Instant,
    job: Job,
}

/// Tokio-backed scheduler running every job on one timeline task.
pub struct SingleThreadedScheduler {
    tx: mpsc::UnboundedSender<Submission>,
    shutdown: CancellationToken,
}

impl SingleThreadedScheduler {
    /// Spawns the timeline task; must be called from within a tokio runtime.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        tokio::spawn(run_timeline(rx, shutdown.clone()));
        Self { tx, shutdown }
    }

    /// Stops the timeline; queued jobs are cancelled and never run.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn submit(&self, delay: Duration, job: Job) -> Cancellable {
        let handle = job.handle.clone();
        if self.shutdown.is_cancelled() {
            return Cancellable::terminated();
        }
        let due = due_after(Instant::now(), delay);
        if self.tx.send(Submission { due, job }).is_err() {
            handle.cancel();
        }
        handle
    }
}

impl Drop for SingleThreadedScheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Scheduler for SingleThreadedScheduler {
    fn schedule(&self, task: Task, delay: Duration) -> Cancellable {
        self.submit(
            delay,
            Job {
                handle: Cancellable::new(false),
                kind: JobKind::Once(task),
            },
        )
    }

    fn schedule_repeating(
        &self,
        task: RepeatingTask,
        initial_delay: Duration,
        period: Duration,
    ) -> Cancellable {
        // A zero period would spin the timeline.
        let period = period.max(Duration::from_millis(1));
        self.submit(
            initial_delay,
            Job {
                handle: Cancellable::new(true),
                kind: JobKind::Repeating { task, period },
            },
        )
    }
}

async fn run_timeline(
    mut rx: mpsc::UnboundedReceiver<Submission>,
    shutdown: CancellationToken,
) {
    let mut timeline: BTreeMap<(Instant, u64), Job> = BTreeMap::new();
    let mut seq: u64 = 0;

    loop {
        let next_due = timeline.keys().next().map(|(due, _)| *due);
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            submission = rx.recv() => match submission {
                Some(Submission { due, job }) => {
                    timeline.insert((due, seq), job);
                    seq += 1;
                }
                None => break,
            },
            _ = wait_until(next_due) => {
                let now = Instant::now();
                while let Some(entry) = timeline.first_entry() {
                    if entry.key().0 > now {
                        break;
                    }
                    let ((due, _), job) = entry.remove_entry();
                    if let Some((next_due, job)) = run_job(due, now, job) {
                        timeline.insert((next_due, seq), job);
                        seq += 1;
                    }
                }
            }
        }
    }

    rx.close();
    while let Ok(submission) = rx.try_recv() {
        submission.job.handle.cancel();
    }
    let abandoned = timeline.len();
    for job in timeline.into_values() {
        job.handle.cancel();
    }
    debug!(abandoned, "scheduler timeline stopped");
}

async fn wait_until(due: Option<Instant>) {
    match due {
        Some(due) => sleep_until(due).await,
        None => std::future::pending().await,
    }
}

/// `from + delay`, saturating to a far-future instant instead of overflowing.
fn due_after(from: Instant, delay: Duration) -> Instant {
    from.checked_add(delay)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}

/// Runs one due job; returns the job again with its next due time if it repeats.
fn run_job(due: Instant, now: Instant, job: Job) -> Option<(Instant, Job)> {
    let Job { handle, kind } = job;
    if !handle.begin_run() {
        return None;
    }
    match kind {
        JobKind::Once(task) => {
            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                error!("scheduled task panicked");
            }
            handle.finish_run();
            None
        }
        JobKind::Repeating { mut task, period } => {
            if catch_unwind(AssertUnwindSafe(&mut task)).is_err() {
                error!("repeating task panicked");
            }
            if !handle.rearm() {
                return None;
            }
            let mut next_due = due_after(due, period);
            if next_due <= now {
                next_due = due_after(now, period);
            }
            Some((
                next_due,
                Job {
                    handle,
                    kind: JobKind::Repeating { task, period },
                },
            ))
        }
    }
}
