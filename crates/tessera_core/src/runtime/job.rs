use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use tracing::{debug, warn};

use super::mutex::Mutex;
use super::scheduler::{Qos, Queue, Scheduler};

/// Receives progress updates from a job.
pub trait JobObserver: Send + Sync {
    fn job_progress(&self, job: &Job, progress: f64);
}

/// Token returned when registering an observer, used to unregister it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverToken(u64);

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// Cancellation and progress context for some unit of asynchronous work.
///
/// Jobs form a tree. A child reports its aggregate progress to its parent and
/// runs on its parent's queue. Cancellation is advisory: work running under a
/// job is expected to poll `is_cancelled` and bail out on its own.
///
/// Cloning a job gives another handle to the same job.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

struct JobInner {
    id: u64,
    queue: Queue,
    parent: Option<Job>,
    cancelled: AtomicBool,
    state: Mutex<JobState>,
}

#[derive(Default)]
struct JobState {
    progress: HashMap<u64, f64>,
    observers: Vec<(ObserverToken, Weak<dyn JobObserver>)>,
    next_token: u64,
}

impl Job {
    /// Create a root job on the global scheduler.
    pub fn new(qos: Qos) -> Self {
        Self::with_scheduler(Scheduler::global(), qos)
    }

    pub fn with_scheduler(scheduler: &Scheduler, qos: Qos) -> Self {
        Self::from_parts(scheduler.queue(qos), None)
    }

    /// Create a child job sharing the parent's queue.
    pub fn child(parent: &Job) -> Self {
        Self::from_parts(parent.inner.queue.clone(), Some(parent.clone()))
    }

    fn from_parts(queue: Queue, parent: Option<Job>) -> Self {
        Job {
            inner: Arc::new(JobInner {
                id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed),
                queue,
                parent,
                cancelled: AtomicBool::new(false),
                state: Mutex::new(JobState::default()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn queue(&self) -> &Queue {
        &self.inner.queue
    }

    pub fn parent(&self) -> Option<&Job> {
        self.inner.parent.as_ref()
    }

    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            debug!(job_id = self.inner.id, "job cancelled");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// If work under this job should still start.
    ///
    /// Only this job and its direct parent are consulted.
    fn should_run(&self) -> bool {
        if self.is_cancelled() {
            return false;
        }
        match &self.inner.parent {
            Some(parent) => !parent.is_cancelled(),
            None => true,
        }
    }

    /// Run `f` on this job's queue unless the job (or its parent) has been
    /// cancelled by the time the queue gets to it.
    pub fn spawn(&self, f: impl FnOnce() + Send + 'static) {
        if !self.should_run() {
            return;
        }
        let job = self.clone();
        self.inner.queue.spawn(move || {
            if job.should_run() {
                f();
            }
        });
    }

    /// Run `f` inline, logging its throughput.
    ///
    /// Returns None without running `f` if the job was cancelled.
    pub fn time<R>(
        &self,
        description: &str,
        items: usize,
        item_type: &str,
        f: impl FnOnce() -> R,
    ) -> Option<R> {
        if !self.should_run() {
            return None;
        }

        let start = Instant::now();
        let out = f();
        let elapsed = start.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 {
            (10.0 * items as f64 / elapsed).round() / 10.0
        } else {
            f64::INFINITY
        };
        debug!(
            job_id = self.inner.id,
            %description,
            items,
            %item_type,
            elapsed_secs = elapsed,
            rate,
            "timed job section"
        );

        Some(out)
    }

    /// Report progress for one component of this job.
    ///
    /// `key` identifies the component, reporting again under the same key
    /// replaces the earlier value. Values outside of [0, 1] are ignored.
    pub fn report_progress(&self, progress: f64, key: u64) {
        if !(0.0..=1.0).contains(&progress) {
            warn!(job_id = self.inner.id, progress, key, "ignoring out of range progress report");
            return;
        }

        let (current, observers) = self.inner.state.locked(|state| {
            state.progress.insert(key, progress);
            let current = mean(&state.progress);

            let mut live = Vec::with_capacity(state.observers.len());
            state.observers.retain(|(_, weak)| match weak.upgrade() {
                Some(observer) => {
                    live.push(observer);
                    true
                }
                None => false,
            });

            (current, live)
        });

        for observer in observers {
            observer.job_progress(self, current);
        }

        if let Some(parent) = &self.inner.parent {
            parent.report_progress(current, self.inner.id);
        }
    }

    /// Mean of all reported progress components, 0 when nothing was reported.
    pub fn progress(&self) -> f64 {
        self.inner.state.read(|state| mean(&state.progress))
    }

    /// Register an observer. The job only holds a weak reference.
    pub fn add_observer(&self, observer: &Arc<dyn JobObserver>) -> ObserverToken {
        self.inner.state.locked(|state| {
            let token = ObserverToken(state.next_token);
            state.next_token += 1;
            state.observers.push((token, Arc::downgrade(observer)));
            token
        })
    }

    pub fn remove_observer(&self, token: ObserverToken) {
        self.inner
            .state
            .locked(|state| state.observers.retain(|(t, _)| *t != token));
    }

    /// Emit a debug log line tagged with this job's id.
    pub fn log(&self, message: impl fmt::Display) {
        debug!(job_id = self.inner.id, "{message}");
    }
}

fn mean(components: &HashMap<u64, f64>) -> f64 {
    if components.is_empty() {
        return 0.0;
    }
    components.values().sum::<f64>() / components.len() as f64
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.inner.id)
            .field("qos", &self.inner.queue.qos())
            .field("cancelled", &self.is_cancelled())
            .field("parent", &self.inner.parent.as_ref().map(|p| p.id()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    struct RecordingObserver {
        seen: parking_lot::Mutex<Vec<f64>>,
    }

    impl JobObserver for RecordingObserver {
        fn job_progress(&self, _job: &Job, progress: f64) {
            self.seen.lock().push(progress);
        }
    }

    #[test]
    fn progress_is_mean_of_components() {
        let job = Job::new(Qos::UserInitiated);
        assert_eq!(0.0, job.progress());

        job.report_progress(0.5, 1);
        job.report_progress(1.0, 2);
        assert_eq!(0.75, job.progress());
    }

    #[test]
    fn out_of_range_progress_ignored() {
        let job = Job::new(Qos::UserInitiated);
        job.report_progress(0.5, 1);
        job.report_progress(1.5, 2);
        job.report_progress(-0.1, 3);
        job.report_progress(f64::NAN, 4);
        assert_eq!(0.5, job.progress());
    }

    #[test]
    fn child_progress_propagates() {
        let parent = Job::new(Qos::UserInitiated);
        let a = Job::child(&parent);
        let b = Job::child(&parent);

        a.report_progress(1.0, 1);
        b.report_progress(0.25, 1);
        b.report_progress(0.75, 2);

        assert_eq!(0.5, b.progress());
        assert_eq!(0.75, parent.progress());
    }

    #[test]
    fn observers_notified_and_removed() {
        let job = Job::new(Qos::UserInitiated);
        let recording = Arc::new(RecordingObserver {
            seen: parking_lot::Mutex::new(Vec::new()),
        });
        let observer: Arc<dyn JobObserver> = recording.clone();

        let token = job.add_observer(&observer);
        job.report_progress(0.2, 1);
        job.remove_observer(token);
        job.report_progress(0.4, 1);

        assert_eq!(vec![0.2], *recording.seen.lock());
    }

    #[test]
    fn dropped_observer_not_kept_alive() {
        let job = Job::new(Qos::UserInitiated);
        let observer: Arc<dyn JobObserver> = Arc::new(RecordingObserver {
            seen: parking_lot::Mutex::new(Vec::new()),
        });
        let weak = Arc::downgrade(&observer);
        job.add_observer(&observer);
        drop(observer);

        job.report_progress(0.3, 1);
        assert!(weak.upgrade().is_none());
        assert!(job.inner.state.read(|s| s.observers.is_empty()));
    }

    #[test]
    fn cancel_is_idempotent() {
        let job = Job::new(Qos::Background);
        job.cancel();
        job.cancel();
        assert!(job.is_cancelled());
    }

    #[test]
    fn spawn_runs_block() {
        let job = Job::new(Qos::UserInitiated);
        let (tx, rx) = mpsc::channel();
        job.spawn(move || tx.send(42).unwrap());
        assert_eq!(42, rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn spawn_skipped_when_parent_cancelled() {
        let parent = Job::new(Qos::UserInitiated);
        let child = Job::child(&parent);
        parent.cancel();

        let (tx, rx) = mpsc::channel::<()>();
        child.spawn(move || tx.send(()).unwrap());
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn spawn_checks_only_immediate_parent() {
        let root = Job::new(Qos::UserInitiated);
        let middle = Job::child(&root);
        let leaf = Job::child(&middle);
        root.cancel();

        let (tx, rx) = mpsc::channel();
        leaf.spawn(move || tx.send(1).unwrap());
        assert_eq!(1, rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn time_skips_cancelled() {
        let job = Job::new(Qos::UserInitiated);
        assert_eq!(Some(3), job.time("add", 2, "numbers", || 1 + 2));
        job.cancel();
        assert_eq!(None, job.time("add", 2, "numbers", || 1 + 2));
    }
}
