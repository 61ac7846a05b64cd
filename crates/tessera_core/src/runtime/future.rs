use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::oneshot;
use tracing::{debug, warn};

use super::job::Job;
use super::mutex::Mutex;
use super::scheduler::Qos;

/// Consumer of a future's value.
pub type Callback<T> = Box<dyn FnOnce(T) + Send + 'static>;

/// Computes the value of a future. Receives the batch's job for progress and
/// cancellation checks, and must hand the result to the satisfier.
pub type Producer<T> = Box<dyn FnOnce(&Job, Satisfier<T>) + Send + 'static>;

/// Lazily computed, memoized value with any number of consumers.
///
/// The producer runs at most once, the first time `get` is called. Every
/// consumer sees the same value. Once a result has been delivered it stays
/// cached, a new future has to be created to compute it again.
pub struct Future<T> {
    time_limit: Option<Duration>,
    state: Mutex<FutureState<T>>,
}

struct FutureState<T> {
    producer: Option<Producer<T>>,
    batch: Option<Arc<Batch<T>>>,
}

impl<T> Future<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(producer: impl FnOnce(&Job, Satisfier<T>) + Send + 'static) -> Self {
        Future {
            time_limit: None,
            state: Mutex::new(FutureState {
                producer: Some(Box::new(producer)),
                batch: None,
            }),
        }
    }

    /// Create a future whose batch expires once `limit` has elapsed.
    pub fn with_time_limit(
        producer: impl FnOnce(&Job, Satisfier<T>) + Send + 'static,
        limit: Duration,
    ) -> Self {
        let mut future = Self::new(producer);
        future.time_limit = Some(limit);
        future
    }

    /// A future that is already resolved to `value`.
    pub fn ready(value: T) -> Self {
        Self::new(move |_, satisfier| satisfier.satisfy(value))
    }

    /// Request the value, starting the computation if this is the first
    /// request.
    ///
    /// When `job` is given the computation runs in a child of it, otherwise in
    /// a new root job. The callback is always invoked asynchronously on the
    /// batch's queue. The returned batch can be used to cancel or to observe
    /// progress.
    pub fn get(
        &self,
        job: Option<&Job>,
        callback: impl FnOnce(T) + Send + 'static,
    ) -> Arc<Batch<T>> {
        let (batch, producer) = self.state.locked(|state| {
            if let Some(batch) = &state.batch {
                return (batch.clone(), None);
            }
            let batch_job = match job {
                Some(parent) => Job::child(parent),
                None => Job::new(Qos::UserInitiated),
            };
            let batch = Arc::new(Batch::new(batch_job));
            state.batch = Some(batch.clone());
            (batch, state.producer.take())
        });

        batch.enqueue(Box::new(callback));

        if let Some(producer) = producer {
            if let Some(limit) = self.time_limit {
                start_expiry_timer(&batch, limit);
            }
            producer(&batch.job, Satisfier {
                batch: batch.clone(),
            });
        }

        batch
    }

    /// Request the value as a rust future.
    ///
    /// Resolves to None if the batch was cancelled before delivering.
    pub fn get_async(
        &self,
        job: Option<&Job>,
    ) -> impl std::future::Future<Output = Option<T>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        self.get(job, move |value| {
            let _ = tx.send(value);
        });
        async move { rx.await.ok() }
    }

    /// Block the current thread until the value is available.
    ///
    /// Meant for binaries and tests sitting outside of the engine.
    pub fn wait(&self, job: Option<&Job>) -> Option<T> {
        futures::executor::block_on(self.get_async(job))
    }

    /// Cancel the current computation, if any. Waiting consumers are dropped.
    pub fn cancel(&self) {
        if let Some(batch) = self.current_batch() {
            batch.cancel();
        }
    }

    /// Expire the current computation, if any. Waiting consumers are kept.
    pub fn expire(&self) {
        if let Some(batch) = self.current_batch() {
            batch.expire();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.current_batch()
            .map(|b| b.is_cancelled())
            .unwrap_or(false)
    }

    /// The cached result, None if not computed yet.
    pub fn result(&self) -> Option<T> {
        self.current_batch().and_then(|b| b.cached())
    }

    fn current_batch(&self) -> Option<Arc<Batch<T>>> {
        self.state.read(|state| state.batch.clone())
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("time_limit", &self.time_limit)
            .finish_non_exhaustive()
    }
}

fn start_expiry_timer<T>(batch: &Arc<Batch<T>>, limit: Duration)
where
    T: Clone + Send + 'static,
{
    let weak = Arc::downgrade(batch);
    let spawned = std::thread::Builder::new()
        .name("tessera_timer".to_string())
        .spawn(move || {
            std::thread::sleep(limit);
            if let Some(batch) = weak.upgrade() {
                batch.job.log(format_args!("timed out after {limit:?}"));
                batch.expire();
            }
        });
    if let Err(e) = spawned {
        warn!(%e, "failed to start expiry timer");
    }
}

/// Hands a produced value to the batch. Can only be used once.
pub struct Satisfier<T> {
    batch: Arc<Batch<T>>,
}

impl<T> Satisfier<T>
where
    T: Clone + Send + 'static,
{
    pub fn satisfy(self, value: T) {
        self.batch.satisfy(value)
    }

    pub fn job(&self) -> &Job {
        &self.batch.job
    }
}

/// A satisfier dropped without delivering cancels its batch, so waiting
/// consumers are released instead of waiting forever.
impl<T> Drop for Satisfier<T> {
    fn drop(&mut self) {
        self.batch.cancel();
    }
}

impl<T> fmt::Debug for Satisfier<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Satisfier")
            .field("job", &self.batch.job)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Pending,
    /// Cancelled but consumers already waiting still receive the value.
    Expired,
    /// Consumers dropped, nothing will be delivered.
    Cancelled,
    Satisfied,
}

/// A single attempt at computing a future's value.
///
/// Derefs to the job the producer runs under.
pub struct Batch<T> {
    job: Job,
    state: Mutex<BatchState<T>>,
}

struct BatchState<T> {
    status: BatchStatus,
    satisfied: bool,
    cached: Option<T>,
    waiting: Vec<Callback<T>>,
}

impl<T> Batch<T>
where
    T: Clone + Send + 'static,
{
    fn new(job: Job) -> Self {
        Batch {
            job,
            state: Mutex::new(BatchState {
                status: BatchStatus::Pending,
                satisfied: false,
                cached: None,
                waiting: Vec::new(),
            }),
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn status(&self) -> BatchStatus {
        self.state.read(|s| s.status)
    }

    pub fn cached(&self) -> Option<T> {
        self.state.read(|s| s.cached.clone())
    }

    /// Deliver the value to every waiting consumer.
    ///
    /// # Panics
    ///
    /// Panics if the batch was already satisfied.
    pub fn satisfy(&self, value: T) {
        let waiting = self.state.locked(|state| {
            if state.satisfied {
                panic!("batch for job {} satisfied more than once", self.job.id());
            }
            state.satisfied = true;

            if state.status == BatchStatus::Cancelled {
                return None;
            }
            state.status = BatchStatus::Satisfied;
            state.cached = Some(value.clone());
            Some(std::mem::take(&mut state.waiting))
        });

        match waiting {
            Some(waiting) => {
                for callback in waiting {
                    let value = value.clone();
                    self.job.queue().spawn(move || callback(value));
                }
            }
            None => debug!(job_id = self.job.id(), "discarding value for cancelled batch"),
        }
    }

    /// Mark the job cancelled before satisfaction but keep waiting consumers
    /// so a cooperating producer can still deliver a partial result.
    pub fn expire(&self) {
        let expired = self.state.locked(|state| {
            if state.satisfied || state.status == BatchStatus::Cancelled {
                return false;
            }
            state.status = BatchStatus::Expired;
            true
        });
        if expired {
            self.job.cancel();
        }
    }

    fn enqueue(&self, callback: Callback<T>) {
        let ready = self.state.locked(|state| match state.status {
            BatchStatus::Satisfied => Some((callback, state.cached.clone())),
            BatchStatus::Cancelled => {
                debug!(job_id = self.job.id(), "dropping consumer of cancelled batch");
                None
            }
            BatchStatus::Pending | BatchStatus::Expired => {
                state.waiting.push(callback);
                None
            }
        });

        if let Some((callback, Some(value))) = ready {
            self.job.queue().spawn(move || callback(value));
        }
    }
}

impl<T> Batch<T> {
    /// Cancel before satisfaction, dropping all waiting consumers.
    pub fn cancel(&self) {
        let dropped = self.state.locked(|state| {
            if state.satisfied {
                return None;
            }
            state.status = BatchStatus::Cancelled;
            Some(std::mem::take(&mut state.waiting))
        });
        if let Some(dropped) = dropped {
            debug!(job_id = self.job.id(), dropped = dropped.len(), "batch cancelled");
            self.job.cancel();
        }
    }
}

impl<T> Deref for Batch<T> {
    type Target = Job;

    fn deref(&self) -> &Self::Target {
        &self.job
    }
}

impl<T> fmt::Debug for Batch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("job", &self.job)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn producer_runs_once_for_concurrent_gets() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();
        let future = Arc::new(Future::new(move |job: &Job, satisfier: Satisfier<i64>| {
            runs_clone.fetch_add(1, Ordering::SeqCst);
            job.spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                satisfier.satisfy(1337);
            });
        }));

        let (tx, rx) = mpsc::channel();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let future = future.clone();
                let tx = tx.clone();
                std::thread::spawn(move || {
                    future.get(None, move |v| tx.send(v).unwrap());
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        for _ in 0..8 {
            assert_eq!(1337, rx.recv_timeout(TIMEOUT).unwrap());
        }
        assert_eq!(1, runs.load(Ordering::SeqCst));
    }

    #[test]
    fn get_after_satisfied_uses_cache() {
        let future = Future::ready("cached".to_string());
        assert_eq!(Some("cached".to_string()), future.wait(None));
        assert_eq!(Some("cached".to_string()), future.result());

        let (tx, rx) = mpsc::channel();
        future.get(None, move |v| tx.send(v).unwrap());
        assert_eq!("cached", rx.recv_timeout(TIMEOUT).unwrap());
    }

    #[test]
    fn cancel_before_satisfaction_drops_consumers() {
        let (sat_tx, sat_rx) = mpsc::channel::<Satisfier<i32>>();
        let future = Future::new(move |_job: &Job, satisfier| {
            sat_tx.send(satisfier).unwrap();
        });

        let (tx, rx) = mpsc::channel();
        let batch = future.get(None, move |v| tx.send(v).unwrap());
        future.cancel();
        assert!(batch.is_cancelled());
        assert_eq!(BatchStatus::Cancelled, batch.status());

        // Producer delivers anyway.
        sat_rx.recv_timeout(TIMEOUT).unwrap().satisfy(4);
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn expire_before_satisfaction_still_delivers() {
        let (sat_tx, sat_rx) = mpsc::channel::<Satisfier<i32>>();
        let future = Future::new(move |_job: &Job, satisfier| {
            sat_tx.send(satisfier).unwrap();
        });

        let (tx, rx) = mpsc::channel();
        let batch = future.get(None, move |v| tx.send(v).unwrap());
        future.expire();
        assert!(batch.is_cancelled());
        assert_eq!(BatchStatus::Expired, batch.status());

        sat_rx.recv_timeout(TIMEOUT).unwrap().satisfy(4);
        assert_eq!(4, rx.recv_timeout(TIMEOUT).unwrap());
    }

    #[test]
    fn time_limit_expires_batch() {
        let (sat_tx, sat_rx) = mpsc::channel::<Satisfier<i32>>();
        let future = Future::with_time_limit(
            move |_job: &Job, satisfier| {
                sat_tx.send(satisfier).unwrap();
            },
            Duration::from_millis(20),
        );

        let (tx, rx) = mpsc::channel();
        let batch = future.get(None, move |v| tx.send(v).unwrap());
        let satisfier = sat_rx.recv_timeout(TIMEOUT).unwrap();

        let deadline = std::time::Instant::now() + TIMEOUT;
        while !satisfier.job().is_cancelled() {
            assert!(std::time::Instant::now() < deadline, "batch never expired");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(BatchStatus::Expired, batch.status());

        satisfier.satisfy(9);
        assert_eq!(9, rx.recv_timeout(TIMEOUT).unwrap());
    }

    #[test]
    #[should_panic]
    fn satisfy_twice_panics() {
        let future = Future::ready(1);
        let batch = future.get(None, |_| {});
        batch.satisfy(2);
    }

    #[test]
    fn child_of_given_job() {
        let parent = Job::new(Qos::Background);
        let future = Future::ready(3);
        let batch = future.get(Some(&parent), |_| {});
        assert_eq!(Some(parent.id()), batch.parent().map(|p| p.id()));
        assert_eq!(Qos::Background, batch.queue().qos());
    }

    #[test]
    fn get_async_resolves() {
        let future = Future::new(|job: &Job, satisfier: Satisfier<u8>| {
            job.spawn(move || satisfier.satisfy(7));
        });
        let v = futures::executor::block_on(future.get_async(None));
        assert_eq!(Some(7), v);
    }

    #[test]
    fn get_async_cancelled_resolves_none() {
        let (sat_tx, sat_rx) = mpsc::channel::<Satisfier<u8>>();
        let future = Future::new(move |_job: &Job, satisfier| {
            sat_tx.send(satisfier).unwrap();
        });
        let pending = future.get_async(None);
        future.cancel();
        drop(sat_rx);
        assert_eq!(None, futures::executor::block_on(pending));
    }

    #[test]
    fn dropped_satisfier_releases_consumers() {
        let future = Future::new(|_job: &Job, satisfier: Satisfier<u8>| drop(satisfier));
        assert_eq!(None, future.wait(None));
        assert!(future.is_cancelled());
    }

    #[test]
    fn satisfier_dropped_after_delivery_keeps_value() {
        let future = Future::new(|job: &Job, satisfier: Satisfier<u8>| {
            job.spawn(move || satisfier.satisfy(3));
        });
        assert_eq!(Some(3), future.wait(None));
        assert!(!future.is_cancelled());
        assert_eq!(Some(3), future.result());
    }
}
