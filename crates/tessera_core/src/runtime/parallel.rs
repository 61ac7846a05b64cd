use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use super::future::{Future, Satisfier};
use super::job::Job;
use crate::config::DEFAULT_BATCH_SIZE;

/// Chunk size used when none is configured.
pub const DEFAULT_CHUNK_SIZE: usize = DEFAULT_BATCH_SIZE / 8;

const PROGRESS_KEY: u64 = 1;

/// Map chunks of `items` concurrently, then fold the chunk results in order.
///
/// Chunks are mapped on the queue of the job the returned future is requested
/// with, and each chunk checks for cancellation before running. Once every
/// chunk has finished the mapped values are reduced sequentially, in chunk
/// order, with `reduce(mapped, accumulated)`. A cancelled computation never
/// delivers: skipped chunks drop the satisfier, which cancels the batch and
/// releases its consumers, so `wait` returns None. Empty input resolves to
/// None.
pub fn parallel_map_reduce<I, M, R, FM, FR>(
    items: Vec<I>,
    chunk_size: usize,
    map: FM,
    reduce: FR,
) -> Future<Option<R>>
where
    I: Send + Sync + 'static,
    M: Send + 'static,
    R: Clone + Send + 'static,
    FM: Fn(&[I]) -> M + Send + Sync + 'static,
    FR: FnMut(M, Option<R>) -> R + Send + 'static,
{
    Future::new(move |job: &Job, satisfier: Satisfier<Option<R>>| {
        if items.is_empty() {
            satisfier.satisfy(None);
            return;
        }

        let chunk_size = chunk_size.max(1);
        let num_chunks = items.len().div_ceil(chunk_size);
        trace!(job_id = job.id(), items = items.len(), num_chunks, "starting parallel map");

        let state = Arc::new(MapReduceState {
            items,
            chunk_size,
            map,
            reduce: Mutex::new(Some(reduce)),
            results: Mutex::new((0..num_chunks).map(|_| None).collect()),
            finished_items: AtomicUsize::new(0),
            remaining_chunks: AtomicUsize::new(num_chunks),
            satisfier: Mutex::new(Some(satisfier)),
        });

        for chunk_idx in 0..num_chunks {
            let state = state.clone();
            let chunk_job = job.clone();
            job.spawn(move || state.map_chunk(&chunk_job, chunk_idx));
        }
    })
}

struct MapReduceState<I, M, R, FM, FR> {
    items: Vec<I>,
    chunk_size: usize,
    map: FM,
    reduce: Mutex<Option<FR>>,
    results: Mutex<Vec<Option<M>>>,
    finished_items: AtomicUsize,
    remaining_chunks: AtomicUsize,
    satisfier: Mutex<Option<Satisfier<Option<R>>>>,
}

impl<I, M, R, FM, FR> MapReduceState<I, M, R, FM, FR>
where
    I: Send + Sync + 'static,
    M: Send + 'static,
    R: Clone + Send + 'static,
    FM: Fn(&[I]) -> M + Send + Sync + 'static,
    FR: FnMut(M, Option<R>) -> R + Send + 'static,
{
    fn map_chunk(self: &Arc<Self>, job: &Job, chunk_idx: usize) {
        if job.is_cancelled() {
            return;
        }

        let start = chunk_idx * self.chunk_size;
        let end = usize::min(start + self.chunk_size, self.items.len());
        let mapped = (self.map)(&self.items[start..end]);

        {
            // Report under the lock so progress never goes backwards.
            let mut results = self.results.lock();
            results[chunk_idx] = Some(mapped);
            let finished =
                self.finished_items.fetch_add(end - start, Ordering::SeqCst) + (end - start);
            job.report_progress(finished as f64 / self.items.len() as f64, PROGRESS_KEY);
        }

        if self.remaining_chunks.fetch_sub(1, Ordering::SeqCst) == 1 {
            let state = self.clone();
            let reduce_job = job.clone();
            job.spawn(move || state.reduce_all(&reduce_job));
        }
    }

    fn reduce_all(&self, job: &Job) {
        if job.is_cancelled() {
            return;
        }

        let results = std::mem::take(&mut *self.results.lock());
        let mut reduce = match self.reduce.lock().take() {
            Some(reduce) => reduce,
            None => return,
        };

        let mut acc = None;
        for mapped in results.into_iter().flatten() {
            acc = Some(reduce(mapped, acc));
        }

        if let Some(satisfier) = self.satisfier.lock().take() {
            satisfier.satisfy(acc);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::runtime::scheduler::Qos;

    fn doubled_max(chunk_size: usize) -> Option<i64> {
        let items: Vec<i64> = (0..=5_000_000).collect();
        let future = parallel_map_reduce(
            items,
            chunk_size,
            |chunk: &[i64]| chunk.iter().map(|v| v * 2).collect::<Vec<_>>(),
            |mapped, acc: Option<i64>| {
                mapped
                    .into_iter()
                    .fold(acc.unwrap_or(i64::MIN), |max, v| max.max(v))
            },
        );

        let (tx, rx) = mpsc::channel();
        future.get(None, move |v| tx.send(v).unwrap());
        rx.recv_timeout(Duration::from_secs(60)).unwrap()
    }

    #[test]
    fn map_reduce_default_chunks() {
        assert_eq!(Some(10_000_000), doubled_max(DEFAULT_CHUNK_SIZE));
    }

    #[test]
    fn map_reduce_large_chunks() {
        assert_eq!(Some(10_000_000), doubled_max(1_000_003));
    }

    #[test]
    fn reduce_in_chunk_order() {
        let items: Vec<u32> = (0..100).collect();
        let future = parallel_map_reduce(
            items,
            7,
            |chunk: &[u32]| chunk.to_vec(),
            |mapped, acc: Option<Vec<u32>>| {
                let mut acc = acc.unwrap_or_default();
                acc.extend(mapped);
                acc
            },
        );
        let out = future.wait(None).unwrap().unwrap();
        assert_eq!((0..100).collect::<Vec<_>>(), out);
    }

    #[test]
    fn empty_input() {
        let future = parallel_map_reduce(
            Vec::<u8>::new(),
            4,
            |c: &[u8]| c.len(),
            |m, acc: Option<usize>| m + acc.unwrap_or(0),
        );
        assert_eq!(Some(None), future.wait(None));
    }

    #[test]
    fn reports_progress() {
        let job = Job::new(Qos::UserInitiated);
        let items: Vec<u32> = (0..64).collect();
        let future = parallel_map_reduce(
            items,
            8,
            |c: &[u32]| c.len(),
            |m, acc: Option<usize>| m + acc.unwrap_or(0),
        );

        let (tx, rx) = mpsc::channel();
        let batch = future.get(Some(&job), move |v| tx.send(v).unwrap());
        assert_eq!(Some(64), rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert_eq!(1.0, batch.progress());
        assert_eq!(1.0, job.progress());
    }

    #[test]
    fn cancelled_never_delivers() {
        let job = Job::new(Qos::UserInitiated);
        job.cancel();
        let items: Vec<u32> = (0..64).collect();
        let future = parallel_map_reduce(
            items,
            8,
            |c: &[u32]| c.len(),
            |m, acc: Option<usize>| m + acc.unwrap_or(0),
        );

        let (tx, rx) = mpsc::channel();
        future.get(Some(&job), move |v| tx.send(v).unwrap());
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn wait_on_cancelled_job_returns() {
        let job = Job::new(Qos::UserInitiated);
        job.cancel();
        let future = parallel_map_reduce(
            (0..64).collect::<Vec<u32>>(),
            8,
            |c: &[u32]| c.len(),
            |m, acc: Option<usize>| m + acc.unwrap_or(0),
        );
        assert_eq!(None, future.wait(Some(&job)));
        assert!(future.is_cancelled());
    }

    #[test]
    fn cancelled_while_mapping_releases_consumers() {
        let parent = Job::new(Qos::UserInitiated);
        let cancel = parent.clone();
        let future = parallel_map_reduce(
            (0..64).collect::<Vec<u32>>(),
            8,
            move |c: &[u32]| {
                if c[0] == 56 {
                    cancel.cancel();
                }
                c.len()
            },
            |m, acc: Option<usize>| m + acc.unwrap_or(0),
        );
        assert_eq!(None, future.wait(Some(&parent)));
    }
}
