//! Pull based row sources.
//!
//! A stream hands out rows in batches through `fetch`. Results are always
//! delivered through callbacks, and successive fetches on one stream are
//! delivered in the order they were requested.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tessera_error::{EngineError, Result};
use tracing::trace;

use crate::column::Column;
use crate::config::DEFAULT_BATCH_SIZE;
use crate::raster::Raster;
use crate::runtime::future::Future;
use crate::runtime::job::Job;
use crate::value::Value;

pub type StreamRef = Arc<dyn Stream>;

pub type ColumnsCallback = Box<dyn FnOnce(Result<Vec<Column>>) + Send + 'static>;
pub type FetchCallback = Box<dyn FnOnce(Result<(Vec<Vec<Value>>, StreamStatus)>) + Send + 'static>;
pub type RasterCallback = Box<dyn FnOnce(Result<Arc<Raster>>) + Send + 'static>;

/// Memoized raster computation shared between datasets and streams.
pub type RasterFuture = Future<Result<Arc<Raster>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    HasMore,
    Finished,
}

pub trait Stream: Send + Sync + fmt::Debug {
    /// Resolve the columns of this stream.
    fn columns(&self, job: &Job, callback: ColumnsCallback);

    /// Fetch the next batch of rows.
    fn fetch(&self, job: &Job, callback: FetchCallback);

    /// Independent cursor over the same source, starting from the beginning.
    fn clone_stream(&self) -> StreamRef;

    /// Number of rows this stream is expected to produce, if known.
    fn row_count_estimate(&self) -> Option<usize> {
        None
    }
}

/// Stream over an in-memory raster.
#[derive(Debug)]
pub struct RasterStream {
    raster: Arc<Raster>,
    batch_size: usize,
    position: Mutex<usize>,
}

impl RasterStream {
    pub fn new(raster: Arc<Raster>) -> Self {
        Self::with_batch_size(raster, DEFAULT_BATCH_SIZE)
    }

    pub fn with_batch_size(raster: Arc<Raster>, batch_size: usize) -> Self {
        RasterStream {
            raster,
            batch_size: batch_size.max(1),
            position: Mutex::new(0),
        }
    }

    fn next_batch(&self) -> (Vec<Vec<Value>>, StreamStatus) {
        let mut position = self.position.lock();
        next_batch_from(&self.raster, &mut position, self.batch_size)
    }
}

fn next_batch_from(
    raster: &Raster,
    position: &mut usize,
    batch_size: usize,
) -> (Vec<Vec<Value>>, StreamStatus) {
    let rows = raster.rows();
    let start = (*position).min(rows.len());
    let end = (start + batch_size).min(rows.len());
    *position = end;

    let status = if end >= rows.len() {
        StreamStatus::Finished
    } else {
        StreamStatus::HasMore
    };
    (rows[start..end].to_vec(), status)
}

impl Stream for RasterStream {
    fn columns(&self, _job: &Job, callback: ColumnsCallback) {
        callback(Ok(self.raster.columns().to_vec()))
    }

    fn fetch(&self, _job: &Job, callback: FetchCallback) {
        callback(Ok(self.next_batch()))
    }

    fn clone_stream(&self) -> StreamRef {
        Arc::new(RasterStream::with_batch_size(
            self.raster.clone(),
            self.batch_size,
        ))
    }

    fn row_count_estimate(&self) -> Option<usize> {
        Some(self.raster.row_count())
    }
}

/// Stream without columns or rows.
#[derive(Debug, Default)]
pub struct EmptyStream;

impl Stream for EmptyStream {
    fn columns(&self, _job: &Job, callback: ColumnsCallback) {
        callback(Ok(Vec::new()))
    }

    fn fetch(&self, _job: &Job, callback: FetchCallback) {
        callback(Ok((Vec::new(), StreamStatus::Finished)))
    }

    fn clone_stream(&self) -> StreamRef {
        Arc::new(EmptyStream)
    }

    fn row_count_estimate(&self) -> Option<usize> {
        Some(0)
    }
}

/// Stream that fails every request with the same error.
#[derive(Debug)]
pub struct ErrorStream {
    error: EngineError,
}

impl ErrorStream {
    pub fn new(error: EngineError) -> Self {
        ErrorStream { error }
    }
}

impl Stream for ErrorStream {
    fn columns(&self, _job: &Job, callback: ColumnsCallback) {
        callback(Err(self.error.clone()))
    }

    fn fetch(&self, _job: &Job, callback: FetchCallback) {
        callback(Err(self.error.clone()))
    }

    fn clone_stream(&self) -> StreamRef {
        Arc::new(ErrorStream::new(self.error.clone()))
    }
}

/// Stream over a raster that is computed on first use.
///
/// Requests made before the raster is available are queued and answered in
/// order once it resolves. Clones share the computation but not the cursor.
pub struct DeferredStream {
    future: Arc<RasterFuture>,
    batch_size: usize,
    state: Arc<Mutex<DeferredState>>,
}

#[derive(Default)]
struct DeferredState {
    resolved: Option<Result<Arc<Raster>>>,
    requested: bool,
    position: usize,
    pending: VecDeque<DeferredRequest>,
}

enum DeferredRequest {
    Columns(ColumnsCallback),
    Fetch(FetchCallback),
}

enum DeferredReply {
    Columns(ColumnsCallback, Result<Vec<Column>>),
    Fetch(FetchCallback, Result<(Vec<Vec<Value>>, StreamStatus)>),
}

impl DeferredReply {
    fn deliver(self) {
        match self {
            DeferredReply::Columns(cb, result) => cb(result),
            DeferredReply::Fetch(cb, result) => cb(result),
        }
    }
}

impl DeferredState {
    fn answer(&mut self, request: DeferredRequest, batch_size: usize) -> Option<DeferredReply> {
        let resolved = match &self.resolved {
            Some(resolved) => resolved.clone(),
            None => {
                self.pending.push_back(request);
                return None;
            }
        };
        let reply = match request {
            DeferredRequest::Columns(cb) => {
                DeferredReply::Columns(cb, resolved.map(|r| r.columns().to_vec()))
            }
            DeferredRequest::Fetch(cb) => {
                let result =
                    resolved.map(|r| next_batch_from(&r, &mut self.position, batch_size));
                DeferredReply::Fetch(cb, result)
            }
        };
        Some(reply)
    }
}

impl DeferredStream {
    pub fn new(future: Arc<RasterFuture>) -> Self {
        Self::with_batch_size(future, DEFAULT_BATCH_SIZE)
    }

    pub fn with_batch_size(future: Arc<RasterFuture>, batch_size: usize) -> Self {
        DeferredStream {
            future,
            batch_size: batch_size.max(1),
            state: Arc::new(Mutex::new(DeferredState::default())),
        }
    }

    fn request(&self, job: &Job, request: DeferredRequest) {
        let (reply, start) = {
            let mut state = self.state.lock();
            let reply = state.answer(request, self.batch_size);
            let start = reply.is_none() && !state.requested;
            if start {
                state.requested = true;
            }
            (reply, start)
        };

        if let Some(reply) = reply {
            reply.deliver();
            return;
        }

        if start {
            let state = self.state.clone();
            let batch_size = self.batch_size;
            self.future.get(Some(job), move |result| {
                let mut replies = Vec::new();
                {
                    let mut guard = state.lock();
                    guard.resolved = Some(result);
                    let pending: Vec<_> = guard.pending.drain(..).collect();
                    for request in pending {
                        replies.extend(guard.answer(request, batch_size));
                    }
                }
                for reply in replies {
                    reply.deliver();
                }
            });
        }
    }
}

impl Stream for DeferredStream {
    fn columns(&self, job: &Job, callback: ColumnsCallback) {
        self.request(job, DeferredRequest::Columns(callback))
    }

    fn fetch(&self, job: &Job, callback: FetchCallback) {
        self.request(job, DeferredRequest::Fetch(callback))
    }

    fn clone_stream(&self) -> StreamRef {
        Arc::new(DeferredStream::with_batch_size(
            self.future.clone(),
            self.batch_size,
        ))
    }

    fn row_count_estimate(&self) -> Option<usize> {
        match &self.state.lock().resolved {
            Some(Ok(raster)) => Some(raster.row_count()),
            _ => None,
        }
    }
}

impl fmt::Debug for DeferredStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredStream")
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

const COLLECT_PROGRESS_KEY: u64 = 0;

struct CollectState {
    raster: Raster,
    callback: Option<RasterCallback>,
}

/// Drive `stream` until it is finished and collect all rows into a raster.
///
/// Fails as soon as the stream fails. When the job is cancelled collection
/// stops and the callback is never invoked.
pub fn collect(stream: StreamRef, job: &Job, callback: RasterCallback) {
    let columns_job = job.clone();
    let columns_stream = stream.clone();
    stream.columns(
        job,
        Box::new(move |result| {
            let columns = match result {
                Ok(columns) => columns,
                Err(e) => {
                    callback(Err(e));
                    return;
                }
            };
            let raster = match Raster::try_new(columns, Vec::new()) {
                Ok(raster) => raster,
                Err(e) => {
                    callback(Err(e));
                    return;
                }
            };
            let state = Arc::new(Mutex::new(CollectState {
                raster,
                callback: Some(callback),
            }));
            fetch_next(columns_stream, columns_job, state);
        }),
    );
}

fn fetch_next(stream: StreamRef, job: Job, state: Arc<Mutex<CollectState>>) {
    // Each round trips through the queue to keep the stack flat for streams
    // that answer inline.
    let spawn_job = job.clone();
    spawn_job.spawn(move || {
        let next_stream = stream.clone();
        let next_job = job.clone();
        stream.fetch(
            &job,
            Box::new(move |result| {
                let (rows, status) = match result {
                    Ok(fetched) => fetched,
                    Err(e) => {
                        if let Some(cb) = state.lock().callback.take() {
                            cb(Err(e));
                        }
                        return;
                    }
                };

                let push_result = {
                    let mut guard = state.lock();
                    guard.raster.push_rows(rows)
                };
                if let Err(e) = push_result {
                    if let Some(cb) = state.lock().callback.take() {
                        cb(Err(e));
                    }
                    return;
                }

                let collected = state.lock().raster.row_count();
                if let Some(estimate) = next_stream.row_count_estimate() {
                    if estimate > 0 {
                        let progress = (collected as f64 / estimate as f64).min(1.0);
                        next_job.report_progress(progress, COLLECT_PROGRESS_KEY);
                    }
                }
                trace!(job_id = next_job.id(), collected, ?status, "collected stream batch");

                match status {
                    StreamStatus::HasMore => {
                        if next_job.is_cancelled() {
                            return;
                        }
                        fetch_next(next_stream, next_job, state);
                    }
                    StreamStatus::Finished => {
                        let (raster, cb) = {
                            let mut guard = state.lock();
                            (std::mem::take(&mut guard.raster), guard.callback.take())
                        };
                        if let Some(cb) = cb {
                            cb(Ok(Arc::new(raster)));
                        }
                    }
                }
            }),
        );
    });
}

/// Collect a stream into a memoized future.
pub fn collect_future(stream: StreamRef) -> RasterFuture {
    Future::new(move |job, satisfier| {
        collect(stream, job, Box::new(move |result| satisfier.satisfy(result)));
    })
}
