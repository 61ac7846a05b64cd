use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tessera_core::column::Column;
use tessera_core::runtime::job::Job;
use tessera_core::stream::{ColumnsCallback, FetchCallback, Stream, StreamRef, StreamStatus};
use tessera_core::value::Value;
use tessera_error::{EngineError, Result};
use tracing::trace;

use crate::document::{Document, field, json_to_value};
use crate::store::{Continuation, DocumentStore, Response};
use crate::term::Query;

/// Cursor over the results of a document query.
///
/// Pages are requested from the store on demand, one at a time. Concurrent
/// requests queue up and are answered in order on the requesting job's queue.
pub struct DocumentStream {
    inner: Arc<CursorInner>,
}

struct CursorInner {
    store: Arc<DocumentStore>,
    query: Query,
    known_columns: Option<Vec<Column>>,
    state: Mutex<CursorState>,
}

#[derive(Default)]
struct CursorState {
    columns: Option<Vec<Column>>,
    pages: VecDeque<Vec<Vec<Value>>>,
    continuation: Option<Continuation>,
    started: bool,
    in_flight: bool,
    done: bool,
    failed: Option<EngineError>,
    requests: VecDeque<(Job, Request)>,
}

enum Request {
    Columns(ColumnsCallback),
    Fetch(FetchCallback),
}

enum Reply {
    Columns(ColumnsCallback, Result<Vec<Column>>),
    Fetch(FetchCallback, Result<(Vec<Vec<Value>>, StreamStatus)>),
}

impl Reply {
    fn deliver(self, job: Job) {
        job.spawn(move || match self {
            Reply::Columns(cb, result) => cb(result),
            Reply::Fetch(cb, result) => cb(result),
        });
    }
}

/// Next page the cursor has to ask the store for.
enum Pull {
    Start(Job),
    Continue(Job, Continuation),
}

impl CursorState {
    fn drain(&mut self) -> Vec<(Job, Reply)> {
        let mut replies = Vec::new();
        while let Some((job, request)) = self.requests.pop_front() {
            let reply = match request {
                Request::Columns(cb) => match (&self.columns, &self.failed) {
                    (Some(columns), _) => Reply::Columns(cb, Ok(columns.clone())),
                    (None, Some(e)) => Reply::Columns(cb, Err(e.clone())),
                    (None, None) => {
                        self.requests.push_front((job, Request::Columns(cb)));
                        break;
                    }
                },
                Request::Fetch(cb) => {
                    if let Some(rows) = self.pages.pop_front() {
                        let status = if self.done && self.pages.is_empty() {
                            StreamStatus::Finished
                        } else {
                            StreamStatus::HasMore
                        };
                        Reply::Fetch(cb, Ok((rows, status)))
                    } else if let Some(e) = &self.failed {
                        Reply::Fetch(cb, Err(e.clone()))
                    } else if self.done {
                        Reply::Fetch(cb, Ok((Vec::new(), StreamStatus::Finished)))
                    } else {
                        self.requests.push_front((job, Request::Fetch(cb)));
                        break;
                    }
                }
            };
            replies.push((job, reply));
        }
        replies
    }

    /// Pull the next page if a request is waiting on it and none is underway.
    fn next_pull(&mut self) -> Option<Pull> {
        if self.in_flight || self.done || self.failed.is_some() {
            return None;
        }
        let job = self.requests.front().map(|(job, _)| job.clone())?;
        let pull = if !self.started {
            self.started = true;
            Pull::Start(job)
        } else {
            Pull::Continue(job, self.continuation.take()?)
        };
        self.in_flight = true;
        Some(pull)
    }

    fn ingest(&mut self, result: Result<Response>) {
        self.in_flight = false;
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.failed = Some(e);
                return;
            }
        };

        let columns = self
            .columns
            .get_or_insert_with(|| columns_of(&response.documents))
            .clone();
        let rows: Vec<Vec<Value>> = response
            .documents
            .iter()
            .map(|doc| document_row(doc, &columns))
            .collect();
        trace!(rows = rows.len(), more = response.continuation.is_some(), "received document page");

        if !rows.is_empty() {
            self.pages.push_back(rows);
        }
        self.done = response.continuation.is_none();
        self.continuation = response.continuation;
    }
}

fn columns_of(documents: &[Document]) -> Vec<Column> {
    let names: BTreeSet<&String> = documents.iter().flat_map(|d| d.keys()).collect();
    names.into_iter().map(Column::new).collect()
}

fn document_row(document: &Document, columns: &[Column]) -> Vec<Value> {
    columns
        .iter()
        .map(|c| json_to_value(field(document, c.name())))
        .collect()
}

impl CursorInner {
    fn update(self: &Arc<Self>, update: impl FnOnce(&mut CursorState)) {
        let (replies, pull) = {
            let mut state = self.state.lock();
            update(&mut state);
            let replies = state.drain();
            (replies, state.next_pull())
        };
        for (job, reply) in replies {
            reply.deliver(job);
        }
        if let Some(pull) = pull {
            self.pull(pull);
        }
    }

    fn pull(self: &Arc<Self>, pull: Pull) {
        let weak = Arc::downgrade(self);
        match pull {
            Pull::Start(job) => self.store.run(self.query.clone(), &job, on_response(weak)),
            Pull::Continue(job, continuation) => continuation.next(&job, on_response(weak)),
        }
    }
}

fn on_response(cursor: Weak<CursorInner>) -> Box<dyn FnOnce(Result<Response>) + Send> {
    Box::new(move |result| {
        if let Some(cursor) = cursor.upgrade() {
            cursor.update(|state| state.ingest(result));
        }
    })
}

impl DocumentStream {
    /// Stream over `query`. Without `columns` they are taken from the fields
    /// of the first page.
    pub fn new(store: Arc<DocumentStore>, query: Query, columns: Option<Vec<Column>>) -> Self {
        let state = CursorState {
            columns: columns.clone(),
            ..CursorState::default()
        };
        DocumentStream {
            inner: Arc::new(CursorInner {
                store,
                query,
                known_columns: columns,
                state: Mutex::new(state),
            }),
        }
    }

    fn request(&self, job: &Job, request: Request) {
        self.inner
            .update(|state| state.requests.push_back((job.clone(), request)));
    }
}

impl Stream for DocumentStream {
    fn columns(&self, job: &Job, callback: ColumnsCallback) {
        self.request(job, Request::Columns(callback))
    }

    fn fetch(&self, job: &Job, callback: FetchCallback) {
        self.request(job, Request::Fetch(callback))
    }

    fn clone_stream(&self) -> StreamRef {
        Arc::new(DocumentStream::new(
            self.inner.store.clone(),
            self.inner.query.clone(),
            self.inner.known_columns.clone(),
        ))
    }
}

impl fmt::Debug for DocumentStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentStream")
            .field("query", &self.inner.query)
            .finish_non_exhaustive()
    }
}
