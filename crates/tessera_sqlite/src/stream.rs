use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rusqlite::Connection;
use rusqlite::types::ValueRef;
use tessera_core::column::Column;
use tessera_core::runtime::job::Job;
use tessera_core::stream::{ColumnsCallback, FetchCallback, Stream, StreamRef, StreamStatus};
use tessera_core::value::Value;
use tessera_error::{EngineError, Result, ResultExt};
use tracing::{debug, trace};

use crate::client::SqliteClient;

static NEXT_CURSOR_ID: AtomicU64 = AtomicU64::new(1);

/// Stream over the results of one query.
///
/// On the first request the query is run once into a temporary table. Every
/// fetch then reads a single page of that table on the connection thread, so
/// at most one page is held in memory and other work on the connection runs
/// between pages. Requests are answered in the order they were made, on the
/// requesting job's queue. Dropping the stream drops the temporary table.
pub struct SqliteStream {
    cursor: Arc<Cursor>,
}

struct Cursor {
    client: SqliteClient,
    sql: Arc<str>,
    table: String,
    batch_size: usize,
    state: Mutex<CursorState>,
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

/// Work for the connection thread.
#[derive(Debug, Clone, Copy)]
enum Read {
    Create,
    Page { after: i64 },
}

struct Page {
    rows: Vec<Vec<Value>>,
    last_rowid: i64,
    more: bool,
}

#[derive(Default)]
struct CursorState {
    /// Creating the table was submitted.
    started: bool,
    created: bool,
    /// A read is queued or running on the connection thread.
    reading: bool,
    exhausted: bool,
    last_rowid: i64,
    columns: Option<Vec<Column>>,
    /// Page read ahead of the fetch it answers.
    page: Option<(Vec<Vec<Value>>, StreamStatus)>,
    failed: Option<EngineError>,
    requests: VecDeque<(Job, Request)>,
}

impl CursorState {
    /// Answer queued requests for as long as results are available.
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
                    if let Some(page) = self.page.take() {
                        Reply::Fetch(cb, Ok(page))
                    } else if let Some(e) = &self.failed {
                        Reply::Fetch(cb, Err(e.clone()))
                    } else if self.exhausted {
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

    /// The read needed to answer the oldest waiting request, if any.
    fn next_read(&mut self) -> Option<Read> {
        if self.reading || self.failed.is_some() || self.requests.is_empty() {
            return None;
        }
        if !self.created {
            if self.started {
                return None;
            }
            self.started = true;
            self.reading = true;
            return Some(Read::Create);
        }
        if self.exhausted || self.page.is_some() {
            return None;
        }
        self.reading = true;
        Some(Read::Page {
            after: self.last_rowid,
        })
    }

    fn apply_page(&mut self, page: Page) {
        self.last_rowid = page.last_rowid;
        self.exhausted = !page.more;
        let status = if page.more {
            StreamStatus::HasMore
        } else {
            StreamStatus::Finished
        };
        self.page = Some((page.rows, status));
    }
}

impl Cursor {
    /// Apply `update`, deliver whatever it unblocked and start the next read.
    fn update(self: &Arc<Self>, update: impl FnOnce(&mut CursorState)) {
        let (replies, read) = {
            let mut state = self.state.lock();
            update(&mut state);
            (state.drain(), state.next_read())
        };
        for (job, reply) in replies {
            reply.deliver(job);
        }
        if let Some(read) = read {
            self.submit(read);
        }
    }

    fn submit(self: &Arc<Self>, read: Read) {
        let cursor = Arc::downgrade(self);
        let sql = self.sql.clone();
        let table = self.table.clone();
        let batch_size = self.batch_size;
        trace!(%table, ?read, "submitting sqlite read");

        let submitted = self.client.submit(move |conn| {
            let step: Box<dyn FnOnce(&mut CursorState)> = match read {
                Read::Create => match create_table(conn, &table, &sql) {
                    Ok(columns) => Box::new(move |state| {
                        state.created = true;
                        state.columns = Some(columns);
                    }),
                    Err(e) => Box::new(move |state| state.failed = Some(e)),
                },
                Read::Page { after } => match read_page(conn, &table, after, batch_size) {
                    Ok(page) => Box::new(move |state| state.apply_page(page)),
                    Err(e) => Box::new(move |state| state.failed = Some(e)),
                },
            };
            match Weak::upgrade(&cursor) {
                Some(cursor) => cursor.update(move |state| {
                    state.reading = false;
                    step(state);
                }),
                None => trace!(%table, "sqlite stream dropped during read"),
            }
        });

        if let Err(e) = submitted {
            self.update(move |state| {
                state.reading = false;
                state.failed = Some(e);
            });
        }
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if !self.state.get_mut().started {
            return;
        }
        let table = std::mem::take(&mut self.table);
        let dropped = self.client.submit(move |conn| {
            if let Err(e) = conn.execute(&format!("DROP TABLE IF EXISTS temp.\"{table}\""), []) {
                debug!(%table, %e, "failed to drop sqlite cursor table");
            }
        });
        if dropped.is_err() {
            trace!("sqlite connection closed before cursor table was dropped");
        }
    }
}

fn create_table(conn: &Connection, table: &str, sql: &str) -> Result<Vec<Column>> {
    debug!(%sql, %table, "running sqlite query");
    conn.execute(&format!("CREATE TEMP TABLE \"{table}\" AS {sql}"), [])
        .context_fn(|| format!("Failed to run query: {sql}"))?;
    let stmt = conn
        .prepare(&format!("SELECT * FROM temp.\"{table}\" LIMIT 0"))
        .context("Failed to read result columns")?;
    Ok(stmt.column_names().into_iter().map(Column::new).collect())
}

/// Up to `batch_size` rows after `after`, in insertion order.
fn read_page(conn: &Connection, table: &str, after: i64, batch_size: usize) -> Result<Page> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT _rowid_, * FROM temp.\"{table}\" WHERE _rowid_ > ?1 ORDER BY _rowid_ LIMIT ?2"
        ))
        .context("Failed to prepare page query")?;
    let num_columns = stmt.column_count();
    // One extra row tells whether another page follows.
    let limit = i64::try_from(batch_size.saturating_add(1)).unwrap_or(i64::MAX);
    let mut rows = stmt
        .query(rusqlite::params![after, limit])
        .context("Failed to read page")?;

    let mut page = Page {
        rows: Vec::with_capacity(batch_size),
        last_rowid: after,
        more: false,
    };
    while let Some(row) = rows.next().context("Failed to read row")? {
        if page.rows.len() == batch_size {
            page.more = true;
            break;
        }
        page.last_rowid = row.get(0).context("Failed to read rowid")?;
        let values = (1..num_columns)
            .map(|idx| row.get_ref(idx).map(convert_value))
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read value")?;
        page.rows.push(values);
    }
    trace!(%table, rows = page.rows.len(), more = page.more, "read sqlite page");
    Ok(page)
}

fn convert_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Empty,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Double(f),
        ValueRef::Text(t) | ValueRef::Blob(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
    }
}

impl SqliteStream {
    pub fn new(client: SqliteClient, sql: impl Into<Arc<str>>, batch_size: usize) -> Self {
        let id = NEXT_CURSOR_ID.fetch_add(1, Ordering::Relaxed);
        SqliteStream {
            cursor: Arc::new(Cursor {
                client,
                sql: sql.into(),
                table: format!("tessera_cursor_{id}"),
                batch_size: batch_size.max(1),
                state: Mutex::new(CursorState::default()),
            }),
        }
    }

    pub fn sql(&self) -> &str {
        &self.cursor.sql
    }

    fn request(&self, job: &Job, request: Request) {
        self.cursor
            .update(|state| state.requests.push_back((job.clone(), request)));
    }
}

impl Stream for SqliteStream {
    fn columns(&self, job: &Job, callback: ColumnsCallback) {
        self.request(job, Request::Columns(callback))
    }

    fn fetch(&self, job: &Job, callback: FetchCallback) {
        self.request(job, Request::Fetch(callback))
    }

    fn clone_stream(&self) -> StreamRef {
        Arc::new(SqliteStream::new(
            self.cursor.client.clone(),
            self.cursor.sql.clone(),
            self.cursor.batch_size,
        ))
    }
}

impl fmt::Debug for SqliteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteStream")
            .field("sql", &self.cursor.sql)
            .field("batch_size", &self.cursor.batch_size)
            .finish_non_exhaustive()
    }
}
