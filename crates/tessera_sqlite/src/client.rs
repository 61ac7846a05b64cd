use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

use futures::channel::oneshot;
use rusqlite::{Connection, OpenFlags};
use tessera_error::{EngineError, Result, ResultExt};
use tracing::debug;

type Call = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

/// Handle to a SQLite connection owned by a dedicated thread.
///
/// Every call is executed on that thread in submission order. The thread
/// exits once all handles are dropped.
#[derive(Clone)]
pub struct SqliteClient {
    path: Arc<str>,
    tx: mpsc::Sender<Call>,
}

impl fmt::Debug for SqliteClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SqliteClient({})", self.path)
    }
}

impl SqliteClient {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .context_fn(|| format!("Failed to open sqlite database at {}", path.display()))?;
        Self::spawn(path.to_string_lossy().as_ref(), conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory sqlite database")?;
        Self::spawn(":memory:", conn)
    }

    fn spawn(path: &str, mut conn: Connection) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Call>();
        let thread_path = path.to_string();
        thread::Builder::new()
            .name("tessera-sqlite".to_string())
            .spawn(move || {
                while let Ok(call) = rx.recv() {
                    call(&mut conn);
                }
                debug!(path = %thread_path, "sqlite connection closed");
            })
            .context("Failed to spawn sqlite connection thread")?;

        debug!(%path, "opened sqlite connection");
        Ok(SqliteClient {
            path: Arc::from(path),
            tx,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Queue `f` on the connection thread without waiting for it.
    pub fn submit(&self, f: impl FnOnce(&mut Connection) + Send + 'static) -> Result<()> {
        self.tx
            .send(Box::new(f))
            .map_err(|_| EngineError::new("Sqlite connection thread has exited").with_field("path", &self.path))
    }

    /// Run `f` on the connection thread and block until it returns.
    pub fn call<R>(&self, f: impl FnOnce(&mut Connection) -> Result<R> + Send + 'static) -> Result<R>
    where
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(move |conn| {
            let _ = tx.send(f(conn));
        })?;
        futures::executor::block_on(rx)
            .map_err(|_| EngineError::new("Sqlite call dropped before completing").with_field("path", &self.path))?
    }

    pub fn execute_batch(&self, sql: impl Into<String>) -> Result<()> {
        let sql = sql.into();
        self.call(move |conn| {
            conn.execute_batch(&sql)
                .context_fn(|| format!("Failed to execute sql: {sql}"))
        })
    }
}
