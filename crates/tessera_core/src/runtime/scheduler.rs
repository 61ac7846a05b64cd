use std::fmt;
use std::sync::{Arc, OnceLock};

use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use tessera_error::{EngineError, Result};
use tracing::debug;

/// Quality of service for work submitted to a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Qos {
    /// Work a user is actively waiting on.
    #[default]
    UserInitiated,
    Background,
}

impl Qos {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "user_initiated" | "interactive" => Some(Qos::UserInitiated),
            "background" => Some(Qos::Background),
            _ => None,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Qos::UserInitiated => "user_initiated",
            Qos::Background => "background",
        }
    }
}

/// Worker pools keyed by quality of service.
pub struct Scheduler {
    user_initiated: Arc<ThreadPool>,
    background: Arc<ThreadPool>,
}

impl Scheduler {
    /// Create a scheduler sized to the number of cpus on the machine.
    pub fn try_new() -> Result<Self> {
        let threads = num_cpus::get();
        Self::try_with_threads(threads, threads.div_ceil(2))
    }

    pub fn try_with_threads(user_initiated: usize, background: usize) -> Result<Self> {
        debug!(user_initiated, background, "creating scheduler");
        Ok(Scheduler {
            user_initiated: Arc::new(build_pool("tessera_interactive", user_initiated)?),
            background: Arc::new(build_pool("tessera_background", background)?),
        })
    }

    /// The process wide scheduler used by root jobs that weren't given one.
    pub fn global() -> &'static Arc<Scheduler> {
        static GLOBAL: OnceLock<Arc<Scheduler>> = OnceLock::new();
        GLOBAL.get_or_init(|| match Scheduler::try_new() {
            Ok(s) => Arc::new(s),
            Err(e) => panic!("failed to build default scheduler: {e}"),
        })
    }

    pub fn queue(&self, qos: Qos) -> Queue {
        let pool = match qos {
            Qos::UserInitiated => self.user_initiated.clone(),
            Qos::Background => self.background.clone(),
        };
        Queue { pool, qos }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("user_initiated_threads", &self.user_initiated.current_num_threads())
            .field("background_threads", &self.background.current_num_threads())
            .finish_non_exhaustive()
    }
}

fn build_pool(prefix: &'static str, num_threads: usize) -> Result<ThreadPool> {
    ThreadPoolBuilder::new()
        .thread_name(move |idx| format!("{prefix}_{idx}"))
        .num_threads(num_threads.max(1))
        .build()
        .map_err(|e| EngineError::with_source("Failed to build thread pool", Box::new(e)))
}

/// Handle to one of the scheduler's pools.
#[derive(Clone)]
pub struct Queue {
    pool: Arc<ThreadPool>,
    qos: Qos,
}

impl Queue {
    pub fn qos(&self) -> Qos {
        self.qos
    }

    pub fn spawn(&self, f: impl FnOnce() + Send + 'static) {
        self.pool.spawn(f)
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("qos", &self.qos)
            .field("num_threads", &self.pool.current_num_threads())
            .finish()
    }
}
