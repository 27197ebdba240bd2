use std::env;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{JobError, Result, RoutineFault};

/// Callback invoked on the worker thread as soon as a routine faults.
pub type FaultHandler = Arc<dyn Fn(&RoutineFault) + Send + Sync>;

const DEFAULT_FLUSH_THRESHOLD: usize = 64;
const DEFAULT_IDLE_PARK: Duration = Duration::from_millis(1);
const DEFAULT_THREAD_PREFIX: &str = "jobflow-worker";
const DEFAULT_TRANSIENT_CAPACITY: usize = 256 << 20;
const DEFAULT_PERSISTENT_CAPACITY: usize = 1 << 30;

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn parsed_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Like [`parsed_or`], but zero also falls back to `default`.
fn positive_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: usize) -> usize {
    Some(parsed_or(lookup, key, default))
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

/// Byte budgets for the two allocation scopes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorConfig {
    pub transient_capacity_bytes: usize,
    pub persistent_capacity_bytes: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            transient_capacity_bytes: DEFAULT_TRANSIENT_CAPACITY,
            persistent_capacity_bytes: DEFAULT_PERSISTENT_CAPACITY,
        }
    }
}

#[derive(Clone)]
pub struct SchedulerConfig {
    /// Number of background worker threads.
    pub worker_count: usize,
    /// Unflushed submissions that trigger an automatic flush.
    pub flush_threshold: usize,
    /// Longest an idle worker sleeps before polling for unflushed work.
    pub idle_park_timeout: Duration,
    pub thread_name_prefix: String,
    pub allocator: AllocatorConfig,
    pub fault_handler: Option<FaultHandler>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            idle_park_timeout: DEFAULT_IDLE_PARK,
            thread_name_prefix: DEFAULT_THREAD_PREFIX.to_string(),
            allocator: AllocatorConfig::default(),
            fault_handler: None,
        }
    }
}

/// One worker per core, leaving a core for the scheduling thread.
fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

impl SchedulerConfig {
    /// Build config from `JOBFLOW_*` environment variables, falling back to
    /// defaults for anything missing, unparsable or out of range, so the
    /// result always passes [`validate`](Self::validate).
    pub fn from_env() -> Self {
        Self::from_vars(env_opt)
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let park_micros = parsed_or(
            &lookup,
            "JOBFLOW_IDLE_PARK_MICROS",
            defaults.idle_park_timeout.as_micros() as u64,
        );
        Self {
            worker_count: positive_or(&lookup, "JOBFLOW_WORKER_COUNT", defaults.worker_count),
            flush_threshold: positive_or(&lookup, "JOBFLOW_FLUSH_THRESHOLD", defaults.flush_threshold),
            idle_park_timeout: Duration::from_micros(park_micros),
            thread_name_prefix: lookup("JOBFLOW_THREAD_PREFIX")
                .unwrap_or(defaults.thread_name_prefix),
            allocator: AllocatorConfig {
                transient_capacity_bytes: parsed_or(
                    &lookup,
                    "JOBFLOW_TRANSIENT_CAPACITY",
                    defaults.allocator.transient_capacity_bytes,
                ),
                persistent_capacity_bytes: parsed_or(
                    &lookup,
                    "JOBFLOW_PERSISTENT_CAPACITY",
                    defaults.allocator.persistent_capacity_bytes,
                ),
            },
            fault_handler: None,
        }
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_fault_handler(mut self, handler: FaultHandler) -> Self {
        self.fault_handler = Some(handler);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(JobError::Configuration(
                "worker_count must be at least 1".into(),
            ));
        }
        if self.flush_threshold == 0 {
            return Err(JobError::Configuration(
                "flush_threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!(
            workers = self.worker_count,
            flush_threshold = self.flush_threshold,
            idle_park_us = self.idle_park_timeout.as_micros() as u64,
            transient_bytes = self.allocator.transient_capacity_bytes,
            persistent_bytes = self.allocator.persistent_capacity_bytes,
            "scheduler config"
        );
    }
}

impl fmt::Debug for SchedulerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerConfig")
            .field("worker_count", &self.worker_count)
            .field("flush_threshold", &self.flush_threshold)
            .field("idle_park_timeout", &self.idle_park_timeout)
            .field("thread_name_prefix", &self.thread_name_prefix)
            .field("allocator", &self.allocator)
            .field("fault_handler", &self.fault_handler.is_some())
            .finish()
    }
}
