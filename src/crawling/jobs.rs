//! # Scrape Jobs
//!
//! A job is one worker's share of a run: a keyword group, the proxy it egresses
//! through and a stable worker identity. Jobs are built once by the
//! orchestrator, handed to exactly one worker and dropped when it terminates.
//!
//! Fetching and parsing live behind the `ScrapeJob` trait; the orchestrator only
//! schedules, joins and classifies outcomes.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::crawling::queues::{QueueError, ResultProducer};
use crate::domain::{KeywordGroup, Proxy, ScrapeMethod};
use crate::infrastructure::cache::{ResultCache, SearchContext};

pub type WorkerId = usize;

/// Immutable description of one worker's share of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescriptor {
    pub index: usize,
    pub keywords: KeywordGroup,
    pub proxy: Proxy,
    pub worker_identity: WorkerId,
    pub method: ScrapeMethod,
}

/// Scrape parameters shared read-only by every job of a run
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub search: SearchContext,
    pub search_url: String,
    pub request_timeout: Duration,
    pub user_agent: Option<String>,
    pub sleep_min: Duration,
    pub sleep_max: Duration,
}

/// Run-wide mutual exclusion. Guards are scoped to the critical section and
/// released on every exit path when dropped.
#[derive(Debug, Clone, Default)]
pub struct SharedLocks {
    /// Serializes cache file writes across workers
    pub cache: Arc<Mutex<()>>,
    /// Held by a blocked worker for its back-off; one worker backs off at a time
    pub captcha: Arc<Mutex<()>>,
}

/// Everything a running job may touch besides its descriptor
#[derive(Clone)]
pub struct JobContext {
    pub results: ResultProducer,
    pub locks: SharedLocks,
    pub cache: Option<Arc<dyn ResultCache>>,
    pub settings: Arc<JobSettings>,
    pub cancellation: CancellationToken,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    pub keywords_done: usize,
    pub pages_scraped: usize,
    pub pages_failed: usize,
    pub blocked_keywords: usize,
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP error {0}: {1}")]
    Http(u16, String),

    #[error("Failed to hand off results: {0}")]
    Channel(#[from] QueueError),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Worker initialization failed: {0}")]
    Initialization(String),

    #[error("Job was cancelled")]
    Cancelled,
}

#[async_trait]
pub trait ScrapeJob: Send + Sync + 'static {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Scrapes every keyword of `job`, pushing one batch per page into
    /// `ctx.results`. Should return promptly once `ctx.cancellation` fires.
    async fn run(&self, job: JobDescriptor, ctx: JobContext) -> Result<JobSummary, WorkerError>;
}

/// How a joined worker ended
#[derive(Debug)]
pub enum JobOutcome {
    Finished(JobSummary),
    Failed(WorkerError),
    Crashed(String),
    TimedOut,
}

impl JobOutcome {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Finished(_))
    }

    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Finished(_) => "finished",
            Self::Failed(_) => "failed",
            Self::Crashed(_) => "crashed",
            Self::TimedOut => "timed_out",
        }
    }
}

/// Per-worker result of a run
#[derive(Debug)]
pub struct JobReport {
    pub index: usize,
    pub worker_identity: WorkerId,
    pub proxy: String,
    pub keywords: usize,
    pub outcome: JobOutcome,
}
