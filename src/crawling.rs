//! # Crawling Module
//!
//! Run orchestration and result aggregation:
//! - `queues`: the many-producer, single-consumer result channel
//! - `results_handler`: the one serial writer draining that channel
//! - `jobs`: job descriptors and the `ScrapeJob` seam
//! - `workers`: the worker pool and the bundled HTTP scrape job
//! - `orchestrator`: the validation and dispatch state machine

use std::time::Duration;
use thiserror::Error;

pub mod jobs;
pub mod orchestrator;
pub mod queues;
pub mod results_handler;
pub mod workers;

pub use jobs::{
    JobContext, JobDescriptor, JobOutcome, JobReport, JobSettings, JobSummary, ScrapeJob,
    SharedLocks, WorkerError, WorkerId,
};
pub use orchestrator::{
    Collaborators, Orchestrator, RunOptions, RunOutcome, RunReport, SimulationReport,
};
pub use queues::{ChannelItem, QueueError, ResultProducer, ResultReceiver, ResultTerminator};
pub use results_handler::{HandlerReport, HandlerState, PersistenceError, ResultSink, ResultsHandler};
pub use workers::{HttpScrapeJob, WorkerPool};

use crate::domain::ScrapeMethod;
use crate::infrastructure::cache::CacheError;
use crate::infrastructure::proxy_source::ProxySourceError;
use crate::scheduling::AssignmentError;

/// Top level error of a scrape run
#[derive(Error, Debug)]
pub enum ScrapeError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Proxy source error: {0}")]
    ProxySource(#[from] ProxySourceError),

    #[error("Scrape method `{0}` is not implemented yet")]
    UnimplementedMethod(ScrapeMethod),

    #[error("{count} worker(s) crashed: {details}")]
    WorkerCrashed { count: usize, details: String },

    #[error("Workers did not finish within {0:?}; remaining workers were cancelled")]
    WorkerTimeout(Duration),
}

impl ScrapeError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// True for errors raised before any worker starts because the
    /// configuration or its inputs are unusable
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::ResourceUnavailable(_) | Self::ProxySource(_)
        )
    }

    /// Process exit status for this error
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        if self.is_configuration() { 2 } else { 1 }
    }
}

impl From<AssignmentError> for ScrapeError {
    fn from(error: AssignmentError) -> Self {
        Self::ResourceUnavailable(error.to_string())
    }
}
