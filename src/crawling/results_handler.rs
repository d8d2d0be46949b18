//! # Results Handler
//!
//! The only component that writes scraped results to storage. It drains the
//! result channel serially, persists every batch through a `ResultSink`, and
//! commits every `commit_interval` batches plus once more on `Done`.
//!
//! A persistence failure halts the handler: it fires the run's cancellation
//! token so workers stop dispatching, commits the batches written before the
//! failing one, and returns the error to the orchestrator.

use async_trait::async_trait;
use std::num::NonZeroUsize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::crawling::queues::{ChannelItem, ResultReceiver};
use crate::domain::ResultBatch;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Failed to persist page '{query}' #{page}: {message}")]
    Write {
        query: String,
        page: u32,
        message: String,
    },

    #[error("Results handler terminated abnormally: {0}")]
    HandlerCrashed(String),
}

/// Storage seam used by the results handler
#[async_trait]
pub trait ResultSink: Send {
    /// Writes the page row and its links inside the open transaction.
    /// Returns the generated page id. On error nothing of `batch` remains in
    /// the transaction, while earlier batches stay pending for `commit`.
    async fn insert_batch(&mut self, batch: &ResultBatch) -> Result<i64, PersistenceError>;

    /// Commits everything written since the previous commit
    async fn commit(&mut self) -> Result<(), PersistenceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Running,
    Draining,
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandlerReport {
    pub batches_processed: u64,
    pub links_persisted: u64,
    pub commits: u64,
    /// False when the channel closed without a termination signal
    pub saw_termination_signal: bool,
}

pub struct ResultsHandler<S: ResultSink> {
    sink: S,
    receiver: ResultReceiver,
    commit_interval: NonZeroUsize,
    cancellation: CancellationToken,
    state: HandlerState,
    report: HandlerReport,
}

impl<S: ResultSink> ResultsHandler<S> {
    #[must_use]
    pub fn new(
        sink: S,
        receiver: ResultReceiver,
        commit_interval: NonZeroUsize,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            sink,
            receiver,
            commit_interval,
            cancellation,
            state: HandlerState::Running,
            report: HandlerReport {
                batches_processed: 0,
                links_persisted: 0,
                commits: 0,
                saw_termination_signal: false,
            },
        }
    }

    #[must_use]
    pub const fn state(&self) -> HandlerState {
        self.state
    }

    /// Drains the channel until `Done` and performs the final commit.
    ///
    /// # Errors
    /// The first `PersistenceError`; the run's cancellation token has been
    /// fired by then.
    pub async fn run(mut self) -> Result<HandlerReport, PersistenceError> {
        info!(commit_interval = self.commit_interval.get(), "📥 Results handler started");

        match self.drain().await {
            Ok(()) => {
                self.state = HandlerState::Terminal;
                info!(
                    batches = self.report.batches_processed,
                    links = self.report.links_persisted,
                    commits = self.report.commits,
                    "✅ Results handler finished"
                );
                Ok(self.report)
            }
            Err(e) => {
                self.state = HandlerState::Terminal;
                self.cancellation.cancel();
                // Batches written before the failing one are still good
                match self.commit().await {
                    Ok(()) => info!(
                        batches = self.report.batches_processed,
                        "Committed batches persisted before the failure"
                    ),
                    Err(commit_error) => error!(
                        error = %commit_error,
                        "Failed to commit batches persisted before the failure"
                    ),
                }
                error!(
                    error = %e,
                    batches = self.report.batches_processed,
                    "🛑 Results handler halted on persistence failure, cancelling workers"
                );
                Err(e)
            }
        }
    }

    async fn drain(&mut self) -> Result<(), PersistenceError> {
        while self.state == HandlerState::Running {
            match self.receiver.get().await {
                Some(ChannelItem::Batch(batch)) => self.persist(&batch).await?,
                Some(ChannelItem::Done) => {
                    self.report.saw_termination_signal = true;
                    self.state = HandlerState::Draining;
                }
                None => {
                    warn!("Result channel closed without termination signal");
                    self.state = HandlerState::Draining;
                }
            }
        }

        self.commit().await
    }

    async fn persist(&mut self, batch: &ResultBatch) -> Result<(), PersistenceError> {
        let page_id = self.sink.insert_batch(batch).await?;
        self.report.batches_processed += 1;
        self.report.links_persisted += batch.links.len() as u64;

        debug!(
            page_id,
            query = %batch.page.search_query,
            page = batch.page.page_number,
            links = batch.links.len(),
            "Persisted result batch"
        );

        if self.report.batches_processed % self.commit_interval.get() as u64 == 0 {
            self.commit().await?;
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), PersistenceError> {
        self.sink.commit().await?;
        self.report.commits += 1;
        debug!(
            commits = self.report.commits,
            batches = self.report.batches_processed,
            "Committed results transaction"
        );
        Ok(())
    }
}
