//! # Result Channel
//!
//! Unbounded FIFO from any number of scrape jobs to the single results handler.
//! The channel carries a tagged item, so the end-of-stream marker can never be
//! confused with a real batch. Three handles split the roles:
//! - `ResultProducer` (cloneable) puts batches
//! - `ResultTerminator` (single, consumed on use) posts `Done` exactly once
//! - `ResultReceiver` (single) is owned by the consumer

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::domain::ResultBatch;

/// Element type of the result channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelItem {
    Batch(ResultBatch),
    Done,
}

/// Queue operation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Result channel is closed; the results handler has stopped")]
    Closed,
}

/// Counters shared by every handle of one channel
#[derive(Debug, Default)]
struct ChannelCounters {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
}

/// Point-in-time view of the channel counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueMetrics {
    pub total_enqueued: u64,
    pub total_dequeued: u64,
}

impl QueueMetrics {
    /// Batches put but not yet taken
    #[must_use]
    pub const fn in_flight(&self) -> u64 {
        self.total_enqueued.saturating_sub(self.total_dequeued)
    }
}

/// Creates a result channel and splits it into its three role handles
#[must_use]
pub fn result_channel() -> (ResultProducer, ResultTerminator, ResultReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let counters = Arc::new(ChannelCounters::default());

    (
        ResultProducer {
            sender: sender.clone(),
            counters: Arc::clone(&counters),
        },
        ResultTerminator { sender },
        ResultReceiver { receiver, counters },
    )
}

#[derive(Debug, Clone)]
pub struct ResultProducer {
    sender: mpsc::UnboundedSender<ChannelItem>,
    counters: Arc<ChannelCounters>,
}

impl ResultProducer {
    /// Enqueues one batch without blocking
    ///
    /// # Errors
    /// `QueueError::Closed` once the consumer has stopped
    pub fn put(&self, batch: ResultBatch) -> Result<(), QueueError> {
        self.sender
            .send(ChannelItem::Batch(batch))
            .map_err(|_| QueueError::Closed)?;
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    #[must_use]
    pub fn metrics(&self) -> QueueMetrics {
        QueueMetrics {
            total_enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            total_dequeued: self.counters.dequeued.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Posts the termination signal; only the orchestrator holds one
#[derive(Debug)]
pub struct ResultTerminator {
    sender: mpsc::UnboundedSender<ChannelItem>,
}

impl ResultTerminator {
    /// Enqueues `Done`. Must be called only after every producer has been joined.
    ///
    /// # Errors
    /// `QueueError::Closed` if the consumer already stopped
    pub fn finish(self) -> Result<(), QueueError> {
        self.sender
            .send(ChannelItem::Done)
            .map_err(|_| QueueError::Closed)
    }
}

#[derive(Debug)]
pub struct ResultReceiver {
    receiver: mpsc::UnboundedReceiver<ChannelItem>,
    counters: Arc<ChannelCounters>,
}

impl ResultReceiver {
    /// Waits for the next item. `None` means every sender is gone without a
    /// `Done` having been posted.
    pub async fn get(&mut self) -> Option<ChannelItem> {
        let item = self.receiver.recv().await?;
        if matches!(item, ChannelItem::Batch(_)) {
            self.counters.dequeued.fetch_add(1, Ordering::Relaxed);
        }
        Some(item)
    }

    #[must_use]
    pub fn metrics(&self) -> QueueMetrics {
        QueueMetrics {
            total_enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            total_dequeued: self.counters.dequeued.load(Ordering::Relaxed),
        }
    }
}
