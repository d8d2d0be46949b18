//! # Worker Pool
//!
//! Runs one tokio task per job descriptor and classifies how each ended.
//! Panics inside a job are captured and reported as `Crashed`, never
//! propagated into the orchestrator; a task that dies outside the job (aborted,
//! or panicking while reporting) is also reported as `Crashed`. An optional join
//! deadline cancels the run and force-stops the remaining workers, which then
//! report `TimedOut`.

use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{Id, JoinSet};
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::crawling::jobs::{JobContext, JobDescriptor, JobOutcome, JobReport, ScrapeJob};

pub mod http_scrape;

pub use http_scrape::HttpScrapeJob;

/// What is known about a worker before it reports
#[derive(Debug, Clone)]
struct WorkerMeta {
    index: usize,
    worker_identity: usize,
    proxy: String,
    keywords: usize,
}

impl WorkerMeta {
    fn report(self, outcome: JobOutcome) -> JobReport {
        JobReport {
            index: self.index,
            worker_identity: self.worker_identity,
            proxy: self.proxy,
            keywords: self.keywords,
            outcome,
        }
    }
}

pub struct WorkerPool {
    job: Arc<dyn ScrapeJob>,
    cancellation: CancellationToken,
    force_stop: CancellationToken,
    tasks: JoinSet<JobReport>,
    running: HashMap<Id, WorkerMeta>,
    spawned: usize,
}

impl WorkerPool {
    /// `cancellation` is the run-wide token also handed to every job
    #[must_use]
    pub fn new(job: Arc<dyn ScrapeJob>, cancellation: CancellationToken) -> Self {
        Self {
            job,
            cancellation,
            force_stop: CancellationToken::new(),
            tasks: JoinSet::new(),
            running: HashMap::new(),
            spawned: 0,
        }
    }

    #[must_use]
    pub const fn spawned(&self) -> usize {
        self.spawned
    }

    /// Starts one worker; it begins running immediately
    pub fn spawn(&mut self, descriptor: JobDescriptor, ctx: JobContext) {
        let job = Arc::clone(&self.job);
        let force_stop = self.force_stop.clone();

        let meta = WorkerMeta {
            index: descriptor.index,
            worker_identity: descriptor.worker_identity,
            proxy: descriptor.proxy.to_string(),
            keywords: descriptor.keywords.len(),
        };
        let worker_identity = meta.worker_identity;

        info!(
            worker = worker_identity,
            proxy = %meta.proxy,
            keywords = meta.keywords,
            method = %descriptor.method,
            job = job.name(),
            "🚀 Starting worker"
        );

        let task_meta = meta.clone();
        let handle = self.tasks.spawn(async move {
            let run = AssertUnwindSafe(job.run(descriptor, ctx)).catch_unwind();
            let outcome = tokio::select! {
                biased;
                () = force_stop.cancelled() => JobOutcome::TimedOut,
                result = run => match result {
                    Ok(Ok(summary)) => JobOutcome::Finished(summary),
                    Ok(Err(e)) => JobOutcome::Failed(e),
                    Err(payload) => JobOutcome::Crashed(panic_message(payload.as_ref())),
                },
            };

            match &outcome {
                JobOutcome::Finished(summary) => info!(
                    worker = worker_identity,
                    pages = summary.pages_scraped,
                    failed_pages = summary.pages_failed,
                    blocked = summary.blocked_keywords,
                    "✅ Worker finished"
                ),
                JobOutcome::Failed(e) => warn!(worker = worker_identity, error = %e, "Worker failed"),
                JobOutcome::Crashed(reason) => {
                    error!(worker = worker_identity, %reason, "💥 Worker crashed");
                }
                JobOutcome::TimedOut => warn!(worker = worker_identity, "⏰ Worker force-stopped"),
            }

            task_meta.report(outcome)
        });
        self.running.insert(handle.id(), meta);
        self.spawned += 1;
    }

    /// Waits for every worker. With a `limit`, workers still running at the
    /// deadline are cancelled and force-stopped, then awaited.
    ///
    /// Reports are returned in worker index order.
    pub async fn join_all(mut self, limit: Option<Duration>) -> Vec<JobReport> {
        let mut deadline = limit.map(|limit| Instant::now() + limit);
        let mut reports = Vec::with_capacity(self.spawned);

        loop {
            let next = match deadline {
                Some(at) => match timeout_at(at, self.tasks.join_next_with_id()).await {
                    Ok(next) => next,
                    Err(_) => {
                        warn!(
                            remaining = self.tasks.len(),
                            "⏰ Worker join deadline reached, cancelling remaining workers"
                        );
                        self.cancellation.cancel();
                        self.force_stop.cancel();
                        deadline = None;
                        continue;
                    }
                },
                None => self.tasks.join_next_with_id().await,
            };

            match next {
                Some(Ok((id, report))) => {
                    self.running.remove(&id);
                    reports.push(report);
                }
                Some(Err(e)) => match self.running.remove(&e.id()) {
                    Some(meta) => {
                        error!(worker = meta.worker_identity, error = %e, "💥 Worker task died before reporting");
                        reports.push(meta.report(JobOutcome::Crashed(e.to_string())));
                    }
                    None => error!(error = %e, "Unknown worker task could not be joined"),
                },
                None => break,
            }
        }

        if reports.len() < self.spawned {
            error!(
                joined = reports.len(),
                spawned = self.spawned,
                "Some workers vanished without a report"
            );
        }

        reports.sort_by_key(|report| report.index);
        reports
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawling::jobs::{JobSettings, JobSummary, SharedLocks, WorkerError};
    use crate::crawling::queues::result_channel;
    use crate::domain::{Keyword, KeywordGroup, Proxy, ScrapeMethod, SearchType};
    use crate::infrastructure::cache::SearchContext;
    use async_trait::async_trait;

    /// Behaviour keyed by worker index
    struct ScriptedJob;

    #[async_trait]
    impl ScrapeJob for ScriptedJob {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn run(&self, job: JobDescriptor, ctx: JobContext) -> Result<JobSummary, WorkerError> {
            match job.index {
                0 => Ok(JobSummary {
                    keywords_done: job.keywords.len(),
                    ..JobSummary::default()
                }),
                1 => Err(WorkerError::Network("connection reset".into())),
                2 => panic!("parser exploded"),
                _ => {
                    // Ignores cancellation on purpose
                    let _ = &ctx;
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }

    fn context(cancellation: &CancellationToken) -> JobContext {
        let (producer, _terminator, _receiver) = result_channel();
        JobContext {
            results: producer,
            locks: SharedLocks::default(),
            cache: None,
            settings: Arc::new(JobSettings {
                search: SearchContext {
                    search_type: SearchType::Normal,
                    num_results_per_page: 10,
                    num_pages_for_keyword: 1,
                    scrape_method: ScrapeMethod::Http,
                },
                search_url: "http://127.0.0.1:9/search".into(),
                request_timeout: Duration::from_secs(1),
                user_agent: None,
                sleep_min: Duration::ZERO,
                sleep_max: Duration::ZERO,
            }),
            cancellation: cancellation.clone(),
        }
    }

    fn descriptor(index: usize) -> JobDescriptor {
        JobDescriptor {
            index,
            keywords: KeywordGroup::new(vec![Keyword::new(format!("kw{index}")).unwrap()]),
            proxy: Proxy::LocalEgress,
            worker_identity: index,
            method: ScrapeMethod::Http,
        }
    }

    #[tokio::test]
    async fn outcomes_are_classified_per_worker() {
        let cancellation = CancellationToken::new();
        let mut pool = WorkerPool::new(Arc::new(ScriptedJob), cancellation.clone());
        for index in 0..3 {
            pool.spawn(descriptor(index), context(&cancellation));
        }

        let reports = pool.join_all(None).await;

        let labels: Vec<&str> = reports.iter().map(|r| r.outcome.label()).collect();
        assert_eq!(labels, vec!["finished", "failed", "crashed"]);
        assert!(matches!(&reports[2].outcome, JobOutcome::Crashed(msg) if msg.contains("parser exploded")));
        assert!(!cancellation.is_cancelled());
    }

    #[tokio::test]
    async fn deadline_force_stops_hung_workers() {
        let cancellation = CancellationToken::new();
        let mut pool = WorkerPool::new(Arc::new(ScriptedJob), cancellation.clone());
        pool.spawn(descriptor(0), context(&cancellation));
        pool.spawn(descriptor(3), context(&cancellation));

        let reports = pool.join_all(Some(Duration::from_millis(100))).await;

        assert_eq!(reports.len(), 2);
        assert!(reports[0].outcome.is_success());
        assert!(matches!(reports[1].outcome, JobOutcome::TimedOut));
        assert!(cancellation.is_cancelled());
    }

    #[tokio::test]
    async fn aborted_task_is_reported_as_crashed() {
        let cancellation = CancellationToken::new();
        let mut pool = WorkerPool::new(Arc::new(ScriptedJob), cancellation.clone());
        pool.spawn(descriptor(0), context(&cancellation));
        pool.spawn(descriptor(3), context(&cancellation));
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.tasks.abort_all();

        let reports = pool.join_all(None).await;

        assert_eq!(reports.len(), 2);
        assert!(reports[0].outcome.is_success());
        assert_eq!(reports[1].index, 3);
        assert_eq!(reports[1].worker_identity, 3);
        assert_eq!(reports[1].proxy, "localhost");
        assert!(matches!(&reports[1].outcome, JobOutcome::Crashed(reason) if reason.contains("cancelled")));
    }
}
