//! # Run Orchestrator
//!
//! Turns one immutable configuration into one run. The states execute in a
//! fixed order and each may end the run early:
//!
//! 1. ParseConfig: the merged configuration is given; `view_config` shows it
//! 2. CacheMaintenance: optional cleanup; name repair ends the run
//! 3. ValidateInputs: keyword sources are loaded and deduplicated
//! 4. ValidateScrapeParameters
//! 5. LoadProxies: resolved into the run's egress pool
//! 6. PrepareStorage
//! 7. Simulate: reports the intended scope of work and stops
//! 8. CacheReconciliation
//! 9. Partition & Assign
//! 10. Dispatch: workers, results handler, join, signal, drain, commit
//!
//! The orchestrator suspends only while joining the workers and while joining
//! the results handler after the termination signal was posted.

use serde::Serialize;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::crawling::ScrapeError;
use crate::crawling::jobs::{
    JobContext, JobDescriptor, JobOutcome, JobReport, JobSettings, ScrapeJob, SharedLocks,
};
use crate::crawling::queues::result_channel;
use crate::crawling::results_handler::{HandlerReport, PersistenceError, ResultsHandler};
use crate::crawling::workers::WorkerPool;
use crate::domain::results::MAX_RESULTS_PER_PAGE;
use crate::domain::{Keyword, KeywordSet, ResultBatch, ScrapeMethod, SearchType};
use crate::infrastructure::cache::{FsResultCache, Reconciliation, ResultCache, SearchContext};
use crate::infrastructure::config::AppConfig;
use crate::infrastructure::database_connection::{DatabaseConnection, SqliteBootstrap, StorageBootstrap};
use crate::infrastructure::proxy_source::{FileProxySource, ProxySource, StaticProxySource};
use crate::scheduling::{ProxyPool, partition};

/// External collaborators of a run
#[derive(Clone)]
pub struct Collaborators {
    pub proxies: Arc<dyn ProxySource>,
    pub storage: Arc<dyn StorageBootstrap>,
    pub cache: Arc<dyn ResultCache>,
    pub scrape_job: Arc<dyn ScrapeJob>,
}

impl Collaborators {
    /// File/SQLite/filesystem collaborators described by `config`
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        let proxies: Arc<dyn ProxySource> = match &config.global.proxy_file {
            Some(path) => Arc::new(FileProxySource::new(path)),
            None => Arc::new(StaticProxySource::empty()),
        };

        Self {
            proxies,
            storage: Arc::new(SqliteBootstrap::new(&config.global.database_url)),
            cache: Arc::new(FsResultCache::new(&config.cache.cache_dir)),
            scrape_job: Arc::new(crate::crawling::workers::HttpScrapeJob::new()),
        }
    }

    #[must_use]
    pub fn with_scrape_job(mut self, scrape_job: Arc<dyn ScrapeJob>) -> Self {
        self.scrape_job = scrape_job;
        self
    }

    #[must_use]
    pub fn with_proxies(mut self, proxies: Arc<dyn ProxySource>) -> Self {
        self.proxies = proxies;
        self
    }

    #[must_use]
    pub fn with_storage(mut self, storage: Arc<dyn StorageBootstrap>) -> Self {
        self.storage = storage;
        self
    }

    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn ResultCache>) -> Self {
        self.cache = cache;
        self
    }
}

/// Caller preferences that are not part of the scrape configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Hand the storage handle back instead of closing it
    pub keep_storage_open: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            keep_storage_open: true,
        }
    }
}

/// Intended scope of work of a simulated run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SimulationReport {
    pub keyword_count: usize,
    pub pages_per_keyword: u32,
    pub proxies: Vec<String>,
    pub scrape_method: String,
    pub workers: usize,
}

impl SimulationReport {
    /// Human readable description of the chosen method
    #[must_use]
    pub fn method_description(&self) -> String {
        match self.scrape_method.as_str() {
            "sel" => format!("selenium mode with {} browser instances", self.workers),
            "http" => "http mode".to_string(),
            other => format!("{other} mode"),
        }
    }
}

impl fmt::Display for SimulationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "If this run were real, {} keywords would be scraped with {} pages each.",
            self.keyword_count, self.pages_per_keyword
        )?;
        if self.proxies.is_empty() {
            writeln!(f, "No proxies would be used.")?;
        } else {
            writeln!(f, "Used {} proxies:", self.proxies.len())?;
            for proxy in &self.proxies {
                writeln!(f, "  {proxy}")?;
            }
        }
        write!(f, "By using {}", self.method_description())
    }
}

/// Result of a dispatched run
#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub method: ScrapeMethod,
    pub keywords_total: usize,
    pub keywords_scraped: usize,
    /// Pages replayed from the cache instead of being scraped
    pub pages_from_cache: usize,
    pub workers: usize,
    pub handler: HandlerReport,
    pub jobs: Vec<JobReport>,
    pub elapsed: Duration,
    pub storage: Option<DatabaseConnection>,
}

impl RunReport {
    /// Workers that returned an error (not crashes)
    pub fn failures(&self) -> impl Iterator<Item = &JobReport> {
        self.jobs
            .iter()
            .filter(|report| matches!(report.outcome, JobOutcome::Failed(_)))
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    /// Merged configuration as pretty JSON
    ConfigShown(String),
    CacheRepaired { renamed: usize },
    Simulated(SimulationReport),
    Completed(RunReport),
}

/// Scrape parameters after validation
#[derive(Debug, Clone, Copy)]
struct ScrapeParameters {
    search_type: SearchType,
    commit_interval: NonZeroUsize,
}

pub struct Orchestrator {
    config: Arc<AppConfig>,
    collaborators: Collaborators,
    options: RunOptions,
}

impl Orchestrator {
    #[must_use]
    pub fn new(config: AppConfig, collaborators: Collaborators, options: RunOptions) -> Self {
        Self {
            config: Arc::new(config),
            collaborators,
            options,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Executes the run state machine
    ///
    /// # Errors
    /// Configuration-class errors are returned before any worker starts.
    /// Persistence failures, worker crashes and join timeouts are returned
    /// after the orderly shutdown completed.
    pub async fn run(&self) -> Result<RunOutcome, ScrapeError> {
        let config = &self.config;

        // 1. ParseConfig
        if config.global.view_config {
            info!(state = "ParseConfig", "Showing merged configuration");
            let rendered = serde_json::to_string_pretty(config.as_ref())
                .map_err(|e| ScrapeError::configuration(format!("Failed to render configuration: {e}")))?;
            return Ok(RunOutcome::ConfigShown(rendered));
        }

        // 2. CacheMaintenance
        if let Some(hours) = config.cache.clean_cache_after_hours {
            info!(state = "CacheMaintenance", hours, "Cleaning cache");
            self.collaborators
                .cache
                .cleanup(Duration::from_secs(hours.saturating_mul(3600)))
                .await?;
        }
        if config.cache.fix_cache_names {
            info!(state = "CacheMaintenance", "Repairing cache file names");
            let renamed = self.collaborators.cache.repair_names().await?;
            return Ok(RunOutcome::CacheRepaired { renamed });
        }

        // 3. ValidateInputs
        let keywords = self.load_keywords().await?;
        info!(state = "ValidateInputs", keywords = keywords.len(), "Keywords loaded");

        // 4. ValidateScrapeParameters
        let params = self.validate_parameters()?;
        debug!(state = "ValidateScrapeParameters", ?params, "Scrape parameters valid");

        // 5. LoadProxies
        let proxies = self.collaborators.proxies.load().await?;
        let pool = ProxyPool::resolve(proxies, config.scraping.use_own_ip)?;
        info!(
            state = "LoadProxies",
            proxies = pool.len(),
            local_egress = pool.uses_local_egress_only(),
            "Egress pool resolved"
        );

        // 6. PrepareStorage
        let storage = self.collaborators.storage.bootstrap().await?;
        info!(state = "PrepareStorage", "Storage ready");

        // 7. Simulate
        if config.global.simulate {
            let report = SimulationReport {
                keyword_count: keywords.len(),
                pages_per_keyword: config.scraping.num_pages_for_keyword,
                proxies: pool
                    .proxies()
                    .iter()
                    .filter(|proxy| !proxy.is_local())
                    .map(ToString::to_string)
                    .collect(),
                scrape_method: config.scraping.scrape_method.clone(),
                workers: self.worker_count_for(&config.scraping.scrape_method),
            };
            info!(state = "Simulate", "Simulation only, no scrape jobs started");
            storage.close().await;
            return Ok(RunOutcome::Simulated(report));
        }

        // 8. CacheReconciliation
        let method: ScrapeMethod = config
            .scraping
            .scrape_method
            .parse()
            .map_err(ScrapeError::Configuration)?;
        let context = SearchContext {
            search_type: params.search_type,
            num_results_per_page: config.scraping.num_results_per_page,
            num_pages_for_keyword: config.scraping.num_pages_for_keyword,
            scrape_method: method,
        };
        let Reconciliation { remaining, cached } = if config.cache.do_caching {
            self.collaborators.cache.reconcile(&keywords, &context).await?
        } else {
            Reconciliation {
                remaining: keywords.clone(),
                cached: Vec::new(),
            }
        };
        info!(
            state = "CacheReconciliation",
            total = keywords.len(),
            remaining = remaining.len(),
            cached_pages = cached.len(),
            "Remaining work determined"
        );

        // 9. Partition & Assign
        let worker_count = self.worker_count_for(method.as_str());
        let groups = partition(&remaining, worker_count);
        let assignment = pool.assign(groups.len());
        let mut descriptors = Vec::with_capacity(groups.len());
        for (index, group) in groups.into_iter().enumerate() {
            let proxy = assignment
                .proxy_for(index)
                .cloned()
                .ok_or_else(|| ScrapeError::configuration(format!("No proxy for worker {index}")))?;
            info!(worker = index, keywords = group.len(), %proxy, "Assigned proxy");
            descriptors.push(JobDescriptor {
                index,
                keywords: group,
                proxy,
                worker_identity: index,
                method,
            });
        }
        info!(
            state = "Partition",
            workers = descriptors.len(),
            chunk_size = assignment.chunk_size(),
            "Work partitioned"
        );

        // 10. Dispatch
        match method {
            ScrapeMethod::HttpAsync => {
                storage.close().await;
                Err(ScrapeError::UnimplementedMethod(method))
            }
            ScrapeMethod::Sel | ScrapeMethod::Http => {
                self.dispatch(method, params, context, keywords.len(), descriptors, cached, storage)
                    .await
            }
        }
    }

    /// Union of the single keyword, the keyword list and the keyword file
    async fn load_keywords(&self) -> Result<KeywordSet, ScrapeError> {
        let scraping = &self.config.scraping;

        if scraping.keyword.is_none() && scraping.keywords.is_empty() && scraping.keyword_file.is_none() {
            return Err(ScrapeError::configuration(
                "No keywords to scrape for. Provide a keyword, a keyword list or a keyword file",
            ));
        }

        let mut keywords = KeywordSet::new();
        if let Some(keyword) = &scraping.keyword {
            keywords.extend(Keyword::new(keyword).ok());
        }
        keywords.extend(scraping.keywords.iter().filter_map(|k| Keyword::new(k).ok()));

        if let Some(path) = &scraping.keyword_file {
            if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                return Err(ScrapeError::ResourceUnavailable(format!(
                    "The keyword file {} does not exist",
                    path.display()
                )));
            }
            let from_file = KeywordSet::from_file(path).await.map_err(|e| {
                ScrapeError::ResourceUnavailable(format!(
                    "Failed to read keyword file {}: {e}",
                    path.display()
                ))
            })?;
            keywords.extend(from_file);
        }

        if keywords.is_empty() {
            return Err(ScrapeError::configuration("All provided keywords are empty"));
        }
        Ok(keywords)
    }

    fn validate_parameters(&self) -> Result<ScrapeParameters, ScrapeError> {
        let config = &self.config;

        if config.scraping.num_results_per_page > MAX_RESULTS_PER_PAGE {
            return Err(ScrapeError::configuration(format!(
                "Not more than {MAX_RESULTS_PER_PAGE} results per page available for searches, got {}",
                config.scraping.num_results_per_page
            )));
        }
        let search_type: SearchType = config
            .scraping
            .search_type
            .parse()
            .map_err(ScrapeError::Configuration)?;
        let commit_interval = NonZeroUsize::new(config.global.commit_interval)
            .ok_or_else(|| ScrapeError::configuration("global.commit_interval must be at least 1"))?;
        if config.scraping.num_pages_for_keyword == 0 {
            return Err(ScrapeError::configuration(
                "scraping.num_pages_for_keyword must be at least 1",
            ));
        }
        if config.selenium.num_browser_instances == 0 {
            return Err(ScrapeError::configuration(
                "selenium.num_browser_instances must be at least 1",
            ));
        }
        if config.http.num_threads == 0 {
            return Err(ScrapeError::configuration("http.num_threads must be at least 1"));
        }
        if config.scraping.sleep_min_ms > config.scraping.sleep_max_ms {
            return Err(ScrapeError::configuration(
                "scraping.sleep_min_ms must not exceed scraping.sleep_max_ms",
            ));
        }

        Ok(ScrapeParameters {
            search_type,
            commit_interval,
        })
    }

    fn worker_count_for(&self, method: &str) -> usize {
        match method {
            "sel" => self.config.selenium.num_browser_instances,
            _ => self.config.http.num_threads,
        }
    }

    fn job_settings(&self, search: SearchContext) -> JobSettings {
        let scraping = &self.config.scraping;
        JobSettings {
            search,
            search_url: scraping.search_url.clone(),
            request_timeout: Duration::from_secs(self.config.http.request_timeout_seconds),
            user_agent: self.config.http.user_agent.clone(),
            sleep_min: Duration::from_millis(scraping.sleep_min_ms),
            sleep_max: Duration::from_millis(scraping.sleep_max_ms),
        }
    }

    async fn dispatch(
        &self,
        method: ScrapeMethod,
        params: ScrapeParameters,
        context: SearchContext,
        keywords_total: usize,
        descriptors: Vec<JobDescriptor>,
        cached: Vec<ResultBatch>,
        storage: DatabaseConnection,
    ) -> Result<RunOutcome, ScrapeError> {
        let started = Instant::now();
        let run_id = Uuid::new_v4();
        let workers = descriptors.len();
        let keywords_scraped = descriptors.iter().map(|d| d.keywords.len()).sum();

        storage
            .record_run_started(
                run_id,
                method.as_str(),
                context.search_type.as_str(),
                keywords_scraped,
                workers,
            )
            .await?;
        info!(state = "Dispatch", %run_id, %method, workers, "🚀 Dispatching scrape jobs");

        let (producer, terminator, receiver) = result_channel();
        let cancellation = CancellationToken::new();
        let handler = ResultsHandler::new(
            storage.result_sink(run_id),
            receiver,
            params.commit_interval,
            cancellation.clone(),
        );
        let handler_task = tokio::spawn(handler.run());

        let pages_from_cache = cached.len();
        if pages_from_cache > 0 {
            info!(state = "Dispatch", pages = pages_from_cache, "Replaying cached pages into storage");
        }
        for batch in cached {
            if producer.put(batch).is_err() {
                warn!("Results handler stopped while replaying cached pages");
                break;
            }
        }

        let ctx = JobContext {
            results: producer,
            locks: SharedLocks::default(),
            cache: self
                .config
                .cache
                .do_caching
                .then(|| Arc::clone(&self.collaborators.cache)),
            settings: Arc::new(self.job_settings(context)),
            cancellation: cancellation.clone(),
        };

        let mut pool = WorkerPool::new(Arc::clone(&self.collaborators.scrape_job), cancellation);
        for descriptor in descriptors {
            pool.spawn(descriptor, ctx.clone());
        }
        drop(ctx);

        let join_limit = self.config.global.worker_join_timeout_secs.map(Duration::from_secs);
        let jobs = pool.join_all(join_limit).await;
        info!(state = "Dispatch", joined = jobs.len(), "All workers joined");

        if terminator.finish().is_err() {
            debug!("Results handler already stopped before the termination signal");
        }
        let handler_result = match handler_task.await {
            Ok(result) => result,
            Err(e) => Err(PersistenceError::HandlerCrashed(e.to_string())),
        };

        let crashed: Vec<String> = jobs
            .iter()
            .filter_map(|report| match &report.outcome {
                JobOutcome::Crashed(reason) => Some(format!("worker {}: {reason}", report.worker_identity)),
                _ => None,
            })
            .collect();
        let timed_out = jobs
            .iter()
            .any(|report| matches!(report.outcome, JobOutcome::TimedOut));

        let status = match (&handler_result, crashed.is_empty(), timed_out) {
            (Err(_), _, _) => "failed",
            (Ok(_), _, true) => "timed_out",
            (Ok(_), false, false) => "crashed",
            (Ok(_), true, false) => "completed",
        };
        if let Err(e) = storage.record_run_finished(run_id, status).await {
            warn!(%run_id, error = %e, "Failed to record run status");
        }

        let handler = match handler_result {
            Ok(report) => report,
            Err(e) => {
                error!(%run_id, error = %e, "🛑 Run halted by persistence failure");
                storage.close().await;
                return Err(ScrapeError::Persistence(e));
            }
        };
        if let (Some(limit), true) = (join_limit, timed_out) {
            storage.close().await;
            return Err(ScrapeError::WorkerTimeout(limit));
        }
        if !crashed.is_empty() {
            storage.close().await;
            return Err(ScrapeError::WorkerCrashed {
                count: crashed.len(),
                details: crashed.join("; "),
            });
        }

        let report = RunReport {
            run_id,
            method,
            keywords_total,
            keywords_scraped,
            pages_from_cache,
            workers,
            handler,
            jobs,
            elapsed: started.elapsed(),
            storage: None,
        };
        for failure in report.failures() {
            if let JobOutcome::Failed(e) = &failure.outcome {
                warn!(worker = failure.worker_identity, proxy = %failure.proxy, error = %e, "Worker reported failure");
            }
        }
        info!(
            %run_id,
            pages = report.handler.batches_processed,
            links = report.handler.links_persisted,
            commits = report.handler.commits,
            elapsed_ms = u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
            "✅ Run completed"
        );

        let storage = if self.options.keep_storage_open {
            Some(storage)
        } else {
            storage.close().await;
            None
        };
        Ok(RunOutcome::Completed(RunReport { storage, ..report }))
    }
}
