//! End-to-end runs of the orchestrator against a scripted scrape job, a
//! temporary SQLite database and a temporary cache directory.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use serp_harvest::crawling::{JobContext, JobDescriptor, JobOutcome, JobSummary, ScrapeJob, WorkerError};
use serp_harvest::domain::{
    Keyword, LinkResult, PageMeta, ProxyEndpoint, ResultBatch, ScrapeMethod, SearchType,
};
use serp_harvest::infrastructure::{
    DatabaseConnection, FsResultCache, ProxySource, ResultCache, SearchContext, SqliteBootstrap,
    StaticProxySource, StorageBootstrap,
};
use serp_harvest::crawling::PersistenceError;
use serp_harvest::{AppConfig, Collaborators, ConfigManager, Orchestrator, RunOptions, RunOutcome, ScrapeError};

/// Pushes one batch per keyword and page, recording what it was asked to do
#[derive(Default)]
struct ScriptedJob {
    seen: Mutex<Vec<JobDescriptor>>,
    links_per_page: usize,
    panic_on_worker: Option<usize>,
}

impl ScriptedJob {
    fn with_links(links_per_page: usize) -> Self {
        Self {
            links_per_page,
            ..Self::default()
        }
    }

    fn seen(&self) -> Vec<JobDescriptor> {
        let mut seen = self.seen.lock().unwrap().clone();
        seen.sort_by_key(|job| job.index);
        seen
    }
}

fn page(keyword: &Keyword, page_number: u32, links: usize, requested_by: String) -> ResultBatch {
    ResultBatch::new(
        PageMeta {
            page_number,
            requested_at: Utc::now(),
            num_results: u32::try_from(links).unwrap(),
            num_results_for_keyword: None,
            search_query: keyword.to_string(),
            requested_by,
        },
        (0..links)
            .map(|rank| LinkResult {
                title: format!("{keyword} result {rank}"),
                url: format!("https://example.org/{}/{rank}", keyword.as_str().replace(' ', "-")),
                snippet: String::new(),
                rank: u32::try_from(rank + 1).unwrap(),
                domain: "example.org".into(),
            })
            .collect(),
    )
}

#[async_trait]
impl ScrapeJob for ScriptedJob {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn run(&self, job: JobDescriptor, ctx: JobContext) -> Result<JobSummary, WorkerError> {
        self.seen.lock().unwrap().push(job.clone());
        if self.panic_on_worker == Some(job.index) {
            panic!("worker {} lost its browser", job.index);
        }

        let mut summary = JobSummary::default();
        for keyword in &job.keywords {
            for page_number in 1..=ctx.settings.search.num_pages_for_keyword {
                ctx.results
                    .put(page(keyword, page_number, self.links_per_page, job.proxy.to_string()))?;
                summary.pages_scraped += 1;
            }
            summary.keywords_done += 1;
        }
        Ok(summary)
    }
}

/// Bootstraps SQLite, then makes every page of one keyword fail to insert
struct PoisonedKeyword {
    inner: SqliteBootstrap,
    keyword: &'static str,
}

#[async_trait]
impl StorageBootstrap for PoisonedKeyword {
    async fn bootstrap(&self) -> Result<DatabaseConnection, PersistenceError> {
        let db = self.inner.bootstrap().await?;
        sqlx::query(&format!(
            "CREATE TRIGGER reject_keyword BEFORE INSERT ON serp_page
             WHEN NEW.search_query = '{}'
             BEGIN SELECT RAISE(ABORT, 'rejected keyword'); END",
            self.keyword
        ))
        .execute(db.pool())
        .await?;
        Ok(db)
    }
}

struct Fixture {
    dir: TempDir,
    job: Arc<ScriptedJob>,
}

impl Fixture {
    fn new(job: ScriptedJob) -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            job: Arc::new(job),
        }
    }

    fn database_url(&self) -> String {
        format!("sqlite:{}", self.dir.path().join("results.db").display())
    }

    fn config(&self, overrides: Value) -> AppConfig {
        let base = ConfigManager::apply_overrides(
            AppConfig::default(),
            &json!({
                "global": { "database_url": self.database_url() },
                "scraping": { "sleep_min_ms": 0, "sleep_max_ms": 0 },
                "cache": { "cache_dir": self.dir.path().join("cache") }
            }),
        )
        .unwrap();
        ConfigManager::apply_overrides(base, &overrides).unwrap()
    }

    fn orchestrator(&self, overrides: Value, proxies: &[&str]) -> Orchestrator {
        let config = self.config(overrides);
        let proxies: Vec<ProxyEndpoint> = proxies.iter().map(|line| line.parse().unwrap()).collect();
        let collaborators = Collaborators::from_config(&config)
            .with_proxies(Arc::new(StaticProxySource::new(proxies)) as Arc<dyn ProxySource>)
            .with_scrape_job(Arc::clone(&self.job) as Arc<dyn ScrapeJob>);
        Orchestrator::new(config, collaborators, RunOptions::default())
    }

    async fn reopen(&self) -> DatabaseConnection {
        DatabaseConnection::connect(&self.database_url()).await.unwrap()
    }
}

const KEYWORDS: [&str; 7] = ["alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf"];

#[tokio::test]
async fn seven_keywords_three_browsers_two_proxies() {
    let fixture = Fixture::new(ScriptedJob::with_links(2));
    let orchestrator = fixture.orchestrator(
        json!({
            "scraping": { "keywords": KEYWORDS, "scrape_method": "sel" },
            "selenium": { "num_browser_instances": 3 },
            "global": { "commit_interval": 3 }
        }),
        &["socks5 10.0.0.1:1080", "http 10.0.0.2:3128 user:secret"],
    );

    let RunOutcome::Completed(report) = orchestrator.run().await.unwrap() else {
        panic!("expected a completed run");
    };

    let seen = fixture.job.seen();
    let sizes: Vec<usize> = seen.iter().map(|job| job.keywords.len()).collect();
    assert_eq!(sizes, vec![3, 3, 1]);
    let proxies: Vec<String> = seen.iter().map(|job| job.proxy.to_string()).collect();
    assert_eq!(
        proxies,
        vec!["socks5://10.0.0.1:1080", "socks5://10.0.0.1:1080", "http://10.0.0.2:3128"]
    );
    assert!(seen.iter().all(|job| job.method == ScrapeMethod::Sel));

    assert_eq!(report.workers, 3);
    assert_eq!(report.handler.batches_processed, 7);
    assert_eq!(report.handler.links_persisted, 14);
    assert_eq!(report.handler.commits, 3);
    assert!(report.jobs.iter().all(|job| job.outcome.is_success()));

    let db = report.storage.expect("storage is kept open");
    assert_eq!(db.count_pages_for_run(report.run_id).await.unwrap(), 7);
    assert_eq!(db.count_links_for_run(report.run_id).await.unwrap(), 14);
    assert_eq!(db.run_status(report.run_id).await.unwrap().as_deref(), Some("completed"));
}

#[tokio::test]
async fn single_worker_falls_back_to_local_egress() {
    let fixture = Fixture::new(ScriptedJob::with_links(1));
    let orchestrator = fixture.orchestrator(
        json!({
            "scraping": { "keywords": &KEYWORDS[..5], "num_pages_for_keyword": 2 },
            "http": { "num_threads": 1 }
        }),
        &[],
    );

    let RunOutcome::Completed(report) = orchestrator.run().await.unwrap() else {
        panic!("expected a completed run");
    };

    let seen = fixture.job.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].keywords.len(), 5);
    assert!(seen[0].proxy.is_local());
    assert_eq!(report.handler.batches_processed, 10);
}

#[tokio::test]
async fn no_proxies_without_local_egress_fails_before_dispatch() {
    let fixture = Fixture::new(ScriptedJob::default());
    let orchestrator = fixture.orchestrator(
        json!({ "scraping": { "keyword": "rust", "use_own_ip": false } }),
        &[],
    );

    let error = orchestrator.run().await.unwrap_err();

    assert!(error.is_configuration(), "{error}");
    assert_eq!(error.exit_code(), 2);
    assert!(fixture.job.seen().is_empty());
}

#[tokio::test]
async fn simulation_reports_scope_without_scraping() {
    let fixture = Fixture::new(ScriptedJob::default());
    let orchestrator = fixture.orchestrator(
        json!({
            "scraping": { "keywords": KEYWORDS, "num_pages_for_keyword": 4, "scrape_method": "sel" },
            "selenium": { "num_browser_instances": 2 },
            "global": { "simulate": true }
        }),
        &["socks4 10.1.1.1:1080"],
    );

    let RunOutcome::Simulated(report) = orchestrator.run().await.unwrap() else {
        panic!("expected a simulation");
    };

    assert_eq!(report.keyword_count, 7);
    assert_eq!(report.pages_per_keyword, 4);
    assert_eq!(report.proxies, vec!["socks4://10.1.1.1:1080"]);
    assert_eq!(report.workers, 2);
    assert!(fixture.job.seen().is_empty());
}

#[tokio::test]
async fn view_config_shows_the_merged_configuration() {
    let fixture = Fixture::new(ScriptedJob::default());
    let orchestrator = fixture.orchestrator(
        json!({ "global": { "view_config": true }, "scraping": { "search_type": "news" } }),
        &[],
    );

    let RunOutcome::ConfigShown(rendered) = orchestrator.run().await.unwrap() else {
        panic!("expected the configuration");
    };
    let parsed: Value = serde_json::from_str(&rendered).unwrap();
    assert_eq!(parsed["scraping"]["search_type"], "news");
    assert!(fixture.job.seen().is_empty());
}

#[tokio::test]
async fn http_async_is_not_dispatched() {
    let fixture = Fixture::new(ScriptedJob::default());
    let orchestrator = fixture.orchestrator(
        json!({ "scraping": { "keyword": "rust", "scrape_method": "http_async" } }),
        &[],
    );

    let error = orchestrator.run().await.unwrap_err();

    assert!(matches!(error, ScrapeError::UnimplementedMethod(ScrapeMethod::HttpAsync)));
    assert!(fixture.job.seen().is_empty());
}

#[tokio::test]
async fn unknown_method_is_a_configuration_error() {
    let fixture = Fixture::new(ScriptedJob::default());
    let orchestrator = fixture.orchestrator(
        json!({ "scraping": { "keyword": "rust", "scrape_method": "carrier-pigeon" } }),
        &[],
    );

    let error = orchestrator.run().await.unwrap_err();

    assert!(matches!(error, ScrapeError::Configuration(_)), "{error}");
    assert!(fixture.job.seen().is_empty());
}

#[tokio::test]
async fn persistence_failure_halts_the_run_but_keeps_earlier_pages() {
    let fixture = Fixture::new(ScriptedJob::with_links(3));
    // one worker pushes keywords in sorted order, so "golf" arrives last
    let config = fixture.config(json!({
        "scraping": { "keywords": KEYWORDS },
        "http": { "num_threads": 1 }
    }));
    let collaborators = Collaborators::from_config(&config)
        .with_storage(Arc::new(PoisonedKeyword {
            inner: SqliteBootstrap::new(fixture.database_url()),
            keyword: "golf",
        }))
        .with_scrape_job(Arc::clone(&fixture.job) as Arc<dyn ScrapeJob>);
    let orchestrator = Orchestrator::new(config, collaborators, RunOptions::default());

    let error = orchestrator.run().await.unwrap_err();

    assert!(matches!(error, ScrapeError::Persistence(_)), "{error}");
    assert_eq!(error.exit_code(), 1);

    let db = fixture.reopen().await;
    let status: String = sqlx::query_scalar("SELECT status FROM scrape_run")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(status, "failed");
    let pages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM serp_page")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(pages, 6, "pages written before the failure must be committed");
    let links: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM link")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(links, 18);
}

#[tokio::test]
async fn crashed_worker_is_reported_after_the_others_persist() {
    let fixture = Fixture::new(ScriptedJob {
        panic_on_worker: Some(1),
        links_per_page: 1,
        ..ScriptedJob::default()
    });
    let orchestrator = fixture.orchestrator(
        json!({
            "scraping": { "keywords": ["one", "two", "three"] },
            "http": { "num_threads": 3 }
        }),
        &[],
    );

    let error = orchestrator.run().await.unwrap_err();

    let ScrapeError::WorkerCrashed { count, details } = &error else {
        panic!("expected a crash, got {error}");
    };
    assert_eq!(*count, 1);
    assert!(details.contains("lost its browser"));

    let db = fixture.reopen().await;
    let pages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM serp_page")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(pages, 2);
    let status: String = sqlx::query_scalar("SELECT status FROM scrape_run")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(status, "crashed");
}

#[tokio::test]
async fn keyword_file_and_flags_are_deduplicated() {
    let fixture = Fixture::new(ScriptedJob::default());
    let keyword_file = fixture.dir.path().join("keywords.txt");
    std::fs::write(&keyword_file, "rust\ntokio\n\n  rust  \nserde\n").unwrap();
    let orchestrator = fixture.orchestrator(
        json!({
            "scraping": { "keyword": "tokio", "keywords": ["axum"], "keyword_file": keyword_file },
            "http": { "num_threads": 8 }
        }),
        &[],
    );

    let RunOutcome::Completed(report) = orchestrator.run().await.unwrap() else {
        panic!("expected a completed run");
    };

    assert_eq!(report.keywords_total, 4);
    // fewer keywords than workers: one keyword per worker
    assert_eq!(report.workers, 4);
    assert!(fixture.job.seen().iter().all(|job| job.keywords.len() == 1));
}

#[tokio::test]
async fn missing_keyword_file_fails_with_resource_unavailable() {
    let fixture = Fixture::new(ScriptedJob::default());
    let missing = fixture.dir.path().join("nope.txt");
    let orchestrator = fixture.orchestrator(json!({ "scraping": { "keyword_file": missing } }), &[]);

    let error = orchestrator.run().await.unwrap_err();

    assert!(matches!(error, ScrapeError::ResourceUnavailable(_)), "{error}");
    assert!(fixture.job.seen().is_empty());
}

#[tokio::test]
async fn cached_keywords_are_not_scraped_again() {
    let fixture = Fixture::new(ScriptedJob::default());
    let cache = FsResultCache::new(fixture.dir.path().join("cache"));
    let context = SearchContext {
        search_type: SearchType::Normal,
        num_results_per_page: 10,
        num_pages_for_keyword: 1,
        scrape_method: ScrapeMethod::Http,
    };
    let cached = Keyword::new("cached").unwrap();
    cache
        .store(&cached, 1, &context, &page(&cached, 1, 2, "localhost".into()))
        .await
        .unwrap();

    let orchestrator = fixture.orchestrator(
        json!({ "scraping": { "keywords": ["cached", "fresh"] }, "http": { "num_threads": 2 } }),
        &[],
    );

    let RunOutcome::Completed(report) = orchestrator.run().await.unwrap() else {
        panic!("expected a completed run");
    };

    assert_eq!(report.keywords_total, 2);
    assert_eq!(report.keywords_scraped, 1);
    let seen = fixture.job.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].keywords.keywords(), &[Keyword::new("fresh").unwrap()]);
    assert!(matches!(report.jobs[0].outcome, JobOutcome::Finished(_)));

    // The cached page is replayed into this run's storage next to the fresh one
    assert_eq!(report.pages_from_cache, 1);
    assert_eq!(report.handler.batches_processed, 2);
    let db = report.storage.expect("storage is kept open");
    assert_eq!(db.count_pages_for_run(report.run_id).await.unwrap(), 2);
    assert_eq!(db.count_links_for_run(report.run_id).await.unwrap(), 2);
}
