//! Plain HTTP scrape job
//!
//! Fetches every results page of every keyword in the job's group through the
//! assigned proxy, extracts outbound links generically and hands one batch per
//! page to the results handler. No rendering, no CAPTCHA solving and no retry
//! inside a single fetch. A blocked worker backs off under the run-wide captcha
//! lock before giving up on the keyword.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use scraper::{Html, Selector};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use url::Url;

use crate::crawling::jobs::{
    JobContext, JobDescriptor, JobSettings, JobSummary, ScrapeJob, WorkerError,
};
use crate::domain::{Keyword, LinkResult, PageMeta, Proxy, ResultBatch};

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_4) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
];

/// Outcome of scraping one keyword
enum KeywordProgress {
    Completed,
    Blocked,
    Cancelled,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HttpScrapeJob;

impl HttpScrapeJob {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn build_client(proxy: &Proxy, settings: &JobSettings) -> Result<Client, WorkerError> {
        let user_agent = settings.user_agent.clone().unwrap_or_else(|| {
            USER_AGENTS[fastrand::usize(..USER_AGENTS.len())].to_string()
        });

        let mut builder = Client::builder()
            .timeout(settings.request_timeout)
            .cookie_store(true)
            .gzip(true)
            .brotli(true)
            .user_agent(user_agent);

        builder = match proxy.endpoint() {
            Some(endpoint) => builder.proxy(
                reqwest::Proxy::all(endpoint.to_url())
                    .map_err(|e| WorkerError::Initialization(format!("Invalid proxy {proxy}: {e}")))?,
            ),
            None => builder.no_proxy(),
        };

        builder
            .build()
            .map_err(|e| WorkerError::Initialization(e.to_string()))
    }

    async fn scrape_keyword(
        client: &Client,
        job: &JobDescriptor,
        keyword: &Keyword,
        ctx: &JobContext,
        summary: &mut JobSummary,
    ) -> Result<KeywordProgress, WorkerError> {
        let settings = &ctx.settings;

        for page in 1..=settings.search.num_pages_for_keyword {
            if ctx.cancellation.is_cancelled() {
                return Ok(KeywordProgress::Cancelled);
            }

            let url = search_url(settings, keyword, page)?;
            debug!(worker = job.worker_identity, %keyword, page, %url, "Fetching results page");

            let response = match client.get(url.clone()).send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!(worker = job.worker_identity, %keyword, page, error = %e, "Request failed");
                    summary.pages_failed += 1;
                    continue;
                }
            };

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
                let _captcha = ctx.locks.captcha.lock().await;
                warn!(
                    worker = job.worker_identity,
                    proxy = %job.proxy,
                    %keyword,
                    page,
                    status = status.as_u16(),
                    "🚧 Blocked by search engine, backing off before abandoning keyword"
                );
                if !pause(settings, ctx).await {
                    return Ok(KeywordProgress::Cancelled);
                }
                return Ok(KeywordProgress::Blocked);
            }
            if !status.is_success() {
                warn!(worker = job.worker_identity, %keyword, page, status = status.as_u16(), "Unexpected status");
                summary.pages_failed += 1;
                continue;
            }

            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    warn!(worker = job.worker_identity, %keyword, page, error = %e, "Failed to read body");
                    summary.pages_failed += 1;
                    continue;
                }
            };

            let parsed = parse_results_page(&body, url.host_str())?;
            let batch = ResultBatch::new(
                PageMeta {
                    page_number: page,
                    requested_at: Utc::now(),
                    num_results: u32::try_from(parsed.links.len()).unwrap_or(u32::MAX),
                    num_results_for_keyword: parsed.result_stats,
                    search_query: keyword.to_string(),
                    requested_by: job.proxy.to_string(),
                },
                parsed.links,
            );

            if let Some(cache) = &ctx.cache {
                let _cache_guard = ctx.locks.cache.lock().await;
                cache
                    .store(keyword, page, &settings.search, &batch)
                    .await
                    .map_err(|e| WorkerError::Cache(e.to_string()))?;
            }

            ctx.results.put(batch)?;
            summary.pages_scraped += 1;

            if page < settings.search.num_pages_for_keyword && !pause(settings, ctx).await {
                return Ok(KeywordProgress::Cancelled);
            }
        }

        Ok(KeywordProgress::Completed)
    }
}

#[async_trait]
impl ScrapeJob for HttpScrapeJob {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn run(&self, job: JobDescriptor, ctx: JobContext) -> Result<JobSummary, WorkerError> {
        let client = Self::build_client(&job.proxy, &ctx.settings)?;
        let mut summary = JobSummary::default();

        for (position, keyword) in job.keywords.iter().enumerate() {
            if position > 0 && !pause(&ctx.settings, &ctx).await {
                return Err(WorkerError::Cancelled);
            }

            match Self::scrape_keyword(&client, &job, keyword, &ctx, &mut summary).await? {
                KeywordProgress::Completed => summary.keywords_done += 1,
                KeywordProgress::Blocked => summary.blocked_keywords += 1,
                KeywordProgress::Cancelled => {
                    info!(worker = job.worker_identity, "Run cancelled, stopping worker");
                    return Err(WorkerError::Cancelled);
                }
            }
        }

        Ok(summary)
    }
}

/// Sleeps a random delay between requests. Returns false if the run was
/// cancelled meanwhile.
async fn pause(settings: &JobSettings, ctx: &JobContext) -> bool {
    let min = settings.sleep_min.as_millis();
    let max = settings.sleep_max.as_millis().max(min);
    let millis = u64::try_from(fastrand::u128(min..=max)).unwrap_or(u64::MAX);
    if millis == 0 {
        return !ctx.cancellation.is_cancelled();
    }

    tokio::select! {
        () = ctx.cancellation.cancelled() => false,
        () = sleep(Duration::from_millis(millis)) => true,
    }
}

fn search_url(settings: &JobSettings, keyword: &Keyword, page: u32) -> Result<Url, WorkerError> {
    let per_page = settings.search.num_results_per_page;
    let start = page.saturating_sub(1).checked_mul(per_page).ok_or_else(|| {
        WorkerError::Initialization(format!(
            "Result offset of page {page} with {per_page} results per page overflows"
        ))
    })?;

    let mut url = Url::parse(&settings.search_url).map_err(|e| {
        WorkerError::Initialization(format!("Invalid search URL {}: {e}", settings.search_url))
    })?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("q", keyword.as_str())
            .append_pair("num", &per_page.to_string())
            .append_pair("start", &start.to_string());
        if let Some(vertical) = settings.search.search_type.vertical() {
            query.append_pair("tbm", vertical);
        }
    }
    Ok(url)
}

struct ParsedPage {
    links: Vec<LinkResult>,
    result_stats: Option<String>,
}

/// Collects absolute outbound links in document order. Links back to the
/// search engine itself are skipped.
fn parse_results_page(html: &str, search_host: Option<&str>) -> Result<ParsedPage, WorkerError> {
    let document = Html::parse_document(html);
    let link_selector = Selector::parse("a[href]")
        .map_err(|e| WorkerError::Initialization(format!("Invalid CSS selector: {e:?}")))?;
    let stats_selector = Selector::parse("#result-stats")
        .map_err(|e| WorkerError::Initialization(format!("Invalid CSS selector: {e:?}")))?;

    let mut links = Vec::new();
    for element in document.select(&link_selector) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let Ok(target) = Url::parse(href) else {
            continue;
        };
        if !matches!(target.scheme(), "http" | "https") {
            continue;
        }
        let Some(domain) = target.host_str().map(str::to_string) else {
            continue;
        };
        if search_host.is_some_and(|host| domain == host || domain.ends_with(&format!(".{host}"))) {
            continue;
        }

        let title = element
            .value()
            .attr("title")
            .map(str::to_string)
            .unwrap_or_else(|| element.text().collect::<Vec<_>>().join(" "))
            .trim()
            .to_string();
        if title.is_empty() {
            continue;
        }

        let snippet = element
            .parent()
            .and_then(scraper::ElementRef::wrap)
            .map(|parent| parent.text().collect::<Vec<_>>().join(" "))
            .map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|text| text != &title)
            .unwrap_or_default();

        links.push(LinkResult {
            title,
            url: target.to_string(),
            snippet,
            rank: u32::try_from(links.len() + 1).unwrap_or(u32::MAX),
            domain,
        });
    }

    let result_stats = document
        .select(&stats_selector)
        .next()
        .map(|element| element.text().collect::<String>().trim().to_string())
        .filter(|text| !text.is_empty());

    Ok(ParsedPage {
        links,
        result_stats,
    })
}
