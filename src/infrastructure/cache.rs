//! # Result Cache
//!
//! One JSON file per scraped page, named by the blake3 hash of the page's cache
//! key (keyword, page number and search context). A keyword counts as cached
//! only when every page the run asks for is present and readable; its pages are
//! then replayed into the run's storage instead of being scraped again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::domain::{Keyword, KeywordSet, ResultBatch, ScrapeMethod, SearchType};

const CACHE_EXTENSION: &str = "json";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cache entry serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CacheError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Search parameters that make two fetches of the same keyword comparable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchContext {
    pub search_type: SearchType,
    pub num_results_per_page: u32,
    pub num_pages_for_keyword: u32,
    pub scrape_method: ScrapeMethod,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CacheKey {
    keyword: String,
    page: u32,
    search_type: SearchType,
    num_results_per_page: u32,
    scrape_method: ScrapeMethod,
}

impl CacheKey {
    fn new(keyword: &Keyword, page: u32, context: &SearchContext) -> Self {
        Self {
            keyword: keyword.to_string(),
            page,
            search_type: context.search_type,
            num_results_per_page: context.num_results_per_page,
            scrape_method: context.scrape_method,
        }
    }

    fn file_name(&self) -> String {
        let material = format!(
            "{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}",
            self.keyword,
            self.page,
            self.search_type,
            self.num_results_per_page,
            self.scrape_method
        );
        format!("{}.{CACHE_EXTENSION}", blake3::hash(material.as_bytes()).to_hex())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    key: CacheKey,
    stored_at: DateTime<Utc>,
    batch: ResultBatch,
}

/// Split of a run's keywords into work still to do and pages already cached
#[derive(Debug, Default)]
pub struct Reconciliation {
    /// Keywords missing at least one page
    pub remaining: KeywordSet,
    /// Every page of the fully cached keywords, in keyword then page order
    pub cached: Vec<ResultBatch>,
}

/// Cache collaborator consumed by the orchestrator and the scrape jobs
#[async_trait]
pub trait ResultCache: Send + Sync {
    /// Splits `keywords` into the ones still to scrape and the cached pages
    /// of the others
    async fn reconcile(
        &self,
        keywords: &KeywordSet,
        context: &SearchContext,
    ) -> Result<Reconciliation, CacheError>;

    async fn store(
        &self,
        keyword: &Keyword,
        page: u32,
        context: &SearchContext,
        batch: &ResultBatch,
    ) -> Result<(), CacheError>;

    /// Removes entries older than `max_age`; returns how many were removed
    async fn cleanup(&self, max_age: Duration) -> Result<usize, CacheError>;

    /// Renames entries whose file name does not match their key; returns how
    /// many were renamed
    async fn repair_names(&self) -> Result<usize, CacheError>;
}

#[derive(Debug, Clone)]
pub struct FsResultCache {
    dir: PathBuf,
}

impl FsResultCache {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    /// All pages of `keyword`, or `None` if any page is missing or unreadable
    async fn cached_pages(
        &self,
        keyword: &Keyword,
        context: &SearchContext,
    ) -> Result<Option<Vec<ResultBatch>>, CacheError> {
        let mut pages = Vec::new();

        for page in 1..=context.num_pages_for_keyword {
            let key = CacheKey::new(keyword, page, context);
            let path = self.entry_path(&key);
            let content = match fs::read(&path).await {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(CacheError::io(&path, e)),
            };
            match serde_json::from_slice::<CacheEntry>(&content) {
                Ok(entry) if entry.key == key => pages.push(entry.batch),
                Ok(_) => {
                    warn!(?path, "Cache entry belongs to another key, scraping again");
                    return Ok(None);
                }
                Err(e) => {
                    warn!(?path, error = %e, "Unreadable cache entry, scraping again");
                    return Ok(None);
                }
            }
        }

        Ok(Some(pages))
    }

    async fn entries(&self) -> Result<Vec<PathBuf>, CacheError> {
        let mut read_dir = match fs::read_dir(&self.dir).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CacheError::io(&self.dir, e)),
        };

        let mut paths = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| CacheError::io(&self.dir, e))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == CACHE_EXTENSION) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

#[async_trait]
impl ResultCache for FsResultCache {
    async fn reconcile(
        &self,
        keywords: &KeywordSet,
        context: &SearchContext,
    ) -> Result<Reconciliation, CacheError> {
        let mut reconciliation = Reconciliation::default();

        for keyword in keywords {
            match self.cached_pages(keyword, context).await? {
                Some(pages) => reconciliation.cached.extend(pages),
                None => {
                    reconciliation.remaining.insert(keyword.clone());
                }
            }
        }

        info!(
            total = keywords.len(),
            cached = keywords.len() - reconciliation.remaining.len(),
            cached_pages = reconciliation.cached.len(),
            remaining = reconciliation.remaining.len(),
            "Cache reconciliation done"
        );
        Ok(reconciliation)
    }

    async fn store(
        &self,
        keyword: &Keyword,
        page: u32,
        context: &SearchContext,
        batch: &ResultBatch,
    ) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CacheError::io(&self.dir, e))?;

        let entry = CacheEntry {
            key: CacheKey::new(keyword, page, context),
            stored_at: Utc::now(),
            batch: batch.clone(),
        };
        let path = self.entry_path(&entry.key);
        let tmp = path.with_extension("tmp");

        fs::write(&tmp, serde_json::to_vec(&entry)?)
            .await
            .map_err(|e| CacheError::io(&tmp, e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| CacheError::io(&path, e))?;

        debug!(%keyword, page, ?path, "Cached results page");
        Ok(())
    }

    async fn cleanup(&self, max_age: Duration) -> Result<usize, CacheError> {
        let now = SystemTime::now();
        let mut removed = 0;

        for path in self.entries().await? {
            let modified = fs::metadata(&path)
                .await
                .and_then(|meta| meta.modified())
                .map_err(|e| CacheError::io(&path, e))?;
            let age = now.duration_since(modified).unwrap_or_default();
            if age > max_age {
                fs::remove_file(&path)
                    .await
                    .map_err(|e| CacheError::io(&path, e))?;
                removed += 1;
            }
        }

        info!(removed, max_age_secs = max_age.as_secs(), "🧹 Cache cleanup finished");
        Ok(removed)
    }

    async fn repair_names(&self) -> Result<usize, CacheError> {
        let mut renamed = 0;

        for path in self.entries().await? {
            let content = fs::read(&path).await.map_err(|e| CacheError::io(&path, e))?;
            let entry: CacheEntry = match serde_json::from_slice(&content) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(?path, error = %e, "Skipping unreadable cache entry");
                    continue;
                }
            };

            let expected = self.entry_path(&entry.key);
            if expected == path {
                continue;
            }
            fs::rename(&path, &expected)
                .await
                .map_err(|e| CacheError::io(&path, e))?;
            debug!(from = ?path, to = ?expected, "Renamed cache entry");
            renamed += 1;
        }

        info!(renamed, "🔧 Cache file names repaired");
        Ok(renamed)
    }
}
