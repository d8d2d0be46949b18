//! Command line surface.
//!
//! Every flag maps onto a configuration key; [`Cli::to_overrides`] produces the
//! JSON object that is deep-merged over the configuration file.

use clap::Parser;
use serde_json::{Map, Value, json};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "serp-harvest",
    version,
    about = "Scrape search engine result pages for a keyword list"
)]
pub struct Cli {
    /// Configuration file (defaults to the per-user config directory)
    #[arg(long, short = 'c', env = "SERP_HARVEST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Single keyword to scrape
    #[arg(long, short = 'q')]
    pub keyword: Option<String>,

    /// Keyword to scrape; may be repeated
    #[arg(long = "keywords", value_name = "KEYWORD")]
    pub keywords: Vec<String>,

    /// File with one keyword per line
    #[arg(long)]
    pub keyword_file: Option<PathBuf>,

    /// File with one proxy per line: `<scheme> <host>:<port> [<user>:<password>]`
    #[arg(long)]
    pub proxy_file: Option<PathBuf>,

    /// `sel`, `http` or `http_async`
    #[arg(long, short = 'm')]
    pub scrape_method: Option<String>,

    /// `normal`, `video`, `news` or `image`
    #[arg(long)]
    pub search_type: Option<String>,

    #[arg(long)]
    pub num_results_per_page: Option<u32>,

    #[arg(long, short = 'p')]
    pub num_pages_for_keyword: Option<u32>,

    /// Worker count for both browser and HTTP modes
    #[arg(long, short = 'n')]
    pub num_workers: Option<usize>,

    /// Never fall back to this host's own address
    #[arg(long)]
    pub no_own_ip: bool,

    #[arg(long, env = "SERP_HARVEST_DATABASE_URL")]
    pub database_url: Option<String>,

    /// Commit after this many result batches
    #[arg(long)]
    pub commit_interval: Option<usize>,

    /// Cancel workers still running after this many seconds
    #[arg(long)]
    pub worker_timeout_secs: Option<u64>,

    /// Report the scope of work without scraping
    #[arg(long)]
    pub simulate: bool,

    /// Print the merged configuration and exit
    #[arg(long)]
    pub view_config: bool,

    #[arg(long)]
    pub no_cache: bool,

    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Remove cache entries older than this many hours before running
    #[arg(long)]
    pub clean_cache_after_hours: Option<u64>,

    /// Rename cache files to their canonical names and exit
    #[arg(long)]
    pub fix_cache_names: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, short = 'l', env = "SERP_HARVEST_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Also write logs to this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    #[arg(long)]
    pub json_logs: bool,
}

/// Inserts `value` under `section.key`, creating the section on demand
fn set(overrides: &mut Map<String, Value>, section: &str, key: &str, value: Value) {
    let entry = overrides
        .entry(section.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(section) = entry {
        section.insert(key.to_string(), value);
    }
}

impl Cli {
    /// Configuration overrides for the flags that were given
    #[must_use]
    pub fn to_overrides(&self) -> Value {
        let mut o = Map::new();

        if let Some(keyword) = &self.keyword {
            set(&mut o, "scraping", "keyword", json!(keyword));
        }
        if !self.keywords.is_empty() {
            set(&mut o, "scraping", "keywords", json!(self.keywords));
        }
        if let Some(path) = &self.keyword_file {
            set(&mut o, "scraping", "keyword_file", json!(path));
        }
        if let Some(method) = &self.scrape_method {
            set(&mut o, "scraping", "scrape_method", json!(method));
        }
        if let Some(search_type) = &self.search_type {
            set(&mut o, "scraping", "search_type", json!(search_type));
        }
        if let Some(n) = self.num_results_per_page {
            set(&mut o, "scraping", "num_results_per_page", json!(n));
        }
        if let Some(n) = self.num_pages_for_keyword {
            set(&mut o, "scraping", "num_pages_for_keyword", json!(n));
        }
        if self.no_own_ip {
            set(&mut o, "scraping", "use_own_ip", json!(false));
        }
        if let Some(n) = self.num_workers {
            set(&mut o, "selenium", "num_browser_instances", json!(n));
            set(&mut o, "http", "num_threads", json!(n));
        }

        if let Some(path) = &self.proxy_file {
            set(&mut o, "global", "proxy_file", json!(path));
        }
        if let Some(url) = &self.database_url {
            set(&mut o, "global", "database_url", json!(url));
        }
        if let Some(n) = self.commit_interval {
            set(&mut o, "global", "commit_interval", json!(n));
        }
        if let Some(secs) = self.worker_timeout_secs {
            set(&mut o, "global", "worker_join_timeout_secs", json!(secs));
        }
        if self.simulate {
            set(&mut o, "global", "simulate", json!(true));
        }
        if self.view_config {
            set(&mut o, "global", "view_config", json!(true));
        }

        if self.no_cache {
            set(&mut o, "cache", "do_caching", json!(false));
        }
        if let Some(dir) = &self.cache_dir {
            set(&mut o, "cache", "cache_dir", json!(dir));
        }
        if let Some(hours) = self.clean_cache_after_hours {
            set(&mut o, "cache", "clean_cache_after_hours", json!(hours));
        }
        if self.fix_cache_names {
            set(&mut o, "cache", "fix_cache_names", json!(true));
        }

        if let Some(level) = &self.log_level {
            set(&mut o, "logging", "level", json!(level));
        }
        if let Some(dir) = &self.log_dir {
            set(&mut o, "logging", "log_dir", json!(dir));
            set(&mut o, "logging", "file_output", json!(true));
        }
        if self.json_logs {
            set(&mut o, "logging", "json_format", json!(true));
        }

        Value::Object(o)
    }
}
