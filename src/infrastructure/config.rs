//! Configuration infrastructure
//!
//! One immutable `AppConfig` value per run. It is read from a JSON file, then
//! caller overrides (CLI flags or a programmatic mapping) are deep-merged on
//! top. Nothing reads configuration from ambient globals.
//!
//! Sections:
//! 1. `global`: storage, commit cadence, run modes
//! 2. `scraping`: keywords, method, search parameters, egress policy
//! 3. `selenium` / `http`: per-method worker settings
//! 4. `cache`: result cache behaviour and maintenance
//! 5. `logging`: log outputs and levels

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

use crate::crawling::ScrapeError;

/// Complete application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub global: GlobalConfig,
    pub scraping: ScrapingConfig,
    pub selenium: SeleniumConfig,
    pub http: HttpConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Proxy list file; no file means no configured proxies
    pub proxy_file: Option<PathBuf>,

    /// sqlx SQLite URL, e.g. `sqlite:results.db`
    pub database_url: String,

    /// Number of persisted pages between transaction commits
    pub commit_interval: usize,

    /// Report the intended scope of work and stop before any network activity
    pub simulate: bool,

    /// Print the merged configuration and stop
    pub view_config: bool,

    /// Upper bound for joining workers; unbounded when absent
    pub worker_join_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapingConfig {
    pub keyword: Option<String>,
    pub keywords: Vec<String>,
    pub keyword_file: Option<PathBuf>,

    /// `sel`, `http` or `http_async`
    pub scrape_method: String,

    /// `normal`, `video`, `news` or `image`
    pub search_type: String,

    pub num_results_per_page: u32,
    pub num_pages_for_keyword: u32,

    /// Allow scraping from the host's own address when no proxy is configured
    pub use_own_ip: bool,

    pub search_url: String,
    pub sleep_min_ms: u64,
    pub sleep_max_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeleniumConfig {
    pub num_browser_instances: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub num_threads: usize,
    pub request_timeout_seconds: u64,
    /// Fixed user agent; rotated from a built-in list when absent
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub do_caching: bool,
    pub cache_dir: PathBuf,
    /// Remove cache entries older than this many hours before the run
    pub clean_cache_after_hours: Option<u64>,
    /// Repair cache file names and exit
    pub fix_cache_names: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    pub level: String,

    /// Enable JSON formatted file logs
    pub json_format: bool,

    /// Enable console output (stderr)
    pub console_output: bool,

    /// Enable file output
    pub file_output: bool,

    /// Directory for the log file; `logs/` next to the working directory when absent
    pub log_dir: Option<PathBuf>,

    pub file_name: String,

    /// Module-specific log level filters (e.g., "sqlx": "warn", "reqwest": "info")
    pub module_filters: HashMap<String, String>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            proxy_file: None,
            database_url: defaults::DATABASE_URL.to_string(),
            commit_interval: defaults::COMMIT_INTERVAL,
            simulate: false,
            view_config: false,
            worker_join_timeout_secs: None,
        }
    }
}

impl Default for ScrapingConfig {
    fn default() -> Self {
        Self {
            keyword: None,
            keywords: Vec::new(),
            keyword_file: None,
            scrape_method: defaults::SCRAPE_METHOD.to_string(),
            search_type: defaults::SEARCH_TYPE.to_string(),
            num_results_per_page: defaults::NUM_RESULTS_PER_PAGE,
            num_pages_for_keyword: defaults::NUM_PAGES_FOR_KEYWORD,
            use_own_ip: true,
            search_url: defaults::SEARCH_URL.to_string(),
            sleep_min_ms: defaults::SLEEP_MIN_MS,
            sleep_max_ms: defaults::SLEEP_MAX_MS,
        }
    }
}

impl Default for SeleniumConfig {
    fn default() -> Self {
        Self {
            num_browser_instances: defaults::NUM_BROWSER_INSTANCES,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            num_threads: defaults::NUM_HTTP_THREADS,
            request_timeout_seconds: defaults::REQUEST_TIMEOUT_SECONDS,
            user_agent: None,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            do_caching: true,
            cache_dir: PathBuf::from(defaults::CACHE_DIR),
            clean_cache_after_hours: None,
            fix_cache_names: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            console_output: true,
            file_output: false,
            log_dir: None,
            file_name: defaults::LOG_FILE_NAME.to_string(),
            module_filters: HashMap::new(),
        }
    }
}

/// Configuration defaults
pub mod defaults {
    pub const DATABASE_URL: &str = "sqlite:serp_harvest.db";

    /// Pages persisted between commits
    pub const COMMIT_INTERVAL: usize = 10;

    pub const SCRAPE_METHOD: &str = "http";
    pub const SEARCH_TYPE: &str = "normal";
    pub const NUM_RESULTS_PER_PAGE: u32 = 10;
    pub const NUM_PAGES_FOR_KEYWORD: u32 = 1;
    pub const SEARCH_URL: &str = "https://www.google.com/search";

    pub const SLEEP_MIN_MS: u64 = 1000;
    pub const SLEEP_MAX_MS: u64 = 3000;

    pub const NUM_BROWSER_INSTANCES: usize = 1;
    pub const NUM_HTTP_THREADS: usize = 1;
    pub const REQUEST_TIMEOUT_SECONDS: u64 = 30;

    pub const CACHE_DIR: &str = ".scrapecache";
    pub const LOG_FILE_NAME: &str = "serp-harvest.log";

    pub const CONFIG_FILE_NAME: &str = "config.json";
    pub const APP_DIR_NAME: &str = "serp-harvest";
}

/// Configuration file loader
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Get the application configuration directory
    pub fn get_config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get user config directory")?
            .join(defaults::APP_DIR_NAME);

        Ok(config_dir)
    }

    /// Manager for the per-user configuration file
    pub fn new() -> Result<Self> {
        let config_path = Self::get_config_dir()?.join(defaults::CONFIG_FILE_NAME);
        Ok(Self { config_path })
    }

    #[must_use]
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: path.into(),
        }
    }

    #[must_use]
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load configuration from file; a missing file yields defaults
    pub async fn load_config(&self) -> Result<AppConfig> {
        if !self.config_path.exists() {
            info!("Configuration file not found, using defaults: {:?}", self.config_path);
            return Ok(AppConfig::default());
        }

        let content = fs::read_to_string(&self.config_path)
            .await
            .with_context(|| format!("Failed to read configuration file {:?}", self.config_path))?;

        let config = serde_json::from_str::<AppConfig>(&content)
            .with_context(|| format!("Invalid configuration file {:?}", self.config_path))?;

        info!("Loaded configuration from: {:?}", self.config_path);
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save_config(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        let content =
            serde_json::to_string_pretty(config).context("Failed to serialize configuration")?;

        fs::write(&self.config_path, content)
            .await
            .context("Failed to write configuration file")?;

        info!("Saved configuration to: {:?}", self.config_path);
        Ok(())
    }

    /// Deep-merges a JSON object of overrides into `config`.
    ///
    /// Nested objects merge key by key; any other value replaces the current
    /// one, and `null` resets an optional field.
    ///
    /// # Errors
    /// `ScrapeError::Configuration` if `overrides` is not an object or the merged
    /// document no longer describes a valid configuration.
    pub fn apply_overrides(config: AppConfig, overrides: &Value) -> Result<AppConfig, ScrapeError> {
        if !overrides.is_object() {
            return Err(ScrapeError::configuration(format!(
                "Configuration overrides must be a JSON object, got: {overrides}"
            )));
        }

        let mut merged = serde_json::to_value(config)
            .map_err(|e| ScrapeError::configuration(format!("Failed to serialize configuration: {e}")))?;
        merge_json(&mut merged, overrides);

        serde_json::from_value(merged)
            .map_err(|e| ScrapeError::configuration(format!("Invalid configuration override: {e}")))
    }
}

fn merge_json(base: &mut Value, overrides: &Value) {
    match (base, overrides) {
        (Value::Object(base), Value::Object(overrides)) => {
            for (key, value) in overrides {
                let nested = value.is_object() && base.get(key).is_some_and(Value::is_object);
                if nested {
                    if let Some(existing) = base.get_mut(key) {
                        merge_json(existing, value);
                    }
                } else {
                    base.insert(key.clone(), value.clone());
                }
            }
        }
        (base, overrides) => *base = overrides.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.global.commit_interval, 10);
        assert_eq!(config.scraping.search_type, "normal");
        assert!(config.scraping.use_own_ip);
        assert!(config.global.worker_join_timeout_secs.is_none());
    }

    #[test]
    fn overrides_merge_nested_sections() {
        let config = ConfigManager::apply_overrides(
            AppConfig::default(),
            &json!({
                "scraping": { "keyword": "rust", "num_pages_for_keyword": 3 },
                "selenium": { "num_browser_instances": 4 }
            }),
        )
        .unwrap();

        assert_eq!(config.scraping.keyword.as_deref(), Some("rust"));
        assert_eq!(config.scraping.num_pages_for_keyword, 3);
        assert_eq!(config.selenium.num_browser_instances, 4);
        // untouched siblings keep their values
        assert_eq!(config.scraping.search_type, "normal");
        assert_eq!(config.http, HttpConfig::default());
    }

    #[test]
    fn non_object_override_is_a_configuration_error() {
        let error = ConfigManager::apply_overrides(AppConfig::default(), &json!(["keyword"]))
            .unwrap_err();
        assert!(error.is_configuration());
    }

    #[test]
    fn mistyped_override_is_a_configuration_error() {
        let error = ConfigManager::apply_overrides(
            AppConfig::default(),
            &json!({ "global": { "commit_interval": "often" } }),
        )
        .unwrap_err();
        assert!(matches!(error, ScrapeError::Configuration(_)));
    }

    #[tokio::test]
    async fn missing_file_yields_defaults_and_partial_file_is_accepted() {
        let dir = tempdir().unwrap();

        let missing = ConfigManager::with_path(dir.path().join("absent.json"));
        assert_eq!(missing.load_config().await.unwrap(), AppConfig::default());

        let path = dir.path().join("partial.json");
        std::fs::write(&path, r#"{ "http": { "num_threads": 8 } }"#).unwrap();
        let config = ConfigManager::with_path(&path).load_config().await.unwrap();
        assert_eq!(config.http.num_threads, 8);
        assert_eq!(config.http.request_timeout_seconds, defaults::REQUEST_TIMEOUT_SECONDS);
    }

    #[tokio::test]
    async fn saved_config_loads_back() {
        let dir = tempdir().unwrap();
        let manager = ConfigManager::with_path(dir.path().join("nested").join("config.json"));
        let mut config = AppConfig::default();
        config.scraping.keywords = vec!["a".into(), "b".into()];

        manager.save_config(&config).await.unwrap();

        assert_eq!(manager.load_config().await.unwrap(), config);
    }
}
