//! Infrastructure layer: configuration, logging, storage and the external
//! collaborators (proxy sources, result cache) the orchestrator consumes.

pub mod cache; // Filesystem result cache
pub mod cli; // Command line surface
pub mod config; // Configuration loading and overrides
pub mod database_connection; // SQLite bootstrap and result sink
pub mod logging; // Logging infrastructure
pub mod proxy_source; // Proxy list loading

pub use cli::Cli;
pub use cache::{CacheError, FsResultCache, Reconciliation, ResultCache, SearchContext};
pub use config::{AppConfig, ConfigManager, LoggingConfig};
pub use database_connection::{DatabaseConnection, SqliteBootstrap, SqliteResultSink, StorageBootstrap};
pub use logging::{init_logging, init_logging_with_config};
pub use proxy_source::{FileProxySource, ProxySource, ProxySourceError, StaticProxySource};
