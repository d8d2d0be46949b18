//! Proxy list sources
//!
//! File format, one proxy per line:
//! ```text
//! # comment
//! socks5 10.0.0.7:1080 user:password
//! http proxy.internal:3128
//! ```

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

use crate::domain::{ProxyEndpoint, ProxyParseError};

#[derive(Error, Debug)]
pub enum ProxySourceError {
    #[error("Failed to read proxy file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid proxy on line {line} of {path:?}: {source}")]
    Parse {
        path: PathBuf,
        line: usize,
        #[source]
        source: ProxyParseError,
    },
}

#[async_trait]
pub trait ProxySource: Send + Sync {
    /// Loads the ordered proxy list. An empty list is valid.
    async fn load(&self) -> Result<Vec<ProxyEndpoint>, ProxySourceError>;
}

#[derive(Debug, Clone)]
pub struct FileProxySource {
    path: PathBuf,
}

impl FileProxySource {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ProxySource for FileProxySource {
    async fn load(&self) -> Result<Vec<ProxyEndpoint>, ProxySourceError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| ProxySourceError::Io {
                path: self.path.clone(),
                source,
            })?;

        let proxies = content
            .lines()
            .enumerate()
            .map(|(index, line)| (index + 1, line.trim()))
            .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
            .map(|(line, text)| {
                text.parse().map_err(|source| ProxySourceError::Parse {
                    path: self.path.clone(),
                    line,
                    source,
                })
            })
            .collect::<Result<Vec<ProxyEndpoint>, _>>()?;

        info!("Loaded {} proxies from {:?}", proxies.len(), self.path);
        Ok(proxies)
    }
}

/// In-memory proxy list
#[derive(Debug, Clone, Default)]
pub struct StaticProxySource {
    proxies: Vec<ProxyEndpoint>,
}

impl StaticProxySource {
    #[must_use]
    pub const fn new(proxies: Vec<ProxyEndpoint>) -> Self {
        Self { proxies }
    }

    #[must_use]
    pub const fn empty() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl ProxySource for StaticProxySource {
    async fn load(&self) -> Result<Vec<ProxyEndpoint>, ProxySourceError> {
        Ok(self.proxies.clone())
    }
}
