//! # Scrape Result Types
//!
//! One `ResultBatch` is one scraped results page: page metadata plus the
//! ranked links found on it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Hard cap the search engine enforces on results per page
pub const MAX_RESULTS_PER_PAGE: u32 = 100;

/// How a worker fetches pages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrapeMethod {
    /// Browser driven
    Sel,
    /// Lightweight concurrent HTTP fetches
    Http,
    /// Asynchronous HTTP fetches; not available in this release
    HttpAsync,
}

impl ScrapeMethod {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sel => "sel",
            Self::Http => "http",
            Self::HttpAsync => "http_async",
        }
    }
}

impl FromStr for ScrapeMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sel" => Ok(Self::Sel),
            "http" => Ok(Self::Http),
            "http_async" => Ok(Self::HttpAsync),
            other => Err(format!(
                "No such scrape method `{other}`. Use one of: sel, http, http_async"
            )),
        }
    }
}

impl fmt::Display for ScrapeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    Normal,
    Video,
    News,
    Image,
}

impl SearchType {
    pub const ALL: [Self; 4] = [Self::Normal, Self::Video, Self::News, Self::Image];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Video => "video",
            Self::News => "news",
            Self::Image => "image",
        }
    }

    /// Vertical selector understood by the search endpoint, if any
    #[must_use]
    pub const fn vertical(self) -> Option<&'static str> {
        match self {
            Self::Normal => None,
            Self::Video => Some("vid"),
            Self::News => Some("nws"),
            Self::Image => Some("isch"),
        }
    }
}

impl FromStr for SearchType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|candidate| candidate.as_str() == s)
            .ok_or_else(|| {
                format!("Invalid search type `{s}`. Select one of: normal, video, news, image")
            })
    }
}

impl fmt::Display for SearchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata of one scraped results page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMeta {
    pub page_number: u32,
    pub requested_at: DateTime<Utc>,
    pub num_results: u32,
    /// Result count as reported by the search engine, verbatim
    pub num_results_for_keyword: Option<String>,
    pub search_query: String,
    pub requested_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub rank: u32,
    pub domain: String,
}

/// One page worth of results, produced by exactly one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultBatch {
    pub page: PageMeta,
    pub links: Vec<LinkResult>,
}

impl ResultBatch {
    #[must_use]
    pub fn new(page: PageMeta, links: Vec<LinkResult>) -> Self {
        Self { page, links }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrape_method_round_trips_through_strings() {
        for method in [ScrapeMethod::Sel, ScrapeMethod::Http, ScrapeMethod::HttpAsync] {
            assert_eq!(method.as_str().parse::<ScrapeMethod>(), Ok(method));
        }
        assert!("selenium".parse::<ScrapeMethod>().is_err());
    }

    #[test]
    fn search_type_accepts_only_known_values() {
        assert_eq!("news".parse::<SearchType>(), Ok(SearchType::News));
        assert!("shopping".parse::<SearchType>().is_err());
        assert_eq!(SearchType::Normal.vertical(), None);
        assert_eq!(SearchType::Image.vertical(), Some("isch"));
    }
}
