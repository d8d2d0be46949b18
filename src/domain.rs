//! Domain module - value types shared by scheduling, crawling and storage
//!
//! - `keywords`: validated search keywords and keyword groups
//! - `proxy`: egress descriptors (remote proxy or local egress)
//! - `results`: scraped page metadata, link results and result batches

pub mod keywords;
pub mod proxy;
pub mod results;

pub use keywords::{Keyword, KeywordError, KeywordGroup, KeywordSet};
pub use proxy::{Proxy, ProxyEndpoint, ProxyParseError, ProxyScheme};
pub use results::{LinkResult, PageMeta, ResultBatch, ScrapeMethod, SearchType};
