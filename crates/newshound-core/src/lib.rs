use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod dedup;
mod window;

pub use dedup::LinkDeduper;
pub use window::{DateParseError, DateWindow, RelativeDateResolver, WindowError, WindowPosition};

pub const CRATE_NAME: &str = "newshound-core";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiscoveredLink {
    pub url: String,
    pub source_name: String,
}

impl DiscoveredLink {
    pub fn new(url: impl Into<String>, source_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            source_name: source_name.into(),
        }
    }
}

/// Persisted ticker row. Created implicitly on first article upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub id: i64,
    pub symbol: String,
    pub name: Option<String>,
    pub exchange: Option<String>,
    pub last_updated: DateTime<Utc>,
}

/// Write model handed to storage. `url` is the upsert key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleRecord {
    pub ticker_symbol: String,
    pub url: String,
    pub title: String,
    pub date_published: DateTime<Utc>,
    pub source: String,
    pub author: String,
    pub text: String,
    pub summary: Option<String>,
    /// Reserved; nothing in the pipeline scores sentiment yet.
    pub sentiment: Option<f64>,
    pub fetch_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub id: i64,
    pub ticker_id: i64,
    pub ticker_symbol: String,
    pub url: String,
    pub title: String,
    pub date_published: DateTime<Utc>,
    pub source: String,
    pub author: String,
    pub text: String,
    pub summary: Option<String>,
    pub sentiment: Option<f64>,
    pub fetch_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    AlreadyExists,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IngestResult {
    Added,
    Skipped(SkipReason),
    Failed(String),
}

impl IngestResult {
    pub fn is_added(&self) -> bool {
        matches!(self, IngestResult::Added)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerStats {
    pub symbol: String,
    pub count: u64,
    pub oldest_date: DateTime<Utc>,
    pub newest_date: DateTime<Utc>,
    pub avg_sentiment: Option<f64>,
}
