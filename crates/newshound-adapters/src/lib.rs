use std::sync::Arc;

use async_trait::async_trait;
use newshound_core::{DateWindow, DiscoveredLink};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod discovery;
mod extract;
mod fixture;
mod profile;
mod render;

pub use discovery::{Credentials, DiscoveryTiming, ProfileAdapter};
pub use extract::{parse_article_html, ArticleExtractor, ExtractedArticle, ExtractionError, HtmlArticleExtractor};
pub use fixture::{load_fixture_renderer, load_fixture_site, FixturePage, FixtureRenderer, FixtureSite, RenderLog};
pub use profile::{
    BoundaryPolicy, LoginProfile, MissingDatePolicy, PaginationMode, SourceKind, SourceProfile, UnknownSource,
    UnparseableDatePolicy,
};
pub use render::{find_element, split_identifier, HttpRenderer, PageHandle, PageRenderer, RenderError};

pub const CRATE_NAME: &str = "newshound-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{source_name} unavailable: {reason}")]
    SourceUnavailable { source_name: String, reason: String },
    #[error("{source_name} rejected the login")]
    LoginRejected { source_name: String },
    #[error("{source_name} needs credentials but none were supplied")]
    MissingCredentials { source_name: String },
    #[error("invalid selector {selector:?}: {reason}")]
    InvalidSelector { selector: String, reason: String },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AdapterError {
    /// Failures that cost one source its results without ending the batch.
    pub fn is_source_failure(&self) -> bool {
        matches!(
            self,
            AdapterError::SourceUnavailable { .. }
                | AdapterError::LoginRejected { .. }
                | AdapterError::MissingCredentials { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    EmptyPage,
    BoundaryReached,
    UnparseableDate,
    ContentStalled,
    SinglePage,
    CeilingExhausted,
}

impl StopReason {
    pub fn is_natural(self) -> bool {
        !matches!(self, StopReason::CeilingExhausted)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryReport {
    pub source_name: String,
    pub links: Vec<DiscoveredLink>,
    pub stop_reason: StopReason,
    pub pages_visited: u32,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_name(&self) -> &str;

    async fn discover(&self, term: &str, window: &DateWindow) -> Result<DiscoveryReport, AdapterError>;
}

/// A source that signs in once before discovery. `discover` performs the
/// login itself; calling `login` directly is only needed to check credentials.
#[async_trait]
pub trait AuthenticatedSourceAdapter: SourceAdapter {
    async fn login(&self) -> Result<(), AdapterError>;
}

pub fn adapter_for_source(
    kind: SourceKind,
    renderer: Arc<dyn PageRenderer>,
    timing: DiscoveryTiming,
    credentials: Option<Credentials>,
) -> ProfileAdapter {
    let adapter = ProfileAdapter::new(kind.profile(), renderer).with_timing(timing);
    match credentials {
        Some(credentials) => adapter.with_credentials(credentials),
        None => adapter,
    }
}
