//! Pipeline glue: runs source adapters, ingests the links they find and
//! moves link lists in and out of CSV.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use newshound_adapters::{
    ArticleExtractor, Credentials, HtmlArticleExtractor, HttpRenderer, PageRenderer, ProfileAdapter, SourceKind,
};
use newshound_core::DateWindow;
use newshound_storage::{HtmlArchive, HttpClientConfig, HttpFetcher, NewsStore};
use serde::Serialize;
use tracing::{info, warn};

mod config;
pub mod csv;
mod ingest;
mod orchestrator;

pub use config::{PipelineConfig, SourceConfig, SourceRegistry};
pub use ingest::{classify_source, ArticleIngestor, IngestDelay, IngestSummary};
pub use orchestrator::{ConfiguredAdapter, DiscoveryOrchestrator, DiscoveryRunSummary, SourceOutcome};

pub const CRATE_NAME: &str = "newshound-sync";

#[derive(Debug, Clone, Serialize)]
pub struct ScrapeSummary {
    pub ticker: String,
    pub discovery: DiscoveryRunSummary,
    pub ingest: IngestSummary,
}

/// Owns the store, render session and extractor for one process run.
pub struct NewsPipeline {
    config: PipelineConfig,
    store: NewsStore,
    renderer: Arc<dyn PageRenderer>,
    extractor: Arc<dyn ArticleExtractor>,
    orchestrator: DiscoveryOrchestrator,
}

impl NewsPipeline {
    pub async fn from_config(config: PipelineConfig) -> Result<Self> {
        let store = NewsStore::open(&config.db_path)
            .await
            .with_context(|| format!("opening news store {}", config.db_path.display()))?;
        let render_fetcher = HttpFetcher::new(HttpClientConfig {
            cookie_store: true,
            ..config.http_client_config()
        })?;
        let article_fetcher = HttpFetcher::new(config.http_client_config())?;
        Ok(Self {
            config,
            store,
            renderer: Arc::new(HttpRenderer::new(render_fetcher)),
            extractor: Arc::new(HtmlArticleExtractor::new(article_fetcher)),
            orchestrator: DiscoveryOrchestrator::new(),
        })
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn PageRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn ArticleExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &NewsStore {
        &self.store
    }

    pub fn adapter(&self, kind: SourceKind, credentials: Option<Credentials>, ceiling: Option<u32>) -> ProfileAdapter {
        let profile = match ceiling {
            Some(ceiling) => kind.profile().with_ceiling(ceiling),
            None => kind.profile(),
        };
        let adapter = ProfileAdapter::new(profile, self.renderer.clone()).with_timing(self.config.discovery_timing());
        match credentials {
            Some(credentials) => adapter.with_credentials(credentials),
            None => adapter,
        }
    }

    pub fn ingestor(&self) -> ArticleIngestor {
        ArticleIngestor::new(self.store.clone(), self.extractor.clone())
            .with_delay(self.config.ingest_delay())
            .with_failure_backoff(self.config.failure_backoff())
            .with_archive(self.config.archive_dir.clone().map(HtmlArchive::new))
    }

    pub async fn discover(
        &self,
        kind: SourceKind,
        term: &str,
        window: DateWindow,
        credentials: Option<Credentials>,
    ) -> DiscoveryRunSummary {
        let adapter = self.adapter(kind, credentials, None);
        self.orchestrator
            .run_all(&[ConfiguredAdapter::new(Arc::new(adapter), term, window)])
            .await
    }

    /// Runs every enabled source in `registry`. Authenticated sources whose
    /// credentials are not set are skipped with a warning.
    pub async fn discover_enabled(&self, registry: &SourceRegistry, term: &str, window: DateWindow) -> DiscoveryRunSummary {
        let mut adapters = Vec::new();
        for source in registry.enabled() {
            let credentials = source.credentials();
            if source.kind.requires_login() && credentials.is_none() {
                warn!(source = %source.kind, "credentials not configured; skipping source");
                continue;
            }
            let adapter = self.adapter(source.kind, credentials, source.ceiling);
            adapters.push(ConfiguredAdapter::new(Arc::new(adapter), term, window));
        }
        self.orchestrator.run_all(&adapters).await
    }

    pub async fn scrape_ticker(&self, ticker: &str, days: u32) -> Result<ScrapeSummary> {
        let window = DateWindow::trailing_days(Utc::now().date_naive(), days);
        let discovery = self.discover(SourceKind::YahooStock, ticker, window, None).await;
        let urls = discovery.all_links().map(|link| link.url.clone()).collect::<Vec<_>>();
        info!(ticker, links = urls.len(), "ingesting scraped links");
        let ingest = self
            .ingestor()
            .ingest_all(&urls, ticker)
            .await
            .with_context(|| format!("storing articles for {ticker}"))?;
        Ok(ScrapeSummary {
            ticker: ticker.to_string(),
            discovery,
            ingest,
        })
    }

    pub async fn ingest_links(&self, urls: &[String], ticker: &str) -> Result<IngestSummary> {
        self.ingestor()
            .ingest_all(urls, ticker)
            .await
            .with_context(|| format!("storing articles for {ticker}"))
    }

    pub async fn ingest_csv(&self, path: impl AsRef<Path>, ticker: &str) -> Result<IngestSummary> {
        let urls = csv::read_links(path).await?;
        self.ingest_links(&urls, ticker).await
    }

    pub async fn close(self) {
        self.store.close().await;
    }
}

pub async fn run_discover_all_from_env(term: &str, window: DateWindow) -> Result<DiscoveryRunSummary> {
    let config = PipelineConfig::from_env();
    let registry = SourceRegistry::load(config.registry_path()).await?;
    let pipeline = NewsPipeline::from_config(config).await?;
    let summary = pipeline.discover_enabled(&registry, term, window).await;
    pipeline.close().await;
    Ok(summary)
}

pub async fn run_scrape_from_env(ticker: &str, days: u32) -> Result<ScrapeSummary> {
    let pipeline = NewsPipeline::from_config(PipelineConfig::from_env()).await?;
    let summary = pipeline.scrape_ticker(ticker, days).await;
    pipeline.close().await;
    summary
}
