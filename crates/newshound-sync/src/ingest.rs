use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use newshound_adapters::{ArticleExtractor, ExtractedArticle};
use newshound_core::{ArticleRecord, IngestResult, SkipReason};
use newshound_storage::{HtmlArchive, NewsStore, StorageError};
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;

/// Known publisher hosts. Matching picks the longest suffix that fits.
const KNOWN_SOURCES: &[(&str, &str)] = &[
    ("finance.yahoo.com", "Yahoo Finance"),
    ("yahoo.com", "Yahoo Finance"),
    ("bloomberg.com", "Bloomberg"),
    ("reuters.com", "Reuters"),
    ("marketwatch.com", "MarketWatch"),
    ("seekingalpha.com", "Seeking Alpha"),
    ("ft.com", "Financial Times"),
    ("barrons.com", "Barron's"),
];

const UNKNOWN: &str = "Unknown";

pub fn classify_source(url: &str) -> String {
    let Some(host) = Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_ascii_lowercase))
    else {
        return UNKNOWN.to_string();
    };
    KNOWN_SOURCES
        .iter()
        .filter(|(suffix, _)| {
            host == *suffix
                || host
                    .strip_suffix(suffix)
                    .is_some_and(|rest| rest.ends_with('.'))
        })
        .max_by_key(|(suffix, _)| suffix.len())
        .map(|(_, name)| name.to_string())
        .unwrap_or_else(|| UNKNOWN.to_string())
}

/// Pause taken before every article fetch: a fixed base plus up to `jitter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestDelay {
    pub base: Duration,
    pub jitter: Duration,
}

impl IngestDelay {
    pub fn new(base: Duration, jitter: Duration) -> Self {
        Self { base, jitter }
    }

    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    pub fn sample(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.base;
        }
        self.base + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }

    async fn wait(&self) {
        let pause = self.sample();
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub added: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl IngestSummary {
    fn record(&mut self, result: &IngestResult) {
        match result {
            IngestResult::Added => self.added += 1,
            IngestResult::Skipped(_) => self.skipped += 1,
            IngestResult::Failed(_) => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.added + self.skipped + self.failed
    }
}

#[derive(Clone)]
pub struct ArticleIngestor {
    store: NewsStore,
    extractor: Arc<dyn ArticleExtractor>,
    delay: IngestDelay,
    failure_backoff: Duration,
    archive: Option<HtmlArchive>,
}

impl ArticleIngestor {
    pub fn new(store: NewsStore, extractor: Arc<dyn ArticleExtractor>) -> Self {
        Self {
            store,
            extractor,
            delay: IngestDelay::none(),
            failure_backoff: Duration::ZERO,
            archive: None,
        }
    }

    pub fn with_delay(mut self, delay: IngestDelay) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_failure_backoff(mut self, backoff: Duration) -> Self {
        self.failure_backoff = backoff;
        self
    }

    pub fn with_archive(mut self, archive: Option<HtmlArchive>) -> Self {
        self.archive = archive;
        self
    }

    pub fn store(&self) -> &NewsStore {
        &self.store
    }

    /// Ingests one URL for `ticker`. Only storage faults surface as `Err`;
    /// extraction problems come back as [`IngestResult::Failed`].
    pub async fn ingest(&self, url: &str, ticker: &str) -> Result<IngestResult, StorageError> {
        let span = info_span!("ingest", url, ticker);
        async {
            if self.store.exists_by_url(url).await? {
                debug!("already stored");
                return Ok(IngestResult::Skipped(SkipReason::AlreadyExists));
            }
            self.fetch_and_store(url, ticker).await
        }
        .instrument(span)
        .await
    }

    /// Fetches even when the URL is already stored.
    pub async fn refresh(&self, url: &str, ticker: &str) -> Result<IngestResult, StorageError> {
        self.fetch_and_store(url, ticker)
            .instrument(info_span!("refresh", url, ticker))
            .await
    }

    /// Ingests every URL in order. A failed extraction is followed by one
    /// backoff pause before moving on; a storage fault aborts the batch.
    pub async fn ingest_all<I, S>(&self, urls: I, ticker: &str) -> Result<IngestSummary, StorageError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut summary = IngestSummary::default();
        for url in urls {
            let result = self.ingest(url.as_ref(), ticker).await?;
            summary.record(&result);
            if matches!(result, IngestResult::Failed(_)) && !self.failure_backoff.is_zero() {
                tokio::time::sleep(self.failure_backoff).await;
            }
        }
        info!(
            ticker,
            added = summary.added,
            skipped = summary.skipped,
            failed = summary.failed,
            "ingest batch finished"
        );
        Ok(summary)
    }

    async fn fetch_and_store(&self, url: &str, ticker: &str) -> Result<IngestResult, StorageError> {
        self.delay.wait().await;
        let article = match self.extractor.extract(url).await {
            Ok(article) => article,
            Err(err) => {
                warn!(url, error = %err, "article extraction failed");
                return Ok(IngestResult::Failed(err.to_string()));
            }
        };

        let source = classify_source(url);
        self.archive_html(url, &source, &article).await;

        let record = to_record(url, ticker, source, article);
        let outcome = self.store.upsert_article(&record).await?;
        info!(url, source = %record.source, ?outcome, "article stored");
        Ok(IngestResult::Added)
    }

    async fn archive_html(&self, url: &str, source: &str, article: &ExtractedArticle) {
        let (Some(archive), Some(html)) = (&self.archive, &article.html) else {
            return;
        };
        match archive.save(source, url, Utc::now(), html).await {
            Ok(entry) => debug!(
                url,
                path = %entry.path.display(),
                reused = entry.reused,
                "raw html archived"
            ),
            Err(err) => warn!(url, error = %err, "archiving raw html failed"),
        }
    }
}

fn to_record(url: &str, ticker: &str, source: String, article: ExtractedArticle) -> ArticleRecord {
    let now = Utc::now();
    let author = if article.authors.is_empty() {
        UNKNOWN.to_string()
    } else {
        article.authors.join(", ")
    };
    ArticleRecord {
        ticker_symbol: ticker.to_string(),
        url: url.to_string(),
        title: article.title,
        date_published: article.publish_date.unwrap_or(now),
        source,
        author,
        text: article.text,
        summary: article.summary,
        sentiment: None,
        fetch_date: now,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use newshound_adapters::ExtractionError;

    use super::*;

    #[derive(Default)]
    struct StubExtractor {
        pages: Mutex<HashMap<String, ExtractedArticle>>,
        calls: Mutex<Vec<String>>,
    }

    impl StubExtractor {
        fn set(&self, url: &str, title: &str, text: &str) {
            let article = ExtractedArticle {
                title: title.to_string(),
                text: text.to_string(),
                authors: vec!["Jane Doe".into(), "John Roe".into()],
                publish_date: Some(Utc.with_ymd_and_hms(2024, 5, 2, 9, 0, 0).unwrap()),
                html: Some(format!("<html><body><p>{text}</p></body></html>")),
                ..Default::default()
            };
            self.pages.lock().unwrap().insert(url.to_string(), article);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ArticleExtractor for StubExtractor {
        async fn extract(&self, url: &str) -> Result<ExtractedArticle, ExtractionError> {
            self.calls.lock().unwrap().push(url.to_string());
            self.pages
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .ok_or_else(|| ExtractionError::Fetch {
                    url: url.to_string(),
                    reason: "connection reset".into(),
                })
        }
    }

    async fn ingestor(extractor: Arc<StubExtractor>) -> ArticleIngestor {
        let store = NewsStore::open_in_memory().await.unwrap();
        ArticleIngestor::new(store, extractor)
    }

    #[test]
    fn classifies_by_longest_host_suffix() {
        assert_eq!(classify_source("https://finance.yahoo.com/news/x.html"), "Yahoo Finance");
        assert_eq!(classify_source("https://news.yahoo.com/x"), "Yahoo Finance");
        assert_eq!(classify_source("https://www.ft.com/content/abc"), "Financial Times");
        assert_eq!(classify_source("https://www.barrons.com/articles/x"), "Barron's");
        assert_eq!(classify_source("https://WWW.Reuters.com/markets/"), "Reuters");
        assert_eq!(classify_source("https://microsoft.com/news"), "Unknown");
        assert_eq!(classify_source("https://notft.com/x"), "Unknown");
        assert_eq!(classify_source("not a url"), "Unknown");
    }

    #[test]
    fn delay_stays_within_base_plus_jitter() {
        let delay = IngestDelay::new(Duration::from_millis(20), Duration::from_millis(10));
        for _ in 0..50 {
            let pause = delay.sample();
            assert!(pause >= Duration::from_millis(20));
            assert!(pause <= Duration::from_millis(30));
        }
        assert_eq!(IngestDelay::none().sample(), Duration::ZERO);
    }

    #[tokio::test]
    async fn second_ingest_of_same_url_is_skipped_without_fetching() {
        let extractor = Arc::new(StubExtractor::default());
        extractor.set("https://www.reuters.com/a", "Apple rallies", "Shares rose.");
        let ingestor = ingestor(extractor.clone()).await;

        let first = ingestor.ingest("https://www.reuters.com/a", "AAPL").await.unwrap();
        let second = ingestor.ingest("https://www.reuters.com/a", "AAPL").await.unwrap();

        assert_eq!(first, IngestResult::Added);
        assert_eq!(second, IngestResult::Skipped(SkipReason::AlreadyExists));
        assert_eq!(extractor.calls().len(), 1);

        let stored = ingestor.store().find_by_ticker("AAPL", None).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].source, "Reuters");
        assert_eq!(stored[0].author, "Jane Doe, John Roe");
    }

    #[tokio::test]
    async fn refresh_replaces_stored_content() {
        let extractor = Arc::new(StubExtractor::default());
        let url = "https://www.marketwatch.com/story/x";
        extractor.set(url, "Old headline", "old body");
        let ingestor = ingestor(extractor.clone()).await;
        ingestor.ingest(url, "MSFT").await.unwrap();

        extractor.set(url, "New headline", "new body");
        assert_eq!(ingestor.refresh(url, "MSFT").await.unwrap(), IngestResult::Added);

        let article = ingestor.store().find_by_url(url).await.unwrap().unwrap();
        assert_eq!(article.title, "New headline");
        assert_eq!(article.text, "new body");
        assert_eq!(ingestor.store().find_by_ticker("MSFT", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn extraction_failure_is_reported_and_batch_continues() {
        let extractor = Arc::new(StubExtractor::default());
        extractor.set("https://seekingalpha.com/article/1", "One", "first");
        extractor.set("https://seekingalpha.com/article/3", "Three", "third");
        let ingestor = ingestor(extractor.clone()).await;

        let failed = ingestor.ingest("https://seekingalpha.com/article/2", "NVDA").await.unwrap();
        assert!(matches!(failed, IngestResult::Failed(reason) if reason.contains("connection reset")));

        let summary = ingestor
            .ingest_all(
                [
                    "https://seekingalpha.com/article/1",
                    "https://seekingalpha.com/article/2",
                    "https://seekingalpha.com/article/3",
                    "https://seekingalpha.com/article/1",
                ],
                "NVDA",
            )
            .await
            .unwrap();
        assert_eq!(
            summary,
            IngestSummary {
                added: 2,
                skipped: 1,
                failed: 1
            }
        );
        assert_eq!(summary.total(), 4);
        assert!(ingestor.store().find_by_url("https://seekingalpha.com/article/2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_metadata_falls_back_to_unknown_author_and_fetch_time() {
        let extractor = Arc::new(StubExtractor::default());
        let url = "https://example.org/post";
        extractor.pages.lock().unwrap().insert(
            url.to_string(),
            ExtractedArticle {
                title: "Untitled wire".into(),
                text: "body".into(),
                ..Default::default()
            },
        );
        let before = Utc::now();
        let ingestor = ingestor(extractor).await;
        ingestor.ingest(url, "IBM").await.unwrap();

        let article = ingestor.store().find_by_url(url).await.unwrap().unwrap();
        assert_eq!(article.author, "Unknown");
        assert_eq!(article.source, "Unknown");
        assert!(article.date_published >= before - chrono::Duration::seconds(1));
    }

    #[tokio::test]
    async fn archives_raw_html_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = Arc::new(StubExtractor::default());
        let url = "https://www.bloomberg.com/news/x";
        extractor.set(url, "Fed holds", "Rates unchanged.");
        let ingestor = ingestor(extractor)
            .await
            .with_archive(Some(HtmlArchive::new(dir.path())));

        ingestor.ingest(url, "SPY").await.unwrap();

        let mut files = Vec::new();
        let mut pending = vec![dir.path().to_path_buf()];
        while let Some(path) = pending.pop() {
            for entry in std::fs::read_dir(&path).unwrap() {
                let entry = entry.unwrap();
                if entry.file_type().unwrap().is_dir() {
                    pending.push(entry.path());
                } else {
                    files.push(entry.path());
                }
            }
        }
        assert_eq!(files.len(), 1);
        let body = std::fs::read_to_string(&files[0]).unwrap();
        assert!(body.contains("Rates unchanged."));
    }
}
