use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use newshound_adapters::{SourceAdapter, StopReason};
use newshound_core::{DateWindow, DiscoveredLink};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// An adapter paired with the query it should run.
#[derive(Clone)]
pub struct ConfiguredAdapter {
    pub adapter: Arc<dyn SourceAdapter>,
    pub term: String,
    pub window: DateWindow,
}

impl ConfiguredAdapter {
    pub fn new(adapter: Arc<dyn SourceAdapter>, term: impl Into<String>, window: DateWindow) -> Self {
        Self {
            adapter,
            term: term.into(),
            window,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceOutcome {
    pub source_name: String,
    pub links: Vec<DiscoveredLink>,
    pub stop_reason: Option<StopReason>,
    pub pages_visited: u32,
    /// Set when the source failed; `links` is then empty.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceOutcome>,
}

impl DiscoveryRunSummary {
    /// Links grouped by source name. Cross-source duplicates are kept.
    pub fn links_by_source(&self) -> BTreeMap<String, Vec<DiscoveredLink>> {
        let mut grouped: BTreeMap<String, Vec<DiscoveredLink>> = BTreeMap::new();
        for outcome in &self.sources {
            grouped
                .entry(outcome.source_name.clone())
                .or_default()
                .extend(outcome.links.iter().cloned());
        }
        grouped
    }

    pub fn all_links(&self) -> impl Iterator<Item = &DiscoveredLink> {
        self.sources.iter().flat_map(|outcome| outcome.links.iter())
    }

    pub fn total_links(&self) -> usize {
        self.sources.iter().map(|outcome| outcome.links.len()).sum()
    }

    pub fn failed_sources(&self) -> usize {
        self.sources.iter().filter(|outcome| outcome.error.is_some()).count()
    }
}

/// Runs adapters one after another; a failing source is logged and recorded
/// with no links, never aborting the rest of the batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscoveryOrchestrator;

impl DiscoveryOrchestrator {
    pub fn new() -> Self {
        Self
    }

    pub async fn run_all(&self, adapters: &[ConfiguredAdapter]) -> DiscoveryRunSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut sources = Vec::with_capacity(adapters.len());

        for configured in adapters {
            let source_name = configured.adapter.source_name().to_string();
            let span = info_span!("discover", %run_id, source = %source_name, term = %configured.term);
            let outcome = async {
                match configured.adapter.discover(&configured.term, &configured.window).await {
                    Ok(report) => {
                        info!(
                            links = report.links.len(),
                            pages = report.pages_visited,
                            stop_reason = ?report.stop_reason,
                            "source finished"
                        );
                        if !report.stop_reason.is_natural() {
                            warn!(stop_reason = ?report.stop_reason, "source hit its ceiling before a natural stop");
                        }
                        SourceOutcome {
                            source_name: report.source_name,
                            links: report.links,
                            stop_reason: Some(report.stop_reason),
                            pages_visited: report.pages_visited,
                            error: None,
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "source failed; continuing with remaining sources");
                        SourceOutcome {
                            source_name: source_name.clone(),
                            links: Vec::new(),
                            stop_reason: None,
                            pages_visited: 0,
                            error: Some(err.to_string()),
                        }
                    }
                }
            }
            .instrument(span)
            .await;
            sources.push(outcome);
        }

        let summary = DiscoveryRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            sources,
        };
        info!(
            %run_id,
            sources = summary.sources.len(),
            failed = summary.failed_sources(),
            links = summary.total_links(),
            "discovery run finished"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use newshound_adapters::{AdapterError, DiscoveryReport};

    use super::*;

    struct Scripted {
        name: &'static str,
        links: Vec<&'static str>,
        fail: bool,
    }

    #[async_trait]
    impl SourceAdapter for Scripted {
        fn source_name(&self) -> &str {
            self.name
        }

        async fn discover(&self, _term: &str, _window: &DateWindow) -> Result<DiscoveryReport, AdapterError> {
            if self.fail {
                return Err(AdapterError::SourceUnavailable {
                    source_name: self.name.to_string(),
                    reason: "navigation timed out".into(),
                });
            }
            Ok(DiscoveryReport {
                source_name: self.name.to_string(),
                links: self
                    .links
                    .iter()
                    .map(|url| DiscoveredLink::new(*url, self.name))
                    .collect(),
                stop_reason: StopReason::EmptyPage,
                pages_visited: 2,
            })
        }
    }

    fn window() -> DateWindow {
        DateWindow::parse("2024-05-01", "2024-05-31").unwrap()
    }

    fn configured(name: &'static str, links: Vec<&'static str>, fail: bool) -> ConfiguredAdapter {
        ConfiguredAdapter::new(Arc::new(Scripted { name, links, fail }), "AAPL", window())
    }

    #[tokio::test]
    async fn failing_source_does_not_hide_other_results() {
        let summary = DiscoveryOrchestrator::new()
            .run_all(&[
                configured("A", vec![], true),
                configured("B", vec!["https://b.example/1", "https://b.example/2"], false),
            ])
            .await;

        assert_eq!(summary.sources.len(), 2);
        assert_eq!(summary.failed_sources(), 1);
        let a = &summary.sources[0];
        assert!(a.links.is_empty());
        assert!(a.error.as_deref().unwrap().contains("navigation timed out"));
        assert_eq!(a.stop_reason, None);

        let grouped = summary.links_by_source();
        assert_eq!(grouped["A"].len(), 0);
        assert_eq!(grouped["B"].len(), 2);
        assert_eq!(summary.sources[1].stop_reason, Some(StopReason::EmptyPage));
    }

    #[tokio::test]
    async fn duplicates_across_sources_are_kept() {
        let shared = "https://news.example/shared";
        let summary = DiscoveryOrchestrator::new()
            .run_all(&[configured("A", vec![shared], false), configured("B", vec![shared], false)])
            .await;
        assert_eq!(summary.total_links(), 2);
        assert_eq!(summary.all_links().filter(|link| link.url == shared).count(), 2);
    }
}
