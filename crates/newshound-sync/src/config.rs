use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use newshound_adapters::{Credentials, DiscoveryTiming, SourceKind};
use newshound_storage::HttpClientConfig;
use serde::Deserialize;
use tokio::fs;

use crate::ingest::IngestDelay;

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub db_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub page_delay_ms: u64,
    pub login_settle_ms: u64,
    pub fetch_delay_ms: u64,
    pub fetch_jitter_ms: u64,
    pub failure_backoff_ms: u64,
    pub archive_dir: Option<PathBuf>,
    pub workspace_root: PathBuf,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`PipelineConfig::from_env`] but reads variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let number = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        Self {
            db_path: lookup("NEWSHOUND_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("financial_news.db")),
            user_agent: lookup("NEWSHOUND_USER_AGENT")
                .unwrap_or_else(|| "Mozilla/5.0 (compatible; newshound/0.1)".to_string()),
            http_timeout_secs: number("NEWSHOUND_HTTP_TIMEOUT_SECS", 20),
            page_delay_ms: number("NEWSHOUND_PAGE_DELAY_MS", 3_000),
            login_settle_ms: number("NEWSHOUND_LOGIN_SETTLE_MS", 10_000),
            fetch_delay_ms: number("NEWSHOUND_FETCH_DELAY_MS", 2_000),
            fetch_jitter_ms: number("NEWSHOUND_FETCH_JITTER_MS", 1_000),
            failure_backoff_ms: number("NEWSHOUND_FAILURE_BACKOFF_MS", 60_000),
            archive_dir: lookup("NEWSHOUND_ARCHIVE_DIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            workspace_root: lookup("NEWSHOUND_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    pub fn discovery_timing(&self) -> DiscoveryTiming {
        DiscoveryTiming {
            page_delay: Duration::from_millis(self.page_delay_ms),
            scroll_settle: Duration::from_millis(self.page_delay_ms),
            login_settle: Duration::from_millis(self.login_settle_ms),
            ..DiscoveryTiming::default()
        }
    }

    pub fn ingest_delay(&self) -> IngestDelay {
        IngestDelay::new(
            Duration::from_millis(self.fetch_delay_ms),
            Duration::from_millis(self.fetch_jitter_ms),
        )
    }

    pub fn failure_backoff(&self) -> Duration {
        Duration::from_millis(self.failure_backoff_ms)
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub enabled: bool,
    /// Environment variables holding the login, for authenticated sources.
    #[serde(default)]
    pub username_env: Option<String>,
    #[serde(default)]
    pub password_env: Option<String>,
    /// Page or scroll-attempt ceiling override.
    #[serde(default)]
    pub ceiling: Option<u32>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceConfig {
    pub fn credentials_from(&self, lookup: impl Fn(&str) -> Option<String>) -> Option<Credentials> {
        let username = lookup(self.username_env.as_deref()?)?;
        let password = lookup(self.password_env.as_deref()?)?;
        Some(Credentials::new(username, password))
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.credentials_from(|key| std::env::var(key).ok())
    }
}

impl SourceRegistry {
    pub fn parse(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|source| source.enabled)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_apply_when_env_is_empty() {
        let config = PipelineConfig::from_lookup(|_| None);
        assert_eq!(config.db_path, PathBuf::from("financial_news.db"));
        assert_eq!(config.http_timeout_secs, 20);
        assert_eq!(config.page_delay_ms, 3_000);
        assert_eq!(config.failure_backoff(), Duration::from_secs(60));
        assert_eq!(config.archive_dir, None);
        assert_eq!(config.registry_path(), PathBuf::from("./sources.yaml"));
        assert_eq!(config.discovery_timing().login_settle, Duration::from_secs(10));
    }

    #[test]
    fn env_values_override_defaults_and_bad_numbers_fall_back() {
        let env = HashMap::from([
            ("NEWSHOUND_DB_PATH", "/tmp/news.db"),
            ("NEWSHOUND_PAGE_DELAY_MS", "0"),
            ("NEWSHOUND_FETCH_DELAY_MS", "soon"),
            ("NEWSHOUND_ARCHIVE_DIR", "/tmp/archive"),
        ]);
        let config = PipelineConfig::from_lookup(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.db_path, PathBuf::from("/tmp/news.db"));
        assert_eq!(config.discovery_timing().page_delay, Duration::ZERO);
        assert_eq!(config.fetch_delay_ms, 2_000);
        assert_eq!(config.archive_dir, Some(PathBuf::from("/tmp/archive")));
    }

    #[test]
    fn registry_parses_kinds_credentials_and_ceilings() {
        let registry = SourceRegistry::parse(
            r#"
sources:
  - kind: marketwatch
    enabled: true
  - kind: barrons
    enabled: true
    username_env: BARRONS_USER
    password_env: BARRONS_PASS
  - kind: reuters
    enabled: false
    ceiling: 10
"#,
        )
        .unwrap();

        let enabled = registry.enabled().map(|s| s.kind).collect::<Vec<_>>();
        assert_eq!(enabled, vec![SourceKind::MarketWatch, SourceKind::Barrons]);
        assert_eq!(registry.sources[2].ceiling, Some(10));

        let env = HashMap::from([("BARRONS_USER", "ann"), ("BARRONS_PASS", "pw")]);
        let creds = registry.sources[1]
            .credentials_from(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(creds, Credentials::new("ann", "pw"));
        assert!(registry.sources[0].credentials_from(|_| Some("x".into())).is_none());
    }

    #[test]
    fn unknown_source_kind_is_rejected() {
        assert!(SourceRegistry::parse("sources:\n  - kind: bloomberg\n    enabled: true\n").is_err());
    }
}
