use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Relative to the archive root.
    pub path: PathBuf,
    pub body_digest: String,
    /// An identical copy of this page was already on disk.
    pub reused: bool,
}

/// Raw article pages on disk, one file per distinct body of each URL.
#[derive(Debug, Clone)]
pub struct HtmlArchive {
    root: PathBuf,
}

impl HtmlArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<source>/<yyyy-mm>/<url digest>-<body digest>.html`
    pub fn entry_path(&self, source: &str, url: &str, fetched_at: DateTime<Utc>, body_digest: &str) -> PathBuf {
        let url_digest = digest(url.trim().as_bytes());
        PathBuf::from(source_dir(source))
            .join(fetched_at.format("%Y-%m").to_string())
            .join(format!("{}-{}.html", &url_digest[..16], &body_digest[..16]))
    }

    pub async fn save(
        &self,
        source: &str,
        url: &str,
        fetched_at: DateTime<Utc>,
        html: &str,
    ) -> anyhow::Result<ArchiveEntry> {
        let body_digest = digest(html.as_bytes());
        let path = self.entry_path(source, url, fetched_at, &body_digest);
        let target = self.root.join(&path);
        let entry = |reused| ArchiveEntry {
            path: path.clone(),
            body_digest: body_digest.clone(),
            reused,
        };

        if fs::try_exists(&target)
            .await
            .with_context(|| format!("checking {}", target.display()))?
        {
            return Ok(entry(true));
        }

        let dir = target.parent().unwrap_or(self.root.as_path());
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating archive directory {}", dir.display()))?;

        // Written aside and renamed so a reader never sees a partial page.
        let partial = dir.join(format!(".{}.partial", Uuid::new_v4()));
        fs::write(&partial, html)
            .await
            .with_context(|| format!("writing {}", partial.display()))?;
        if let Err(err) = fs::rename(&partial, &target).await {
            let _ = fs::remove_file(&partial).await;
            return Err(err).with_context(|| format!("moving archived page into {}", target.display()));
        }
        Ok(entry(false))
    }
}

fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn source_dir(source: &str) -> String {
    let dir = source
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(str::to_ascii_lowercase)
        .collect::<Vec<_>>()
        .join("-");
    if dir.is_empty() {
        "unknown".to_string()
    } else {
        dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn fetched_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().unwrap()
    }

    #[test]
    fn pages_are_grouped_by_source_and_month() {
        let archive = HtmlArchive::new("/tmp/archive");
        let body = digest(b"<html></html>");
        let path = archive.entry_path("Barron's", "https://www.barrons.com/articles/x", fetched_at(), &body);
        let text = path.to_string_lossy().into_owned();
        assert!(text.starts_with("barron-s/2024-05/"), "{text}");
        assert!(text.ends_with(&format!("-{}.html", &body[..16])), "{text}");
        assert_eq!(source_dir("  "), "unknown");
    }

    #[tokio::test]
    async fn unchanged_page_is_written_once() {
        let dir = tempdir().unwrap();
        let archive = HtmlArchive::new(dir.path());
        let url = "https://www.reuters.com/markets/a/";

        let first = archive.save("Reuters", url, fetched_at(), "<p>v1</p>").await.unwrap();
        let again = archive.save("Reuters", url, fetched_at(), "<p>v1</p>").await.unwrap();
        assert!(!first.reused);
        assert!(again.reused);
        assert_eq!(first.path, again.path);
        assert_eq!(
            std::fs::read_to_string(dir.path().join(&first.path)).unwrap(),
            "<p>v1</p>"
        );
    }

    #[tokio::test]
    async fn changed_page_gets_its_own_file() {
        let dir = tempdir().unwrap();
        let archive = HtmlArchive::new(dir.path());
        let url = "https://www.reuters.com/markets/a/";

        let v1 = archive.save("Reuters", url, fetched_at(), "<p>v1</p>").await.unwrap();
        let v2 = archive.save("Reuters", url, fetched_at(), "<p>v2</p>").await.unwrap();
        assert_ne!(v1.path, v2.path);
        assert!(!v2.reused);
        assert_eq!(v1.path.parent(), v2.path.parent());
    }
}
