use async_trait::async_trait;
use chrono::{DateTime, Utc};
use newshound_core::RelativeDateResolver;
use newshound_storage::{FetchError, HttpFetcher};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

/// Content pulled from one article page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedArticle {
    pub title: String,
    pub publish_date: Option<DateTime<Utc>>,
    pub authors: Vec<String>,
    pub text: String,
    pub summary: Option<String>,
    pub top_image: Option<String>,
    pub canonical_link: Option<String>,
    pub keywords: Vec<String>,
    /// Raw page HTML, kept for archiving.
    #[serde(skip)]
    pub html: Option<String>,
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("fetching {url} failed: {reason}")]
    Fetch { url: String, reason: String },
    #[error("no article content found at {url}")]
    NoContent { url: String },
}

impl ExtractionError {
    fn fetch(url: &str, err: FetchError) -> Self {
        Self::Fetch {
            url: url.to_string(),
            reason: err.to_string(),
        }
    }
}

#[async_trait]
pub trait ArticleExtractor: Send + Sync {
    async fn extract(&self, url: &str) -> Result<ExtractedArticle, ExtractionError>;
}

/// Fetches an article over HTTP and reads it from its markup and metadata.
#[derive(Debug, Clone)]
pub struct HtmlArticleExtractor {
    fetcher: HttpFetcher,
    resolver: RelativeDateResolver,
}

impl HtmlArticleExtractor {
    pub fn new(fetcher: HttpFetcher) -> Self {
        Self {
            fetcher,
            resolver: RelativeDateResolver::new(),
        }
    }
}

#[async_trait]
impl ArticleExtractor for HtmlArticleExtractor {
    async fn extract(&self, url: &str) -> Result<ExtractedArticle, ExtractionError> {
        let span = info_span!("extract_article", url);
        async {
            let response = self
                .fetcher
                .get(url)
                .await
                .map_err(|err| ExtractionError::fetch(url, err))?;
            let html = response.text_lossy();
            let mut article = parse_article_html(url, &html, &self.resolver, Utc::now())?;
            article.html = Some(html);
            debug!(chars = article.text.len(), authors = article.authors.len(), "article extracted");
            Ok::<_, ExtractionError>(article)
        }
        .instrument(span)
        .await
    }
}

/// Reads an article out of `html`. Fails only when neither a title nor any
/// body text can be found.
pub fn parse_article_html(
    url: &str,
    html: &str,
    resolver: &RelativeDateResolver,
    now: DateTime<Utc>,
) -> Result<ExtractedArticle, ExtractionError> {
    let document = Html::parse_document(html);
    let linked_data = linked_data(&document);

    let title = meta_content(&document, r#"meta[property="og:title"]"#)
        .or_else(|| first_text(&document, "h1"))
        .or_else(|| first_text(&document, "title"))
        .unwrap_or_default();

    let mut paragraphs = all_texts(&document, "article p");
    if paragraphs.is_empty() {
        paragraphs = all_texts(&document, "p");
    }
    let text = paragraphs.join("\n\n");

    if title.is_empty() && text.is_empty() {
        return Err(ExtractionError::NoContent { url: url.to_string() });
    }

    let publish_date = meta_content(&document, r#"meta[property="article:published_time"]"#)
        .or_else(|| attr(&document, "time[datetime]", "datetime"))
        .or_else(|| linked_data.iter().find_map(|value| json_str(value, "datePublished")))
        .and_then(|raw| resolver.resolve(&raw, now).ok());

    let mut authors = Vec::new();
    let candidates = meta_content(&document, r#"meta[name="author"]"#)
        .into_iter()
        .chain(all_texts(&document, r#"[rel="author"]"#))
        .chain(linked_data.iter().flat_map(json_authors));
    for author in candidates {
        if !authors.contains(&author) {
            authors.push(author);
        }
    }

    let keywords = meta_content(&document, r#"meta[name="keywords"]"#)
        .or_else(|| meta_content(&document, r#"meta[name="news_keywords"]"#))
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|keyword| !keyword.is_empty())
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(ExtractedArticle {
        title,
        publish_date,
        authors,
        text,
        summary: meta_content(&document, r#"meta[name="description"]"#)
            .or_else(|| meta_content(&document, r#"meta[property="og:description"]"#)),
        top_image: meta_content(&document, r#"meta[property="og:image"]"#),
        canonical_link: attr(&document, r#"link[rel="canonical"]"#, "href"),
        keywords,
        html: None,
    })
}

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn first_text(document: &Html, css: &str) -> Option<String> {
    let sel = selector(css)?;
    document
        .select(&sel)
        .find_map(|node| text_or_none(node.text().collect::<String>()))
}

fn all_texts(document: &Html, css: &str) -> Vec<String> {
    let Some(sel) = selector(css) else {
        return Vec::new();
    };
    document
        .select(&sel)
        .filter_map(|node| text_or_none(node.text().collect::<String>()))
        .collect()
}

fn attr(document: &Html, css: &str, name: &str) -> Option<String> {
    let sel = selector(css)?;
    document
        .select(&sel)
        .find_map(|node| node.value().attr(name))
        .and_then(|value| text_or_none(value.to_string()))
}

fn meta_content(document: &Html, css: &str) -> Option<String> {
    attr(document, css, "content")
}

/// JSON-LD blocks, with `@graph` members flattened in.
fn linked_data(document: &Html) -> Vec<JsonValue> {
    let Some(sel) = selector(r#"script[type="application/ld+json"]"#) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for script in document.select(&sel) {
        let raw = script.text().collect::<String>();
        let Ok(value) = serde_json::from_str::<JsonValue>(&raw) else {
            continue;
        };
        let mut pending = vec![value];
        while let Some(value) = pending.pop() {
            match value {
                JsonValue::Array(items) => pending.extend(items),
                JsonValue::Object(mut map) => {
                    if let Some(graph) = map.remove("@graph") {
                        pending.push(graph);
                    }
                    out.push(JsonValue::Object(map));
                }
                _ => {}
            }
        }
    }
    out
}

fn json_str(value: &JsonValue, key: &str) -> Option<String> {
    value.get(key)?.as_str().map(ToString::to_string)
}

fn json_authors(value: &JsonValue) -> Vec<String> {
    let name_of = |author: &JsonValue| match author {
        JsonValue::String(name) => Some(name.clone()),
        JsonValue::Object(_) => json_str(author, "name"),
        _ => None,
    };
    match value.get("author") {
        Some(JsonValue::Array(authors)) => authors.iter().filter_map(name_of).collect(),
        Some(author) => name_of(author).into_iter().collect(),
        None => Vec::new(),
    }
}
