use std::time::Duration;

use anyhow::Context;
use reqwest::{RequestBuilder, StatusCode};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Keep cookies between requests so a login persists for the session.
    pub cookie_store: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            cookie_store: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// One request per call. Failures surface to the caller as they happen;
/// whether to try again is the caller's decision.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .cookie_store(config.cookie_store)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn get(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.send(url, self.client.get(url))
            .instrument(info_span!("http_get", url))
            .await
    }

    pub async fn post_form(&self, url: &str, fields: &[(String, String)]) -> Result<FetchedResponse, FetchError> {
        self.send(url, self.client.post(url).form(fields))
            .instrument(info_span!("http_post_form", url, fields = fields.len()))
            .await
    }

    async fn send(&self, url: &str, request: RequestBuilder) -> Result<FetchedResponse, FetchError> {
        let request_failed = |source| FetchError::Request {
            url: url.to_string(),
            source,
        };
        let resp = request.send().await.map_err(request_failed)?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            debug!(%status, final_url, "non-success response");
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.bytes().await.map_err(request_failed)?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    /// Local server answering every request with `status_line`; returns its
    /// base URL and a hit counter.
    fn serve_always(status_line: &'static str, body: &'static str) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf);
                counter.fetch_add(1, Ordering::SeqCst);
                let reply = format!(
                    "HTTP/1.1 {status_line}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(reply.as_bytes());
            }
        });
        (format!("http://{addr}"), hits)
    }

    #[tokio::test]
    async fn server_errors_are_not_retried() {
        let (base, hits) = serve_always("503 Service Unavailable", "busy");
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();

        let err = fetcher.get(&format!("{base}/story")).await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let fields = vec![("q".to_string(), "gold".to_string())];
        assert!(fetcher.post_form(&format!("{base}/login"), &fields).await.is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn success_returns_body_and_final_url() {
        let (base, hits) = serve_always("200 OK", "<p>ok</p>");
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let resp = fetcher.get(&format!("{base}/a")).await.unwrap();
        assert_eq!(resp.text_lossy(), "<p>ok</p>");
        assert_eq!(resp.final_url, format!("{base}/a"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connection_refused_fails_once() {
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let err = fetcher.get(&format!("http://127.0.0.1:{port}/")).await.unwrap_err();
        assert!(matches!(err, FetchError::Request { .. }));
    }
}
