use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use newshound_core::{DateWindow, DiscoveredLink, LinkDeduper, RelativeDateResolver, WindowPosition};
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;

use crate::profile::{BoundaryPolicy, MissingDatePolicy, PaginationMode, SourceProfile, UnparseableDatePolicy};
use crate::render::{find_element, PageHandle, PageRenderer, RenderError};
use crate::{AdapterError, AuthenticatedSourceAdapter, DiscoveryReport, SourceAdapter, StopReason};

/// Waits applied between discovery steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryTiming {
    pub page_delay: Duration,
    pub scroll_settle: Duration,
    pub stall_wait: Duration,
    pub warm_up_settle: Duration,
    pub login_settle: Duration,
}

impl Default for DiscoveryTiming {
    fn default() -> Self {
        Self {
            page_delay: Duration::from_secs(3),
            scroll_settle: Duration::from_secs(3),
            stall_wait: Duration::from_secs(2),
            warm_up_settle: Duration::from_secs(2),
            login_settle: Duration::from_secs(10),
        }
    }
}

impl DiscoveryTiming {
    pub fn immediate() -> Self {
        Self {
            page_delay: Duration::ZERO,
            scroll_settle: Duration::ZERO,
            stall_wait: Duration::ZERO,
            warm_up_settle: Duration::ZERO,
            login_settle: Duration::ZERO,
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Runs one [`SourceProfile`] against a [`PageRenderer`].
pub struct ProfileAdapter {
    profile: SourceProfile,
    renderer: Arc<dyn PageRenderer>,
    resolver: RelativeDateResolver,
    timing: DiscoveryTiming,
    credentials: Option<Credentials>,
    reference_now: Option<DateTime<Utc>>,
}

impl ProfileAdapter {
    pub fn new(profile: SourceProfile, renderer: Arc<dyn PageRenderer>) -> Self {
        Self {
            profile,
            renderer,
            resolver: RelativeDateResolver::new(),
            timing: DiscoveryTiming::default(),
            credentials: None,
            reference_now: None,
        }
    }

    pub fn with_timing(mut self, timing: DiscoveryTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_resolver(mut self, resolver: RelativeDateResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Pins the "now" that relative dates resolve against.
    pub fn with_reference_now(mut self, now: DateTime<Utc>) -> Self {
        self.reference_now = Some(now);
        self
    }

    pub fn profile(&self) -> &SourceProfile {
        &self.profile
    }

    fn unavailable(&self, err: RenderError) -> AdapterError {
        AdapterError::SourceUnavailable {
            source_name: self.profile.source_name().to_string(),
            reason: err.to_string(),
        }
    }

    async fn close_quietly(&self, page: PageHandle) {
        let id = page.id;
        if let Err(err) = self.renderer.close(page).await {
            debug!(page = id, error = %err, "closing page failed");
        }
    }

    async fn perform_login(&self, page: &PageHandle, credentials: &Credentials) -> Result<(), AdapterError> {
        let Some(login) = self.profile.login else {
            return Ok(());
        };
        let renderer = &self.renderer;
        renderer
            .fill_field(page, login.username_field, &credentials.username)
            .await
            .map_err(|err| self.unavailable(err))?;
        renderer
            .fill_field(page, login.password_field, &credentials.password)
            .await
            .map_err(|err| self.unavailable(err))?;
        renderer
            .click(page, login.submit)
            .await
            .map_err(|err| self.unavailable(err))?;
        sleep(self.timing.login_settle).await;

        if let Some(marker) = login.authenticated_marker {
            let html = renderer.current_html(page).await.map_err(|err| self.unavailable(err))?;
            if !contains_element(&html, marker)? {
                return Err(AdapterError::LoginRejected {
                    source_name: self.profile.source_name().to_string(),
                });
            }
        }
        Ok(())
    }

    async fn warm_up(&self, page: &PageHandle) {
        for identifier in self.profile.warm_up_clicks {
            match self.renderer.click(page, identifier).await {
                Ok(()) => sleep(self.timing.warm_up_settle).await,
                Err(err) => debug!(identifier, error = %err, "warm-up click skipped"),
            }
        }
    }

    async fn run(&self, term: &str, window: &DateWindow) -> Result<DiscoveryReport, AdapterError> {
        let compiled = CompiledProfile::compile(&self.profile)?;
        if self.profile.login.is_some() {
            self.login().await?;
        }

        let mut harvest = Harvest {
            window: *window,
            now: self.reference_now.unwrap_or_else(Utc::now),
            deduper: LinkDeduper::new(),
            links: Vec::new(),
        };
        let mut session = Session::default();
        let outcome = self.drive(&mut session, &compiled, &mut harvest, term).await;
        if let Some(page) = session.page.take() {
            self.close_quietly(page).await;
        }
        let stop_reason = outcome?;

        info!(
            links = harvest.links.len(),
            pages = session.loads,
            ?stop_reason,
            "discovery finished"
        );
        Ok(DiscoveryReport {
            source_name: self.profile.source_name().to_string(),
            links: harvest.links,
            stop_reason,
            pages_visited: session.loads,
        })
    }

    /// Fetching -> Extracting -> BoundaryCheck -> (Fetching | Stopped).
    async fn drive(
        &self,
        session: &mut Session,
        compiled: &CompiledProfile,
        harvest: &mut Harvest,
        term: &str,
    ) -> Result<StopReason, AdapterError> {
        let mut state = DiscoveryState::Fetching;
        loop {
            state = match state {
                DiscoveryState::Fetching => match self.fetch_next(session, term, &harvest.window).await? {
                    Fetched::Html(html) => DiscoveryState::Extracting(html),
                    Fetched::Exhausted(reason) => DiscoveryState::Stopped(reason),
                },
                DiscoveryState::Extracting(html) => DiscoveryState::BoundaryCheck(scan_page(
                    &self.profile,
                    compiled,
                    &self.resolver,
                    &html,
                    harvest,
                )),
                DiscoveryState::BoundaryCheck(scan) => match (scan.stop, self.profile.pagination) {
                    (Some(reason), _) => DiscoveryState::Stopped(reason),
                    (None, PaginationMode::Scroll { .. }) => DiscoveryState::Fetching,
                    (None, _) if scan.items == 0 => DiscoveryState::Stopped(StopReason::EmptyPage),
                    (None, PaginationMode::Single) => DiscoveryState::Stopped(StopReason::SinglePage),
                    (None, PaginationMode::Pages { .. }) => DiscoveryState::Fetching,
                },
                DiscoveryState::Stopped(reason) => return Ok(reason),
            };
        }
    }

    async fn fetch_next(&self, session: &mut Session, term: &str, window: &DateWindow) -> Result<Fetched, AdapterError> {
        match self.profile.pagination {
            PaginationMode::Pages { first_page, max_pages } => {
                if session.loads >= max_pages {
                    return Ok(Fetched::Exhausted(StopReason::CeilingExhausted));
                }
                if session.loads > 0 {
                    sleep(self.timing.page_delay).await;
                }
                let page_number = first_page + session.loads;
                let url = self.profile.search_url(term, window, page_number);
                let html = self.load(session, &url).await?;
                if let Some(page) = session.page.take() {
                    self.close_quietly(page).await;
                }
                Ok(Fetched::Html(html))
            }
            PaginationMode::Single => {
                let url = self.profile.search_url(term, window, 1);
                let html = self.load(session, &url).await?;
                Ok(Fetched::Html(html))
            }
            PaginationMode::Scroll {
                stall_limit,
                max_attempts,
            } => {
                let Some(page) = session.page.clone() else {
                    let url = self.profile.search_url(term, window, 1);
                    let html = self.load(session, &url).await?;
                    if let Some(page) = &session.page {
                        session.last_height = self.height(page).await?;
                    }
                    return Ok(Fetched::Html(html));
                };
                loop {
                    if session.scrolls >= max_attempts {
                        return Ok(Fetched::Exhausted(StopReason::CeilingExhausted));
                    }
                    self.renderer
                        .scroll_to_bottom(&page)
                        .await
                        .map_err(|err| self.unavailable(err))?;
                    session.scrolls += 1;
                    sleep(self.timing.scroll_settle).await;

                    let height = self.height(&page).await?;
                    if height != session.last_height {
                        session.last_height = height;
                        session.stalled = 0;
                        let html = self
                            .renderer
                            .current_html(&page)
                            .await
                            .map_err(|err| self.unavailable(err))?;
                        return Ok(Fetched::Html(html));
                    }
                    session.stalled += 1;
                    debug!(stalled = session.stalled, height, "scroll produced no new content");
                    if session.stalled >= stall_limit {
                        return Ok(Fetched::Exhausted(StopReason::ContentStalled));
                    }
                    sleep(self.timing.stall_wait).await;
                }
            }
        }
    }

    /// Opens `url`, runs warm-up clicks on the first load, and returns the HTML.
    /// The page stays in `session` so every exit path can close it.
    async fn load(&self, session: &mut Session, url: &str) -> Result<String, AdapterError> {
        debug!(url, load = session.loads + 1, "loading results");
        let page = self.renderer.open(url).await.map_err(|err| self.unavailable(err))?;
        session.page = Some(page.clone());
        if session.loads == 0 {
            self.warm_up(&page).await;
        }
        session.loads += 1;
        self.renderer
            .current_html(&page)
            .await
            .map_err(|err| self.unavailable(err))
    }

    async fn height(&self, page: &PageHandle) -> Result<u64, AdapterError> {
        self.renderer
            .document_height(page)
            .await
            .map_err(|err| self.unavailable(err))
    }
}

#[async_trait]
impl SourceAdapter for ProfileAdapter {
    fn source_name(&self) -> &str {
        self.profile.source_name()
    }

    async fn discover(&self, term: &str, window: &DateWindow) -> Result<DiscoveryReport, AdapterError> {
        let span = info_span!("discover", source = self.profile.kind.slug(), term);
        self.run(term, window).instrument(span).await
    }
}

#[async_trait]
impl AuthenticatedSourceAdapter for ProfileAdapter {
    async fn login(&self) -> Result<(), AdapterError> {
        let Some(login) = self.profile.login else {
            return Ok(());
        };
        let credentials = self.credentials.as_ref().ok_or_else(|| AdapterError::MissingCredentials {
            source_name: self.profile.source_name().to_string(),
        })?;

        info!(url = login.url, "logging in");
        let page = self.renderer.open(login.url).await.map_err(|err| self.unavailable(err))?;
        let outcome = self.perform_login(&page, credentials).await;
        self.close_quietly(page).await;
        if let Err(err) = &outcome {
            warn!(error = %err, "login failed");
        }
        outcome
    }
}

async fn sleep(duration: Duration) {
    if !duration.is_zero() {
        tokio::time::sleep(duration).await;
    }
}

fn contains_element(html: &str, identifier: &str) -> Result<bool, AdapterError> {
    let document = Html::parse_document(html);
    find_element(&document, identifier)
        .map(|found| found.is_some())
        .map_err(|err| AdapterError::InvalidSelector {
            selector: identifier.to_string(),
            reason: err.to_string(),
        })
}

enum DiscoveryState {
    Fetching,
    Extracting(String),
    BoundaryCheck(PageScan),
    Stopped(StopReason),
}

enum Fetched {
    Html(String),
    Exhausted(StopReason),
}

#[derive(Debug, Default)]
struct Session {
    page: Option<PageHandle>,
    loads: u32,
    scrolls: u32,
    stalled: u32,
    last_height: u64,
}

struct Harvest {
    window: DateWindow,
    now: DateTime<Utc>,
    deduper: LinkDeduper,
    links: Vec<DiscoveredLink>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PageScan {
    items: usize,
    stop: Option<StopReason>,
}

struct CompiledProfile {
    origin: Url,
    item: Selector,
    date: Selector,
    links: Vec<Selector>,
}

impl CompiledProfile {
    fn compile(profile: &SourceProfile) -> Result<Self, AdapterError> {
        let origin = Url::parse(profile.origin).map_err(|err| AdapterError::InvalidSelector {
            selector: profile.origin.to_string(),
            reason: err.to_string(),
        })?;
        Ok(Self {
            origin,
            item: parse_selector(profile.item_selector)?,
            date: parse_selector(profile.date_selector)?,
            links: profile
                .link_selectors
                .iter()
                .map(|selector| parse_selector(selector))
                .collect::<Result<_, _>>()?,
        })
    }
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|err| AdapterError::InvalidSelector {
        selector: selector.to_string(),
        reason: err.to_string(),
    })
}

enum ItemDate {
    Missing,
    Unparseable(String),
    Located(WindowPosition),
}

/// Applies the per-item rules to one page of results, in document order.
fn scan_page(
    profile: &SourceProfile,
    compiled: &CompiledProfile,
    resolver: &RelativeDateResolver,
    html: &str,
    harvest: &mut Harvest,
) -> PageScan {
    let document = Html::parse_document(html);
    let mut items = 0;

    for item in document.select(&compiled.item) {
        items += 1;
        let date = match item.select(&compiled.date).next() {
            None => ItemDate::Missing,
            Some(element) => {
                let text = date_text(element, profile.date_separator);
                match harvest.window.locate(resolver, &text, harvest.now) {
                    Ok(position) => ItemDate::Located(position),
                    Err(_) => ItemDate::Unparseable(text),
                }
            }
        };

        let include = match date {
            ItemDate::Located(WindowPosition::Within) => true,
            ItemDate::Located(WindowPosition::Before) if profile.boundary == BoundaryPolicy::ShortCircuit => {
                debug!(item = items, "boundary item reached");
                return PageScan {
                    items,
                    stop: Some(StopReason::BoundaryReached),
                };
            }
            ItemDate::Located(_) => profile.include_out_of_window,
            ItemDate::Missing => profile.missing_dates == MissingDatePolicy::Include,
            ItemDate::Unparseable(text) => match profile.unparseable_dates {
                UnparseableDatePolicy::Include => true,
                UnparseableDatePolicy::Stop => {
                    debug!(item = items, date = %text, "unparseable date ends discovery");
                    return PageScan {
                        items,
                        stop: Some(StopReason::UnparseableDate),
                    };
                }
            },
        };
        if !include {
            continue;
        }

        let Some(url) = item_link(item, compiled) else {
            continue;
        };
        if harvest.deduper.add(url.clone()) {
            harvest
                .links
                .push(DiscoveredLink::new(url, profile.source_name()));
        }
    }

    PageScan { items, stop: None }
}

fn date_text(element: ElementRef<'_>, separator: Option<&str>) -> String {
    let text = element.text().collect::<Vec<_>>().join(" ");
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match separator.and_then(|sep| text.split_once(sep)) {
        Some((_, after)) => after.trim().to_string(),
        None => text,
    }
}

fn item_link(item: ElementRef<'_>, compiled: &CompiledProfile) -> Option<String> {
    compiled.links.iter().find_map(|selector| {
        let href = item.select(selector).find_map(|link| link.value().attr("href"))?;
        let href = href.trim();
        if href.is_empty() {
            return None;
        }
        compiled.origin.join(href).ok().map(String::from)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::SourceKind;
    use chrono::TimeZone;

    fn harvest(start: &str, end: &str) -> Harvest {
        Harvest {
            window: DateWindow::parse(start, end).unwrap(),
            now: Utc.with_ymd_and_hms(2024, 3, 20, 12, 0, 0).single().unwrap(),
            deduper: LinkDeduper::new(),
            links: Vec::new(),
        }
    }

    fn scan(kind: SourceKind, html: &str, harvest: &mut Harvest) -> PageScan {
        let profile = kind.profile();
        let compiled = CompiledProfile::compile(&profile).unwrap();
        scan_page(&profile, &compiled, &RelativeDateResolver::new(), html, harvest)
    }

    fn urls(harvest: &Harvest) -> Vec<&str> {
        harvest.links.iter().map(|link| link.url.as_str()).collect()
    }

    #[test]
    fn every_profile_compiles() {
        for kind in SourceKind::ALL {
            assert!(CompiledProfile::compile(&kind.profile()).is_ok(), "{kind}");
        }
    }

    #[test]
    fn boundary_item_short_circuits_the_rest_of_the_page() {
        let html = r#"
            <div class="searchresult"><span class="deemphasized">March 12, 2024</span><a class="link" href="/a">A</a></div>
            <div class="searchresult"><span class="deemphasized">February 28, 2024</span><a class="link" href="/b">B</a></div>
            <div class="searchresult"><span class="deemphasized">March 11, 2024</span><a class="link" href="/c">C</a></div>
        "#;
        let mut harvest = harvest("2024-03-01", "2024-03-31");
        let scan = scan(SourceKind::MarketWatch, html, &mut harvest);
        assert_eq!(scan.stop, Some(StopReason::BoundaryReached));
        assert_eq!(urls(&harvest), vec!["https://www.marketwatch.com/a"]);
    }

    #[test]
    fn items_newer_than_the_window_are_skipped_not_stopped() {
        let html = r#"
            <div class="searchresult"><span class="deemphasized">April 2, 2024</span><a class="link" href="/new">N</a></div>
            <div class="searchresult"><span class="deemphasized">March 5, 2024</span><a class="link" href="https://x.com/in">I</a></div>
            <div class="searchresult"><a class="link" href="/undated">U</a></div>
        "#;
        let mut harvest = harvest("2024-03-01", "2024-03-31");
        let scan = scan(SourceKind::MarketWatch, html, &mut harvest);
        assert_eq!(scan, PageScan { items: 3, stop: None });
        assert_eq!(urls(&harvest), vec!["https://x.com/in"]);
    }

    #[test]
    fn strict_sources_stop_on_unparseable_dates() {
        let html = r#"
            <li class="search-pages-result"><span class="search-result-date">Mar. 10, 2024</span><a class="search-result-title" href="/article/1">1</a></li>
            <li class="search-pages-result"><span class="search-result-date">Sponsored</span><a class="search-result-title" href="/article/2">2</a></li>
            <li class="search-pages-result"><span class="search-result-date">Mar. 9, 2024</span><a class="search-result-title" href="/article/3">3</a></li>
        "#;
        let mut harvest = harvest("2024-03-01", "2024-03-31");
        let scan = scan(SourceKind::SeekingAlpha, html, &mut harvest);
        assert_eq!(scan.stop, Some(StopReason::UnparseableDate));
        assert_eq!(urls(&harvest), vec!["https://seekingalpha.com/article/1"]);
    }

    #[test]
    fn permissive_sources_keep_unparseable_dates_and_resolve_relative_ones() {
        let html = r#"
            <div data-test="article"><span data-test="article-timestamp">Reuters • 3 hours ago</span><a href="/news/a.html">a</a></div>
            <div data-test="article"><span data-test="article-timestamp">Breaking</span><a href="/news/b.html">b</a></div>
            <div data-test="article"><span data-test="article-timestamp">2 days ago</span><a href="/news/a.html">dup</a></div>
            <div data-test="article"><span data-test="article-timestamp">2 months ago</span><a href="/news/c.html">c</a></div>
            <div data-test="article"><span data-test="article-timestamp">1 hour ago</span><a href="/news/d.html">d</a></div>
        "#;
        let mut harvest = harvest("2024-03-01", "2024-03-31");
        let scan = scan(SourceKind::YahooFinance, html, &mut harvest);
        assert_eq!(scan.stop, Some(StopReason::BoundaryReached));
        assert_eq!(
            urls(&harvest),
            vec![
                "https://finance.yahoo.com/news/a.html",
                "https://finance.yahoo.com/news/b.html"
            ]
        );
    }

    #[test]
    fn scroll_sources_skip_items_without_a_date_element() {
        let html = r#"
            <div data-test="article"><span data-test="article-timestamp">2 hours ago</span><a href="/news/a.html">a</a></div>
            <div data-test="article"><a href="/promo/sponsored.html">promo</a></div>
        "#;
        let mut harvest = harvest("2024-03-01", "2024-03-31");
        let scan = scan(SourceKind::YahooFinance, html, &mut harvest);
        assert_eq!(scan, PageScan { items: 2, stop: None });
        assert_eq!(urls(&harvest), vec!["https://finance.yahoo.com/news/a.html"]);

        let html = r#"
            <li class="search-results__item"><time>March 12, 2024</time><a href="/markets/x">x</a></li>
            <li class="search-results__item"><a href="/sponsored/y">y</a></li>
        "#;
        let mut harvest = self::harvest("2024-03-01", "2024-03-31");
        self::scan(SourceKind::Reuters, html, &mut harvest);
        assert_eq!(urls(&harvest), vec!["https://www.reuters.com/markets/x"]);
    }

    #[test]
    fn quote_panel_filters_by_text_after_the_separator() {
        let html = r#"
            <div id="tabpanel-news">
              <section data-testid="storyitem">
                <a class="subtle-link fin-size-small titles noUnderline" href="https://au.finance.yahoo.com/news/one">One</a>
                <div class="publishing">Reuters • 5 days ago</div>
              </section>
              <section data-testid="storyitem">
                <a class="subtle-link" href="/news/old">Old</a>
                <div class="publishing">Bloomberg • 3 months ago</div>
              </section>
              <section data-testid="storyitem">
                <a href="/news/undated">Undated</a>
              </section>
              <section data-testid="storyitem">
                <a class="subtle-link" href="/news/two">Two</a>
                <div class="publishing">Motley Fool • yesterday-ish</div>
              </section>
            </div>
        "#;
        let mut harvest = harvest("2024-02-19", "2024-03-20");
        let scan = scan(SourceKind::YahooStock, html, &mut harvest);
        assert_eq!(scan, PageScan { items: 4, stop: None });
        assert_eq!(
            urls(&harvest),
            vec![
                "https://au.finance.yahoo.com/news/one",
                "https://au.finance.yahoo.com/news/undated",
                "https://au.finance.yahoo.com/news/two"
            ]
        );
    }

    #[test]
    fn out_of_window_items_can_be_kept_on_request() {
        let html = r#"
            <div id="tabpanel-news">
              <section data-testid="storyitem">
                <a href="/news/old">Old</a><div class="publishing">Bloomberg • 3 months ago</div>
              </section>
            </div>
        "#;
        let profile = SourceKind::YahooStock.profile().with_out_of_window_items(true);
        let compiled = CompiledProfile::compile(&profile).unwrap();
        let mut harvest = harvest("2024-03-01", "2024-03-20");
        scan_page(&profile, &compiled, &RelativeDateResolver::new(), html, &mut harvest);
        assert_eq!(urls(&harvest), vec!["https://au.finance.yahoo.com/news/old"]);
    }

    #[test]
    fn date_text_collapses_whitespace_and_splits_on_separator() {
        let document = Html::parse_fragment(r#"<div class="publishing">Reuters
              •   3 hours ago</div>"#);
        let selector = Selector::parse("div.publishing").unwrap();
        let element = document.select(&selector).next().unwrap();
        assert_eq!(date_text(element, Some("•")), "3 hours ago");
        assert_eq!(date_text(element, None), "Reuters • 3 hours ago");
    }
}
