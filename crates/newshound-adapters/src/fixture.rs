use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use scraper::Html;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::render::{find_element, PageHandle, PageRenderer, RenderError};

/// Scripted page served by [`FixtureRenderer`]. Each `scroll_to_bottom`
/// advances one frame; the last frame repeats once the script runs out.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixturePage {
    pub frames: Vec<String>,
    /// When set, opening the page fails with this reason.
    #[serde(default)]
    pub unavailable: Option<String>,
    /// Element identifier -> URL of the fixture page a click navigates to.
    #[serde(default)]
    pub navigations: BTreeMap<String, String>,
}

impl FixturePage {
    pub fn html(html: impl Into<String>) -> Self {
        Self {
            frames: vec![html.into()],
            ..Self::default()
        }
    }

    pub fn scrolling(frames: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            frames: frames.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            unavailable: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn navigates(mut self, identifier: impl Into<String>, target_url: impl Into<String>) -> Self {
        self.navigations.insert(identifier.into(), target_url.into());
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureSite {
    pub pages: BTreeMap<String, FixturePage>,
}

/// Everything a [`FixtureRenderer`] was asked to do, in call order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderLog {
    pub opened: Vec<String>,
    pub filled: Vec<(String, String)>,
    pub clicked: Vec<String>,
    pub scrolls: usize,
    pub closed: usize,
}

impl RenderLog {
    pub fn open_pages(&self) -> usize {
        self.opened.len().saturating_sub(self.closed)
    }
}

#[derive(Debug)]
struct OpenPage {
    url: String,
    frame: usize,
}

#[derive(Debug, Default)]
struct FixtureState {
    next_id: u64,
    open: HashMap<u64, OpenPage>,
    log: RenderLog,
}

/// Replays a [`FixtureSite`] and records every call.
#[derive(Debug, Default)]
pub struct FixtureRenderer {
    site: FixtureSite,
    state: Mutex<FixtureState>,
}

impl FixtureRenderer {
    pub fn new(site: FixtureSite) -> Self {
        Self {
            site,
            state: Mutex::default(),
        }
    }

    pub fn with_page(mut self, url: impl Into<String>, page: FixturePage) -> Self {
        self.site.pages.insert(url.into(), page);
        self
    }

    pub async fn log(&self) -> RenderLog {
        self.state.lock().await.log.clone()
    }

    fn page(&self, url: &str) -> Result<&FixturePage, RenderError> {
        self.site.pages.get(url).ok_or_else(|| RenderError::Navigation {
            url: url.to_string(),
            reason: "no fixture for url".to_string(),
        })
    }

    fn frame(&self, open: &OpenPage) -> Result<&str, RenderError> {
        let page = self.page(&open.url)?;
        let last = page.frames.len().saturating_sub(1);
        Ok(page
            .frames
            .get(open.frame.min(last))
            .map(String::as_str)
            .unwrap_or_default())
    }

    async fn current(&self, handle: &PageHandle) -> Result<(String, String), RenderError> {
        let state = self.state.lock().await;
        let open = state.open.get(&handle.id).ok_or(RenderError::UnknownPage(handle.id))?;
        Ok((open.url.clone(), self.frame(open)?.to_string()))
    }
}

pub fn load_fixture_site(path: impl AsRef<Path>) -> Result<FixtureSite> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

pub fn load_fixture_renderer(path: impl AsRef<Path>) -> Result<FixtureRenderer> {
    Ok(FixtureRenderer::new(load_fixture_site(path)?))
}

fn require_element(html: &str, url: &str, identifier: &str) -> Result<(), RenderError> {
    let document = Html::parse_document(html);
    match find_element(&document, identifier)? {
        Some(_) => Ok(()),
        None => Err(RenderError::ElementNotFound {
            identifier: identifier.to_string(),
            url: url.to_string(),
        }),
    }
}

#[async_trait]
impl PageRenderer for FixtureRenderer {
    async fn open(&self, url: &str) -> Result<PageHandle, RenderError> {
        let mut state = self.state.lock().await;
        state.log.opened.push(url.to_string());
        let page = self.page(url)?;
        if let Some(reason) = &page.unavailable {
            return Err(RenderError::Navigation {
                url: url.to_string(),
                reason: reason.clone(),
            });
        }
        state.next_id += 1;
        let id = state.next_id;
        state.open.insert(
            id,
            OpenPage {
                url: url.to_string(),
                frame: 0,
            },
        );
        Ok(PageHandle {
            id,
            url: url.to_string(),
        })
    }

    async fn current_html(&self, page: &PageHandle) -> Result<String, RenderError> {
        Ok(self.current(page).await?.1)
    }

    async fn scroll_to_bottom(&self, page: &PageHandle) -> Result<(), RenderError> {
        let mut state = self.state.lock().await;
        state.log.scrolls += 1;
        let open = state.open.get_mut(&page.id).ok_or(RenderError::UnknownPage(page.id))?;
        open.frame += 1;
        Ok(())
    }

    async fn document_height(&self, page: &PageHandle) -> Result<u64, RenderError> {
        Ok(self.current(page).await?.1.len() as u64)
    }

    async fn fill_field(&self, page: &PageHandle, identifier: &str, value: &str) -> Result<(), RenderError> {
        let (url, html) = self.current(page).await?;
        require_element(&html, &url, identifier)?;
        self.state
            .lock()
            .await
            .log
            .filled
            .push((identifier.to_string(), value.to_string()));
        Ok(())
    }

    async fn click(&self, page: &PageHandle, identifier: &str) -> Result<(), RenderError> {
        let (url, html) = self.current(page).await?;
        require_element(&html, &url, identifier)?;
        let target = self.page(&url)?.navigations.get(identifier).cloned();

        let mut state = self.state.lock().await;
        state.log.clicked.push(identifier.to_string());
        if let Some(target) = target {
            self.page(&target)?;
            let open = state.open.get_mut(&page.id).ok_or(RenderError::UnknownPage(page.id))?;
            open.url = target;
            open.frame = 0;
        }
        Ok(())
    }

    async fn close(&self, page: PageHandle) -> Result<(), RenderError> {
        let mut state = self.state.lock().await;
        state.open.remove(&page.id).ok_or(RenderError::UnknownPage(page.id))?;
        state.log.closed += 1;
        Ok(())
    }
}
