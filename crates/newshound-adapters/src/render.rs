use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use newshound_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageHandle {
    pub id: u64,
    pub url: String,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },
    #[error("no element matches {identifier:?} on {url}")]
    ElementNotFound { identifier: String, url: String },
    #[error("invalid element identifier {identifier:?}: {reason}")]
    InvalidIdentifier { identifier: String, reason: String },
    #[error("page {0} is not open")]
    UnknownPage(u64),
}

impl RenderError {
    fn navigation(url: &str, err: FetchError) -> Self {
        Self::Navigation {
            url: url.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Page navigation and DOM access used by discovery. Element identifiers are
/// CSS selectors, optionally ending in `:has-text("Label")` to pick the first
/// match whose text contains the label.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn open(&self, url: &str) -> Result<PageHandle, RenderError>;
    async fn current_html(&self, page: &PageHandle) -> Result<String, RenderError>;
    async fn scroll_to_bottom(&self, page: &PageHandle) -> Result<(), RenderError>;
    async fn document_height(&self, page: &PageHandle) -> Result<u64, RenderError>;
    async fn fill_field(&self, page: &PageHandle, identifier: &str, value: &str) -> Result<(), RenderError>;
    async fn click(&self, page: &PageHandle, identifier: &str) -> Result<(), RenderError>;
    async fn close(&self, page: PageHandle) -> Result<(), RenderError>;
}

pub fn split_identifier(identifier: &str) -> (&str, Option<&str>) {
    let trimmed = identifier.trim();
    if let Some(open) = trimmed.rfind(":has-text(") {
        let rest = &trimmed[open + ":has-text(".len()..];
        if let Some(inner) = rest.strip_suffix(')') {
            let label = inner.trim().trim_matches(|c| c == '"' || c == '\'');
            return (trimmed[..open].trim(), Some(label));
        }
    }
    (trimmed, None)
}

pub fn find_element<'a>(document: &'a Html, identifier: &str) -> Result<Option<ElementRef<'a>>, RenderError> {
    let (css, label) = split_identifier(identifier);
    let selector = Selector::parse(css).map_err(|err| RenderError::InvalidIdentifier {
        identifier: identifier.to_string(),
        reason: err.to_string(),
    })?;
    Ok(document.select(&selector).find(|element| match label {
        Some(label) => element.text().collect::<String>().contains(label),
        None => true,
    }))
}

#[derive(Debug, Clone)]
struct PageState {
    url: String,
    html: String,
    fields: Vec<(String, String)>,
}

enum ClickPlan {
    Nothing,
    Get(String),
    PostForm { action: String, fields: Vec<(String, String)> },
}

/// No script execution: scrolling never grows the document and clicks only
/// follow links or submit enclosing forms.
#[derive(Debug)]
pub struct HttpRenderer {
    fetcher: HttpFetcher,
    pages: Mutex<HashMap<u64, PageState>>,
    next_id: AtomicU64,
}

impl HttpRenderer {
    pub fn new(fetcher: HttpFetcher) -> Self {
        Self {
            fetcher,
            pages: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    async fn state(&self, page: &PageHandle) -> Result<PageState, RenderError> {
        self.pages
            .lock()
            .await
            .get(&page.id)
            .cloned()
            .ok_or(RenderError::UnknownPage(page.id))
    }

    async fn replace_document(&self, page: &PageHandle, url: String, html: String) -> Result<(), RenderError> {
        let mut pages = self.pages.lock().await;
        let state = pages.get_mut(&page.id).ok_or(RenderError::UnknownPage(page.id))?;
        state.url = url;
        state.html = html;
        state.fields.clear();
        Ok(())
    }
}

#[async_trait]
impl PageRenderer for HttpRenderer {
    async fn open(&self, url: &str) -> Result<PageHandle, RenderError> {
        let response = self
            .fetcher
            .get(url)
            .await
            .map_err(|err| RenderError::navigation(url, err))?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pages.lock().await.insert(
            id,
            PageState {
                url: response.final_url.clone(),
                html: response.text_lossy(),
                fields: Vec::new(),
            },
        );
        Ok(PageHandle {
            id,
            url: url.to_string(),
        })
    }

    async fn current_html(&self, page: &PageHandle) -> Result<String, RenderError> {
        Ok(self.state(page).await?.html)
    }

    async fn scroll_to_bottom(&self, page: &PageHandle) -> Result<(), RenderError> {
        self.state(page).await.map(|_| ())
    }

    async fn document_height(&self, page: &PageHandle) -> Result<u64, RenderError> {
        Ok(self.state(page).await?.html.len() as u64)
    }

    async fn fill_field(&self, page: &PageHandle, identifier: &str, value: &str) -> Result<(), RenderError> {
        let mut pages = self.pages.lock().await;
        let state = pages.get_mut(&page.id).ok_or(RenderError::UnknownPage(page.id))?;
        let name = field_name(&state.html, &state.url, identifier)?;
        state.fields.retain(|(existing, _)| existing != &name);
        state.fields.push((name, value.to_string()));
        Ok(())
    }

    async fn click(&self, page: &PageHandle, identifier: &str) -> Result<(), RenderError> {
        let state = self.state(page).await?;
        match plan_click(&state, identifier)? {
            ClickPlan::Nothing => {
                debug!(identifier, url = %state.url, "click has no navigation target");
                Ok(())
            }
            ClickPlan::Get(target) => {
                let response = self
                    .fetcher
                    .get(&target)
                    .await
                    .map_err(|err| RenderError::navigation(&target, err))?;
                let html = response.text_lossy();
                self.replace_document(page, response.final_url, html).await
            }
            ClickPlan::PostForm { action, fields } => {
                let response = self
                    .fetcher
                    .post_form(&action, &fields)
                    .await
                    .map_err(|err| RenderError::navigation(&action, err))?;
                let html = response.text_lossy();
                self.replace_document(page, response.final_url, html).await
            }
        }
    }

    async fn close(&self, page: PageHandle) -> Result<(), RenderError> {
        self.pages
            .lock()
            .await
            .remove(&page.id)
            .map(|_| ())
            .ok_or(RenderError::UnknownPage(page.id))
    }
}

fn field_name(html: &str, url: &str, identifier: &str) -> Result<String, RenderError> {
    let document = Html::parse_document(html);
    let element = find_element(&document, identifier)?.ok_or_else(|| RenderError::ElementNotFound {
        identifier: identifier.to_string(),
        url: url.to_string(),
    })?;
    element
        .value()
        .attr("name")
        .or_else(|| element.value().attr("id"))
        .map(ToString::to_string)
        .ok_or_else(|| RenderError::ElementNotFound {
            identifier: format!("{identifier}[name]"),
            url: url.to_string(),
        })
}

fn plan_click(state: &PageState, identifier: &str) -> Result<ClickPlan, RenderError> {
    let document = Html::parse_document(&state.html);
    let element = find_element(&document, identifier)?.ok_or_else(|| RenderError::ElementNotFound {
        identifier: identifier.to_string(),
        url: state.url.clone(),
    })?;

    let resolve = |target: &str| -> Result<String, RenderError> {
        Url::parse(&state.url)
            .and_then(|base| base.join(target))
            .map(String::from)
            .map_err(|err| RenderError::Navigation {
                url: target.to_string(),
                reason: err.to_string(),
            })
    };

    if let Some(href) = link_target(element) {
        return Ok(ClickPlan::Get(resolve(href)?));
    }

    let Some(form) = element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|ancestor| ancestor.value().name() == "form")
    else {
        return Ok(ClickPlan::Nothing);
    };

    let mut fields = hidden_inputs(form);
    for (name, value) in &state.fields {
        fields.retain(|(existing, _)| existing != name);
        fields.push((name.clone(), value.clone()));
    }

    let action = resolve(form.value().attr("action").unwrap_or(&state.url))?;
    let is_get = form
        .value()
        .attr("method")
        .is_some_and(|method| method.eq_ignore_ascii_case("get"));
    if is_get {
        let query = fields
            .iter()
            .map(|(name, value)| format!("{}={}", urlencoding::encode(name), urlencoding::encode(value)))
            .collect::<Vec<_>>()
            .join("&");
        let target = match (query.is_empty(), action.contains('?')) {
            (true, _) => action,
            (false, true) => format!("{action}&{query}"),
            (false, false) => format!("{action}?{query}"),
        };
        return Ok(ClickPlan::Get(target));
    }
    Ok(ClickPlan::PostForm { action, fields })
}

// Own `href`, else the first link inside.
fn link_target(element: ElementRef<'_>) -> Option<&str> {
    if let Some(href) = element.value().attr("href") {
        return Some(href);
    }
    let selector = Selector::parse("a[href]").ok()?;
    element
        .select(&selector)
        .find_map(|link| link.value().attr("href"))
}

fn hidden_inputs(form: ElementRef<'_>) -> Vec<(String, String)> {
    let Ok(selector) = Selector::parse(r#"input[type="hidden"][name]"#) else {
        return Vec::new();
    };
    form.select(&selector)
        .filter_map(|input| {
            let name = input.value().attr("name")?;
            Some((name.to_string(), input.value().attr("value").unwrap_or_default().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOGIN_PAGE: &str = r#"
        <html><body>
          <form action="/session" method="post">
            <input type="hidden" name="csrf" value="tok">
            <input id="username" name="user">
            <input id="password" name="pass" type="password">
            <button id="password-submit" type="submit">Sign in</button>
          </form>
          <ul class="tabs"><li>Videos</li><li><a href="/search?tab=news">News</a></li></ul>
        </body></html>
    "#;

    fn state() -> PageState {
        PageState {
            url: "https://accounts.example.com/login".into(),
            html: LOGIN_PAGE.into(),
            fields: vec![("user".into(), "ann".into()), ("pass".into(), "s3cret".into())],
        }
    }

    #[test]
    fn has_text_suffix_is_split_from_the_selector() {
        assert_eq!(split_identifier(r#".tabs li:has-text("News")"#), (".tabs li", Some("News")));
        assert_eq!(split_identifier("#username"), ("#username", None));
    }

    #[test]
    fn has_text_picks_the_first_element_containing_the_label() {
        let document = Html::parse_document(LOGIN_PAGE);
        let element = find_element(&document, r#".tabs li:has-text("News")"#).unwrap().unwrap();
        assert!(element.inner_html().contains("/search?tab=news"));
        assert!(find_element(&document, r#".tabs li:has-text("Podcasts")"#).unwrap().is_none());
    }

    #[test]
    fn fill_field_resolves_the_form_name_of_an_id_selector() {
        assert_eq!(field_name(LOGIN_PAGE, "https://x", "#username").unwrap(), "user");
        assert!(matches!(
            field_name(LOGIN_PAGE, "https://x", "#missing"),
            Err(RenderError::ElementNotFound { .. })
        ));
    }

    #[test]
    fn submit_click_posts_hidden_and_filled_fields_to_the_form_action() {
        let ClickPlan::PostForm { action, fields } = plan_click(&state(), "#password-submit").unwrap() else {
            panic!("expected a form post");
        };
        assert_eq!(action, "https://accounts.example.com/session");
        assert_eq!(
            fields,
            vec![
                ("csrf".to_string(), "tok".to_string()),
                ("user".to_string(), "ann".to_string()),
                ("pass".to_string(), "s3cret".to_string()),
            ]
        );
    }

    #[test]
    fn link_click_follows_the_resolved_href() {
        let ClickPlan::Get(target) = plan_click(&state(), r#".tabs a:has-text("News")"#).unwrap() else {
            panic!("expected navigation");
        };
        assert_eq!(target, "https://accounts.example.com/search?tab=news");
    }

    #[test]
    fn click_on_tab_item_follows_the_link_inside_it() {
        let ClickPlan::Get(target) = plan_click(&state(), r#".tabs li:has-text("News")"#).unwrap() else {
            panic!("expected navigation");
        };
        assert_eq!(target, "https://accounts.example.com/search?tab=news");
    }

    #[test]
    fn get_form_appends_to_an_action_that_already_has_a_query() {
        let page = PageState {
            url: "https://www.example.com/search".into(),
            html: r#"<form action="/search?lang=en" method="get">
                       <input type="hidden" name="tab" value="news">
                       <button id="go">Go</button>
                     </form>"#
                .into(),
            fields: vec![("q".into(), "gold price".into())],
        };
        let ClickPlan::Get(target) = plan_click(&page, "#go").unwrap() else {
            panic!("expected navigation");
        };
        assert_eq!(target, "https://www.example.com/search?lang=en&tab=news&q=gold%20price");
    }

    #[test]
    fn click_on_inert_element_does_nothing() {
        assert!(matches!(
            plan_click(&state(), r#".tabs li:has-text("Videos")"#).unwrap(),
            ClickPlan::Nothing
        ));
    }
}
