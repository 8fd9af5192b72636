//! Per-source selectors and discovery policies. Short-circuit profiles
//! assume newest-first results; the note on each says why.

use std::fmt;
use std::str::FromStr;

use newshound_core::DateWindow;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    #[serde(rename = "marketwatch")]
    MarketWatch,
    YahooFinance,
    Barrons,
    FinancialTimes,
    SeekingAlpha,
    Reuters,
    YahooStock,
}

impl SourceKind {
    pub const ALL: [SourceKind; 7] = [
        SourceKind::MarketWatch,
        SourceKind::YahooFinance,
        SourceKind::Barrons,
        SourceKind::FinancialTimes,
        SourceKind::SeekingAlpha,
        SourceKind::Reuters,
        SourceKind::YahooStock,
    ];

    pub fn slug(self) -> &'static str {
        match self {
            SourceKind::MarketWatch => "marketwatch",
            SourceKind::YahooFinance => "yahoo-finance",
            SourceKind::Barrons => "barrons",
            SourceKind::FinancialTimes => "financial-times",
            SourceKind::SeekingAlpha => "seeking-alpha",
            SourceKind::Reuters => "reuters",
            SourceKind::YahooStock => "yahoo-stock",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            SourceKind::MarketWatch => "MarketWatch",
            SourceKind::YahooFinance => "Yahoo Finance",
            SourceKind::Barrons => "Barron's",
            SourceKind::FinancialTimes => "Financial Times",
            SourceKind::SeekingAlpha => "Seeking Alpha",
            SourceKind::Reuters => "Reuters",
            SourceKind::YahooStock => "Yahoo Finance Quote",
        }
    }

    pub fn requires_login(self) -> bool {
        self.profile().login.is_some()
    }

    pub fn profile(self) -> SourceProfile {
        match self {
            // Search is sorted by date server-side and bounded by bd/ed.
            SourceKind::MarketWatch => SourceProfile {
                kind: self,
                origin: "https://www.marketwatch.com",
                url_template: "https://www.marketwatch.com/search?q={term}&m=Keyword&rpp=100&mp={page}\
                               &bd=false&bd=false&bd={start}&ed={end}&ts=0",
                date_param_format: "%m/%d/%Y",
                item_selector: "div.searchresult",
                date_selector: "span.deemphasized",
                date_separator: None,
                link_selectors: &["a.link"],
                pagination: PaginationMode::Pages {
                    first_page: 1,
                    max_pages: 50,
                },
                unparseable_dates: UnparseableDatePolicy::Stop,
                missing_dates: MissingDatePolicy::Skip,
                boundary: BoundaryPolicy::ShortCircuit,
                include_out_of_window: false,
                login: None,
                warm_up_clicks: &[],
            },
            // The news tab of the search page streams newest first.
            SourceKind::YahooFinance => SourceProfile {
                kind: self,
                origin: "https://finance.yahoo.com",
                url_template: "https://finance.yahoo.com/search?q={term}",
                date_param_format: "%Y-%m-%d",
                item_selector: r#"div[data-test="article"]"#,
                date_selector: r#"span[data-test="article-timestamp"]"#,
                date_separator: None,
                link_selectors: &["a"],
                pagination: PaginationMode::Scroll {
                    stall_limit: 3,
                    max_attempts: 20,
                },
                unparseable_dates: UnparseableDatePolicy::Include,
                missing_dates: MissingDatePolicy::Skip,
                boundary: BoundaryPolicy::ShortCircuit,
                include_out_of_window: false,
                login: None,
                warm_up_clicks: &[r#".SearchTabs_root li:has-text("News")"#],
            },
            // Search takes min/max dates and returns newest first.
            SourceKind::Barrons => SourceProfile {
                kind: self,
                origin: "https://www.barrons.com",
                url_template: "https://www.barrons.com/search?keyword={term}&page={page}\
                               &min-date={start}&max-date={end}",
                date_param_format: "%Y/%m/%d",
                item_selector: "article.SearchResult",
                date_selector: "p.SearchResult-time",
                date_separator: None,
                link_selectors: &["h3.SearchResult-headline a"],
                pagination: PaginationMode::Pages {
                    first_page: 1,
                    max_pages: 50,
                },
                unparseable_dates: UnparseableDatePolicy::Stop,
                missing_dates: MissingDatePolicy::Skip,
                boundary: BoundaryPolicy::ShortCircuit,
                include_out_of_window: false,
                login: Some(LoginProfile {
                    url: "https://accounts.barrons.com/login",
                    username_field: "#username",
                    password_field: "#password",
                    submit: "#password-submit",
                    authenticated_marker: None,
                }),
                warm_up_clicks: &[],
            },
            // dateFrom/dateTo bound the query; results default to newest first.
            SourceKind::FinancialTimes => SourceProfile {
                kind: self,
                origin: "https://www.ft.com",
                url_template: "https://www.ft.com/search?q={term}&dateTo={end}&dateFrom={start}&page={page}",
                date_param_format: "%Y-%m-%d",
                item_selector: "li.o-teaser",
                date_selector: "div.o-teaser__timestamp",
                date_separator: None,
                link_selectors: &["a.js-teaser-heading-link"],
                pagination: PaginationMode::Pages {
                    first_page: 1,
                    max_pages: 50,
                },
                unparseable_dates: UnparseableDatePolicy::Stop,
                missing_dates: MissingDatePolicy::Skip,
                boundary: BoundaryPolicy::ShortCircuit,
                include_out_of_window: false,
                login: Some(LoginProfile {
                    url: "https://accounts.ft.com/login",
                    username_field: "#email",
                    password_field: "#password",
                    submit: r#"button[type="submit"]"#,
                    authenticated_marker: None,
                }),
                warm_up_clicks: &[],
            },
            // Articles tab is newest first; the default "All" tab is not.
            SourceKind::SeekingAlpha => SourceProfile {
                kind: self,
                origin: "https://seekingalpha.com",
                url_template: "https://seekingalpha.com/search?q={term}&page={page}",
                date_param_format: "%Y-%m-%d",
                item_selector: "li.search-pages-result",
                date_selector: "span.search-result-date",
                date_separator: None,
                link_selectors: &["a.search-result-title"],
                pagination: PaginationMode::Pages {
                    first_page: 1,
                    max_pages: 50,
                },
                unparseable_dates: UnparseableDatePolicy::Stop,
                missing_dates: MissingDatePolicy::Skip,
                boundary: BoundaryPolicy::ShortCircuit,
                include_out_of_window: false,
                login: None,
                warm_up_clicks: &[r#".tabs__tab-label:has-text("Articles")"#],
            },
            // sort=newest is explicit in the query.
            SourceKind::Reuters => SourceProfile {
                kind: self,
                origin: "https://www.reuters.com",
                url_template: "https://www.reuters.com/site-search/?query={term}&sort=newest",
                date_param_format: "%Y-%m-%d",
                item_selector: r#"li[class*="search-results__item"]"#,
                date_selector: "time",
                date_separator: None,
                link_selectors: &["a"],
                pagination: PaginationMode::Scroll {
                    stall_limit: 3,
                    max_attempts: 50,
                },
                unparseable_dates: UnparseableDatePolicy::Include,
                missing_dates: MissingDatePolicy::Skip,
                boundary: BoundaryPolicy::ShortCircuit,
                include_out_of_window: false,
                login: None,
                warm_up_clicks: &[r#".search-results__section-filter button:has-text("Business")"#],
            },
            // The quote news panel mixes pinned and recent stories, so no
            // ordering is assumed and out-of-window items are filtered.
            SourceKind::YahooStock => SourceProfile {
                kind: self,
                origin: "https://au.finance.yahoo.com",
                url_template: "https://au.finance.yahoo.com/quote/{term}",
                date_param_format: "%Y-%m-%d",
                item_selector: r#"#tabpanel-news section[data-testid="storyitem"]"#,
                date_selector: "div.publishing",
                date_separator: Some("•"),
                link_selectors: &["a.subtle-link.fin-size-small.titles.noUnderline", "a.subtle-link", "a"],
                pagination: PaginationMode::Single,
                unparseable_dates: UnparseableDatePolicy::Include,
                missing_dates: MissingDatePolicy::Include,
                boundary: BoundaryPolicy::Filter,
                include_out_of_window: false,
                login: None,
                warm_up_clicks: &[],
            },
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownSource(pub String);

impl fmt::Display for UnknownSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown source {:?}; expected one of ", self.0)?;
        let slugs = SourceKind::ALL.iter().map(|kind| kind.slug()).collect::<Vec<_>>();
        f.write_str(&slugs.join(", "))
    }
}

impl std::error::Error for UnknownSource {}

impl FromStr for SourceKind {
    type Err = UnknownSource;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let wanted = value.trim().to_ascii_lowercase().replace(['_', ' '], "-");
        SourceKind::ALL
            .into_iter()
            .find(|kind| kind.slug() == wanted || kind.slug().replace('-', "") == wanted)
            .ok_or_else(|| UnknownSource(value.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaginationMode {
    Pages { first_page: u32, max_pages: u32 },
    /// `stall_limit` consecutive scrolls without growth end the scan.
    Scroll { stall_limit: u32, max_attempts: u32 },
    Single,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnparseableDatePolicy {
    Stop,
    /// Treat the item as inside the window.
    Include,
}

/// Items with no date element at all, such as sponsored slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissingDatePolicy {
    Skip,
    Include,
}

/// What an item dated before the window start means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoundaryPolicy {
    /// Stop, and drop everything after it.
    ShortCircuit,
    Filter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginProfile {
    pub url: &'static str,
    pub username_field: &'static str,
    pub password_field: &'static str,
    pub submit: &'static str,
    pub authenticated_marker: Option<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceProfile {
    pub kind: SourceKind,
    pub origin: &'static str,
    /// Placeholders: `{term}`, `{page}`, `{start}`, `{end}`.
    pub url_template: &'static str,
    pub date_param_format: &'static str,
    pub item_selector: &'static str,
    pub date_selector: &'static str,
    /// Date text is whatever follows this token, when present.
    pub date_separator: Option<&'static str>,
    pub link_selectors: &'static [&'static str],
    pub pagination: PaginationMode,
    pub unparseable_dates: UnparseableDatePolicy,
    pub missing_dates: MissingDatePolicy,
    pub boundary: BoundaryPolicy,
    pub include_out_of_window: bool,
    pub login: Option<LoginProfile>,
    /// Clicked once after the first load; failures are ignored.
    pub warm_up_clicks: &'static [&'static str],
}

impl SourceProfile {
    pub fn source_name(&self) -> &'static str {
        self.kind.display_name()
    }

    pub fn search_url(&self, term: &str, window: &DateWindow, page: u32) -> String {
        self.url_template
            .replace("{term}", &urlencoding::encode(term.trim()))
            .replace("{page}", &page.to_string())
            .replace("{start}", &window.start().format(self.date_param_format).to_string())
            .replace("{end}", &window.end().format(self.date_param_format).to_string())
    }

    pub fn with_ceiling(mut self, ceiling: u32) -> Self {
        self.pagination = match self.pagination {
            PaginationMode::Pages { first_page, .. } => PaginationMode::Pages {
                first_page,
                max_pages: ceiling,
            },
            PaginationMode::Scroll { stall_limit, .. } => PaginationMode::Scroll {
                stall_limit,
                max_attempts: ceiling,
            },
            PaginationMode::Single => PaginationMode::Single,
        };
        self
    }

    pub fn with_authenticated_marker(mut self, marker: &'static str) -> Self {
        if let Some(login) = self.login.as_mut() {
            login.authenticated_marker = Some(marker);
        }
        self
    }

    pub fn with_out_of_window_items(mut self, include: bool) -> Self {
        self.include_out_of_window = include;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> DateWindow {
        DateWindow::parse("2024-03-01", "2024-03-31").unwrap()
    }

    #[test]
    fn marketwatch_url_carries_page_and_us_dates() {
        let url = SourceKind::MarketWatch.profile().search_url("apple inc", &window(), 2);
        assert_eq!(
            url,
            "https://www.marketwatch.com/search?q=apple%20inc&m=Keyword&rpp=100&mp=2\
             &bd=false&bd=false&bd=03/01/2024&ed=03/31/2024&ts=0"
        );
    }

    #[test]
    fn barrons_and_ft_urls_use_their_own_date_formats() {
        let barrons = SourceKind::Barrons.profile().search_url("AAPL", &window(), 1);
        assert!(barrons.ends_with("page=1&min-date=2024/03/01&max-date=2024/03/31"));
        let ft = SourceKind::FinancialTimes.profile().search_url("AAPL", &window(), 3);
        assert!(ft.contains("dateTo=2024-03-31&dateFrom=2024-03-01&page=3"));
    }

    #[test]
    fn policies_match_each_source_family() {
        use UnparseableDatePolicy::*;
        for kind in [SourceKind::MarketWatch, SourceKind::SeekingAlpha, SourceKind::Barrons, SourceKind::FinancialTimes] {
            assert_eq!(kind.profile().unparseable_dates, Stop, "{kind}");
            assert!(matches!(kind.profile().pagination, PaginationMode::Pages { .. }));
        }
        for kind in [SourceKind::YahooFinance, SourceKind::Reuters] {
            assert_eq!(kind.profile().unparseable_dates, Include, "{kind}");
            assert!(matches!(kind.profile().pagination, PaginationMode::Scroll { stall_limit: 3, .. }));
        }
        let quote = SourceKind::YahooStock.profile();
        assert_eq!(quote.pagination, PaginationMode::Single);
        assert_eq!(quote.unparseable_dates, Include);
        assert_eq!(quote.missing_dates, MissingDatePolicy::Include);
        for kind in SourceKind::ALL.into_iter().filter(|kind| *kind != SourceKind::YahooStock) {
            assert_eq!(kind.profile().missing_dates, MissingDatePolicy::Skip, "{kind}");
        }
        assert_eq!(quote.boundary, BoundaryPolicy::Filter);
        assert!(SourceKind::Barrons.requires_login());
        assert!(SourceKind::FinancialTimes.requires_login());
        assert!(!SourceKind::Reuters.requires_login());
    }

    #[test]
    fn ceiling_override_applies_to_the_active_mode() {
        let reuters = SourceKind::Reuters.profile().with_ceiling(5);
        assert_eq!(reuters.pagination, PaginationMode::Scroll { stall_limit: 3, max_attempts: 5 });
        let mw = SourceKind::MarketWatch.profile().with_ceiling(2);
        assert_eq!(mw.pagination, PaginationMode::Pages { first_page: 1, max_pages: 2 });
    }

    #[test]
    fn source_kind_parses_slugs_loosely() {
        assert_eq!("yahoo_finance".parse::<SourceKind>().unwrap(), SourceKind::YahooFinance);
        assert_eq!("MarketWatch".parse::<SourceKind>().unwrap(), SourceKind::MarketWatch);
        assert_eq!("seekingalpha".parse::<SourceKind>().unwrap(), SourceKind::SeekingAlpha);
        let err = "bloomberg".parse::<SourceKind>().unwrap_err();
        assert!(err.to_string().contains("reuters"));
    }
}
