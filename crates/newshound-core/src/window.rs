//! Date window bounds and normalization of the timestamp text sources print.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeDelta, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized date text: {text:?}")]
pub struct DateParseError {
    pub text: String,
}

impl DateParseError {
    fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WindowError {
    #[error("window start {start} is after end {end}")]
    Inverted { start: NaiveDate, end: NaiveDate },
    #[error("invalid window bound {value:?}: expected YYYY-MM-DD")]
    InvalidBound { value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowPosition {
    Before,
    Within,
    After,
}

/// Inclusive `[start, end]` calendar-date range, fixed for a discovery run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, WindowError> {
        if start > end {
            return Err(WindowError::Inverted { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn parse(start: &str, end: &str) -> Result<Self, WindowError> {
        let parse_bound = |value: &str| {
            NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|_| WindowError::InvalidBound {
                value: value.to_string(),
            })
        };
        Self::new(parse_bound(start)?, parse_bound(end)?)
    }

    /// Window covering the `days` calendar days up to and including `today`.
    pub fn trailing_days(today: NaiveDate, days: u32) -> Self {
        let start = today
            .checked_sub_signed(TimeDelta::days(i64::from(days)))
            .unwrap_or(NaiveDate::MIN);
        Self { start, end: today }
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn position(&self, date: NaiveDate) -> WindowPosition {
        if date < self.start {
            WindowPosition::Before
        } else if date > self.end {
            WindowPosition::After
        } else {
            WindowPosition::Within
        }
    }

    pub fn locate(
        &self,
        resolver: &RelativeDateResolver,
        text: &str,
        reference_now: DateTime<Utc>,
    ) -> Result<WindowPosition, DateParseError> {
        let resolved = resolver.resolve(text, reference_now)?;
        Ok(self.position(resolved.date_naive()))
    }
}

static RELATIVE_PHRASE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\d+)\s*(minute|min|hour|hr|day|month|year|yr)s?\b").expect("static regex")
});

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
];

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%m/%d/%Y",
    "%B %d, %Y",
    "%B %d %Y",
    "%d %B %Y",
    "%d %B, %Y",
    "%A, %B %d, %Y",
    "%A, %d %B %Y",
];

/// Months count as 30 days and years as 365. Date-only formats resolve to
/// midnight UTC.
#[derive(Debug, Clone)]
pub struct RelativeDateResolver {
    datetime_formats: Vec<&'static str>,
    date_formats: Vec<&'static str>,
}

impl Default for RelativeDateResolver {
    fn default() -> Self {
        Self {
            datetime_formats: DATETIME_FORMATS.to_vec(),
            date_formats: DATE_FORMATS.to_vec(),
        }
    }
}

impl RelativeDateResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_date_format(mut self, format: &'static str) -> Self {
        self.date_formats.push(format);
        self
    }

    pub fn resolve(&self, text: &str, reference_now: DateTime<Utc>) -> Result<DateTime<Utc>, DateParseError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(DateParseError::new(text));
        }

        if let Some(caps) = RELATIVE_PHRASE.captures(trimmed) {
            let amount: i64 = caps[1].parse().map_err(|_| DateParseError::new(text))?;
            let unit = caps[2].to_ascii_lowercase();
            let delta = match unit.as_str() {
                "minute" | "min" => TimeDelta::try_minutes(amount),
                "hour" | "hr" => TimeDelta::try_hours(amount),
                "day" => TimeDelta::try_days(amount),
                "month" => amount.checked_mul(30).and_then(TimeDelta::try_days),
                "year" | "yr" => amount.checked_mul(365).and_then(TimeDelta::try_days),
                _ => None,
            }
            .ok_or_else(|| DateParseError::new(text))?;
            return reference_now
                .checked_sub_signed(delta)
                .ok_or_else(|| DateParseError::new(text));
        }

        let lower = trimmed.to_ascii_lowercase();
        let has_digit = lower.chars().any(|c| c.is_ascii_digit());
        if !has_digit && (lower.contains("ago") || lower == "just now" || lower == "now") {
            return Ok(reference_now);
        }

        self.resolve_absolute(trimmed).ok_or_else(|| DateParseError::new(text))
    }

    fn resolve_absolute(&self, text: &str) -> Option<DateTime<Utc>> {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
            return Some(parsed.with_timezone(&Utc));
        }

        for candidate in candidates(text) {
            for format in &self.datetime_formats {
                if let Ok(naive) = NaiveDateTime::parse_from_str(&candidate, format) {
                    return Some(naive.and_utc());
                }
            }
            for format in &self.date_formats {
                if let Ok(date) = NaiveDate::parse_from_str(&candidate, format) {
                    return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
                }
            }
        }
        None
    }
}

/// Variants of a timestamp with trailing clock text and abbreviation dots
/// removed, e.g. `"Jan. 5, 2024 at 3:12 p.m. ET"` -> `"Jan 5, 2024"`.
fn candidates(text: &str) -> Vec<String> {
    let mut out = vec![text.to_string()];
    for separator in [" at ", " | ", " - ", " • "] {
        if let Some((head, _)) = text.split_once(separator) {
            out.push(head.trim().to_string());
        }
    }
    let undotted = out
        .iter()
        .filter(|c| c.contains(". "))
        .map(|c| c.replace(". ", " "))
        .collect::<Vec<_>>();
    out.extend(undotted);
    out
}
