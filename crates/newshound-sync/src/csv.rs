//! Link lists as CSV: `source,article_link` on export, and a lenient reader
//! for link files produced here or by hand.

use std::path::Path;

use anyhow::{Context, Result};
use newshound_core::DiscoveredLink;
use tokio::fs;

pub const LINK_COLUMN: &str = "article_link";
const HEADER: &str = "source,article_link";

pub fn render_links<'a>(links: impl IntoIterator<Item = &'a DiscoveredLink>) -> String {
    let mut out = String::from(HEADER);
    out.push('\n');
    for link in links {
        out.push_str(&quote(&link.source_name));
        out.push(',');
        out.push_str(&quote(&link.url));
        out.push('\n');
    }
    out
}

pub async fn write_links<'a>(
    path: impl AsRef<Path>,
    links: impl IntoIterator<Item = &'a DiscoveredLink>,
) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    fs::write(path, render_links(links))
        .await
        .with_context(|| format!("writing {}", path.display()))
}

/// URLs from the `article_link` column, or, when there is no such header,
/// the first field of each row that looks like an absolute URL.
pub fn parse_links(text: &str) -> Vec<String> {
    let mut rows = text.lines().filter(|line| !line.trim().is_empty()).map(split_row);
    let Some(first) = rows.next() else {
        return Vec::new();
    };

    let link_column = first
        .iter()
        .position(|field| field.trim().eq_ignore_ascii_case(LINK_COLUMN));
    let pick = |row: &[String]| -> Option<String> {
        match link_column {
            Some(index) => row.get(index).map(|field| field.trim().to_string()),
            None => row.iter().map(|field| field.trim()).find(|field| looks_like_url(field)).map(ToString::to_string),
        }
    };

    let header_row = if link_column.is_some() { None } else { pick(first.as_slice()) };
    header_row
        .into_iter()
        .chain(rows.filter_map(|row| pick(row.as_slice())))
        .filter(|url| !url.is_empty())
        .collect()
}

pub async fn read_links(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(parse_links(&text))
}

fn looks_like_url(field: &str) -> bool {
    field.starts_with("http://") || field.starts_with("https://")
}

fn quote(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn split_row(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.trim_end_matches('\r').chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    fields.push(current);
    fields
}
