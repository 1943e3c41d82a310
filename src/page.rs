use anyhow::{Context, Result};
use log::{debug, warn};
use regex::Regex;
use reqwest::Url;
use scraper::{Html, Selector};
use std::sync::LazyLock;
use std::time::Duration;

use crate::models::NewApplication;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PageInfo {
    pub title: Option<String>,
    pub favicon: Option<String>,
    pub company: Option<String>,
}

fn first_attr(document: &Html, selector: &str, attr: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    document
        .select(&selector)
        .filter_map(|el| el.value().attr(attr))
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(String::from)
}

fn title_of(document: &Html) -> Option<String> {
    let selector = Selector::parse("title").ok()?;
    let title = document
        .select(&selector)
        .next()
        .map(|el| el.text().collect::<Vec<_>>().join(" "))?;
    let title = title.split_whitespace().collect::<Vec<_>>().join(" ");
    if title.is_empty() {
        return None;
    }
    Some(title)
}

/// "Backend Engineer at Acme | Jobs" or "Backend Engineer - Acme Corp".
static TITLE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^.+?\s+at\s+(.+?)(?:\s+[|\-–·].*)?$",
        r"^.+?\s+[\-–|]\s+(.+?)(?:\s+[\-–|].*)?$",
    ]
    .into_iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

fn company_from_title(title: &str) -> Option<String> {
    for re in TITLE_PATTERNS.iter() {
        if let Some(company) = re.captures(title).and_then(|c| c.get(1)) {
            let company = company.as_str().trim();
            if !company.is_empty() {
                return Some(company.to_string());
            }
        }
    }
    None
}

pub fn parse_page(html: &str, page_url: &Url) -> PageInfo {
    let document = Html::parse_document(html);

    let title = title_of(&document)
        .or_else(|| first_attr(&document, "meta[property='og:title']", "content"));

    let favicon = first_attr(&document, "link[rel~='icon']", "href")
        .and_then(|href| page_url.join(&href).ok())
        .or_else(|| page_url.join("/favicon.ico").ok())
        .map(String::from);

    let company = first_attr(&document, "meta[property='og:site_name']", "content")
        .or_else(|| title.as_deref().and_then(company_from_title));

    PageInfo {
        title,
        favicon,
        company,
    }
}

pub fn fetch_page(url: &str, timeout: Duration) -> Result<PageInfo> {
    let page_url = Url::parse(url).with_context(|| format!("Invalid URL: {}", url))?;
    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .context("Failed to build HTTP client")?;
    debug!("fetching {}", page_url);
    let response = client
        .get(page_url.clone())
        .send()
        .with_context(|| format!("Failed to fetch {}", url))?;
    if !response.status().is_success() {
        anyhow::bail!("{} returned {}", url, response.status());
    }
    // Redirects may land somewhere else; relative links resolve against that.
    let final_url = response.url().clone();
    let body = response.text().context("Failed to read page body")?;
    Ok(parse_page(&body, &final_url))
}

/// Build the application to track. Fetch problems never block tracking:
/// the URL stands in for the title.
pub fn capture(url: &str, title: Option<String>, fetch: bool, timeout: Duration) -> NewApplication {
    let info = if fetch && title.is_none() {
        fetch_page(url, timeout).unwrap_or_else(|e| {
            warn!("{:#}", e);
            PageInfo::default()
        })
    } else {
        PageInfo::default()
    };
    NewApplication {
        url: url.to_string(),
        title: title.or(info.title).unwrap_or_else(|| url.to_string()),
        favicon: info.favicon,
        company: info.company,
        tags: Vec::new(),
    }
}
