use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::config::ResolverOptions;
use crate::resolver::{ResolveError, TitleService};

/// What the title service answers when a page yields nothing usable.
pub const UNKNOWN_TITLE: &str = "Unknown Title";
pub const UNTITLED_BOOKMARK: &str = "Untitled Bookmark";

const HEAD_END: &[u8] = b"</head>";

static META_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<meta\b[^>]*>").expect("valid meta tag pattern"));
static ATTRIBUTE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)([A-Za-z_:][-A-Za-z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#)
        .expect("valid attribute pattern")
});
static TITLE_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<title\b[^>]*>(.*?)</title\s*>").expect("valid title pattern"));

/// Source of best-effort page titles, consulted by create when the user left
/// the title blank.
#[async_trait]
pub trait PageTitleSource: Send + Sync {
    async fn page_title(&self, url: &str) -> Result<Option<String>, ResolveError>;
}

/// Fetches a page and reads its `<head>` for a title. Stops reading as soon as
/// the head is complete.
#[derive(Clone)]
pub struct PageScraper {
    client: reqwest::Client,
    max_head_bytes: usize,
}

impl PageScraper {
    pub fn new(options: &ResolverOptions) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(options.user_agent.clone())
            .timeout(Duration::from_secs(options.timeout_secs))
            .build()
            .context("building page scraper http client")?;
        Ok(Self::with_client(client, options.max_head_bytes))
    }

    pub fn with_client(client: reqwest::Client, max_head_bytes: usize) -> Self {
        Self {
            client,
            max_head_bytes: max_head_bytes.max(HEAD_END.len()),
        }
    }

    /// Document text up to and including `</head>`, or up to the byte cap.
    pub async fn fetch_head(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ResolveError> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ResolveError::Cancelled),
            response = self.client.get(url).send() => response.map_err(ResolveError::http)?,
        };
        let mut stream = response.bytes_stream();
        let mut head: Vec<u8> = Vec::new();

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ResolveError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let bytes = chunk.map_err(ResolveError::http)?;
            let scan_from = head.len().saturating_sub(HEAD_END.len() - 1);
            head.extend_from_slice(&bytes);
            if let Some(end) = find_head_end(&head[scan_from..]) {
                head.truncate(scan_from + end);
                tracing::trace!(url, bytes = head.len(), "head complete, dropping body stream");
                break;
            }
            if head.len() >= self.max_head_bytes {
                head.truncate(self.max_head_bytes);
                tracing::debug!(url, cap = self.max_head_bytes, "no </head> within byte cap");
                break;
            }
        }

        Ok(String::from_utf8_lossy(&head).into_owned())
    }

    pub async fn scrape_title(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, ResolveError> {
        let head = self.fetch_head(url, cancel).await?;
        Ok(extract_title(&head))
    }
}

#[async_trait]
impl PageTitleSource for PageScraper {
    async fn page_title(&self, url: &str) -> Result<Option<String>, ResolveError> {
        self.scrape_title(url, &CancellationToken::new()).await
    }
}

#[async_trait]
impl TitleService for PageScraper {
    /// Local stand-in for the remote title endpoint: never fails except on
    /// cancellation.
    async fn resolve(&self, url: &str, cancel: CancellationToken) -> Result<String, ResolveError> {
        match self.scrape_title(url, &cancel).await {
            Ok(Some(title)) => Ok(title),
            Ok(None) => Ok(UNKNOWN_TITLE.to_string()),
            Err(ResolveError::Cancelled) => Err(ResolveError::Cancelled),
            Err(err) => {
                tracing::debug!(url, error = %err, "scrape failed");
                Ok(UNKNOWN_TITLE.to_string())
            }
        }
    }
}

fn find_head_end(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(HEAD_END.len())
        .position(|window| window.eq_ignore_ascii_case(HEAD_END))
        .map(|start| start + HEAD_END.len())
}

/// First non-empty of `og:title`, `twitter:title`, then `<title>` text.
pub fn extract_title(html: &str) -> Option<String> {
    meta_content(html, "property", "og:title")
        .or_else(|| meta_content(html, "name", "twitter:title"))
        .or_else(|| {
            TITLE_TAG
                .captures(html)
                .and_then(|caps| caps.get(1))
                .map(|text| decode_entities(text.as_str().trim()))
                .filter(|text| !text.is_empty())
        })
}

fn meta_content(html: &str, key: &str, value: &str) -> Option<String> {
    META_TAG.find_iter(html).find_map(|tag| {
        let mut matched = false;
        let mut content = None;
        for caps in ATTRIBUTE.captures_iter(tag.as_str()) {
            let name = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            let raw = caps
                .get(2)
                .or_else(|| caps.get(3))
                .or_else(|| caps.get(4))
                .map(|m| m.as_str())
                .unwrap_or_default();
            if name.eq_ignore_ascii_case(key) && raw.eq_ignore_ascii_case(value) {
                matched = true;
            } else if name.eq_ignore_ascii_case("content") {
                content = Some(raw);
            }
        }
        if !matched {
            return None;
        }
        content
            .map(decode_entities)
            .filter(|text| !text.is_empty())
    })
}

fn decode_entities(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let decoded = tail
            .find(';')
            .filter(|end| *end <= 10)
            .and_then(|end| decode_entity(&tail[1..end]).map(|ch| (ch, end)));
        match decoded {
            Some((ch, end)) => {
                out.push(ch);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some('\u{a0}'),
        _ => {
            let code = if let Some(hex) = name.strip_prefix("#x").or_else(|| name.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok()?
            } else {
                name.strip_prefix('#')?.parse().ok()?
            };
            char::from_u32(code)
        }
    }
}
