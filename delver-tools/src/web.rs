//! Default web collaborators: DuckDuckGo search and an HTTP page fetcher.
//!
//! The search provider uses the DuckDuckGo instant answers API, which needs
//! no API key. The fetcher sends browser-like headers (blocking rates drop
//! sharply when the client does not identify itself as a bot) and extracts
//! readable text from HTML before handing bytes to the engine.

use async_trait::async_trait;
use delver_core::error::ProviderError;
use delver_core::providers::{FetchedPage, PageFetcher, SearchProvider, SearchResult};
use std::time::Duration;

/// Desktop-browser user agent sent by default.
const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";
const ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";

fn classify_request_error(operation: &str, e: reqwest::Error, timeout_ms: u64) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout {
            operation: operation.to_string(),
            timeout_ms,
        }
    } else if e.is_connect() {
        ProviderError::Transient {
            operation: operation.to_string(),
            message: e.to_string(),
        }
    } else {
        ProviderError::Permanent {
            operation: operation.to_string(),
            message: e.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// DuckDuckGoSearch
// ---------------------------------------------------------------------------

/// Search the web using the DuckDuckGo instant answers API.
pub struct DuckDuckGoSearch {
    client: reqwest::Client,
    timeout_ms: u64,
}

impl DuckDuckGoSearch {
    pub fn new(timeout_ms: u64) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ProviderError::Permanent {
                operation: "search".into(),
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client, timeout_ms })
    }

    fn parse_results(body: &serde_json::Value, max_results: usize) -> Vec<SearchResult> {
        let mut results = Vec::new();

        // The main abstract, when present, is the best-sourced hit.
        if let Some(text) = body.get("AbstractText").and_then(|v| v.as_str()) {
            if !text.is_empty() {
                let url = body
                    .get("AbstractURL")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                let title = body
                    .get("AbstractSource")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Abstract");
                if !url.is_empty() {
                    results.push(SearchResult {
                        url: url.to_string(),
                        title: title.to_string(),
                        snippet: text.to_string(),
                    });
                }
            }
        }

        for key in ["Results", "RelatedTopics"] {
            if let Some(items) = body.get(key).and_then(|v| v.as_array()) {
                for item in items {
                    if results.len() >= max_results {
                        break;
                    }
                    let Some(url) = item.get("FirstURL").and_then(|v| v.as_str()) else {
                        continue;
                    };
                    let Some(text) = item.get("Text").and_then(|v| v.as_str()) else {
                        continue;
                    };
                    results.push(SearchResult {
                        url: url.to_string(),
                        // The text is "Title - description"; the first clause
                        // doubles as a title.
                        title: text.split(" - ").next().unwrap_or(text).to_string(),
                        snippet: text.to_string(),
                    });
                }
            }
        }

        results.truncate(max_results);
        results
    }
}

#[async_trait]
impl SearchProvider for DuckDuckGoSearch {
    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchResult>, ProviderError> {
        let url = format!(
            "https://api.duckduckgo.com/?q={}&format=json&no_html=1&skip_disambig=1",
            urlencoding::encode(query)
        );

        let response = self
            .client
            .get(&url)
            .header("Accept-Language", ACCEPT_LANGUAGE)
            .send()
            .await
            .map_err(|e| classify_request_error("search", e, self.timeout_ms))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(ProviderError::Transient {
                operation: "search".into(),
                message: format!("HTTP {status}"),
            });
        }
        if !status.is_success() {
            return Err(ProviderError::Permanent {
                operation: "search".into(),
                message: format!("HTTP {status}"),
            });
        }

        let body: serde_json::Value =
            response
                .json()
                .await
                .map_err(|e| ProviderError::Permanent {
                    operation: "search".into(),
                    message: format!("failed to parse search response: {e}"),
                })?;

        let results = Self::parse_results(&body, max_results);
        tracing::debug!(query = %query, hits = results.len(), "Search completed");
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// HttpPageFetcher
// ---------------------------------------------------------------------------

/// Fetch pages over HTTP with browser-like headers, extracting readable text
/// from HTML bodies.
pub struct HttpPageFetcher {
    client: reqwest::Client,
}

impl HttpPageFetcher {
    pub fn new() -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| ProviderError::Permanent {
                operation: "fetch".into(),
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch(&self, url: &str, timeout_ms: u64) -> Result<FetchedPage, ProviderError> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ProviderError::Permanent {
                operation: "fetch".into(),
                message: format!("unsupported URL scheme: {url}"),
            });
        }

        let response = self
            .client
            .get(url)
            .header("Accept-Language", ACCEPT_LANGUAGE)
            .timeout(Duration::from_millis(timeout_ms))
            .send()
            .await
            .map_err(|e| classify_request_error("fetch", e, timeout_ms))?;

        let status_code = response.status().as_u16();
        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let raw = response
            .bytes()
            .await
            .map_err(|e| classify_request_error("fetch", e, timeout_ms))?;

        let body_bytes = if content_type.contains("text/html")
            || content_type.contains("application/xhtml")
        {
            let html = String::from_utf8_lossy(&raw);
            extract_text_from_html(&html).into_bytes()
        } else {
            raw.to_vec()
        };

        Ok(FetchedPage {
            status_code,
            body_bytes,
            final_url,
        })
    }
}

/// Tags whose boundaries end a line of readable text.
const BLOCK_TAGS: &[&str] = &[
    "p", "div", "section", "article", "li", "tr", "br", "h1", "h2", "h3", "h4", "h5", "h6",
    "ul", "ol", "table", "blockquote", "pre",
];

/// Entities worth decoding in extracted text. Longest-prefix wins; anything
/// unrecognized passes through untouched.
const ENTITIES: &[(&str, &str)] = &[
    ("&nbsp;", " "),
    ("&quot;", "\""),
    ("&apos;", "'"),
    ("&#39;", "'"),
    ("&amp;", "&"),
    ("&lt;", "<"),
    ("&gt;", ">"),
];

/// Simple HTML-to-text extraction.
///
/// Walks the document tag by tag: text between tags is entity-decoded and
/// kept, script and style elements are skipped wholesale, and block-level
/// tag boundaries become line breaks. Blank lines are collapsed at the end.
pub fn extract_text_from_html(html: &str) -> String {
    let mut out = String::with_capacity(html.len() / 2);
    let mut rest = html;

    while let Some(open) = rest.find('<') {
        push_decoded(&mut out, &rest[..open]);
        rest = &rest[open..];

        let Some(close) = rest.find('>') else {
            // Unterminated tag: nothing readable follows.
            rest = "";
            break;
        };
        let tag = rest[1..close].trim();
        let name = tag
            .trim_start_matches('/')
            .split(|c: char| c.is_whitespace() || c == '/')
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();
        rest = &rest[close + 1..];

        // Script and style bodies are noise; jump straight past them.
        if !tag.starts_with('/') && (name == "script" || name == "style") {
            let closing = format!("</{name}");
            rest = match rest.to_ascii_lowercase().find(&closing) {
                Some(at) => {
                    let after = &rest[at..];
                    after.find('>').map(|end| &after[end + 1..]).unwrap_or("")
                }
                None => "",
            };
            continue;
        }

        if BLOCK_TAGS.contains(&name.as_str()) {
            out.push('\n');
        }
    }
    push_decoded(&mut out, rest);

    let mut cleaned = String::with_capacity(out.len());
    for line in out.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if !cleaned.is_empty() {
            cleaned.push('\n');
        }
        cleaned.push_str(line);
    }
    cleaned
}

/// Append a text chunk with HTML entities decoded in a single pass.
fn push_decoded(out: &mut String, chunk: &str) {
    let mut rest = chunk;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        match ENTITIES.iter().find(|(entity, _)| rest.starts_with(entity)) {
            Some((entity, replacement)) => {
                out.push_str(replacement);
                rest = &rest[entity.len()..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
}
