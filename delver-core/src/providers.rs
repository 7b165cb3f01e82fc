//! External collaborator interfaces: web search and page fetching.
//!
//! The engine treats both as opaque callables with two failure modes:
//! transient (retried once with backoff) and permanent (logged, demoted to an
//! empty result). Concrete implementations live outside the core.

use crate::error::ProviderError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One hit returned by the search provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub url: String,
    pub title: String,
    pub snippet: String,
}

/// A web search provider.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Search for a query, returning at most `max_results` hits.
    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchResult>, ProviderError>;
}

/// The raw result of fetching one URL.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status_code: u16,
    pub body_bytes: Vec<u8>,
    pub final_url: String,
}

/// A page fetcher.
///
/// Implementations must send a browser-like `User-Agent` and an
/// `Accept-Language` header; the default configuration must not identify
/// itself as a bot.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str, timeout_ms: u64) -> Result<FetchedPage, ProviderError>;
}

/// Backoff before the single retry of a transient search failure.
const SEARCH_RETRY_BACKOFF_MS: u64 = 500;

/// Issue a search with timeout, one transient retry, and permanent-failure
/// demotion to an empty result set. Never returns an error.
pub async fn search_with_retry(
    provider: &dyn SearchProvider,
    query: &str,
    max_results: usize,
    timeout_ms: u64,
) -> Vec<SearchResult> {
    for attempt in 0..2u32 {
        let outcome = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            provider.search(query, max_results),
        )
        .await
        .unwrap_or(Err(ProviderError::Timeout {
            operation: "search".into(),
            timeout_ms,
        }));

        match outcome {
            Ok(results) => return results,
            Err(e) if e.is_transient() && attempt == 0 => {
                tracing::warn!(query = %query, error = %e, "Search failed, retrying once");
                tokio::time::sleep(Duration::from_millis(SEARCH_RETRY_BACKOFF_MS)).await;
            }
            Err(e) => {
                tracing::warn!(query = %query, error = %e, "Search failed, treating as empty");
                return Vec::new();
            }
        }
    }
    Vec::new()
}
