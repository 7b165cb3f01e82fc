//! Shared fixtures for unit tests: scripted search, map-backed fetcher, and
//! a pre-wired stage context.

use crate::config::EngineConfig;
use crate::error::ProviderError;
use crate::events::{EventSender, RunEvent};
use crate::model::{MockModelEndpoint, ModelSet};
use crate::providers::{FetchedPage, PageFetcher, SearchProvider, SearchResult};
use crate::stages::StageContext;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

/// Search provider returning canned results per query, with a shared default.
pub struct StaticSearch {
    by_query: Mutex<HashMap<String, Vec<SearchResult>>>,
    default: Mutex<Vec<SearchResult>>,
    calls: AtomicUsize,
}

impl StaticSearch {
    pub fn new() -> Self {
        Self {
            by_query: Mutex::new(HashMap::new()),
            default: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_default(self, results: Vec<SearchResult>) -> Self {
        *self.default.lock().unwrap() = results;
        self
    }

    pub fn set_results(&self, query: &str, results: Vec<SearchResult>) {
        self.by_query
            .lock()
            .unwrap()
            .insert(query.to_string(), results);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchProvider for StaticSearch {
    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchResult>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut results = self
            .by_query
            .lock()
            .unwrap()
            .get(query)
            .cloned()
            .unwrap_or_else(|| self.default.lock().unwrap().clone());
        results.truncate(max_results);
        Ok(results)
    }
}

/// Page fetcher serving bodies from a map; unknown URLs return 404.
pub struct MapFetcher {
    pages: Mutex<HashMap<String, (u16, String)>>,
    calls: AtomicUsize,
    /// When set, every fetch returns this status with an empty body.
    force_status: Option<u16>,
}

impl MapFetcher {
    pub fn new() -> Self {
        Self {
            pages: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            force_status: None,
        }
    }

    pub fn always_status(status: u16) -> Self {
        Self {
            pages: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            force_status: Some(status),
        }
    }

    pub fn set_page(&self, url: &str, status: u16, body: &str) {
        self.pages
            .lock()
            .unwrap()
            .insert(url.to_string(), (status, body.to_string()));
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageFetcher for MapFetcher {
    async fn fetch(&self, url: &str, _timeout_ms: u64) -> Result<FetchedPage, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = self.force_status {
            return Ok(FetchedPage {
                status_code: status,
                body_bytes: Vec::new(),
                final_url: url.to_string(),
            });
        }
        let (status_code, body) = self
            .pages
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or((404, String::new()));
        Ok(FetchedPage {
            status_code,
            body_bytes: body.into_bytes(),
            final_url: url.to_string(),
        })
    }
}

/// One search result pointing at `url`.
pub fn hit(url: &str, title: &str) -> SearchResult {
    SearchResult {
        url: url.to_string(),
        title: title.to_string(),
        snippet: format!("snippet for {title}"),
    }
}

/// A context wired to a mock model, empty search, and empty fetcher.
pub fn make_context() -> (
    StageContext,
    Arc<MockModelEndpoint>,
    UnboundedReceiver<RunEvent>,
) {
    make_context_with(Arc::new(StaticSearch::new()), Arc::new(MapFetcher::new()))
}

/// A context wired to a mock model and the given collaborators.
pub fn make_context_with(
    search: Arc<dyn SearchProvider>,
    fetcher: Arc<dyn PageFetcher>,
) -> (
    StageContext,
    Arc<MockModelEndpoint>,
    UnboundedReceiver<RunEvent>,
) {
    let mock = Arc::new(MockModelEndpoint::new());
    let (events, rx) = EventSender::channel();
    let ctx = StageContext {
        config: EngineConfig::default(),
        models: ModelSet::uniform(mock.clone()),
        search,
        fetcher,
        events,
        cancel: CancellationToken::new(),
    };
    (ctx, mock, rx)
}
