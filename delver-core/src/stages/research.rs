//! Research subgraph: Search -> Read -> Analyze, looped sequentially or
//! fanned out in parallel.
//!
//! Guarantees: at most `max_iterations * |plan.queries|` searches per run, no
//! URL fetched twice, and a single page failure never fails the run. Within
//! one iteration findings follow the order pages were submitted to the
//! analyzer, not fetch completion order; in parallel mode per-task results
//! merge in plan-query order regardless of completion order.

use super::{StageContext, StageOutcome};
use crate::events::{ErrorKind, RunEvent};
use crate::extract;
use crate::graph::EdgeLabel;
use crate::model::ModelRole;
use crate::providers::{search_with_retry, SearchResult};
use crate::state::{
    Finding, PageContent, PageStatus, ResearchPlan, ResearchState, SearchRecord, StateDelta,
    Strategy, StrategyMode,
};
use crate::text;
use chrono::Utc;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Search results requested per query.
const MAX_RESULTS_PER_SEARCH: usize = 5;
/// Top search URLs handed to the Read step per query.
const MAX_URLS_PER_QUERY: usize = 5;
/// Per-page excerpt length in the analyzer prompt, in bytes.
const PAGE_EXCERPT_BYTES: usize = 800;
/// Total collected-information budget in the analyzer prompt, in bytes.
const CONTEXT_BUDGET_BYTES: usize = 6_000;
/// Fraction of fresh findings below which the loop is deemed saturated.
const MIN_GAIN_RATIO: f64 = 0.2;

const ANALYZER_PROMPT: &str = "You are a RESEARCH ANALYZER. Analyze the collected information.

YOUR TASKS:
1. Extract key findings that answer the user's question; give each a short verbatim supporting snippet and its source URL
2. Decide whether the information is sufficient: every focus area should be covered by at least one finding
3. If more research is needed, propose one specific follow-up search query

OUTPUT FORMAT (JSON):
{
    \"findings\": [{\"claim\": \"...\", \"source_url\": \"https://...\", \"confidence\": 0.8, \"supporting_snippet\": \"...\"}],
    \"action\": \"continue\" or \"finish\",
    \"next_query\": \"specific query if action is continue\"
}
";

#[derive(Debug, serde::Deserialize)]
struct DraftFinding {
    #[serde(default)]
    claim: String,
    #[serde(default)]
    source_url: String,
    #[serde(default = "default_confidence")]
    confidence: f64,
    #[serde(default)]
    supporting_snippet: String,
}

fn default_confidence() -> f64 {
    0.7
}

#[derive(Debug, serde::Deserialize)]
struct Analysis {
    #[serde(default)]
    findings: Vec<DraftFinding>,
    #[serde(default)]
    action: String,
    #[serde(default)]
    next_query: Option<String>,
}

impl Analysis {
    fn finish() -> Self {
        Self {
            findings: Vec::new(),
            action: "finish".into(),
            next_query: None,
        }
    }

    fn wants_continue(&self) -> bool {
        self.action.eq_ignore_ascii_case("continue")
    }
}

/// Run one pass of the research stage.
///
/// Sequential mode performs a single Search -> Read -> Analyze iteration and
/// returns `Continue` when another loop pass is warranted. Parallel mode
/// performs the whole fan-out in one call and always returns `Finish`.
pub async fn run_iteration(state: &ResearchState, ctx: &StageContext) -> StageOutcome {
    let plan = state.plan.clone().unwrap_or_default();
    let strategy = state.strategy.unwrap_or(Strategy {
        mode: StrategyMode::Sequential,
        max_parallelism: 1,
        max_iterations: 1,
    });

    match strategy.mode {
        StrategyMode::Sequential => run_sequential(state, ctx, &plan, strategy).await,
        StrategyMode::Parallel => run_parallel(state, ctx, &plan, strategy).await,
    }
}

async fn run_sequential(
    state: &ResearchState,
    ctx: &StageContext,
    plan: &ResearchPlan,
    strategy: Strategy,
) -> StageOutcome {
    if state.iteration_count >= strategy.max_iterations {
        return StageOutcome::new(StateDelta::default(), EdgeLabel::Finish);
    }
    let iteration = state.iteration_count + 1;

    let Some(query) = pick_query(state, plan) else {
        return StageOutcome::new(StateDelta::default(), EdgeLabel::Finish);
    };
    tracing::debug!(iteration, query = %query, "Research iteration starting");

    let mut delta = StateDelta::default();
    // Consume the analyzer's carry-over, if that is what we ran.
    delta.next_query = Some(String::new());

    // Search
    let results = search_with_retry(
        ctx.search.as_ref(),
        &query,
        MAX_RESULTS_PER_SEARCH,
        ctx.config.search_timeout_ms,
    )
    .await;
    delta.search_history.push(SearchRecord {
        query: query.clone(),
        timestamp: Utc::now(),
        result_urls: results.iter().map(|r| r.url.clone()).collect(),
    });

    // Read: only URLs this run has not seen yet.
    let urls: Vec<String> = results
        .iter()
        .map(|r| r.url.clone())
        .filter(|u| !state.has_read(u))
        .take(MAX_URLS_PER_QUERY)
        .collect();
    let pages = read_pages(ctx, urls).await;

    // Analyze
    let prompt = analyzer_prompt(state, plan, &query, iteration, strategy.max_iterations, &results, &pages);
    let (analysis, warning) = analyze(ctx, ModelRole::Analyzer, &prompt, &mut delta).await;
    let page_count = pages.len();

    let wants_continue = analysis.wants_continue();
    let accepted = accept_findings(analysis.findings, &results, &pages);
    delta.read_contents = pages;
    for finding in &accepted {
        ctx.events.emit(RunEvent::FindingAdded {
            url: finding.source_url.clone(),
        });
    }
    let fresh = accepted.len();
    delta.findings = accepted;
    delta.iteration_gains.push(fresh);
    delta.iteration_count = Some(iteration);

    // Loop decision
    let budget_left = iteration < strategy.max_iterations;
    let saturated = is_saturated(state, fresh);
    let label = if wants_continue && budget_left && fresh > 0 && !saturated {
        if let Some(next) = analysis.next_query.clone().filter(|q| !q.trim().is_empty()) {
            delta.next_query = Some(next);
        }
        EdgeLabel::Continue
    } else {
        EdgeLabel::Finish
    };

    // Exactly one thought per iteration, for observability tooling.
    let assessment = match label {
        EdgeLabel::Continue => format!(
            "need {}",
            delta
                .next_query
                .as_deref()
                .filter(|q| !q.is_empty())
                .unwrap_or("next planned query")
        ),
        _ => "sufficient".to_string(),
    };
    let thought = format_thought(&query, results.len(), page_count, &results, &assessment);
    ctx.events.emit(RunEvent::Thought {
        text: thought.clone(),
    });
    delta.thoughts.push(thought);

    let mut outcome = StageOutcome::new(delta, label);
    if let Some((kind, detail)) = warning {
        outcome = outcome.with_warning(kind, detail);
    }
    outcome
}

/// Result of one parallel research task, merged in plan order at the join.
struct TaskOutput {
    record: SearchRecord,
    pages: Vec<PageContent>,
    findings: Vec<Finding>,
    thought: String,
    warning: Option<(ErrorKind, String)>,
    tokens_in: usize,
    tokens_out: usize,
}

async fn run_parallel(
    state: &ResearchState,
    ctx: &StageContext,
    plan: &ResearchPlan,
    strategy: Strategy,
) -> StageOutcome {
    let queries: Vec<String> = plan
        .queries
        .iter()
        .take(strategy.max_parallelism)
        .cloned()
        .collect();
    tracing::debug!(tasks = queries.len(), "Dispatching parallel research tasks");

    // Shared URL-dedup view; the lock is never held across a fetch.
    let seen: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(
        state.read_contents.iter().map(|p| p.url.clone()).collect(),
    ));

    let tasks = queries
        .iter()
        .map(|query| run_task(state, ctx, plan, query.clone(), Arc::clone(&seen)));
    // join_all yields results in input order, which is plan order.
    let outputs = futures::future::join_all(tasks).await;

    let mut delta = StateDelta::default();
    let mut warning = None;
    for output in outputs {
        delta.search_history.push(output.record);
        delta.read_contents.extend(output.pages);
        for finding in &output.findings {
            ctx.events.emit(RunEvent::FindingAdded {
                url: finding.source_url.clone(),
            });
        }
        delta.findings.extend(output.findings);
        ctx.events.emit(RunEvent::Thought {
            text: output.thought.clone(),
        });
        delta.thoughts.push(output.thought);
        delta.tokens_in += output.tokens_in;
        delta.tokens_out += output.tokens_out;
        warning = warning.or(output.warning);
    }

    delta.iteration_gains.push(delta.findings.len());
    delta.iteration_count = Some(1);

    let mut outcome = StageOutcome::new(delta, EdgeLabel::Finish);
    if let Some((kind, detail)) = warning {
        outcome = outcome.with_warning(kind, detail);
    }
    outcome
}

/// One Search -> Read -> Analyze triple; no inner loop.
async fn run_task(
    state: &ResearchState,
    ctx: &StageContext,
    plan: &ResearchPlan,
    query: String,
    seen: Arc<Mutex<HashSet<String>>>,
) -> TaskOutput {
    let results = search_with_retry(
        ctx.search.as_ref(),
        &query,
        MAX_RESULTS_PER_SEARCH,
        ctx.config.search_timeout_ms,
    )
    .await;
    let record = SearchRecord {
        query: query.clone(),
        timestamp: Utc::now(),
        result_urls: results.iter().map(|r| r.url.clone()).collect(),
    };

    // Claim unseen URLs under the shared lock, then release before fetching.
    let urls: Vec<String> = {
        let mut seen = seen.lock().unwrap();
        results
            .iter()
            .map(|r| r.url.clone())
            .filter(|u| seen.insert(u.clone()))
            .take(MAX_URLS_PER_QUERY)
            .collect()
    };
    let pages = read_pages(ctx, urls).await;

    let mut scratch = StateDelta::default();
    let prompt = analyzer_prompt(state, plan, &query, 1, 1, &results, &pages);
    let (analysis, warning) =
        analyze(ctx, ModelRole::SearcherAnalyzer, &prompt, &mut scratch).await;
    let findings = accept_findings(analysis.findings, &results, &pages);

    let thought = format_thought(&query, results.len(), pages.len(), &results, "sufficient");

    TaskOutput {
        record,
        pages,
        findings,
        thought,
        warning,
        tokens_in: scratch.tokens_in,
        tokens_out: scratch.tokens_out,
    }
}

/// The next query to execute: the analyzer's follow-up if one is pending,
/// otherwise the first plan query that has not been searched yet.
fn pick_query(state: &ResearchState, plan: &ResearchPlan) -> Option<String> {
    if let Some(next) = &state.next_query {
        return Some(next.clone());
    }
    let executed: HashSet<&str> = state
        .search_history
        .iter()
        .map(|r| r.query.as_str())
        .collect();
    plan.queries
        .iter()
        .find(|q| !executed.contains(q.as_str()))
        .cloned()
}

/// Fetch pages with bounded concurrency, preserving submission order.
async fn read_pages(ctx: &StageContext, urls: Vec<String>) -> Vec<PageContent> {
    let concurrency = ctx.config.fetch_concurrency.max(1);
    futures::stream::iter(urls.into_iter().map(|url| fetch_one(ctx, url)))
        .buffered(concurrency)
        .collect()
        .await
}

async fn fetch_one(ctx: &StageContext, url: String) -> PageContent {
    let timeout_ms = ctx.config.fetch_timeout_ms;
    if ctx.cancel.is_cancelled() {
        return failed_page(url, PageStatus::Error);
    }

    let fetch = ctx.fetcher.fetch(&url, timeout_ms);
    let outcome = tokio::select! {
        _ = ctx.cancel.cancelled() => None,
        r = tokio::time::timeout(Duration::from_millis(timeout_ms), fetch) => Some(r),
    };

    match outcome {
        None => failed_page(url, PageStatus::Error),
        Some(Err(_elapsed)) => {
            tracing::debug!(url = %url, timeout_ms, "Page fetch timed out");
            failed_page(url, PageStatus::Error)
        }
        Some(Ok(Err(e))) => {
            tracing::debug!(url = %url, error = %e, "Page fetch failed");
            failed_page(url, PageStatus::Error)
        }
        Some(Ok(Ok(fetched))) => {
            let body = String::from_utf8_lossy(&fetched.body_bytes).into_owned();
            let content_length = body.len();
            match fetched.status_code {
                200..=299 if body.trim().is_empty() => PageContent {
                    url,
                    fetched_at: Utc::now(),
                    status: PageStatus::Empty,
                    body: String::new(),
                    content_length,
                    bytes_truncated: false,
                },
                200..=299 => {
                    let (cut, truncated) =
                        text::truncate_bytes(&body, ctx.config.body_truncate_bytes);
                    PageContent {
                        url,
                        fetched_at: Utc::now(),
                        status: PageStatus::Ok,
                        body: cut.to_string(),
                        content_length,
                        bytes_truncated: truncated,
                    }
                }
                401 | 403 | 429 | 451 => failed_page(url, PageStatus::Blocked),
                _ => failed_page(url, PageStatus::Error),
            }
        }
    }
}

fn failed_page(url: String, status: PageStatus) -> PageContent {
    PageContent {
        url,
        fetched_at: Utc::now(),
        status,
        body: String::new(),
        content_length: 0,
        bytes_truncated: false,
    }
}

fn analyzer_prompt(
    state: &ResearchState,
    plan: &ResearchPlan,
    query: &str,
    iteration: usize,
    max_iterations: usize,
    results: &[SearchResult],
    pages: &[PageContent],
) -> String {
    let mut collected = String::new();
    for r in results {
        collected.push_str(&format!("- [{}] {} ({})\n", r.title, r.snippet, r.url));
    }
    for p in pages {
        if p.status == PageStatus::Ok {
            let (excerpt, _) = text::truncate_bytes(&p.body, PAGE_EXCERPT_BYTES);
            collected.push_str(&format!("- [URL: {}] {}\n", p.url, excerpt));
        }
    }
    let (collected, _) = text::truncate_bytes(&collected, CONTEXT_BUDGET_BYTES);

    let known: Vec<String> = state
        .findings
        .iter()
        .rev()
        .take(10)
        .map(|f| {
            let (claim, _) = text::truncate_bytes(&f.claim, 120);
            format!("- {claim}")
        })
        .collect();

    format!(
        "{ANALYZER_PROMPT}\nUser Question: {}\nSearch Query: {query}\nResearch Iteration: {iteration}/{max_iterations}\nFocus Areas: {}\n\nCollected Information:\n{collected}\n\nExisting Findings:\n{}\n",
        state.query,
        plan.focus_areas.join(", "),
        known.join("\n"),
    )
}

async fn analyze(
    ctx: &StageContext,
    role: ModelRole,
    prompt: &str,
    delta: &mut StateDelta,
) -> (Analysis, Option<(ErrorKind, String)>) {
    match ctx
        .models
        .complete(role, prompt, ctx.config.model_timeout_ms)
        .await
    {
        Ok(response) => {
            delta.tokens_in += response.usage.input_tokens;
            delta.tokens_out += response.usage.output_tokens;
            match extract::extract::<Analysis>(&response.text) {
                Some(analysis) => (analysis, None),
                None => {
                    tracing::warn!("Analyzer output did not match schema, finishing iteration");
                    (
                        Analysis::finish(),
                        Some((ErrorKind::Model, "analyzer output unparseable".into())),
                    )
                }
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Analyzer model call failed, dropping this batch");
            (
                Analysis::finish(),
                Some((ErrorKind::Model, format!("analyzer failed: {e}"))),
            )
        }
    }
}

/// Keep only findings grounded in this iteration's sources; remap unknown
/// URLs to the first successfully read page when one exists.
fn accept_findings(
    drafts: Vec<DraftFinding>,
    results: &[SearchResult],
    pages: &[PageContent],
) -> Vec<Finding> {
    let known: HashSet<&str> = results
        .iter()
        .map(|r| r.url.as_str())
        .chain(pages.iter().map(|p| p.url.as_str()))
        .collect();
    let fallback = pages
        .iter()
        .find(|p| p.status == PageStatus::Ok)
        .map(|p| p.url.clone())
        .or_else(|| results.first().map(|r| r.url.clone()));

    drafts
        .into_iter()
        .filter(|d| !d.claim.trim().is_empty())
        .filter_map(|d| {
            let source_url = if known.contains(d.source_url.as_str()) {
                d.source_url
            } else {
                fallback.clone()?
            };
            Some(Finding {
                claim: d.claim,
                source_url,
                confidence: d.confidence.clamp(0.0, 1.0),
                supporting_snippet: d.supporting_snippet,
            })
        })
        .collect()
}

/// Diminishing-returns stop rule: the last two iterations together added
/// fewer than 20% of the findings known after them.
fn is_saturated(state: &ResearchState, fresh: usize) -> bool {
    let Some(&previous_gain) = state.iteration_gains.last() else {
        return false;
    };
    let total = state.findings.len() + fresh;
    if total == 0 {
        return false;
    }
    ((previous_gain + fresh) as f64) < MIN_GAIN_RATIO * total as f64
}

fn format_thought(
    query: &str,
    result_count: usize,
    url_count: usize,
    results: &[SearchResult],
    assessment: &str,
) -> String {
    let snippet = results
        .first()
        .map(|r| text::truncate_bytes(&r.snippet, 80).0.to_string())
        .unwrap_or_else(|| "none".to_string());
    format!(
        "Query: {query} | Found {result_count} results, {url_count} URLs. Key snippets: {snippet} | Assessment: {assessment}"
    )
}
