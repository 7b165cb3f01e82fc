//! Research run state and the delta merge rules.
//!
//! A single `ResearchState` is threaded through the stage graph. Stages
//! receive a read-only view and return a `StateDelta`; the run coordinator
//! owns the state and applies deltas under well-defined rules: append-only
//! for lists, last-writer-wins for scalars, URL-deduplicated page contents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The plan produced by the Planner stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResearchPlan {
    /// 2-5 English search queries.
    pub queries: Vec<String>,
    /// 2-6 focus areas the report should cover.
    pub focus_areas: Vec<String>,
    /// Research depth: 1 = single aspect, 2 = overview, 3 = deep comparative.
    pub depth: u8,
}

/// Execution strategy chosen by the Supervisor stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyMode {
    /// Iterative loop where later searches depend on earlier analysis.
    Sequential,
    /// Breadth-first fan-out over plan queries.
    Parallel,
}

/// Concurrency and iteration limits for the research subgraph.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Strategy {
    pub mode: StrategyMode,
    pub max_parallelism: usize,
    pub max_iterations: usize,
}

/// A single extracted claim with its source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    /// The claim text.
    pub claim: String,
    /// URL of the page or search result backing the claim.
    pub source_url: String,
    /// Confidence in the claim (0.0-1.0).
    pub confidence: f64,
    /// Verbatim snippet supporting the claim.
    pub supporting_snippet: String,
}

/// Outcome of fetching one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    Ok,
    Blocked,
    Empty,
    Error,
}

/// A fetched page body, possibly truncated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageContent {
    pub url: String,
    pub fetched_at: DateTime<Utc>,
    pub status: PageStatus,
    /// Extracted text; empty for blocked or failed fetches.
    pub body: String,
    /// Length of the body before truncation, in bytes.
    pub content_length: usize,
    pub bytes_truncated: bool,
}

/// One search issued against the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRecord {
    pub query: String,
    pub timestamp: DateTime<Utc>,
    pub result_urls: Vec<String>,
}

/// A numbered reference bound to a URL. Ids are dense and assigned in
/// first-use order within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub id: usize,
    pub url: String,
    pub title: Option<String>,
    pub snippet: String,
}

/// Deduplicated, condensed findings with their citations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Compressed {
    pub text: String,
    pub citations: Vec<Citation>,
}

/// CARC quality scores, each in [0, 5].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CritiqueScores {
    pub completeness: f64,
    pub accuracy: f64,
    pub relevance: f64,
    pub clarity: f64,
    /// Sum of the four sub-scores, in [0, 20].
    pub total: f64,
}

impl CritiqueScores {
    /// Build scores from the four components, clamping each to [0, 5].
    pub fn new(completeness: f64, accuracy: f64, relevance: f64, clarity: f64) -> Self {
        let completeness = completeness.clamp(0.0, 5.0);
        let accuracy = accuracy.clamp(0.0, 5.0);
        let relevance = relevance.clamp(0.0, 5.0);
        let clarity = clarity.clamp(0.0, 5.0);
        Self {
            completeness,
            accuracy,
            relevance,
            clarity,
            total: completeness + accuracy + relevance + clarity,
        }
    }
}

/// The shared research state threaded through the stage graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchState {
    /// Unique identifier for this run.
    pub run_id: Uuid,
    /// Stable identifier for checkpointing; reused across related runs.
    pub thread_id: String,
    /// The original user question.
    pub query: String,

    // Clarify
    pub needs_clarification: bool,
    pub clarification_question: Option<String>,
    pub query_analysis: String,
    pub detected_topics: Vec<String>,

    // Planner / Supervisor
    pub plan: Option<ResearchPlan>,
    pub strategy: Option<Strategy>,

    // Research subgraph
    pub findings: Vec<Finding>,
    pub read_contents: Vec<PageContent>,
    pub search_history: Vec<SearchRecord>,
    /// Observability trace emitted by the analyzer, one entry per iteration.
    /// Never re-fed to the model.
    pub thoughts: Vec<String>,
    pub iteration_count: usize,
    /// Follow-up query proposed by the analyzer for the next iteration.
    /// Cleared once consumed.
    pub next_query: Option<String>,
    /// Findings added per research iteration, oldest first. Drives the
    /// diminishing-returns stop rule.
    pub iteration_gains: Vec<usize>,

    // Compress / Writer / Critique
    pub compressed: Option<Compressed>,
    pub report: String,
    pub critique: Option<CritiqueScores>,

    // Accounting
    pub tokens_in: usize,
    pub tokens_out: usize,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl ResearchState {
    /// Create the state for a new run.
    pub fn new(query: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            thread_id: thread_id.into(),
            query: query.into(),
            needs_clarification: false,
            clarification_question: None,
            query_analysis: String::new(),
            detected_topics: Vec::new(),
            plan: None,
            strategy: None,
            findings: Vec::new(),
            read_contents: Vec::new(),
            search_history: Vec::new(),
            thoughts: Vec::new(),
            iteration_count: 0,
            next_query: None,
            iteration_gains: Vec::new(),
            compressed: None,
            report: String::new(),
            critique: None,
            tokens_in: 0,
            tokens_out: 0,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Mark the run as finished. After this, deltas are rejected.
    pub fn finish(&mut self) {
        if self.ended_at.is_none() {
            self.ended_at = Some(Utc::now());
        }
    }

    /// Whether the state accepts further mutation.
    pub fn is_frozen(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Whether a URL has already been read (successfully or not).
    pub fn has_read(&self, url: &str) -> bool {
        self.read_contents.iter().any(|p| p.url == url)
    }

    /// Merge a stage delta into the state.
    ///
    /// Returns `false` (leaving the state untouched) if the run has ended.
    pub fn apply(&mut self, delta: StateDelta) -> bool {
        if self.is_frozen() {
            tracing::warn!(run_id = %self.run_id, "Delta rejected: state is frozen");
            return false;
        }

        if let Some(v) = delta.needs_clarification {
            self.needs_clarification = v;
        }
        if let Some(v) = delta.clarification_question {
            self.clarification_question = Some(v);
        }
        if let Some(v) = delta.query_analysis {
            self.query_analysis = v;
        }
        if let Some(v) = delta.plan {
            self.plan = Some(v);
        }
        if let Some(v) = delta.strategy {
            self.strategy = Some(v);
        }
        if let Some(v) = delta.compressed {
            self.compressed = Some(v);
        }
        if let Some(v) = delta.report {
            self.report = v;
        }
        if let Some(v) = delta.critique {
            self.critique = Some(v);
        }
        if let Some(v) = delta.iteration_count {
            self.iteration_count = v;
        }
        if let Some(v) = delta.next_query {
            // An empty proposal clears the carry-over.
            self.next_query = if v.is_empty() { None } else { Some(v) };
        }
        self.iteration_gains.extend(delta.iteration_gains);

        self.detected_topics.extend(delta.detected_topics);
        self.findings.extend(delta.findings);
        self.search_history.extend(delta.search_history);
        self.thoughts.extend(delta.thoughts);
        for page in delta.read_contents {
            if !self.has_read(&page.url) {
                self.read_contents.push(page);
            }
        }

        self.tokens_in += delta.tokens_in;
        self.tokens_out += delta.tokens_out;
        true
    }

    /// Check the structural invariants, returning a description per violation.
    /// Intended for tests and debug assertions, not the hot path.
    pub fn violations(&self) -> Vec<String> {
        let mut out = Vec::new();

        // Every finding's source must come from a read page or a search result.
        for f in &self.findings {
            let in_pages = self
                .read_contents
                .iter()
                .any(|p| p.url == f.source_url && p.status == PageStatus::Ok);
            let in_search = self
                .search_history
                .iter()
                .any(|s| s.result_urls.iter().any(|u| u == &f.source_url));
            if !in_pages && !in_search {
                out.push(format!("finding source not grounded: {}", f.source_url));
            }
        }

        // Every citation marker in the report must resolve to a citation.
        let citations: &[Citation] = self
            .compressed
            .as_ref()
            .map(|c| c.citations.as_slice())
            .unwrap_or(&[]);
        for id in crate::text::citation_markers(&self.report) {
            if !citations.iter().any(|c| c.id == id) {
                out.push(format!("report marker [{id}] has no matching citation"));
            }
        }

        if let Some(strategy) = &self.strategy {
            if self.iteration_count > strategy.max_iterations {
                out.push(format!(
                    "iteration_count {} exceeds max_iterations {}",
                    self.iteration_count, strategy.max_iterations
                ));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for page in &self.read_contents {
            if !seen.insert(page.url.as_str()) {
                out.push(format!("duplicate read url: {}", page.url));
            }
        }

        out
    }
}

/// A structured update produced by one stage.
///
/// `Option` fields overwrite (last-writer-wins); `Vec` fields append.
#[derive(Debug, Clone, Default)]
pub struct StateDelta {
    pub needs_clarification: Option<bool>,
    pub clarification_question: Option<String>,
    pub query_analysis: Option<String>,
    pub detected_topics: Vec<String>,
    pub plan: Option<ResearchPlan>,
    pub strategy: Option<Strategy>,
    pub findings: Vec<Finding>,
    pub read_contents: Vec<PageContent>,
    pub search_history: Vec<SearchRecord>,
    pub thoughts: Vec<String>,
    pub iteration_count: Option<usize>,
    /// `Some("")` clears the analyzer's follow-up query carry-over.
    pub next_query: Option<String>,
    pub iteration_gains: Vec<usize>,
    pub compressed: Option<Compressed>,
    pub report: Option<String>,
    pub critique: Option<CritiqueScores>,
    pub tokens_in: usize,
    pub tokens_out: usize,
}
