//! Writer stage: produce the final cited report.
//!
//! Tokens stream to the event channel as they arrive; citation validation
//! runs after end-of-stream. A report failing validation triggers one
//! corrective rewrite; a second failure is surfaced as a citation error while
//! the best-effort report is still returned.

use super::{StageContext, StageOutcome};
use crate::error::RunError;
use crate::events::{ErrorKind, RunEvent};
use crate::graph::EdgeLabel;
use crate::model::ModelRole;
use crate::state::{Citation, Compressed, ResearchState, StateDelta};
use crate::text::citation_markers;
use tokio::sync::mpsc;

/// Reports shorter than this are treated as a failed generation.
const MIN_REPORT_CHARS: usize = 50;

const WRITER_PROMPT: &str = "You are a PROFESSIONAL WRITER. Write the final research report.

INSTRUCTIONS:
1. Use ONLY the research notes below; do not introduce facts that are not in them
2. Cite every non-trivial factual claim by placing its marker like [1] immediately after the sentence
3. Structure: a short executive summary, then one section per focus area
4. Do NOT write a sources section; it is appended automatically
5. Use markdown headings and clear professional prose
";

const CORRECTION_DIRECTIVE: &str = "\nYour previous report failed citation validation:\n";

fn superlative(word: &str) -> bool {
    matches!(
        word,
        "best"
            | "worst"
            | "largest"
            | "smallest"
            | "fastest"
            | "slowest"
            | "most"
            | "least"
            | "first"
            | "latest"
            | "newest"
            | "oldest"
            | "biggest"
    )
}

/// Problems found by post-generation validation.
fn validate_report(text: &str, citations: &[Citation]) -> Vec<String> {
    let mut problems = Vec::new();

    for id in citation_markers(text) {
        if !citations.iter().any(|c| c.id == id) {
            problems.push(format!("marker [{id}] has no matching citation"));
        }
    }

    // With nothing to cite there is nothing to flag: an insufficiency report
    // is legitimately citation-free.
    if citations.is_empty() {
        return problems;
    }

    for sentence in sentences(text) {
        if sentence.len() < 30 || !citation_markers(&sentence).is_empty() {
            continue;
        }
        if looks_factual(&sentence) {
            let preview: String = sentence.chars().take(60).collect();
            problems.push(format!("uncited factual claim: \"{preview}\""));
        }
    }

    problems
}

/// Sentence fragments with trailing citation markers re-attached to the
/// sentence they follow.
fn sentences(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for line in text.lines().filter(|l| !l.trim_start().starts_with('#')) {
        for piece in line.split_inclusive(['.', '!', '?']) {
            let trimmed = piece.trim();
            if trimmed.is_empty() {
                continue;
            }
            let marker_only = trimmed
                .chars()
                .all(|c| matches!(c, '[' | ']' | ' ') || c.is_ascii_digit());
            if marker_only && !out.is_empty() {
                let last = out.last_mut().expect("non-empty");
                last.push(' ');
                last.push_str(trimmed);
            } else {
                out.push(trimmed.to_string());
            }
        }
    }
    out
}

/// Heuristic: a sentence containing a number, a superlative, or a proper noun
/// past its first word is a factual claim that needs a citation.
fn looks_factual(sentence: &str) -> bool {
    if sentence.chars().any(|c| c.is_ascii_digit()) {
        return true;
    }
    let words: Vec<&str> = sentence.split_whitespace().collect();
    for (i, word) in words.iter().enumerate() {
        let cleaned = word.trim_matches(|c: char| !c.is_alphanumeric());
        if superlative(&cleaned.to_lowercase()) {
            return true;
        }
        if i > 0 && cleaned.chars().next().is_some_and(|c| c.is_uppercase()) {
            return true;
        }
    }
    false
}

/// Renumber markers to dense first-use order, drop markers without a
/// citation, and return the citations actually referenced.
fn finalize_citations(text: &str, citations: &[Citation]) -> (String, Vec<Citation>) {
    let mut mapping: Vec<(usize, usize)> = Vec::new(); // (old, new)
    let mut kept: Vec<Citation> = Vec::new();

    for old in citation_markers(text) {
        if mapping.iter().any(|(o, _)| *o == old) {
            continue;
        }
        if let Some(citation) = citations.iter().find(|c| c.id == old) {
            let new = kept.len() + 1;
            mapping.push((old, new));
            let mut citation = citation.clone();
            citation.id = new;
            kept.push(citation);
        }
    }

    // Rewrite markers in one pass, removing any that lack a citation.
    let mut out = String::with_capacity(text.len());
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'[' {
            let mut j = i + 1;
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            if j > i + 1 && j < bytes.len() && bytes[j] == b']' {
                if let Ok(old) = text[i + 1..j].parse::<usize>() {
                    if let Some((_, new)) = mapping.iter().find(|(o, _)| *o == old) {
                        out.push_str(&format!("[{new}]"));
                    }
                    i = j + 1;
                    continue;
                }
            }
        }
        // Safe: we only land on char boundaries outside marker spans.
        let ch_len = text[i..].chars().next().map(char::len_utf8).unwrap_or(1);
        out.push_str(&text[i..i + ch_len]);
        i += ch_len;
    }

    (out, kept)
}

fn sources_section(citations: &[Citation]) -> String {
    if citations.is_empty() {
        return String::new();
    }
    let mut out = String::from("\n\n## Sources\n\n");
    for c in citations {
        match &c.title {
            Some(title) => out.push_str(&format!("[{}] {}: {}\n", c.id, title, c.url)),
            None => out.push_str(&format!("[{}] {}\n", c.id, c.url)),
        }
    }
    out
}

/// Minimal report assembled from state when the model output is unusable.
fn fallback_report(state: &ResearchState, compressed: &Compressed) -> String {
    if compressed.text.is_empty() {
        return format!(
            "## Summary\n\nResearch into \"{}\" did not yield enough accessible \
             sources to give a grounded answer. The searched pages were \
             unavailable or empty; re-running with a narrower question may \
             help.\n",
            state.query
        );
    }
    format!("## Key Findings\n\n{}", compressed.text)
}

fn writer_prompt(state: &ResearchState, compressed: &Compressed, correction: Option<&str>) -> String {
    let focus_areas = state
        .plan
        .as_ref()
        .map(|p| p.focus_areas.join(", "))
        .unwrap_or_else(|| "overview".into());

    let mut citation_list = String::new();
    for c in &compressed.citations {
        citation_list.push_str(&format!("[{}] {}\n", c.id, c.url));
    }

    let mut prompt = format!(
        "{WRITER_PROMPT}\nUSER QUESTION: {}\nFOCUS AREAS: {focus_areas}\n\nRESEARCH NOTES:\n{}\nCITATIONS:\n{citation_list}",
        state.query, compressed.text,
    );
    if let Some(problems) = correction {
        prompt.push_str(CORRECTION_DIRECTIVE);
        prompt.push_str(problems);
        prompt.push_str("\nRewrite the report with correct citations.");
    }
    prompt
}

/// Run the writer stage.
///
/// Returns `Err` only when the model fails twice; validation failures degrade
/// to a warning with the best-effort report.
pub async fn run(state: &ResearchState, ctx: &StageContext) -> Result<StageOutcome, RunError> {
    let compressed = state.compressed.clone().unwrap_or_default();

    let mut delta = StateDelta::default();
    let mut model_failures = 0u32;
    let mut correction: Option<String> = None;
    let mut report: Option<String> = None;
    let mut citation_warning = None;

    for attempt in 0..2u32 {
        let prompt = writer_prompt(state, &compressed, correction.as_deref());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = ctx.events.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(token) = rx.recv().await {
                events.emit(RunEvent::PartialReportToken { text: token });
            }
        });

        let result = ctx
            .models
            .complete_streaming(
                ModelRole::Writer,
                &prompt,
                ctx.config.model_timeout_ms,
                tx,
            )
            .await;
        let _ = forwarder.await;

        match result {
            Ok(response) => {
                delta.tokens_in += response.usage.input_tokens;
                delta.tokens_out += response.usage.output_tokens;

                let text = response.text.trim().to_string();
                if text.len() < MIN_REPORT_CHARS {
                    tracing::warn!(chars = text.len(), "Writer output too short, using fallback");
                    report = Some(fallback_report(state, &compressed));
                    break;
                }

                let problems = validate_report(&text, &compressed.citations);
                if problems.is_empty() {
                    report = Some(text);
                    break;
                }
                tracing::warn!(problems = problems.len(), "Report failed citation validation");
                if attempt == 1 || correction.is_some() {
                    // No more attempts: keep the best effort.
                    citation_warning = Some((ErrorKind::Citation, problems.join("; ")));
                    report = Some(text);
                    break;
                }
                correction = Some(problems.join("\n"));
            }
            Err(e) => {
                model_failures += 1;
                tracing::warn!(error = %e, attempt = model_failures, "Writer model call failed");
                if model_failures >= 2 {
                    return Err(RunError::WriterFailed {
                        attempts: model_failures,
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    let body = report.unwrap_or_else(|| fallback_report(state, &compressed));
    let (body, kept) = finalize_citations(&body, &compressed.citations);
    let report = format!("{}{}", body, sources_section(&kept));

    delta.report = Some(report);
    delta.compressed = Some(Compressed {
        text: compressed.text,
        citations: kept,
    });

    let mut outcome = StageOutcome::new(delta, EdgeLabel::Next);
    if let Some((kind, detail)) = citation_warning {
        outcome = outcome.with_warning(kind, detail);
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::make_context;

    fn citation(id: usize, url: &str) -> Citation {
        Citation {
            id,
            url: url.to_string(),
            title: None,
            snippet: "snippet".into(),
        }
    }

    fn state_with_compressed(citations: Vec<Citation>, text: &str) -> ResearchState {
        let mut state = ResearchState::new("what is the x framework", "t");
        state.compressed = Some(Compressed {
            text: text.to_string(),
            citations,
        });
        state
    }

    #[test]
    fn test_validate_flags_dangling_marker() {
        let problems = validate_report(
            "The framework shipped in 2021. [4]",
            &[citation(1, "https://a.example")],
        );
        assert!(problems.iter().any(|p| p.contains("[4]")));
    }

    #[test]
    fn test_validate_flags_uncited_numeric_claim() {
        let problems = validate_report(
            "The framework handles 100000 requests per second in production.",
            &[citation(1, "https://a.example")],
        );
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("uncited factual claim"));
    }

    #[test]
    fn test_validate_passes_cited_text() {
        let problems = validate_report(
            "## Summary\n\nThe framework handles 100000 requests per second. [1]",
            &[citation(1, "https://a.example")],
        );
        assert!(problems.is_empty());
    }

    #[test]
    fn test_validate_skips_heuristic_without_citations() {
        let problems = validate_report(
            "Research found nothing because every source returned error 403 today.",
            &[],
        );
        assert!(problems.is_empty());
    }

    #[test]
    fn test_finalize_renumbers_to_first_use_order() {
        let citations = vec![
            citation(1, "https://one.example"),
            citation(2, "https://two.example"),
            citation(3, "https://three.example"),
        ];
        let (text, kept) = finalize_citations("b [3] then a [1] then [3]", &citations);
        assert_eq!(text, "b [1] then a [2] then [1]");
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].url, "https://three.example");
        assert_eq!(kept[0].id, 1);
        assert_eq!(kept[1].url, "https://one.example");
    }

    #[test]
    fn test_finalize_drops_dangling_markers() {
        let citations = vec![citation(1, "https://one.example")];
        let (text, kept) = finalize_citations("ok [1] broken [9]", &citations);
        assert_eq!(text, "ok [1] broken ");
        assert_eq!(kept.len(), 1);
    }

    #[tokio::test]
    async fn test_valid_report_accepted_and_sources_appended() {
        let (ctx, mock, mut rx) = make_context();
        mock.queue_text(
            "## Executive Summary\n\nThe x framework is a distributed graph engine built for scale. [1]\n",
        );

        let state = state_with_compressed(
            vec![citation(1, "https://a.example/doc")],
            "- x is a distributed graph engine [1]\n",
        );
        let outcome = run(&state, &ctx).await.unwrap();
        assert!(outcome.warning.is_none());

        let report = outcome.delta.report.unwrap();
        assert!(report.contains("[1]"));
        assert!(report.contains("## Sources"));
        assert!(report.contains("https://a.example/doc"));

        // Tokens were streamed before the final report.
        let mut saw_token = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, RunEvent::PartialReportToken { .. }) {
                saw_token = true;
            }
        }
        assert!(saw_token);
    }

    #[tokio::test]
    async fn test_invalid_report_retried_once_with_correction() {
        let (ctx, mock, _rx) = make_context();
        mock.queue_text(
            "The x framework processes 5000 events per second without any citation at all today.",
        );
        mock.queue_text(
            "The x framework processes 5000 events per second in benchmarks run by its authors. [1]",
        );

        let state = state_with_compressed(
            vec![citation(1, "https://a.example")],
            "- x processes 5000 events per second [1]\n",
        );
        let outcome = run(&state, &ctx).await.unwrap();
        assert!(outcome.warning.is_none());
        assert_eq!(mock.call_count(), 2);
        assert!(mock.prompts()[1].contains("failed citation validation"));
    }

    #[tokio::test]
    async fn test_second_validation_failure_surfaces_citation_error() {
        let (ctx, mock, _rx) = make_context();
        let bad = "The x framework processes 5000 events per second without citations in this sentence.";
        mock.queue_text(bad);
        mock.queue_text(bad);

        let state = state_with_compressed(
            vec![citation(1, "https://a.example")],
            "- x processes 5000 events per second [1]\n",
        );
        let outcome = run(&state, &ctx).await.unwrap();
        let (kind, _) = outcome.warning.unwrap();
        assert_eq!(kind, ErrorKind::Citation);
        // Best-effort report still returned.
        assert!(!outcome.delta.report.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_short_output_uses_fallback() {
        let (ctx, mock, _rx) = make_context();
        mock.queue_text("ok");

        let state = state_with_compressed(
            vec![citation(1, "https://a.example")],
            "- x is a graph engine [1]\n",
        );
        let outcome = run(&state, &ctx).await.unwrap();
        let report = outcome.delta.report.unwrap();
        assert!(report.contains("Key Findings"));
        assert!(report.contains("[1]"));
    }

    #[tokio::test]
    async fn test_two_model_failures_fail_the_stage() {
        let (ctx, mock, _rx) = make_context();
        mock.queue_error(crate::error::ModelError::Connection {
            message: "down".into(),
        });
        mock.queue_error(crate::error::ModelError::Connection {
            message: "still down".into(),
        });

        let state = state_with_compressed(vec![], "");
        let result = run(&state, &ctx).await;
        assert!(matches!(result, Err(RunError::WriterFailed { .. })));
    }

    #[tokio::test]
    async fn test_empty_findings_yield_insufficiency_report() {
        let (ctx, mock, _rx) = make_context();
        mock.queue_text("x");

        let state = state_with_compressed(vec![], "");
        let outcome = run(&state, &ctx).await.unwrap();
        let report = outcome.delta.report.unwrap();
        assert!(report.contains("did not yield enough accessible"));
        assert!(!report.contains("## Sources"));
    }
}
