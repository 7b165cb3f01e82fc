//! Critique stage: CARC quality scores for the finished report.
//!
//! Advisory only; the run never gates on the scores. The critic runs at a
//! fixed low temperature so identical inputs score near-identically.

use super::{StageContext, StageOutcome};
use crate::extract;
use crate::graph::EdgeLabel;
use crate::model::ModelRole;
use crate::state::{CritiqueScores, PageStatus, ResearchState, StateDelta};
use serde::Deserialize;

const CRITIQUE_PROMPT: &str = "You are a QUALITY REVIEWER. Score the research report on four dimensions, each 0.0-5.0:

- completeness: does it cover every focus area of the question?
- accuracy: is every claim backed by a citation marker?
- relevance: does it directly answer the question?
- clarity: is it well structured and readable?

OUTPUT FORMAT (JSON):
{
    \"completeness\": 4.0,
    \"accuracy\": 4.5,
    \"relevance\": 5.0,
    \"clarity\": 4.0
}
";

#[derive(Debug, Deserialize)]
struct ScoreDraft {
    #[serde(default)]
    completeness: f64,
    #[serde(default)]
    accuracy: f64,
    #[serde(default)]
    relevance: f64,
    #[serde(default)]
    clarity: f64,
}

/// Whether any citation resolves to a page this run actually read with
/// status ok. Without one, high accuracy is not defensible.
fn has_verified_citation(state: &ResearchState) -> bool {
    let Some(compressed) = &state.compressed else {
        return false;
    };
    compressed.citations.iter().any(|c| {
        state
            .read_contents
            .iter()
            .any(|p| p.url == c.url && p.status == PageStatus::Ok)
    })
}

/// Run the critique stage. Model failure degrades to zeroed scores.
pub async fn run(state: &ResearchState, ctx: &StageContext) -> StageOutcome {
    let compressed_text = state
        .compressed
        .as_ref()
        .map(|c| c.text.as_str())
        .unwrap_or("");
    let focus_areas = state
        .plan
        .as_ref()
        .map(|p| p.focus_areas.join(", "))
        .unwrap_or_default();
    let prompt = format!(
        "{CRITIQUE_PROMPT}\nUSER QUESTION: {}\nFOCUS AREAS: {focus_areas}\n\nREPORT:\n{}\n\nRESEARCH NOTES:\n{compressed_text}\n",
        state.query, state.report,
    );

    let mut delta = StateDelta::default();
    let mut draft = None;
    for attempt in 0..2u32 {
        match ctx
            .models
            .complete(ModelRole::Critic, &prompt, ctx.config.model_timeout_ms)
            .await
        {
            Ok(response) => {
                delta.tokens_in += response.usage.input_tokens;
                delta.tokens_out += response.usage.output_tokens;
                if let Some(parsed) = extract::extract::<ScoreDraft>(&response.text) {
                    draft = Some(parsed);
                    break;
                }
                tracing::debug!(attempt, "Critique response did not match schema");
            }
            Err(e) => {
                tracing::warn!(error = %e, attempt, "Critique model call failed");
            }
        }
    }

    let draft = draft.unwrap_or(ScoreDraft {
        completeness: 0.0,
        accuracy: 0.0,
        relevance: 0.0,
        clarity: 0.0,
    });

    // A report with no citation backed by a readable page cannot claim
    // grounded accuracy, whatever the critic model thinks.
    let accuracy = if has_verified_citation(state) {
        draft.accuracy
    } else {
        draft.accuracy.min(1.0)
    };

    let scores = CritiqueScores::new(draft.completeness, accuracy, draft.relevance, draft.clarity);
    tracing::debug!(
        completeness = scores.completeness,
        accuracy = scores.accuracy,
        relevance = scores.relevance,
        clarity = scores.clarity,
        total = scores.total,
        "Report scored"
    );

    delta.critique = Some(scores);
    StageOutcome::new(delta, EdgeLabel::Next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Citation, Compressed, PageContent};
    use crate::testutil::make_context;
    use chrono::Utc;

    fn state_with_report(verified: bool) -> ResearchState {
        let mut state = ResearchState::new("q", "t");
        state.report = "## Summary\n\nAnswer. [1]".into();
        state.compressed = Some(Compressed {
            text: "- answer [1]".into(),
            citations: vec![Citation {
                id: 1,
                url: "https://a.example".into(),
                title: None,
                snippet: "s".into(),
            }],
        });
        if verified {
            state.read_contents.push(PageContent {
                url: "https://a.example".into(),
                fetched_at: Utc::now(),
                status: PageStatus::Ok,
                body: "body".into(),
                content_length: 4,
                bytes_truncated: false,
            });
        }
        state
    }

    #[tokio::test]
    async fn test_scores_parsed_and_totaled() {
        let (ctx, mock, _rx) = make_context();
        mock.queue_text(
            r#"{"completeness": 4.0, "accuracy": 4.5, "relevance": 5.0, "clarity": 4.0}"#,
        );

        let state = state_with_report(true);
        let scores = run(&state, &ctx).await.delta.critique.unwrap();
        assert!((scores.total - 17.5).abs() < f64::EPSILON);
        assert!((scores.accuracy - 4.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_scores_clamped_to_range() {
        let (ctx, mock, _rx) = make_context();
        mock.queue_text(
            r#"{"completeness": 9.0, "accuracy": 5.0, "relevance": -2.0, "clarity": 3.0}"#,
        );

        let state = state_with_report(true);
        let scores = run(&state, &ctx).await.delta.critique.unwrap();
        assert!((scores.completeness - 5.0).abs() < f64::EPSILON);
        assert!((scores.relevance - 0.0).abs() < f64::EPSILON);
        assert!(scores.total <= 20.0);
    }

    #[tokio::test]
    async fn test_accuracy_capped_without_readable_sources() {
        let (ctx, mock, _rx) = make_context();
        mock.queue_text(
            r#"{"completeness": 4.0, "accuracy": 4.8, "relevance": 4.0, "clarity": 4.0}"#,
        );

        let state = state_with_report(false);
        let scores = run(&state, &ctx).await.delta.critique.unwrap();
        assert!(scores.accuracy <= 1.0);
    }

    #[tokio::test]
    async fn test_model_failure_degrades_to_zeroes() {
        let (ctx, mock, _rx) = make_context();
        mock.queue_error(crate::error::ModelError::Connection {
            message: "down".into(),
        });
        mock.queue_error(crate::error::ModelError::Connection {
            message: "down".into(),
        });

        let state = state_with_report(true);
        let scores = run(&state, &ctx).await.delta.critique.unwrap();
        assert!((scores.total - 0.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_unparseable_retried_then_defaulted() {
        let (ctx, mock, _rx) = make_context();
        mock.queue_text("looks great, five stars");
        mock.queue_text("still prose");

        let state = state_with_report(true);
        let scores = run(&state, &ctx).await.delta.critique.unwrap();
        assert_eq!(mock.call_count(), 2);
        assert!((scores.total - 0.0).abs() < f64::EPSILON);
    }
}
