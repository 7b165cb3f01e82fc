//! Clarify stage: decide whether the query is specific enough to research.

use super::{StageContext, StageOutcome};
use crate::extract;
use crate::graph::EdgeLabel;
use crate::model::ModelRole;
use crate::state::{ResearchState, StateDelta};
use serde::Deserialize;

const CLARIFY_PROMPT: &str = "You are a QUERY ANALYST. Decide whether the user's question is specific enough to research.

DECISION CRITERIA: the query NEEDS clarification when:
- It contains opaque acronyms with no disambiguating context
- It is a trend-style topic with no timeframe or scope anchor
- It is a single broad term covering many subdomains

The query is CLEAR when:
- It names specific entities, products, papers, or people
- It includes a timeframe
- It states an explicit comparison or explanation intent

OUTPUT FORMAT (JSON):
{
    \"needs_clarification\": true/false,
    \"clarification_question\": \"one short question to ask the user, or null\",
    \"query_analysis\": \"one-sentence analysis of the query\",
    \"detected_topics\": [\"topic1\", \"topic2\"]
}
";

#[derive(Debug, Deserialize)]
struct ClarifyVerdict {
    needs_clarification: bool,
    #[serde(default)]
    clarification_question: Option<String>,
    #[serde(default)]
    query_analysis: String,
    #[serde(default)]
    detected_topics: Vec<String>,
}

/// Run the clarify stage.
///
/// Model or parse failure (after one retry) falls back to "no clarification
/// needed" so the pipeline is never blocked here.
pub async fn run(state: &ResearchState, ctx: &StageContext) -> StageOutcome {
    let prompt = format!("{CLARIFY_PROMPT}\nUser Question: {}", state.query);

    let mut verdict = None;
    for attempt in 0..2u32 {
        match ctx
            .models
            .complete(ModelRole::Analyzer, &prompt, ctx.config.model_timeout_ms)
            .await
        {
            Ok(response) => {
                let mut delta = StateDelta::default();
                delta.tokens_in = response.usage.input_tokens;
                delta.tokens_out = response.usage.output_tokens;
                if let Some(parsed) = extract::extract::<ClarifyVerdict>(&response.text) {
                    verdict = Some((parsed, delta));
                    break;
                }
                tracing::debug!(attempt, "Clarify response did not match schema");
                if attempt == 1 {
                    verdict = Some((
                        ClarifyVerdict {
                            needs_clarification: false,
                            clarification_question: None,
                            query_analysis: "unparseable".into(),
                            detected_topics: Vec::new(),
                        },
                        delta,
                    ));
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, attempt, "Clarify model call failed");
                if attempt == 1 {
                    verdict = Some((
                        ClarifyVerdict {
                            needs_clarification: false,
                            clarification_question: None,
                            query_analysis: "unparseable".into(),
                            detected_topics: Vec::new(),
                        },
                        StateDelta::default(),
                    ));
                }
            }
        }
    }

    let (verdict, mut delta) = verdict.expect("clarify fallback always set");

    delta.needs_clarification = Some(verdict.needs_clarification);
    delta.query_analysis = Some(verdict.query_analysis);
    delta.detected_topics = verdict.detected_topics;
    if verdict.needs_clarification {
        let question = verdict
            .clarification_question
            .filter(|q| !q.trim().is_empty())
            .unwrap_or_else(|| {
                format!(
                    "Could you narrow down what you want to know about \"{}\"?",
                    state.query
                )
            });
        delta.clarification_question = Some(question);
        return StageOutcome::new(delta, EdgeLabel::AskUser);
    }

    StageOutcome::new(delta, EdgeLabel::Next)
}
