//! Planner stage: turn a cleared query into search queries, focus areas,
//! and a depth level.

use super::{StageContext, StageOutcome};
use crate::extract;
use crate::graph::EdgeLabel;
use crate::model::ModelRole;
use crate::state::{ResearchPlan, ResearchState, StateDelta};
use crate::text;
use serde::Deserialize;

const PLANNER_PROMPT: &str = "You are a RESEARCH PLANNER. Your job is to create a research strategy.

Analyze the user's question and create a research plan with:
1. Multiple search queries (in English for better results)
2. Focus areas to explore
3. Depth level (1=single aspect, 2=multi-aspect overview, 3=deep comparative analysis)

RULES:
- Create 2-5 lexically diverse queries; no two queries may start with the same four words
- Every query must mention at least one entity or concept from the question
- List 2-6 focus areas

OUTPUT FORMAT (JSON):
{
    \"search_queries\": [\"query1\", \"query2\", \"query3\"],
    \"focus_areas\": [\"area1\", \"area2\"],
    \"depth_level\": 2
}

EXAMPLES:
- \"LangGraph Vision AI papers\" -> queries: [\"LangGraph Vision AI paper\", \"computer vision agents LangGraph\", \"image processing multi-agent research\"]
- \"AI trends 2024\" -> queries: [\"AI trends 2024\", \"machine learning advances 2024\", \"generative models landscape 2024\"]
";

const RETRY_DIRECTIVE: &str = "\nYour previous plan violated the rules: queries must be lexically \
diverse (distinct four-word prefixes) and each must mention a term from the question. Produce a \
corrected plan.";

#[derive(Debug, Deserialize)]
struct PlanDraft {
    #[serde(default)]
    search_queries: Vec<String>,
    #[serde(default)]
    focus_areas: Vec<String>,
    #[serde(default = "default_depth")]
    depth_level: u8,
}

fn default_depth() -> u8 {
    2
}

/// Why a drafted plan was rejected.
#[derive(Debug, PartialEq)]
enum PlanViolation {
    TooFewQueries,
    SharedPrefix,
    NoAnchorTerm,
}

/// Validate the planner's algorithmic rules against a draft.
fn check_plan(queries: &[String], question: &str) -> Option<PlanViolation> {
    if queries.len() < 2 {
        return Some(PlanViolation::TooFewQueries);
    }

    let mut prefixes = std::collections::HashSet::new();
    for q in queries {
        if !prefixes.insert(text::four_gram_prefix(q)) {
            return Some(PlanViolation::SharedPrefix);
        }
    }

    let anchors = text::content_tokens(question);
    // A question of pure stopwords anchors nothing; skip the check then.
    if !anchors.is_empty() {
        for q in queries {
            let q_tokens = text::content_tokens(q);
            if !q_tokens.iter().any(|t| anchors.contains(t)) {
                return Some(PlanViolation::NoAnchorTerm);
            }
        }
    }

    None
}

fn normalize(mut draft: PlanDraft, question: &str) -> ResearchPlan {
    draft.search_queries.truncate(5);
    draft.focus_areas.truncate(6);
    if draft.focus_areas.is_empty() {
        draft.focus_areas = vec!["overview".into(), "recent developments".into()];
    }
    if draft.search_queries.is_empty() {
        draft.search_queries = fallback_queries(question);
    }
    ResearchPlan {
        queries: draft.search_queries,
        focus_areas: draft.focus_areas,
        depth: draft.depth_level.clamp(1, 3),
    }
}

fn fallback_queries(question: &str) -> Vec<String> {
    vec![question.to_string(), format!("{question} overview")]
}

/// Run the planner stage. The plan is validated against the diversity and
/// anchor rules; one corrective retry, then the draft is kept with a soft
/// warning. Downstream stages function either way.
pub async fn run(state: &ResearchState, ctx: &StageContext) -> StageOutcome {
    let base_prompt = format!("{PLANNER_PROMPT}\nUser Question: {}", state.query);

    let mut delta = StateDelta::default();
    let mut best: Option<PlanDraft> = None;
    let mut violation = None;

    for attempt in 0..2u32 {
        let prompt = if attempt == 0 {
            base_prompt.clone()
        } else {
            format!("{base_prompt}{RETRY_DIRECTIVE}")
        };

        match ctx
            .models
            .complete(ModelRole::Planner, &prompt, ctx.config.model_timeout_ms)
            .await
        {
            Ok(response) => {
                delta.tokens_in += response.usage.input_tokens;
                delta.tokens_out += response.usage.output_tokens;
                match extract::extract::<PlanDraft>(&response.text) {
                    Some(draft) => {
                        violation = check_plan(&draft.search_queries, &state.query);
                        let ok = violation.is_none();
                        best = Some(draft);
                        if ok {
                            break;
                        }
                        tracing::debug!(?violation, attempt, "Plan rejected, retrying");
                    }
                    None => {
                        tracing::debug!(attempt, "Planner response did not match schema");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, attempt, "Planner model call failed");
            }
        }
    }

    if let Some(v) = &violation {
        tracing::warn!(violation = ?v, "Keeping plan that violates planner rules");
    }

    let plan = match best {
        Some(draft) => normalize(draft, &state.query),
        None => ResearchPlan {
            queries: fallback_queries(&state.query),
            focus_areas: vec!["overview".into(), "recent developments".into()],
            depth: 2,
        },
    };

    tracing::debug!(
        queries = plan.queries.len(),
        focus_areas = plan.focus_areas.len(),
        depth = plan.depth,
        "Research plan ready"
    );
    delta.plan = Some(plan);
    StageOutcome::new(delta, EdgeLabel::Next)
}
