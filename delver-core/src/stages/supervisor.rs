//! Supervisor stage: choose the research strategy.
//!
//! Parallel breadth maximizes coverage on wide factual queries; a sequential
//! loop maximizes refinement on comparative or deep queries where later
//! searches depend on earlier analysis.

use super::{StageContext, StageOutcome};
use crate::graph::EdgeLabel;
use crate::state::{ResearchState, StateDelta, Strategy, StrategyMode};

/// Phrases that split a comparative question into its subjects.
const COMPARATIVE_SEPARATORS: &[&str] = &[" vs ", " vs. ", " versus ", " compared to ", " or "];

/// Whether the query names at least two explicit subjects.
pub(crate) fn is_comparative(query: &str) -> bool {
    let lower = query.to_lowercase();
    if lower.starts_with("compare ") || lower.contains("difference between") {
        return true;
    }
    COMPARATIVE_SEPARATORS.iter().any(|sep| {
        lower
            .split(sep)
            .filter(|part| !part.trim().is_empty())
            .count()
            >= 2
    })
}

/// Run the supervisor stage. Pure policy over the plan; no model call.
pub fn run(state: &ResearchState, ctx: &StageContext) -> StageOutcome {
    let plan = state.plan.clone().unwrap_or_default();
    let queries = plan.queries.len().max(1);
    let comparative = is_comparative(&state.query);

    let strategy = if plan.depth <= 1 || queries == 1 {
        Strategy {
            mode: StrategyMode::Sequential,
            max_parallelism: 1,
            max_iterations: 1,
        }
    } else if plan.depth == 3 || comparative {
        Strategy {
            mode: StrategyMode::Sequential,
            max_parallelism: 1,
            max_iterations: 3,
        }
    } else {
        // Depth 2: fan out one task per query, up to the cap.
        Strategy {
            mode: StrategyMode::Parallel,
            max_parallelism: queries,
            max_iterations: 1,
        }
    };

    let strategy = Strategy {
        mode: strategy.mode,
        max_parallelism: ctx.config.clamp_parallelism(strategy.max_parallelism),
        max_iterations: ctx.config.clamp_iterations(strategy.max_iterations),
    };

    tracing::debug!(
        mode = ?strategy.mode,
        max_parallelism = strategy.max_parallelism,
        max_iterations = strategy.max_iterations,
        comparative,
        "Strategy selected"
    );

    let mut delta = StateDelta::default();
    delta.strategy = Some(strategy);
    StageOutcome::new(delta, EdgeLabel::Next)
}
