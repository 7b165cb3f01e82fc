//! The stage graph as a static transition table.
//!
//! Each stage is a function from state to delta; the graph is a fixed table
//! of `(from, label) -> to` transitions, including the research self-loop and
//! the clarify short-circuit. No dynamic registration: the table is directly
//! verifiable and dumps to a diagram.

use serde::{Deserialize, Serialize};

/// Stages of the research pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Clarify,
    Planner,
    Supervisor,
    Research,
    Compress,
    Writer,
    Critique,
    End,
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StageId::Clarify => "clarify",
            StageId::Planner => "planner",
            StageId::Supervisor => "supervisor",
            StageId::Research => "research",
            StageId::Compress => "compress",
            StageId::Writer => "writer",
            StageId::Critique => "critique",
            StageId::End => "end",
        };
        write!(f, "{name}")
    }
}

/// Edge labels a stage can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeLabel {
    /// Proceed to the next stage in the main flow.
    Next,
    /// Clarify decided the query is too vague; short-circuit to the end.
    AskUser,
    /// The research subgraph loops for another iteration.
    Continue,
    /// The research subgraph is done.
    Finish,
}

/// The full transition table. One compiled graph drives one run.
pub const TRANSITIONS: &[(StageId, EdgeLabel, StageId)] = &[
    (StageId::Clarify, EdgeLabel::Next, StageId::Planner),
    (StageId::Clarify, EdgeLabel::AskUser, StageId::End),
    (StageId::Planner, EdgeLabel::Next, StageId::Supervisor),
    (StageId::Supervisor, EdgeLabel::Next, StageId::Research),
    (StageId::Research, EdgeLabel::Continue, StageId::Research),
    (StageId::Research, EdgeLabel::Finish, StageId::Compress),
    (StageId::Compress, EdgeLabel::Next, StageId::Writer),
    (StageId::Writer, EdgeLabel::Next, StageId::Critique),
    (StageId::Critique, EdgeLabel::Next, StageId::End),
];

/// Look up the stage that follows `from` under `label`.
pub fn next_stage(from: StageId, label: EdgeLabel) -> Option<StageId> {
    TRANSITIONS
        .iter()
        .find(|(f, l, _)| *f == from && *l == label)
        .map(|(_, _, to)| *to)
}

/// Render the graph as a mermaid flowchart.
pub fn mermaid() -> String {
    let mut out = String::from("flowchart TD\n");
    for (from, label, to) in TRANSITIONS {
        let edge = match label {
            EdgeLabel::Next => String::new(),
            EdgeLabel::AskUser => "|ask user|".to_string(),
            EdgeLabel::Continue => "|continue|".to_string(),
            EdgeLabel::Finish => "|finish|".to_string(),
        };
        out.push_str(&format!("    {from} -->{edge} {to}\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_main_flow() {
        assert_eq!(
            next_stage(StageId::Clarify, EdgeLabel::Next),
            Some(StageId::Planner)
        );
        assert_eq!(
            next_stage(StageId::Planner, EdgeLabel::Next),
            Some(StageId::Supervisor)
        );
        assert_eq!(
            next_stage(StageId::Critique, EdgeLabel::Next),
            Some(StageId::End)
        );
    }

    #[test]
    fn test_research_self_loop() {
        assert_eq!(
            next_stage(StageId::Research, EdgeLabel::Continue),
            Some(StageId::Research)
        );
        assert_eq!(
            next_stage(StageId::Research, EdgeLabel::Finish),
            Some(StageId::Compress)
        );
    }

    #[test]
    fn test_clarify_short_circuit() {
        assert_eq!(
            next_stage(StageId::Clarify, EdgeLabel::AskUser),
            Some(StageId::End)
        );
    }

    #[test]
    fn test_undefined_transition() {
        assert_eq!(next_stage(StageId::Compress, EdgeLabel::Continue), None);
        assert_eq!(next_stage(StageId::End, EdgeLabel::Next), None);
    }

    #[test]
    fn test_mermaid_dump_covers_all_edges() {
        let diagram = mermaid();
        assert!(diagram.starts_with("flowchart TD"));
        assert_eq!(diagram.lines().count(), 1 + TRANSITIONS.len());
        assert!(diagram.contains("research -->|continue| research"));
    }
}
