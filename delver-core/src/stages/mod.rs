//! Pipeline stages.
//!
//! Each stage is a function from a read-only view of the state to a
//! `StateDelta` plus the edge label to follow. Failures are absorbed at the
//! stage boundary wherever a sensible default exists; a stage that cannot
//! produce one annotates its outcome with a warning instead of failing the
//! run.

pub mod clarify;
pub mod compress;
pub mod critique;
pub mod planner;
pub mod research;
pub mod supervisor;
pub mod writer;

use crate::config::EngineConfig;
use crate::events::{ErrorKind, EventSender};
use crate::graph::EdgeLabel;
use crate::model::ModelSet;
use crate::providers::{PageFetcher, SearchProvider};
use crate::state::StateDelta;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Shared collaborators handed to every stage.
#[derive(Clone)]
pub struct StageContext {
    pub config: EngineConfig,
    pub models: ModelSet,
    pub search: Arc<dyn SearchProvider>,
    pub fetcher: Arc<dyn PageFetcher>,
    pub events: EventSender,
    pub cancel: CancellationToken,
}

/// What a stage hands back to the coordinator.
pub struct StageOutcome {
    pub delta: StateDelta,
    pub label: EdgeLabel,
    /// Non-fatal problem worth surfacing on the event stream.
    pub warning: Option<(ErrorKind, String)>,
}

impl StageOutcome {
    pub fn new(delta: StateDelta, label: EdgeLabel) -> Self {
        Self {
            delta,
            label,
            warning: None,
        }
    }

    pub fn with_warning(mut self, kind: ErrorKind, detail: impl Into<String>) -> Self {
        self.warning = Some((kind, detail.into()));
        self
    }
}
