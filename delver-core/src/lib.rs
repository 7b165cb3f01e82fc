//! # Delver Core
//!
//! Research orchestration engine: a directed graph of stages that clarifies a
//! question, plans queries, chooses a strategy, runs bounded-concurrency
//! research loops, compresses findings, writes a cited report, and critiques
//! it. External collaborators (search provider, page fetcher, model
//! endpoints, checkpoint store) are traits; see `delver-tools` for defaults.

pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod extract;
pub mod graph;
pub mod model;
pub mod providers;
pub mod stages;
pub mod state;
pub mod text;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export commonly used types at the crate root.
pub use checkpoint::{CheckpointSink, FileCheckpointSink, InMemoryCheckpointSink};
pub use config::{load_config, EngineConfig};
pub use coordinator::{Coordinator, RunHandle, RunOptions};
pub use error::{DelverError, InputError, ModelError, ProviderError, Result, RunError};
pub use events::{ErrorKind, EventSender, RunEvent};
pub use model::{
    MockModelEndpoint, ModelEndpoint, ModelRequest, ModelResponse, ModelRole, ModelSet,
    RetryConfig, TokenUsage,
};
pub use providers::{FetchedPage, PageFetcher, SearchProvider, SearchResult};
pub use state::{
    Citation, Compressed, CritiqueScores, Finding, PageContent, PageStatus, ResearchPlan,
    ResearchState, SearchRecord, StateDelta, Strategy, StrategyMode,
};
