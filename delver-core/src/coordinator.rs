//! Run coordinator: wires the stage graph, enforces the overall deadline,
//! handles cancellation, and streams events to external observers.
//!
//! The coordinator is the only component that terminates a pipeline. Stages
//! return best-effort deltas; cancellation and the deadline are enforced at
//! every suspension point by racing the stage future against them, so partial
//! findings survive and a `done` event is always emitted.

use crate::checkpoint::CheckpointSink;
use crate::config::EngineConfig;
use crate::error::{DelverError, InputError, RunError};
use crate::events::{ErrorKind, EventSender, RunEvent};
use crate::graph::{next_stage, EdgeLabel, StageId};
use crate::model::ModelSet;
use crate::providers::{PageFetcher, SearchProvider};
use crate::stages::{clarify, compress, critique, planner, research, supervisor, writer};
use crate::stages::{StageContext, StageOutcome};
use crate::state::ResearchState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Queries longer than this are rejected outright.
const MAX_QUERY_CHARS: usize = 4_096;

/// Per-run options. Unknown keys are rejected when parsed from JSON.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RunOptions {
    pub thread_id: Option<String>,
    pub max_iterations_override: Option<usize>,
    pub max_parallelism_override: Option<usize>,
    pub overall_deadline_ms: Option<u64>,
    pub enable_plugin_tools: Option<bool>,
}

impl RunOptions {
    /// Parse options from a JSON object, rejecting unknown keys.
    pub fn from_json(value: serde_json::Value) -> Result<Self, InputError> {
        serde_json::from_value(value).map_err(|e| {
            let message = e.to_string();
            match message
                .strip_prefix("unknown field `")
                .and_then(|rest| rest.split('`').next())
            {
                Some(name) => InputError::UnknownOption {
                    name: name.to_string(),
                },
                None => InputError::InvalidOption {
                    name: "options".into(),
                    reason: message,
                },
            }
        })
    }

    fn validate(&self) -> Result<(), InputError> {
        if self.max_iterations_override == Some(0) {
            return Err(InputError::InvalidOption {
                name: "max_iterations_override".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.max_parallelism_override == Some(0) {
            return Err(InputError::InvalidOption {
                name: "max_parallelism_override".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.overall_deadline_ms == Some(0) {
            return Err(InputError::InvalidOption {
                name: "overall_deadline_ms".into(),
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// A handle to a running research pipeline.
pub struct RunHandle {
    pub run_id: Uuid,
    pub events: mpsc::UnboundedReceiver<RunEvent>,
    cancel: CancellationToken,
    join: tokio::task::JoinHandle<ResearchState>,
}

impl RunHandle {
    /// Request cooperative cancellation of the run.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The token observed by every suspension point of this run.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the run to finish and take the final state.
    pub async fn join(self) -> ResearchState {
        self.join.await.expect("run task panicked")
    }
}

/// Orchestrates research runs against a fixed set of collaborators.
pub struct Coordinator {
    config: EngineConfig,
    models: ModelSet,
    search: Arc<dyn SearchProvider>,
    fetcher: Arc<dyn PageFetcher>,
    checkpoint: Option<Arc<dyn CheckpointSink>>,
}

impl Coordinator {
    pub fn new(
        config: EngineConfig,
        models: ModelSet,
        search: Arc<dyn SearchProvider>,
        fetcher: Arc<dyn PageFetcher>,
    ) -> Self {
        Self {
            config,
            models,
            search,
            fetcher,
            checkpoint: None,
        }
    }

    /// Attach a checkpoint sink; the state is saved after each stage boundary.
    pub fn with_checkpoint_sink(mut self, sink: Arc<dyn CheckpointSink>) -> Self {
        self.checkpoint = Some(sink);
        self
    }

    /// Start a research run. Returns a handle carrying the event stream;
    /// invalid input is rejected before any work begins.
    pub fn start(&self, query: &str, options: RunOptions) -> Result<RunHandle, DelverError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(InputError::EmptyQuery.into());
        }
        if query.chars().count() > MAX_QUERY_CHARS {
            return Err(InputError::QueryTooLong {
                max: MAX_QUERY_CHARS,
            }
            .into());
        }
        options.validate().map_err(DelverError::from)?;

        let thread_id = options
            .thread_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let state = ResearchState::new(query, thread_id);
        let run_id = state.run_id;

        if options.enable_plugin_tools.unwrap_or(self.config.enable_plugin_tools) {
            tracing::debug!(run_id = %run_id, "Plugin tools requested; no tool surface is wired");
        }

        let (events, rx) = EventSender::channel();
        let cancel = CancellationToken::new();
        let ctx = StageContext {
            config: self.config.clone(),
            models: self.models.clone(),
            search: Arc::clone(&self.search),
            fetcher: Arc::clone(&self.fetcher),
            events,
            cancel: cancel.clone(),
        };
        let checkpoint = self.checkpoint.clone();
        let deadline_ms = options
            .overall_deadline_ms
            .unwrap_or(self.config.overall_deadline_ms);

        tracing::info!(run_id = %run_id, query = %state.query, "Research run starting");
        let join = tokio::spawn(drive(state, ctx, options, checkpoint, deadline_ms));

        Ok(RunHandle {
            run_id,
            events: rx,
            cancel,
            join,
        })
    }
}

/// How a run stopped ahead of reaching the end of the graph.
enum Stop {
    Cancelled,
    Deadline,
    StageFailed(RunError),
}

async fn drive(
    mut state: ResearchState,
    ctx: StageContext,
    options: RunOptions,
    checkpoint: Option<Arc<dyn CheckpointSink>>,
    deadline_ms: u64,
) -> ResearchState {
    let deadline = Instant::now() + Duration::from_millis(deadline_ms);

    if let Some(sink) = &checkpoint {
        if let Ok(Some(previous)) = sink.load(&state.thread_id).await {
            tracing::debug!(
                thread_id = %state.thread_id,
                previous_run = %previous.run_id,
                "Thread has a prior checkpoint; starting a fresh run on it"
            );
        }
    }

    let mut current = StageId::Clarify;
    let mut stop: Option<Stop> = None;

    while current != StageId::End {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            stop = Some(Stop::Deadline);
            break;
        }

        ctx.events.emit(RunEvent::StageStart {
            name: current.to_string(),
        });
        let started = Instant::now();

        let outcome = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                stop = Some(Stop::Cancelled);
                break;
            }
            _ = tokio::time::sleep(remaining) => {
                stop = Some(Stop::Deadline);
                break;
            }
            outcome = run_stage(current, &state, &ctx) => outcome,
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                stop = Some(Stop::StageFailed(e));
                break;
            }
        };

        let label = outcome.label;
        if let Some((kind, detail)) = outcome.warning {
            ctx.events.emit(RunEvent::Error { kind, detail });
        }
        state.apply(outcome.delta);
        if current == StageId::Supervisor {
            apply_overrides(&mut state, &options, &ctx.config);
        }

        ctx.events.emit(RunEvent::StageEnd {
            name: current.to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
        });

        if let Some(sink) = &checkpoint {
            if let Err(e) = sink.save(&state.thread_id, &state).await {
                tracing::warn!(error = %e, "Checkpoint save failed");
            }
        }

        current = match next_stage(current, label) {
            Some(next) => next,
            None => {
                tracing::warn!(stage = %current, "No transition defined, ending run");
                StageId::End
            }
        };
    }

    state.finish();
    match stop {
        Some(Stop::Cancelled) => {
            tracing::info!(run_id = %state.run_id, "Run cancelled");
            ctx.events.emit(RunEvent::Error {
                kind: ErrorKind::Cancelled,
                detail: "run cancelled by caller".into(),
            });
        }
        Some(Stop::Deadline) => {
            tracing::warn!(run_id = %state.run_id, deadline_ms, "Run deadline exceeded");
            ctx.events.emit(RunEvent::Error {
                kind: ErrorKind::Deadline,
                detail: format!("overall deadline of {deadline_ms}ms exceeded"),
            });
        }
        Some(Stop::StageFailed(e)) => {
            tracing::error!(run_id = %state.run_id, error = %e, "Run failed");
            ctx.events.emit(RunEvent::Error {
                kind: ErrorKind::Model,
                detail: e.to_string(),
            });
        }
        None => {}
    }

    if let Some(sink) = &checkpoint {
        if let Err(e) = sink.save(&state.thread_id, &state).await {
            tracing::warn!(error = %e, "Final checkpoint save failed");
        }
    }

    ctx.events.emit(RunEvent::Done {
        state: Box::new(state.clone()),
    });
    ctx.events.emit(RunEvent::End);
    state
}

async fn run_stage(
    stage: StageId,
    state: &ResearchState,
    ctx: &StageContext,
) -> Result<StageOutcome, RunError> {
    match stage {
        StageId::Clarify => Ok(clarify::run(state, ctx).await),
        StageId::Planner => Ok(planner::run(state, ctx).await),
        StageId::Supervisor => Ok(supervisor::run(state, ctx)),
        StageId::Research => Ok(research::run_iteration(state, ctx).await),
        StageId::Compress => Ok(compress::run(state, ctx)),
        StageId::Writer => writer::run(state, ctx).await,
        StageId::Critique => Ok(critique::run(state, ctx).await),
        StageId::End => Ok(StageOutcome::new(Default::default(), EdgeLabel::Next)),
    }
}

/// Apply per-run overrides to the supervisor's strategy, inside the caps.
fn apply_overrides(state: &mut ResearchState, options: &RunOptions, config: &EngineConfig) {
    let Some(strategy) = state.strategy.as_mut() else {
        return;
    };
    if let Some(iterations) = options.max_iterations_override {
        strategy.max_iterations = config.clamp_iterations(iterations);
    }
    if let Some(parallelism) = options.max_parallelism_override {
        strategy.max_parallelism = config.clamp_parallelism(parallelism);
    }
}
