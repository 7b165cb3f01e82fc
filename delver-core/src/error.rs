//! Error types for the Delver research engine.
//!
//! Uses `thiserror` for public API error types. Failures are caught at the
//! narrowest stage that can yield a sensible default; only the run
//! coordinator terminates a pipeline.

/// Top-level error type for the Delver core library.
#[derive(Debug, thiserror::Error)]
pub enum DelverError {
    #[error("Input error: {0}")]
    Input(#[from] InputError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Run error: {0}")]
    Run(#[from] RunError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors in the caller-supplied query or options. Surfaced before the run
/// starts; a run is never created from invalid input.
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("Query is empty")]
    EmptyQuery,

    #[error("Query exceeds {max} characters")]
    QueryTooLong { max: usize },

    #[error("Unknown option: {name}")]
    UnknownOption { name: String },

    #[error("Invalid option '{name}': {reason}")]
    InvalidOption { name: String, reason: String },
}

/// Errors from model endpoint interactions.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("API request failed: {message}")]
    ApiRequest { message: String },

    #[error("Response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Streaming error: {message}")]
    Streaming { message: String },

    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Model call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Connection failed: {message}")]
    Connection { message: String },

    #[error("Authentication failed for endpoint {endpoint}")]
    AuthFailed { endpoint: String },
}

impl ModelError {
    /// Whether a retry may succeed. Parse and auth failures are permanent.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ModelError::RateLimited { .. }
                | ModelError::Streaming { .. }
                | ModelError::Connection { .. }
                | ModelError::Timeout { .. }
        )
    }
}

/// Errors from the search provider or page fetcher.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Transient failure for '{operation}': {message}")]
    Transient { operation: String, message: String },

    #[error("Permanent failure for '{operation}': {message}")]
    Permanent { operation: String, message: String },

    #[error("'{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },
}

impl ProviderError {
    /// Transient failures (including timeouts) are retried once; permanent
    /// failures are logged and demoted to empty results.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Transient { .. } | ProviderError::Timeout { .. }
        )
    }
}

/// Errors that terminate or annotate a whole run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Run was cancelled")]
    Cancelled,

    #[error("Overall deadline of {deadline_ms}ms exceeded")]
    DeadlineExceeded { deadline_ms: u64 },

    #[error("Writer failed after {attempts} attempts: {message}")]
    WriterFailed { attempts: u32, message: String },

    #[error("Citation validation failed: {detail}")]
    Citation { detail: String },

    #[error("Checkpoint error: {message}")]
    Checkpoint { message: String },
}

/// A type alias for results using the top-level `DelverError`.
pub type Result<T> = std::result::Result<T, DelverError>;
