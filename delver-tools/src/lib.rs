//! # Delver Tools
//!
//! Default implementations of the `delver-core` collaborator traits: a
//! DuckDuckGo search provider, a browser-headed page fetcher, and an
//! OpenAI-compatible model endpoint.

pub mod openai;
pub mod web;

pub use openai::OpenAiCompatibleEndpoint;
pub use web::{DuckDuckGoSearch, HttpPageFetcher};
