//! Configuration for the research engine.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config file -> environment -> explicit overrides. Loaded from
//! `~/.config/delver/config.toml` and/or `.delver/config.toml` in the
//! workspace directory; environment variables use the `DELVER_` prefix.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Process-wide engine configuration.
///
/// Every knob the engine honors is here; per-run overrides travel in
/// `RunOptions` and are clamped against the caps in this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hard cap on parallel research tasks in fan-out mode.
    pub max_parallelism_cap: usize,
    /// Hard cap on sequential research iterations.
    pub max_iterations_cap: usize,
    /// Concurrent page fetches inside the Read step.
    pub fetch_concurrency: usize,
    /// Per-fetch timeout in milliseconds.
    pub fetch_timeout_ms: u64,
    /// Per-search timeout in milliseconds.
    pub search_timeout_ms: u64,
    /// Per-model-call timeout in milliseconds.
    pub model_timeout_ms: u64,
    /// Page bodies are truncated to this many bytes before analysis.
    pub body_truncate_bytes: usize,
    /// Target ratio of compressed text to raw finding text.
    pub compression_target_ratio: f64,
    /// Token-Jaccard similarity above which two claims are duplicates.
    pub jaccard_dedup_threshold: f64,
    /// Overall run deadline in milliseconds.
    pub overall_deadline_ms: u64,
    /// Whether the auxiliary plug-in tool surface is enabled. Accepted and
    /// recorded, but no tool surface is currently wired.
    pub enable_plugin_tools: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallelism_cap: 4,
            max_iterations_cap: 3,
            fetch_concurrency: 3,
            fetch_timeout_ms: 10_000,
            search_timeout_ms: 15_000,
            model_timeout_ms: 60_000,
            body_truncate_bytes: 51_200,
            compression_target_ratio: 0.5,
            jaccard_dedup_threshold: 0.75,
            overall_deadline_ms: 180_000,
            enable_plugin_tools: false,
        }
    }
}

impl EngineConfig {
    /// Clamp a requested parallelism against the configured cap.
    pub fn clamp_parallelism(&self, requested: usize) -> usize {
        requested.clamp(1, self.max_parallelism_cap)
    }

    /// Clamp a requested iteration count against the configured cap.
    pub fn clamp_iterations(&self, requested: usize) -> usize {
        requested.clamp(1, self.max_iterations_cap)
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `DELVER_`)
/// 3. Workspace-local config (`.delver/config.toml`)
/// 4. User config (`~/.config/delver/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&EngineConfig>,
) -> Result<EngineConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(EngineConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "delver", "delver") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".delver").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    figment = figment.merge(Env::prefixed("DELVER_"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.max_parallelism_cap, 4);
        assert_eq!(config.max_iterations_cap, 3);
        assert_eq!(config.fetch_concurrency, 3);
        assert_eq!(config.fetch_timeout_ms, 10_000);
        assert_eq!(config.body_truncate_bytes, 51_200);
        assert!((config.jaccard_dedup_threshold - 0.75).abs() < f64::EPSILON);
        assert!(!config.enable_plugin_tools);
    }

    #[test]
    fn test_clamp_parallelism() {
        let config = EngineConfig::default();
        assert_eq!(config.clamp_parallelism(0), 1);
        assert_eq!(config.clamp_parallelism(3), 3);
        assert_eq!(config.clamp_parallelism(16), 4);
    }

    #[test]
    fn test_clamp_iterations() {
        let config = EngineConfig::default();
        assert_eq!(config.clamp_iterations(0), 1);
        assert_eq!(config.clamp_iterations(2), 2);
        assert_eq!(config.clamp_iterations(10), 3);
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = EngineConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: EngineConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(deserialized.fetch_concurrency, config.fetch_concurrency);
        assert_eq!(
            deserialized.overall_deadline_ms,
            config.overall_deadline_ms
        );
    }

    #[test]
    fn test_load_config_defaults() {
        let config = load_config(None, None).unwrap();
        assert_eq!(config.search_timeout_ms, 15_000);
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let delver_dir = dir.path().join(".delver");
        std::fs::create_dir_all(&delver_dir).unwrap();
        std::fs::write(
            delver_dir.join("config.toml"),
            "fetch_concurrency = 2\noverall_deadline_ms = 60000\n",
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.fetch_concurrency, 2);
        assert_eq!(config.overall_deadline_ms, 60_000);
        // Untouched keys keep their defaults
        assert_eq!(config.max_parallelism_cap, 4);
    }

    #[test]
    fn test_load_config_with_overrides() {
        let mut overrides = EngineConfig::default();
        overrides.model_timeout_ms = 5_000;
        let config = load_config(None, Some(&overrides)).unwrap();
        assert_eq!(config.model_timeout_ms, 5_000);
    }
}
