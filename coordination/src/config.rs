//! Static orchestration configuration.
//!
//! Layered once at startup: defaults, then an optional TOML file, then
//! `CARDEVAL_*` environment overrides. Command-line flags are applied on top
//! by the binary. There is no hot reload.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ensemble::risk::RiskThresholds;
use crate::state::PipelineKind;

/// Error type for configuration loading
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Tunables for the orchestration core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Lifetime of a cached ensemble result
    pub cache_ttl_ms: u64,
    /// Least-recently-used eviction starts beyond this many entries
    pub cache_max_entries: usize,
    /// Ceiling on a whole request, including waiting on another caller
    pub global_request_timeout_ms: u64,
    /// `k` in `1 / (1 + k * dispersion)`
    pub consensus_dispersion_k: f64,
    /// How often expired entries are swept in the background
    pub cache_sweep_interval_ms: u64,
    /// Rolling window for latency percentiles and success rates
    pub monitor_window_ms: u64,
    /// Per-pipeline cap on retained samples
    pub monitor_max_samples: usize,
    /// Broadcast capacity of the event bus
    pub event_channel_capacity: usize,
    pub risk: RiskThresholds,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: 15 * 60 * 1000,
            cache_max_entries: 10_000,
            global_request_timeout_ms: 30_000,
            consensus_dispersion_k: 2.0,
            cache_sweep_interval_ms: 60_000,
            monitor_window_ms: 5 * 60 * 1000,
            monitor_max_samples: 1024,
            event_channel_capacity: 1024,
            risk: RiskThresholds::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Apply `CARDEVAL_*` overrides from any key/value source.
    ///
    /// Unparseable values are ignored and the previous value kept.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ms) = lookup("CARDEVAL_CACHE_TTL_MS").and_then(|v| v.parse().ok()) {
            self.cache_ttl_ms = ms;
        }
        if let Some(n) = lookup("CARDEVAL_CACHE_MAX_ENTRIES").and_then(|v| v.parse().ok()) {
            self.cache_max_entries = n;
        }
        if let Some(ms) = lookup("CARDEVAL_REQUEST_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.global_request_timeout_ms = ms;
        }
        if let Some(k) = lookup("CARDEVAL_DISPERSION_K").and_then(|v| v.parse().ok()) {
            self.consensus_dispersion_k = k;
        }
    }

    /// Reject values the orchestrator cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.cache_ttl_ms == 0 {
            return Err(invalid("cache_ttl_ms", "must be greater than zero"));
        }
        if self.cache_max_entries == 0 {
            return Err(invalid("cache_max_entries", "must be greater than zero"));
        }
        if self.global_request_timeout_ms == 0 {
            return Err(invalid("global_request_timeout_ms", "must be greater than zero"));
        }
        if !self.consensus_dispersion_k.is_finite() || self.consensus_dispersion_k < 0.0 {
            return Err(invalid(
                "consensus_dispersion_k",
                format!("must be finite and non-negative, got {}", self.consensus_dispersion_k),
            ));
        }
        if self.cache_sweep_interval_ms == 0 {
            return Err(invalid("cache_sweep_interval_ms", "must be greater than zero"));
        }
        if self.monitor_window_ms == 0 {
            return Err(invalid("monitor_window_ms", "must be greater than zero"));
        }
        if self.monitor_max_samples == 0 {
            return Err(invalid("monitor_max_samples", "must be greater than zero"));
        }
        if self.event_channel_capacity == 0 {
            return Err(invalid("event_channel_capacity", "must be greater than zero"));
        }
        self.risk.validate().map_err(|reason| invalid("risk", reason))?;
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.global_request_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.cache_sweep_interval_ms)
    }

    pub fn monitor_window(&self) -> Duration {
        Duration::from_millis(self.monitor_window_ms)
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// A pipeline served over HTTP, as declared in the config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub id: String,
    pub kind: PipelineKind,
    pub endpoint: String,
    #[serde(default = "default_pipeline_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub accuracy_factor: Option<f64>,
}

fn default_pipeline_timeout_ms() -> u64 {
    10_000
}

/// On-disk layout of `cardeval.toml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub orchestrator: OrchestratorConfig,
    pub pipelines: Vec<PipelineConfig>,
}

impl ConfigFile {
    /// Parse a config file from TOML text
    pub fn parse(text: &str) -> ConfigResult<Self> {
        let file: ConfigFile = toml::from_str(text)?;
        for pipeline in &file.pipelines {
            if pipeline.timeout_ms == 0 {
                return Err(invalid("pipelines.timeout_ms", format!("zero for {}", pipeline.id)));
            }
        }
        Ok(file)
    }

    /// Load a config file, apply environment overrides and validate
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut file = Self::parse(&text)?;
        file.orchestrator
            .apply_overrides(|key| std::env::var(key).ok());
        file.orchestrator.validate()?;
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache_ttl(), Duration::from_secs(900));
        assert_eq!(config.consensus_dispersion_k, 2.0);
    }

    #[test]
    fn test_overrides_apply_and_ignore_garbage() {
        let env: HashMap<&str, &str> = [
            ("CARDEVAL_CACHE_TTL_MS", "1000"),
            ("CARDEVAL_CACHE_MAX_ENTRIES", "not-a-number"),
            ("CARDEVAL_DISPERSION_K", "3.5"),
        ]
        .into_iter()
        .collect();

        let mut config = OrchestratorConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.cache_ttl_ms, 1000);
        assert_eq!(config.cache_max_entries, 10_000);
        assert_eq!(config.consensus_dispersion_k, 3.5);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = OrchestratorConfig {
            cache_max_entries: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "cache_max_entries",
                ..
            })
        ));

        let config = OrchestratorConfig {
            consensus_dispersion_k: f64::NAN,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_file_with_pipelines() {
        let text = r#"
[orchestrator]
cache_ttl_ms = 60000
global_request_timeout_ms = 5000

[[pipelines]]
id = "auth-v2"
kind = "authenticity"
endpoint = "http://localhost:9001/analyze"
timeout_ms = 2000
accuracy_factor = 0.9

[[pipelines]]
id = "grader"
kind = "grading"
endpoint = "http://localhost:9002/analyze"
"#;
        let file = ConfigFile::parse(text).unwrap();
        assert_eq!(file.orchestrator.cache_ttl_ms, 60_000);
        assert_eq!(file.orchestrator.cache_max_entries, 10_000);
        assert_eq!(file.pipelines.len(), 2);
        assert_eq!(file.pipelines[0].kind, PipelineKind::Authenticity);
        assert_eq!(file.pipelines[1].timeout_ms, 10_000);
        assert_eq!(file.pipelines[1].accuracy_factor, None);
    }

    #[test]
    fn test_load_from_disk() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "[orchestrator]\ncache_max_entries = 32").unwrap();

        let file = ConfigFile::load(tmp.path()).unwrap();
        assert_eq!(file.orchestrator.cache_max_entries, 32);
        assert!(file.pipelines.is_empty());
    }

    #[test]
    fn test_load_missing_file() {
        let err = ConfigFile::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
