//! Runtime configuration (spec.md §6 "Configuration").
//!
//! Loaded from a TOML file with every key defaulted, following the
//! load-or-default pattern used elsewhere in the pack for small
//! single-file configs.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub enabled: bool,
    pub timeout_seconds: u64,
    pub confidence_threshold: f64,
    pub max_stages: u8,
    pub fallback_on_failure: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_seconds: 30,
            confidence_threshold: 0.90,
            max_stages: 4,
            fallback_on_failure: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageLimitsConfig {
    pub v1_max_input_chars: usize,
    pub v2_max_context_notes: usize,
    pub v3_max_input_chars: usize,
}

impl Default for StageLimitsConfig {
    fn default() -> Self {
        Self {
            v1_max_input_chars: 8000,
            v2_max_context_notes: 5,
            v3_max_input_chars: 4000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoppingConfig {
    pub v1_early_stop_overall: f64,
    pub v3_terminate_overall: f64,
    pub v4_queue_overall: f64,
}

impl Default for StoppingConfig {
    fn default() -> Self {
        Self {
            v1_early_stop_overall: 0.95,
            v3_terminate_overall: 0.90,
            v4_queue_overall: 0.90,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub v1: String,
    pub v2: String,
    pub v3: String,
    pub v4: String,
    pub adaptive_escalation_threshold: f64,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            v1: "fast".to_string(),
            v2: "fast".to_string(),
            v3: "fast".to_string(),
            v4: "strong".to_string(),
            adaptive_escalation_threshold: 0.80,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub top_k: usize,
    pub min_relevance: f64,
    pub weight_entity: f64,
    pub weight_semantic: f64,
    pub weight_thread: f64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_relevance: 0.3,
            weight_entity: 0.4,
            weight_semantic: 0.4,
            weight_thread: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossSourceConfig {
    pub cache_ttl_seconds: u64,
    pub adapter_timeout_seconds: u64,
    pub max_total_results: usize,
    pub source_weights: HashMap<String, f64>,
}

impl Default for CrossSourceConfig {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: 900,
            adapter_timeout_seconds: 10,
            max_total_results: 50,
            source_weights: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub max_parallel_per_plan: usize,
    pub action_timeout_seconds: u64,
    /// Upper bound on retry attempts for actions declared idempotent
    /// (spec.md §4.9); non-idempotent actions never retry regardless of
    /// this value.
    pub max_action_retries: u32,
    /// Base delay for the executor's retry backoff, doubled per attempt
    /// (same exponential-backoff shape as `llm::batch::RetryConfig`).
    pub action_retry_base_delay_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel_per_plan: 3,
            action_timeout_seconds: 30,
            max_action_retries: 2,
            action_retry_base_delay_ms: 150,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub undo_window_seconds: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            undo_window_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    pub size: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self { size: 4 }
    }
}

/// Top-level configuration, recognized keys exactly as spec.md §6.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub orchestrator: OrchestratorConfig,
    pub stages: StageLimitsConfig,
    pub stopping: StoppingConfig,
    pub models: ModelsConfig,
    pub context: ContextConfig,
    pub cross_source: CrossSourceConfig,
    pub executor: ExecutorConfig,
    pub queue: QueueConfig,
    pub worker_pool: WorkerPoolConfig,
}

impl Config {
    /// Load from a TOML file; returns defaults if the file does not exist.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("parsing config: {e}")))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(format!("serializing config: {e}")))
    }
}
