use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, WeftError};

/// Top-level engine configuration. Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub fallback_models: Vec<ModelConfig>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
}

/// Per-agent execution loop limits and history policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Oracle exchanges allowed per agent.
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    #[serde(default = "default_max_duration")]
    pub max_duration_secs: u64,
    #[serde(default = "default_oracle_timeout")]
    pub oracle_timeout_secs: u64,
    #[serde(default = "default_snapshot_timeout")]
    pub snapshot_timeout_secs: u64,
    /// Consecutive malformed oracle responses tolerated before the loop fails.
    #[serde(default = "default_max_parse_retries")]
    pub max_parse_retries: u32,
    /// Most recent snapshots kept verbatim.
    #[serde(default = "default_snapshot_window")]
    pub snapshot_window: usize,
    /// Tool invocations inspected by the forced-extraction policy.
    #[serde(default = "default_extraction_window")]
    pub extraction_window: usize,
    /// Scrolls within the window that trigger a forced extraction.
    #[serde(default = "default_extraction_min_scrolls")]
    pub extraction_min_scrolls: usize,
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
    #[serde(default = "default_max_tool_output_tokens")]
    pub max_tool_output_tokens: usize,
    /// Seconds to keep armed watches alive after the last step.
    #[serde(default)]
    pub watch_linger_secs: u64,
    /// Characters of each upstream agent result shown in the system prompt.
    #[serde(default = "default_prior_result_chars")]
    pub prior_result_chars: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            max_duration_secs: default_max_duration(),
            oracle_timeout_secs: default_oracle_timeout(),
            snapshot_timeout_secs: default_snapshot_timeout(),
            max_parse_retries: default_max_parse_retries(),
            snapshot_window: default_snapshot_window(),
            extraction_window: default_extraction_window(),
            extraction_min_scrolls: default_extraction_min_scrolls(),
            max_context_tokens: default_max_context_tokens(),
            max_tool_output_tokens: default_max_tool_output_tokens(),
            watch_linger_secs: 0,
            prior_result_chars: default_prior_result_chars(),
        }
    }
}

fn default_max_turns() -> usize { 100 }
fn default_max_duration() -> u64 { 1800 }
fn default_oracle_timeout() -> u64 { 120 }
fn default_snapshot_timeout() -> u64 { 30 }
fn default_max_parse_retries() -> u32 { 1 }
fn default_snapshot_window() -> usize { 2 }
fn default_extraction_window() -> usize { 8 }
fn default_extraction_min_scrolls() -> usize { 3 }
fn default_max_context_tokens() -> usize { 120_000 }
fn default_max_tool_output_tokens() -> usize { 8_000 }
fn default_prior_result_chars() -> usize { 500 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_id: default_model_id(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            retry: None,
        }
    }
}

fn default_model_id() -> String { "default".to_string() }
fn default_max_tokens() -> u32 { 8192 }
fn default_temperature() -> f32 { 0.0 }

/// Retry configuration for oracle requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Upper bound on concurrently running agents. `None` = unbounded.
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Cap on a single human wait. `None` waits indefinitely.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub fallback: EscalationFallback,
}

/// What a timed-out human wait turns into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationFallback {
    /// The owning loop fails.
    #[default]
    Fail,
    /// The oracle is told the operator declined.
    Decline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    #[serde(default = "default_planner_name")]
    pub name: String,
    /// Capability names accepted when plans are validated outside a live registry.
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<String>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            name: default_planner_name(),
            capabilities: default_capabilities(),
        }
    }
}

fn default_planner_name() -> String { "Weft".to_string() }

fn default_capabilities() -> Vec<String> {
    ["Browser", "Computer", "File", "Chat"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl EngineConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeftError::ConfigNotFound(path.display().to_string()))?;

        debug!(path = %path.display(), "Loading config");
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| WeftError::Config(e.to_string()))
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| WeftError::Config(e.to_string()))
    }
}

/// Expand `${ENV_VAR}` patterns in a string. Unset variables are left as-is.
pub fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    warn!(var = %var_name, "Config references an unset environment variable");
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}
