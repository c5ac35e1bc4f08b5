use std::collections::HashMap;

use serde::Deserialize;

use crate::costs::{CostThresholds, Pricing};

/// Orchestrator configuration. Every field has a default, so embedders can
/// deserialize from whatever config source they use and override
/// selectively. The crate itself never reads a config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Model to drive the loop with. Accepts a short alias (`haiku`,
    /// `sonnet`, `opus`) or a full API model id.
    pub model: String,
    /// Max output tokens per model call.
    pub max_tokens: u32,
    /// Context window ceiling the pressure thresholds are measured against.
    pub max_context_tokens: usize,
    /// Fraction of the window at which checkpoints start being written.
    pub checkpoint_threshold: f32,
    /// Fraction of the window at which old context is summarized away.
    pub summary_threshold: f32,
    pub costs: CostThresholds,
    /// Per-model pricing overrides, keyed by short name or full id.
    pub pricing: HashMap<String, Pricing>,
    pub execution: ExecutionConfig,
    pub git: GitConfig,
    pub tools: ToolsConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            model: crate::costs::DEFAULT_MODEL.into(),
            max_tokens: 8192,
            max_context_tokens: 150_000,
            checkpoint_threshold: 0.6,
            summary_threshold: 0.8,
            costs: CostThresholds::default(),
            pricing: HashMap::new(),
            execution: ExecutionConfig::default(),
            git: GitConfig::default(),
            tools: ToolsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub max_iterations: usize,
    pub max_tool_calls_per_turn: usize,
    /// Seconds to sleep before retrying a failed model call.
    pub cooldown_on_error: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            max_tool_calls_per_turn: 20,
            cooldown_on_error: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    /// Commit automatically when the agent declares a phase complete.
    pub auto_commit_on_phase: bool,
    /// Conventional-commit prefix for phase commits.
    pub commit_prefix: String,
    /// Refuse to commit phases that carry no verification statement.
    pub require_verification: bool,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            auto_commit_on_phase: true,
            commit_prefix: "feat".into(),
            require_verification: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub bash: BashConfig,
}

/// Shell tool policy. `blocked` always wins; a non-empty `allowed` list is
/// an exclusive whitelist; `confirm` routes through the confirmation
/// callback and denies when none is installed.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BashConfig {
    /// Subprocess timeout in seconds.
    pub timeout: u64,
    pub allowed: Vec<String>,
    pub blocked: Vec<String>,
    pub confirm: Vec<String>,
}

impl Default for BashConfig {
    fn default() -> Self {
        Self {
            timeout: 120,
            allowed: Vec::new(),
            blocked: Vec::new(),
            confirm: Vec::new(),
        }
    }
}
