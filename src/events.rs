use serde_json::Value;

/// Events emitted during orchestration, for UI streaming. Delivery is
/// fire-and-forget; the loop never blocks on a consumer.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    TurnStart { turn: usize },
    Text { content: String },
    ToolStart { name: String, input: Value },
    ToolEnd { name: String, output: String, is_error: bool },
    CheckpointSaved { reason: String },
    CostWarning { cost: f64 },
    CostAlert { cost: f64 },
    ContextSummarized { pre_tokens: usize, post_tokens: usize },
    HelpRequested { question: String },
    Finished { complete: bool, iterations: usize },
}
