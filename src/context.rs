use serde_json::{json, Value};
use tracing::debug;

use crate::error::AgentError;
use crate::types::{ContentBlock, ToolResultBlock};

/// Estimate tokens for a plain string. Uses the chars/4 heuristic — good
/// enough for trend detection against a fractional threshold.
pub fn estimate_str_tokens(s: &str) -> usize {
    s.len() / 4
}

/// Estimate tokens for one message. Structured blocks are estimated
/// per sub-block: text by its text, tool_use by its serialized input,
/// tool_result by its content string.
fn estimate_message_tokens(message: &Value) -> usize {
    match &message["content"] {
        Value::String(s) => estimate_str_tokens(s),
        Value::Array(blocks) => blocks
            .iter()
            .map(|block| match block["type"].as_str() {
                Some("text") => estimate_str_tokens(block["text"].as_str().unwrap_or("")),
                Some("tool_use") => estimate_str_tokens(&block["input"].to_string()),
                Some("tool_result") => match &block["content"] {
                    Value::String(s) => estimate_str_tokens(s),
                    other => estimate_str_tokens(&other.to_string()),
                },
                _ => 0,
            })
            .sum(),
        _ => 0,
    }
}

/// Holds the system prompt and the ordered conversation, in the exact wire
/// shape sent to the model. The one place all context decisions happen.
pub struct ContextManager {
    system_prompt: String,
    messages: Vec<Value>,
    max_context_tokens: usize,
    checkpoint_threshold: f32,
    summary_threshold: f32,
    estimated_tokens: usize,
}

impl ContextManager {
    pub fn new(
        system_prompt: impl Into<String>,
        max_context_tokens: usize,
        checkpoint_threshold: f32,
        summary_threshold: f32,
    ) -> Self {
        let mut ctx = Self {
            system_prompt: system_prompt.into(),
            messages: Vec::new(),
            max_context_tokens,
            checkpoint_threshold,
            summary_threshold,
            estimated_tokens: 0,
        };
        ctx.recompute_estimate();
        ctx
    }

    /// Rebuild from a checkpoint snapshot. The saved estimate is discarded
    /// and recomputed from the restored content.
    pub fn from_snapshot(
        snapshot: &Value,
        max_context_tokens: usize,
        checkpoint_threshold: f32,
        summary_threshold: f32,
    ) -> Result<Self, AgentError> {
        let system_prompt = snapshot["system_prompt"]
            .as_str()
            .ok_or_else(|| AgentError::Context("missing system_prompt in snapshot".into()))?
            .to_string();
        let messages = snapshot["messages"]
            .as_array()
            .ok_or_else(|| AgentError::Context("missing messages in snapshot".into()))?
            .clone();

        let mut ctx = Self {
            system_prompt,
            messages,
            max_context_tokens,
            checkpoint_threshold,
            summary_threshold,
            estimated_tokens: 0,
        };
        ctx.recompute_estimate();
        Ok(ctx)
    }

    fn recompute_estimate(&mut self) {
        let mut total = estimate_str_tokens(&self.system_prompt);
        total += self
            .messages
            .iter()
            .map(estimate_message_tokens)
            .sum::<usize>();
        self.estimated_tokens = total;
    }

    pub fn add_user_text(&mut self, text: impl Into<String>) {
        self.messages.push(json!({
            "role": "user",
            "content": text.into(),
        }));
        self.recompute_estimate();
    }

    pub fn add_assistant_blocks(&mut self, blocks: &[ContentBlock]) {
        let content: Vec<Value> = blocks
            .iter()
            .map(|block| match block {
                ContentBlock::Text(text) => json!({
                    "type": "text",
                    "text": text,
                }),
                ContentBlock::ToolUse { id, name, input } => json!({
                    "type": "tool_use",
                    "id": id,
                    "name": name,
                    "input": input,
                }),
            })
            .collect();

        self.messages.push(json!({
            "role": "assistant",
            "content": content,
        }));
        self.recompute_estimate();
    }

    /// Append all tool results of a turn as one user message, preserving the
    /// 1:1 id pairing with the preceding assistant message.
    pub fn add_tool_results(&mut self, results: &[ToolResultBlock]) {
        let content: Vec<Value> = results
            .iter()
            .map(|r| {
                json!({
                    "type": "tool_result",
                    "tool_use_id": r.tool_use_id,
                    "content": r.content,
                    "is_error": r.is_error,
                })
            })
            .collect();

        self.messages.push(json!({
            "role": "user",
            "content": content,
        }));
        self.recompute_estimate();
    }

    pub fn estimated_tokens(&self) -> usize {
        self.estimated_tokens
    }

    /// Fraction of the configured window currently used (0.0 to 1.0+).
    pub fn usage_fraction(&self) -> f32 {
        if self.max_context_tokens == 0 {
            return 1.0;
        }
        self.estimated_tokens as f32 / self.max_context_tokens as f32
    }

    pub fn should_checkpoint(&self) -> bool {
        self.usage_fraction() >= self.checkpoint_threshold
    }

    pub fn should_summarize(&self) -> bool {
        self.usage_fraction() >= self.summary_threshold
    }

    /// Replace everything before the last `2 * keep_recent_pairs` messages
    /// with a single summary envelope. A no-op when the conversation is
    /// already within the retention bound. The system prompt is untouched.
    pub fn summarize_old(&mut self, summary: &str, keep_recent_pairs: usize) {
        let keep = keep_recent_pairs * 2;
        if self.messages.len() <= keep {
            return;
        }

        let cutoff = self.messages.len() - keep;
        let replaced = cutoff;
        let recent = self.messages.split_off(cutoff);

        let envelope = format!(
            "[CONTEXT SUMMARY - {replaced} previous messages]\n\n{summary}\n\n\
             [END SUMMARY - Recent conversation follows]"
        );

        self.messages = Vec::with_capacity(keep + 1);
        self.messages.push(json!({
            "role": "user",
            "content": envelope,
        }));
        self.messages.extend(recent);
        self.recompute_estimate();

        debug!(
            replaced,
            retained = keep,
            estimated_tokens = self.estimated_tokens,
            "old context summarized"
        );
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// Swap in a freshly composed system prompt (used on resume).
    pub fn set_system_prompt(&mut self, system_prompt: impl Into<String>) {
        self.system_prompt = system_prompt.into();
        self.recompute_estimate();
    }

    /// Messages for the outgoing request.
    pub fn messages(&self) -> Vec<Value> {
        self.messages.clone()
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Serialize for checkpointing.
    pub fn snapshot(&self) -> Value {
        json!({
            "system_prompt": self.system_prompt,
            "messages": self.messages,
            "estimated_tokens": self.estimated_tokens,
        })
    }

    /// Drop all messages, keeping the system prompt.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.recompute_estimate();
    }
}
