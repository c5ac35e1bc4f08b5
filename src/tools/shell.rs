use std::time::Duration;

use serde_json::Value;
use tokio::time::timeout;
use tracing::debug;

use super::{ConfirmCallback, ToolExecutor};
use crate::config::BashConfig;
use crate::error::ToolError;

/// Output past this many chars is truncated before it reaches the model.
const MAX_OUTPUT_CHARS: usize = 30_000;

pub(crate) async fn bash(exec: &ToolExecutor, input: &Value) -> Result<String, ToolError> {
    let command = input["command"]
        .as_str()
        .ok_or_else(|| ToolError::new("bash: missing 'command'"))?;
    let timeout_secs = input["timeout"].as_u64().unwrap_or(exec.bash.timeout);

    check_policy(&exec.bash, command, exec.confirm.as_ref())?;

    let fut = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(&exec.project_dir)
        .kill_on_drop(true)
        .output();

    let output = match timeout(Duration::from_secs(timeout_secs), fut).await {
        Ok(result) => result.map_err(|e| ToolError::new(format!("Command failed: {e}")))?,
        Err(_) => {
            return Err(ToolError::new(format!(
                "Command timed out after {timeout_secs}s"
            )))
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let exit_code = output.status.code().unwrap_or(-1);
    debug!(command, exit_code, "bash completed");

    let mut result = String::new();
    result.push_str(&stdout);
    if !stderr.is_empty() {
        if !result.is_empty() {
            result.push('\n');
        }
        result.push_str(&format!("[stderr]\n{stderr}"));
    }
    if exit_code != 0 {
        result.push_str(&format!("\n[exit code: {exit_code}]"));
    }

    if result.chars().count() > MAX_OUTPUT_CHARS {
        let truncated: String = result.chars().take(MAX_OUTPUT_CHARS).collect();
        result = format!("{truncated}\n\n[... output truncated]");
    }

    if result.is_empty() {
        result.push_str("[no output]");
    }
    Ok(result)
}

/// Three-layer shell policy. Layer 1: a blocked command word fails outright.
/// Layer 2: with a non-empty whitelist, every command word must be on it.
/// Layer 3: any token on the confirm list routes through the confirmation
/// callback; with no callback installed the command is denied.
pub fn check_policy(
    config: &BashConfig,
    command: &str,
    confirm_cb: Option<&ConfirmCallback>,
) -> Result<(), ToolError> {
    let words = command_words(command);
    if words.is_empty() {
        return Err(ToolError::new("Empty command"));
    }

    for word in &words {
        if config.blocked.iter().any(|b| b == word) {
            return Err(ToolError::new(format!(
                "Command '{word}' is blocked for security"
            )));
        }
    }

    if !config.allowed.is_empty() {
        for word in &words {
            if !config.allowed.iter().any(|a| a == word) {
                let shown: Vec<&str> =
                    config.allowed.iter().take(10).map(String::as_str).collect();
                return Err(ToolError::new(format!(
                    "Command '{word}' is not in allowed list. Allowed commands: {}...",
                    shown.join(", ")
                )));
            }
        }
    }

    let needs_confirm = command
        .split_whitespace()
        .find(|token| config.confirm.iter().any(|c| c == token));
    if let Some(word) = needs_confirm {
        match confirm_cb {
            Some(cb) => {
                let prompt = format!(
                    "Command requires confirmation: {command}\n\
                     This command may modify or delete files."
                );
                if !cb(&prompt) {
                    return Err(ToolError::new(format!(
                        "Command '{word}' was not confirmed by user"
                    )));
                }
            }
            None => {
                return Err(ToolError::new(format!(
                    "Command '{word}' requires confirmation but no confirmation handler is set. \
                     Command blocked for safety."
                )));
            }
        }
    }

    Ok(())
}

/// First token of each pipeline/chain segment. `ls -la | grep foo && rm x`
/// yields `ls`, `grep`, `rm`.
fn command_words(command: &str) -> Vec<String> {
    split_segments(command)
        .into_iter()
        .filter_map(|segment| segment.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// Split on `|`, `||`, `&&`, and `;`. A single `&` (background job) is not
/// a separator.
fn split_segments(command: &str) -> Vec<&str> {
    let bytes = command.as_bytes();
    let mut segments = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'|' => {
                segments.push(&command[start..i]);
                i += if bytes.get(i + 1) == Some(&b'|') { 2 } else { 1 };
                start = i;
            }
            b'&' if bytes.get(i + 1) == Some(&b'&') => {
                segments.push(&command[start..i]);
                i += 2;
                start = i;
            }
            b';' => {
                segments.push(&command[start..i]);
                i += 1;
                start = i;
            }
            _ => i += 1,
        }
    }
    segments.push(&command[start..]);
    segments
}
