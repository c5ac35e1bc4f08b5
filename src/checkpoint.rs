use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::error::AgentError;
use crate::types::TokenUsage;

/// Hidden subdirectory under the project root that holds all durable state.
const STATE_DIR: &str = ".autopilot";
const CHECKPOINT_FILE: &str = "checkpoint.json";
const HISTORY_FILE: &str = "history.jsonl";
const LEARNINGS_FILE: &str = "learnings.json";

/// Everything needed to resume a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub task_description: String,
    #[serde(default)]
    pub current_phase: Option<String>,
    #[serde(default)]
    pub completed_tasks: Vec<String>,
    pub token_usage: TokenUsage,
    pub total_cost: f64,
    pub context: Value,
    #[serde(default)]
    pub extra_state: Value,
}

/// One line of the append-only checkpoint journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    #[serde(default)]
    pub phase: Option<String>,
    pub tasks_completed: usize,
    pub cost: f64,
    pub tokens: u64,
}

/// Persists run state under `<project>/.autopilot/`. The checkpoint file is
/// written atomically (tmp + rename) so readers never observe a partial
/// document; history is append-only; learnings merge last-writer-wins.
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(project_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: project_dir.as_ref().join(STATE_DIR),
        }
    }

    fn checkpoint_path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_FILE)
    }

    /// Write the checkpoint atomically and append a history entry tagged
    /// with the checkpoint reason.
    pub async fn save(&self, checkpoint: &Checkpoint, action: &str) -> Result<(), AgentError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| AgentError::Checkpoint(e.to_string()))?;

        let json = serde_json::to_string_pretty(checkpoint)
            .map_err(|e| AgentError::Checkpoint(e.to_string()))?;

        let tmp = self.dir.join(format!("{CHECKPOINT_FILE}.tmp"));
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| AgentError::Checkpoint(e.to_string()))?;
        tokio::fs::rename(&tmp, self.checkpoint_path())
            .await
            .map_err(|e| AgentError::Checkpoint(e.to_string()))?;

        let entry = HistoryEntry {
            timestamp: checkpoint.timestamp,
            action: action.to_string(),
            phase: checkpoint.current_phase.clone(),
            tasks_completed: checkpoint.completed_tasks.len(),
            cost: checkpoint.total_cost,
            tokens: checkpoint.token_usage.total(),
        };
        self.append_history(&entry).await
    }

    async fn append_history(&self, entry: &HistoryEntry) -> Result<(), AgentError> {
        let mut line = serde_json::to_string(entry)
            .map_err(|e| AgentError::Checkpoint(e.to_string()))?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(HISTORY_FILE))
            .await
            .map_err(|e| AgentError::Checkpoint(e.to_string()))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| AgentError::Checkpoint(e.to_string()))?;
        Ok(())
    }

    /// Load the latest checkpoint. A missing or corrupted file is treated
    /// as "no checkpoint" — a warning, never a crash.
    pub async fn load(&self) -> Option<Checkpoint> {
        let path = self.checkpoint_path();
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read checkpoint");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(checkpoint) => Some(checkpoint),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not parse checkpoint");
                None
            }
        }
    }

    /// Archive the checkpoint on terminal success. The file is renamed to a
    /// timestamped `completed-*.json`, not deleted.
    pub async fn clear(&self) -> Result<(), AgentError> {
        let path = self.checkpoint_path();
        if tokio::fs::try_exists(&path)
            .await
            .map_err(|e| AgentError::Checkpoint(e.to_string()))?
        {
            let archived = self
                .dir
                .join(format!("completed-{}.json", Utc::now().format("%Y%m%d-%H%M%S")));
            tokio::fs::rename(&path, archived)
                .await
                .map_err(|e| AgentError::Checkpoint(e.to_string()))?;
        }
        Ok(())
    }

    /// Merge learnings into the store, last-writer-wins per top-level key.
    /// Values are overwritten wholesale — no deep merge.
    pub async fn save_learnings(&self, learnings: &Map<String, Value>) -> Result<(), AgentError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| AgentError::Checkpoint(e.to_string()))?;

        let mut existing = self.load_learnings().await;
        for (key, value) in learnings {
            existing.insert(key.clone(), value.clone());
        }
        existing.insert(
            "last_updated".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );

        let json = serde_json::to_string_pretty(&existing)
            .map_err(|e| AgentError::Checkpoint(e.to_string()))?;
        tokio::fs::write(self.dir.join(LEARNINGS_FILE), json)
            .await
            .map_err(|e| AgentError::Checkpoint(e.to_string()))?;
        Ok(())
    }

    /// Load learnings; missing or corrupted files yield an empty map.
    pub async fn load_learnings(&self) -> Map<String, Value> {
        let raw = match tokio::fs::read_to_string(self.dir.join(LEARNINGS_FILE)).await {
            Ok(raw) => raw,
            Err(_) => return Map::new(),
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => map,
            _ => {
                warn!("could not parse learnings, starting fresh");
                Map::new()
            }
        }
    }

    /// Most recent history entries, oldest first. Unparseable lines are
    /// skipped.
    pub async fn history(&self, limit: usize) -> Vec<HistoryEntry> {
        let raw = match tokio::fs::read_to_string(self.dir.join(HISTORY_FILE)).await {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };

        let entries: Vec<HistoryEntry> = raw
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();

        let skip = entries.len().saturating_sub(limit);
        entries.into_iter().skip(skip).collect()
    }
}
