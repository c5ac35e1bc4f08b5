pub mod checkpoint;
pub mod config;
pub mod context;
pub mod costs;
pub mod error;
pub mod events;
pub mod provider;
pub mod tools;
pub mod types;

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use checkpoint::{Checkpoint, CheckpointStore, HistoryEntry};
pub use config::{BashConfig, ExecutionConfig, GitConfig, OrchestratorConfig, ToolsConfig};
pub use context::ContextManager;
pub use costs::{CostSummary, CostThresholds, CostTracker, Pricing, ThresholdLevel};
pub use error::{AgentError, InferenceError, ToolError};
pub use events::OrchestratorEvent;
pub use provider::{AnthropicProvider, InferenceProvider};
pub use tools::ToolExecutor;
pub use types::{
    ContentBlock, InferenceRequest, InferenceResponse, StopReason, TokenUsage, ToolResultBlock,
};

use crate::checkpoint::Checkpoint as CheckpointRecord;
use crate::tools::{PHASE_COMPLETE, REQUEST_HELP, TASK_COMPLETE};

const KICKOFF_PROMPT: &str = "Please begin working on the task. Start by exploring the project \
     structure and understanding what needs to be done, then proceed with implementation.";

const CONTINUE_PROMPT: &str = "Are you finished with the task? If so, use the task_complete \
     tool. If not, continue working.";

const SUMMARY_PROMPT: &str = "Please provide a brief summary of what has been accomplished so \
     far, including key decisions and current state. This will be used to compress context.";

/// Recent conversation pairs kept verbatim through a summarization pass.
const KEEP_RECENT_PAIRS: usize = 6;

/// Synchronous hook for `request_help`: given the help request text, return
/// the human's answer, or None to suspend the run.
pub type HelpCallback = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// How a run ended. Only `Completed` means the task is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    CostLimit,
    NeedsHumanInput,
    MaxIterations,
    Cancelled,
}

impl RunStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, RunStatus::Completed)
    }
}

/// Result of one `run` invocation.
#[derive(Debug)]
pub struct RunReport {
    pub status: RunStatus,
    pub iterations: usize,
    pub usage: TokenUsage,
    pub total_cost: f64,
}

/// Point-in-time view for embedding surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub task: String,
    pub completed_tasks: usize,
    pub is_complete: bool,
    pub cost: CostSummary,
    pub context_usage: f32,
}

/// The control loop: prepares each turn from Context Manager state, calls
/// the model, dispatches tool uses sequentially, and enforces cost and
/// context budgets. Instantiable any number of times per process — all
/// state lives on the value.
pub struct Orchestrator {
    project_dir: PathBuf,
    config: OrchestratorConfig,
    model_id: String,
    provider: Box<dyn InferenceProvider>,
    tools: ToolExecutor,
    checkpoints: CheckpointStore,
    costs: CostTracker,

    context: Option<ContextManager>,
    usage: TokenUsage,
    task_description: String,
    completed_tasks: Vec<String>,
    current_phase: Option<String>,
    is_complete: bool,
    needs_human_input: bool,

    events: Option<UnboundedSender<OrchestratorEvent>>,
    on_help: Option<HelpCallback>,
}

impl Orchestrator {
    pub fn new(
        project_dir: impl Into<PathBuf>,
        config: OrchestratorConfig,
        provider: impl InferenceProvider + 'static,
    ) -> Self {
        let project_dir = project_dir.into();
        let model_id = costs::resolve_model_id(&config.model);
        let pricing = costs::pricing_with_overrides(&config.pricing);
        let tracker = CostTracker::new(config.costs, pricing);
        let tools = ToolExecutor::new(&project_dir, config.tools.bash.clone(), config.git.clone());
        let checkpoints = CheckpointStore::new(&project_dir);

        Self {
            project_dir,
            config,
            model_id,
            provider: Box::new(provider),
            tools,
            checkpoints,
            costs: tracker,
            context: None,
            usage: TokenUsage::default(),
            task_description: String::new(),
            completed_tasks: Vec::new(),
            current_phase: None,
            is_complete: false,
            needs_human_input: false,
            events: None,
            on_help: None,
        }
    }

    /// Attach an event stream. Cost threshold crossings are forwarded as
    /// events through the same channel.
    pub fn with_events(mut self, tx: UnboundedSender<OrchestratorEvent>) -> Self {
        let warn_tx = tx.clone();
        self.costs.set_warning_callback(move |cost| {
            let _ = warn_tx.send(OrchestratorEvent::CostWarning { cost });
        });
        let alert_tx = tx.clone();
        self.costs.set_alert_callback(move |cost| {
            let _ = alert_tx.send(OrchestratorEvent::CostAlert { cost });
        });
        self.events = Some(tx);
        self
    }

    /// Install the synchronous help handler consulted by `request_help`.
    pub fn with_help_handler(
        mut self,
        handler: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.on_help = Some(Box::new(handler));
        self
    }

    /// Install the synchronous confirmation handler for guarded shell
    /// commands.
    pub fn with_confirm_handler(
        mut self,
        handler: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.tools.set_confirm_callback(handler);
        self
    }

    fn emit(&self, event: OrchestratorEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn context_mut(&mut self) -> Result<&mut ContextManager, AgentError> {
        self.context.as_mut().ok_or(AgentError::NotInitialized)
    }

    /// Read-only view of the conversation, once initialized.
    pub fn context(&self) -> Option<&ContextManager> {
        self.context.as_ref()
    }

    pub fn completed_tasks(&self) -> &[String] {
        &self.completed_tasks
    }

    pub fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            task: self.task_description.clone(),
            completed_tasks: self.completed_tasks.len(),
            is_complete: self.is_complete,
            cost: self.costs.summary(),
            context_usage: self
                .context
                .as_ref()
                .map(|c| c.usage_fraction())
                .unwrap_or(0.0),
        }
    }

    /// Start a fresh session for the given task.
    pub async fn initialize(&mut self, task_description: impl Into<String>) {
        self.task_description = task_description.into();
        self.completed_tasks.clear();
        self.current_phase = None;
        self.is_complete = false;
        self.needs_human_input = false;
        self.usage = TokenUsage::default();

        let system = self.build_system_prompt().await;
        self.context = Some(ContextManager::new(
            system,
            self.config.max_context_tokens,
            self.config.checkpoint_threshold,
            self.config.summary_threshold,
        ));
    }

    /// Resume from the project's checkpoint. Returns false when there is
    /// nothing to resume from.
    pub async fn resume(&mut self) -> Result<bool, AgentError> {
        let Some(checkpoint) = self.checkpoints.load().await else {
            return Ok(false);
        };

        let context = ContextManager::from_snapshot(
            &checkpoint.context,
            self.config.max_context_tokens,
            self.config.checkpoint_threshold,
            self.config.summary_threshold,
        )?;

        self.usage = checkpoint.token_usage.clone();
        self.costs.set_initial_cost(checkpoint.total_cost);
        self.task_description = checkpoint.task_description.clone();
        self.completed_tasks = checkpoint.completed_tasks.clone();
        self.current_phase = checkpoint.current_phase.clone();
        self.is_complete = false;
        self.needs_human_input = false;
        self.context = Some(context);

        // The system prompt is recomposed, not restored, so it reflects the
        // current completed-task list and learnings.
        let system = self.build_system_prompt().await;
        self.context_mut()?.set_system_prompt(system);

        info!(
            task = %self.task_description,
            completed = self.completed_tasks.len(),
            cost = checkpoint.total_cost,
            "resumed from checkpoint"
        );
        Ok(true)
    }

    async fn build_system_prompt(&self) -> String {
        let learnings = self.checkpoints.load_learnings().await;

        let mut prompt = format!(
            "You are an expert software engineer working on a project.\n\
             \n\
             PROJECT DIRECTORY: {}\n\
             \n\
             TASK: {}\n\
             \n\
             INSTRUCTIONS:\n\
             1. Break down the task into phases (logical units of work)\n\
             2. For each phase:\n\
             \x20  a. Implement the changes\n\
             \x20  b. Verify it works (run tests, check syntax, manual verification)\n\
             \x20  c. Call phase_complete with summary and verification details\n\
             \x20  d. This will automatically commit the changes\n\
             3. If stuck or need clarification, use request_help tool\n\
             4. When ALL phases are done, use task_complete tool\n\
             \n\
             CONSTRAINTS:\n\
             - Only modify files within the project directory\n\
             - Follow existing code style and patterns\n\
             - Write tests for new functionality\n\
             - Keep changes minimal and focused\n",
            self.project_dir.display(),
            self.task_description,
        );

        if !learnings.is_empty() {
            let rendered = serde_json::to_string_pretty(&learnings).unwrap_or_default();
            prompt.push_str(&format!(
                "\nPROJECT LEARNINGS (from previous sessions):\n{rendered}\n"
            ));
        }

        if !self.completed_tasks.is_empty() {
            let done: Vec<String> = self
                .completed_tasks
                .iter()
                .map(|t| format!("- {t}"))
                .collect();
            prompt.push_str(&format!(
                "\nCOMPLETED SO FAR:\n{}\n\nContinue from where you left off.\n",
                done.join("\n")
            ));
        }

        prompt
    }

    /// Write a checkpoint tagged with the reason it was taken.
    pub async fn save_checkpoint(&mut self, reason: &str) -> Result<(), AgentError> {
        let context = self.context.as_ref().ok_or(AgentError::NotInitialized)?;
        let checkpoint = CheckpointRecord {
            version: 1,
            timestamp: chrono::Utc::now(),
            task_description: self.task_description.clone(),
            current_phase: self.current_phase.clone(),
            completed_tasks: self.completed_tasks.clone(),
            token_usage: self.usage.clone(),
            total_cost: self.costs.total_cost(),
            context: context.snapshot(),
            extra_state: json!({}),
        };
        self.checkpoints.save(&checkpoint, reason).await?;
        self.emit(OrchestratorEvent::CheckpointSaved {
            reason: reason.to_string(),
        });
        info!(reason, "checkpoint saved");
        Ok(())
    }

    /// Run until the task completes or a budget, suspension, or
    /// cancellation boundary is hit.
    pub async fn run(&mut self) -> Result<RunReport, AgentError> {
        self.run_guarded(None).await
    }

    pub async fn run_with_cancel(
        &mut self,
        cancel: CancellationToken,
    ) -> Result<RunReport, AgentError> {
        self.run_guarded(Some(cancel)).await
    }

    async fn run_guarded(
        &mut self,
        cancel: Option<CancellationToken>,
    ) -> Result<RunReport, AgentError> {
        match self.run_loop(cancel).await {
            Ok(report) => Ok(report),
            Err(e) => {
                // Best-effort final checkpoint before surfacing the error.
                if self.context.is_some() {
                    if let Err(save_err) = self.save_checkpoint("error").await {
                        warn!(error = %save_err, "could not save final checkpoint");
                    }
                }
                Err(e)
            }
        }
    }

    async fn run_loop(
        &mut self,
        cancel: Option<CancellationToken>,
    ) -> Result<RunReport, AgentError> {
        if self.context.is_none() {
            return Err(AgentError::NotInitialized);
        }

        self.context_mut()?.add_user_text(KICKOFF_PROMPT);

        let mut iterations = 0usize;
        loop {
            if iterations >= self.config.execution.max_iterations {
                warn!(
                    max_iterations = self.config.execution.max_iterations,
                    "iteration limit reached"
                );
                self.save_checkpoint("max_iterations").await?;
                return Ok(self.finish(RunStatus::MaxIterations, iterations));
            }
            iterations += 1;
            self.emit(OrchestratorEvent::TurnStart { turn: iterations });

            if let Some(token) = &cancel {
                if token.is_cancelled() {
                    info!(turn = iterations, "run cancelled");
                    self.save_checkpoint("cancelled").await?;
                    return Ok(self.finish(RunStatus::Cancelled, iterations));
                }
            }

            // Hard budget gate: never start a turn past the cost ceiling.
            if self.costs.should_stop() {
                warn!(cost = self.costs.total_cost(), "cost limit reached");
                self.save_checkpoint("cost_limit").await?;
                return Ok(self.finish(RunStatus::CostLimit, iterations));
            }

            self.handle_context_pressure().await?;

            let response = match self.call_model(cancel.as_ref()).await {
                Ok(Some(response)) => response,
                Ok(None) => {
                    info!(turn = iterations, "run cancelled during inference");
                    self.save_checkpoint("cancelled").await?;
                    return Ok(self.finish(RunStatus::Cancelled, iterations));
                }
                Err(e) => {
                    warn!(error = %e, "model call failed, retrying after cooldown");
                    tokio::time::sleep(Duration::from_secs(
                        self.config.execution.cooldown_on_error,
                    ))
                    .await;
                    continue;
                }
            };

            self.context_mut()?.add_assistant_blocks(&response.content);

            let mut tool_uses: Vec<(String, String, Value)> = Vec::new();
            for block in &response.content {
                match block {
                    ContentBlock::Text(text) => {
                        self.emit(OrchestratorEvent::Text {
                            content: text.clone(),
                        });
                    }
                    ContentBlock::ToolUse { id, name, input } => {
                        tool_uses.push((id.clone(), name.clone(), input.clone()));
                    }
                }
            }

            if response.stop_reason == StopReason::EndTurn && tool_uses.is_empty() {
                if self.is_complete {
                    info!(iterations, "task complete");
                    self.checkpoints.clear().await?;
                    return Ok(self.finish(RunStatus::Completed, iterations));
                }
                // Ended without tools but never declared done — nudge.
                self.context_mut()?.add_user_text(CONTINUE_PROMPT);
                continue;
            }

            if !tool_uses.is_empty() {
                let results = self.dispatch_tools(tool_uses).await;
                self.context_mut()?.add_tool_results(&results);

                if self.needs_human_input {
                    self.save_checkpoint("human_input_needed").await?;
                    return Ok(self.finish(RunStatus::NeedsHumanInput, iterations));
                }
            }
        }
    }

    async fn call_model(
        &mut self,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<InferenceResponse>, AgentError> {
        let request = {
            let context = self.context.as_ref().ok_or(AgentError::NotInitialized)?;
            InferenceRequest {
                model: self.model_id.clone(),
                max_tokens: self.config.max_tokens,
                system: Some(context.system_prompt().to_string()),
                tools: self.tools.definitions(),
                messages: context.messages(),
            }
        };

        let response = {
            let fut = self.provider.infer(request);
            tokio::pin!(fut);
            match cancel {
                Some(token) => tokio::select! {
                    result = &mut fut => result?,
                    _ = token.cancelled() => return Ok(None),
                },
                None => fut.await?,
            }
        };

        self.usage.add(&response.usage);
        self.costs.add_usage(
            &self.model_id,
            response.usage.input_tokens,
            response.usage.output_tokens,
        );
        Ok(Some(response))
    }

    /// Checkpoint and, past the summary threshold, spend a turn compressing
    /// old context. The compression response is not retained; the request
    /// message stays in the retained tail.
    async fn handle_context_pressure(&mut self) -> Result<(), AgentError> {
        let (should_checkpoint, should_summarize) = {
            let context = self.context.as_ref().ok_or(AgentError::NotInitialized)?;
            (context.should_checkpoint(), context.should_summarize())
        };

        if should_checkpoint {
            self.save_checkpoint("context_threshold").await?;
        }

        if should_summarize {
            let pre_tokens = self.context_mut()?.estimated_tokens();
            info!(pre_tokens, "context pressure - requesting summary");
            self.context_mut()?.add_user_text(SUMMARY_PROMPT);

            match self.call_model(None).await {
                Ok(Some(response)) => {
                    let summary = response.content.iter().find_map(|block| match block {
                        ContentBlock::Text(text) => Some(text.clone()),
                        _ => None,
                    });
                    if let Some(summary) = summary {
                        let context = self.context_mut()?;
                        context.summarize_old(&summary, KEEP_RECENT_PAIRS);
                        let post_tokens = context.estimated_tokens();
                        info!(pre_tokens, post_tokens, "context summarized");
                        self.emit(OrchestratorEvent::ContextSummarized {
                            pre_tokens,
                            post_tokens,
                        });
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "summarization call failed, continuing without it");
                }
            }
        }

        Ok(())
    }

    /// Execute tool uses sequentially in emitted order. Calls past the
    /// per-turn limit are dropped from the tail but still answered with
    /// error results so the id pairing invariant holds.
    async fn dispatch_tools(
        &mut self,
        mut tool_uses: Vec<(String, String, Value)>,
    ) -> Vec<ToolResultBlock> {
        let max_tools = self.config.execution.max_tool_calls_per_turn;
        let dropped = if tool_uses.len() > max_tools {
            warn!(
                requested = tool_uses.len(),
                max_tools, "limiting tool calls this turn"
            );
            tool_uses.split_off(max_tools)
        } else {
            Vec::new()
        };

        let mut results = Vec::with_capacity(tool_uses.len() + dropped.len());

        for (id, name, input) in tool_uses {
            self.emit(OrchestratorEvent::ToolStart {
                name: name.clone(),
                input: input.clone(),
            });

            let (mut content, is_error) = self.tools.execute(&name, &input).await;

            match name.as_str() {
                TASK_COMPLETE => {
                    self.is_complete = true;
                    let summary = input["summary"].as_str().unwrap_or("Task completed");
                    self.completed_tasks.push(summary.to_string());
                }
                PHASE_COMPLETE => {
                    if !is_error {
                        if let Some(phase) = input["phase_name"].as_str() {
                            let summary = input["summary"].as_str().unwrap_or("");
                            self.completed_tasks.push(format!("{phase}: {summary}"));
                            self.current_phase = Some(phase.to_string());
                        }
                    }
                }
                REQUEST_HELP => {
                    if !is_error {
                        self.needs_human_input = true;
                        self.emit(OrchestratorEvent::HelpRequested {
                            question: input["question"].as_str().unwrap_or("").to_string(),
                        });
                        if let Some(handler) = &self.on_help {
                            if let Some(answer) = handler(&content) {
                                content = format!("Human response: {answer}");
                                self.needs_human_input = false;
                            }
                        }
                    }
                }
                _ => {}
            }

            let preview: String = content.chars().take(200).collect();
            self.emit(OrchestratorEvent::ToolEnd {
                name: name.clone(),
                output: preview,
                is_error,
            });

            results.push(ToolResultBlock {
                tool_use_id: id,
                content,
                is_error,
            });
        }

        for (id, _name, _input) in dropped {
            results.push(ToolResultBlock {
                tool_use_id: id,
                content: format!(
                    "Tool call skipped: per-turn limit of {max_tools} tool calls exceeded"
                ),
                is_error: true,
            });
        }

        results
    }

    fn finish(&self, status: RunStatus, iterations: usize) -> RunReport {
        self.emit(OrchestratorEvent::Finished {
            complete: status.is_complete(),
            iterations,
        });
        RunReport {
            status,
            iterations,
            usage: self.usage.clone(),
            total_cost: self.costs.total_cost(),
        }
    }
}
