use std::path::Path;
use std::time::Duration;

use serde_json::Value;
use tokio::time::timeout;
use tracing::{info, warn};

use super::ToolExecutor;
use crate::error::ToolError;

/// Git operations get their own short leash, independent of the bash timeout.
const GIT_TIMEOUT: Duration = Duration::from_secs(30);
/// Commit messages list at most this many changed files.
const MAX_FILES_IN_COMMIT: usize = 20;

/// Mark a phase done and, policy permitting, commit the working tree.
/// Git failures degrade to warnings in the result — a broken repo should
/// never stall the loop.
pub(crate) async fn phase_complete(exec: &ToolExecutor, input: &Value) -> Result<String, ToolError> {
    let phase_name = input["phase_name"]
        .as_str()
        .ok_or_else(|| ToolError::new("phase_complete: missing 'phase_name'"))?;
    let summary = input["summary"]
        .as_str()
        .ok_or_else(|| ToolError::new("phase_complete: missing 'summary'"))?;
    let verification = input["verification"].as_str().filter(|v| !v.is_empty());
    let tests_passed = input["tests_passed"].as_bool();
    let files_changed: Vec<&str> = input["files_changed"]
        .as_array()
        .map(|a| a.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let mut lines = vec![format!("Phase '{phase_name}' completed: {summary}")];

    if exec.git.require_verification && verification.is_none() {
        lines.push("Verification required but not provided - skipping commit".into());
        return Ok(lines.join("\n"));
    }

    if let Some(v) = verification {
        lines.push(format!("Verification: {v}"));
    }
    if let Some(passed) = tests_passed {
        lines.push(format!(
            "Tests: {}",
            if passed { "passed" } else { "failed" }
        ));
    }

    if !exec.git.auto_commit_on_phase {
        lines.push("\nAuto-commit disabled - changes not committed.".into());
        return Ok(lines.join("\n"));
    }

    match commit_phase(
        &exec.project_dir,
        &exec.git.commit_prefix,
        phase_name,
        summary,
        verification,
        &files_changed,
    )
    .await
    {
        Ok(Some(subject)) => {
            info!(phase = phase_name, "phase committed");
            lines.push(format!("\nCommitted: {subject}"));
        }
        Ok(None) => lines.push("\nNo uncommitted changes to commit.".into()),
        Err(e) => {
            warn!(phase = phase_name, error = %e, "phase commit failed");
            lines.push(format!("\nGit error: {e}"));
        }
    }

    Ok(lines.join("\n"))
}

/// Stage everything and commit. Returns the commit subject, or None when
/// the tree was clean.
async fn commit_phase(
    project_dir: &Path,
    prefix: &str,
    phase_name: &str,
    summary: &str,
    verification: Option<&str>,
    files_changed: &[&str],
) -> Result<Option<String>, ToolError> {
    let status = run_git(project_dir, &["status", "--porcelain"]).await?;
    if status.trim().is_empty() {
        return Ok(None);
    }

    run_git(project_dir, &["add", "-A"]).await?;

    let subject = format!("{prefix}({phase_name}): {summary}");
    let mut message = format!("{subject}\n\n");
    if let Some(v) = verification {
        message.push_str(&format!("Verification: {v}\n"));
    }
    if !files_changed.is_empty() {
        message.push_str("\nFiles changed:\n");
        for file in files_changed.iter().take(MAX_FILES_IN_COMMIT) {
            message.push_str(&format!("  - {file}\n"));
        }
        if files_changed.len() > MAX_FILES_IN_COMMIT {
            message.push_str(&format!(
                "  ... and {} more\n",
                files_changed.len() - MAX_FILES_IN_COMMIT
            ));
        }
    }

    run_git(project_dir, &["commit", "-m", &message]).await?;
    Ok(Some(subject))
}

async fn run_git(project_dir: &Path, args: &[&str]) -> Result<String, ToolError> {
    let fut = tokio::process::Command::new("git")
        .args(args)
        .current_dir(project_dir)
        .kill_on_drop(true)
        .output();

    let output = match timeout(GIT_TIMEOUT, fut).await {
        Ok(result) => result.map_err(|e| ToolError::new(format!("git not available: {e}")))?,
        Err(_) => return Err(ToolError::new("git operation timed out")),
    };

    if !output.status.success() {
        return Err(ToolError::new(format!(
            "git {} failed: {}",
            args.first().unwrap_or(&""),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Signaling tool: formats the completion report. The orchestrator reads
/// the signal from the tool name, not from this output.
pub(crate) fn task_complete(input: &Value) -> Result<String, ToolError> {
    let summary = input["summary"]
        .as_str()
        .ok_or_else(|| ToolError::new("task_complete: missing 'summary'"))?;

    let mut result = format!("Task completed: {summary}");
    if let Some(steps) = input["next_steps"].as_array() {
        let steps: Vec<String> = steps
            .iter()
            .filter_map(Value::as_str)
            .map(|s| format!("- {s}"))
            .collect();
        if !steps.is_empty() {
            result.push_str(&format!("\n\nSuggested next steps:\n{}", steps.join("\n")));
        }
    }
    Ok(result)
}

/// Signaling tool: formats the help request shown to the human.
pub(crate) fn request_help(input: &Value) -> Result<String, ToolError> {
    let question = input["question"]
        .as_str()
        .ok_or_else(|| ToolError::new("request_help: missing 'question'"))?;

    let mut result = format!("HELP REQUESTED: {question}");
    if let Some(context) = input["context"].as_str() {
        result.push_str(&format!("\n\nContext: {context}"));
    }
    if let Some(options) = input["options"].as_array() {
        let options: Vec<String> = options
            .iter()
            .filter_map(Value::as_str)
            .map(|o| format!("- {o}"))
            .collect();
        if !options.is_empty() {
            result.push_str(&format!("\n\nOptions:\n{}", options.join("\n")));
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BashConfig, GitConfig};
    use serde_json::json;

    fn executor(dir: &Path, git: GitConfig) -> ToolExecutor {
        ToolExecutor::new(dir, BashConfig::default(), git)
    }

    async fn init_repo(dir: &Path) {
        for args in [
            vec!["init"],
            vec!["config", "user.email", "agent@example.com"],
            vec!["config", "user.name", "Agent"],
        ] {
            let status = tokio::process::Command::new("git")
                .args(&args)
                .current_dir(dir)
                .output()
                .await
                .unwrap();
            assert!(status.status.success(), "git {args:?} failed");
        }
    }

    #[tokio::test]
    async fn missing_verification_skips_commit() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path(), GitConfig::default());

        let result = phase_complete(
            &exec,
            &json!({"phase_name": "setup", "summary": "did setup"}),
        )
        .await
        .unwrap();

        assert!(result.contains("Phase 'setup' completed: did setup"));
        assert!(result.contains("skipping commit"));
    }

    #[tokio::test]
    async fn auto_commit_disabled_reports_skip() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(
            dir.path(),
            GitConfig {
                auto_commit_on_phase: false,
                ..GitConfig::default()
            },
        );

        let result = phase_complete(
            &exec,
            &json!({
                "phase_name": "setup",
                "summary": "did setup",
                "verification": "tests pass"
            }),
        )
        .await
        .unwrap();

        assert!(result.contains("Verification: tests pass"));
        assert!(result.contains("Auto-commit disabled"));
    }

    #[tokio::test]
    async fn commits_uncommitted_changes() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path(), GitConfig::default());
        init_repo(exec.project_dir()).await;
        tokio::fs::write(exec.project_dir().join("new.txt"), "content")
            .await
            .unwrap();

        let result = phase_complete(
            &exec,
            &json!({
                "phase_name": "auth",
                "summary": "add login",
                "verification": "unit tests pass",
                "files_changed": ["new.txt"],
                "tests_passed": true
            }),
        )
        .await
        .unwrap();

        assert!(result.contains("Committed: feat(auth): add login"), "got: {result}");
        assert!(result.contains("Tests: passed"));

        let log = run_git(exec.project_dir(), &["log", "-1", "--format=%B"])
            .await
            .unwrap();
        assert!(log.contains("feat(auth): add login"));
        assert!(log.contains("Verification: unit tests pass"));
        assert!(log.contains("- new.txt"));
    }

    #[tokio::test]
    async fn clean_tree_commits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path(), GitConfig::default());
        init_repo(exec.project_dir()).await;

        let result = phase_complete(
            &exec,
            &json!({
                "phase_name": "noop",
                "summary": "nothing",
                "verification": "n/a"
            }),
        )
        .await
        .unwrap();

        assert!(result.contains("No uncommitted changes to commit."));
    }

    #[tokio::test]
    async fn custom_commit_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(
            dir.path(),
            GitConfig {
                commit_prefix: "chore".into(),
                ..GitConfig::default()
            },
        );
        init_repo(exec.project_dir()).await;
        tokio::fs::write(exec.project_dir().join("f.txt"), "x")
            .await
            .unwrap();

        let result = phase_complete(
            &exec,
            &json!({
                "phase_name": "deps",
                "summary": "bump versions",
                "verification": "build passes"
            }),
        )
        .await
        .unwrap();
        assert!(result.contains("Committed: chore(deps): bump versions"));
    }

    #[test]
    fn task_complete_formats_next_steps() {
        let result = task_complete(&json!({
            "summary": "all done",
            "next_steps": ["deploy", "monitor"]
        }))
        .unwrap();
        assert_eq!(
            result,
            "Task completed: all done\n\nSuggested next steps:\n- deploy\n- monitor"
        );
    }

    #[test]
    fn task_complete_requires_summary() {
        assert!(task_complete(&json!({})).is_err());
    }

    #[test]
    fn request_help_formats_options() {
        let result = request_help(&json!({
            "question": "Which database?",
            "context": "Two schemas found",
            "options": ["postgres", "sqlite"]
        }))
        .unwrap();
        assert!(result.starts_with("HELP REQUESTED: Which database?"));
        assert!(result.contains("Context: Two schemas found"));
        assert!(result.contains("- postgres\n- sqlite"));
    }
}
