mod fs;
mod search;
mod shell;
mod workflow;

use std::path::{Component, Path, PathBuf};

use serde_json::{json, Value};
use tracing::debug;

use crate::config::{BashConfig, GitConfig};
use crate::error::ToolError;

pub use shell::check_policy;

/// Synchronous confirmation hook for commands on the confirm list.
pub type ConfirmCallback = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Names of tools the orchestrator interprets as signals rather than plain
/// side effects.
pub const TASK_COMPLETE: &str = "task_complete";
pub const PHASE_COMPLETE: &str = "phase_complete";
pub const REQUEST_HELP: &str = "request_help";

/// Executes the fixed tool catalog against a sandboxed project directory.
/// Every call returns `(content, is_error)`; recoverable failures become
/// error results for the model, never loop errors.
pub struct ToolExecutor {
    pub(crate) project_dir: PathBuf,
    pub(crate) bash: BashConfig,
    pub(crate) git: GitConfig,
    pub(crate) confirm: Option<ConfirmCallback>,
}

impl ToolExecutor {
    pub fn new(project_dir: impl Into<PathBuf>, bash: BashConfig, git: GitConfig) -> Self {
        let project_dir = project_dir.into();
        // Canonicalize once so descendant checks compare real paths.
        let project_dir = std::fs::canonicalize(&project_dir).unwrap_or(project_dir);
        Self {
            project_dir,
            bash,
            git,
            confirm: None,
        }
    }

    pub fn set_confirm_callback(&mut self, cb: impl Fn(&str) -> bool + Send + Sync + 'static) {
        self.confirm = Some(Box::new(cb));
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// Run one tool call. Never fails outward: errors are folded into the
    /// result pair so the model can observe and react.
    pub async fn execute(&self, name: &str, input: &Value) -> (String, bool) {
        debug!(tool = name, "executing tool");
        let result = match name {
            "read_file" => fs::read_file(self, input).await,
            "write_file" => fs::write_file(self, input).await,
            "edit_file" => fs::edit_file(self, input).await,
            "bash" => shell::bash(self, input).await,
            "glob" => search::glob(self, input).await,
            "grep" => search::grep(self, input).await,
            "list_dir" => fs::list_dir(self, input).await,
            PHASE_COMPLETE => workflow::phase_complete(self, input).await,
            TASK_COMPLETE => workflow::task_complete(input),
            REQUEST_HELP => workflow::request_help(input),
            other => Err(ToolError::new(format!("Unknown tool: {other}"))),
        };

        match result {
            Ok(content) => (content, false),
            Err(e) => (e.to_string(), true),
        }
    }

    /// Resolve a model-supplied path against the project root, following
    /// symlinks, and reject anything that escapes the sandbox before any
    /// side effect happens.
    pub(crate) fn resolve_path(&self, raw: &str) -> Result<PathBuf, ToolError> {
        let candidate = if Path::new(raw).is_absolute() {
            PathBuf::from(raw)
        } else {
            self.project_dir.join(raw)
        };

        let resolved = resolve_symlinks(&candidate);
        if !resolved.starts_with(&self.project_dir) {
            return Err(ToolError::new(format!(
                "Path '{raw}' is outside project directory"
            )));
        }
        Ok(resolved)
    }

    /// The tool catalog published to the model. Names and input-schema keys
    /// are part of the model contract.
    pub fn definitions(&self) -> Vec<Value> {
        vec![
            json!({
                "name": "read_file",
                "description": "Read contents of a file. Returns file content with line numbers.",
                "input_schema": {
                    "type": "object",
                    "properties": {
                        "path": {"type": "string", "description": "Path to file (relative to project root)"},
                        "offset": {"type": "integer", "description": "Line number to start reading from (1-indexed)"},
                        "limit": {"type": "integer", "description": "Maximum number of lines to read"}
                    },
                    "required": ["path"]
                }
            }),
            json!({
                "name": "write_file",
                "description": "Write content to a file. Creates parent directories if needed.",
                "input_schema": {
                    "type": "object",
                    "properties": {
                        "path": {"type": "string", "description": "Path to file (relative to project root)"},
                        "content": {"type": "string", "description": "Content to write"}
                    },
                    "required": ["path", "content"]
                }
            }),
            json!({
                "name": "edit_file",
                "description": "Replace a specific string in a file with new content.",
                "input_schema": {
                    "type": "object",
                    "properties": {
                        "path": {"type": "string", "description": "Path to file (relative to project root)"},
                        "old_string": {"type": "string", "description": "Exact string to find and replace"},
                        "new_string": {"type": "string", "description": "Replacement string"},
                        "replace_all": {"type": "boolean", "description": "Replace all occurrences (default: false)"}
                    },
                    "required": ["path", "old_string", "new_string"]
                }
            }),
            json!({
                "name": "bash",
                "description": "Execute a bash command. Use for git, npm, tests, etc.",
                "input_schema": {
                    "type": "object",
                    "properties": {
                        "command": {"type": "string", "description": "Command to execute"},
                        "timeout": {"type": "integer", "description": "Timeout in seconds (default: 120)"}
                    },
                    "required": ["command"]
                }
            }),
            json!({
                "name": "glob",
                "description": "Find files matching a glob pattern.",
                "input_schema": {
                    "type": "object",
                    "properties": {
                        "pattern": {"type": "string", "description": "Glob pattern (e.g., '**/*.ts', 'src/**/*.py')"},
                        "path": {"type": "string", "description": "Directory to search in (default: project root)"}
                    },
                    "required": ["pattern"]
                }
            }),
            json!({
                "name": "grep",
                "description": "Search file contents using regex.",
                "input_schema": {
                    "type": "object",
                    "properties": {
                        "pattern": {"type": "string", "description": "Regex pattern to search for"},
                        "path": {"type": "string", "description": "File or directory to search"},
                        "glob_filter": {"type": "string", "description": "Only search files matching this glob"},
                        "case_insensitive": {"type": "boolean", "description": "Case insensitive search"}
                    },
                    "required": ["pattern"]
                }
            }),
            json!({
                "name": "list_dir",
                "description": "List contents of a directory.",
                "input_schema": {
                    "type": "object",
                    "properties": {
                        "path": {"type": "string", "description": "Directory path (default: project root)"}
                    }
                }
            }),
            json!({
                "name": "phase_complete",
                "description": "Signal that a phase is complete and verified. Commits all changes with a descriptive message.",
                "input_schema": {
                    "type": "object",
                    "properties": {
                        "phase_name": {"type": "string", "description": "Name of the completed phase (e.g., 'authentication', 'api-endpoints')"},
                        "summary": {"type": "string", "description": "Brief summary of what was accomplished in this phase"},
                        "files_changed": {"type": "array", "items": {"type": "string"}, "description": "List of files created or modified"},
                        "tests_passed": {"type": "boolean", "description": "Whether tests were run and passed"},
                        "verification": {"type": "string", "description": "How the phase was verified (e.g., 'unit tests pass', 'manual testing', 'type check passes')"}
                    },
                    "required": ["phase_name", "summary", "verification"]
                }
            }),
            json!({
                "name": "task_complete",
                "description": "Signal that the entire task is complete (all phases done).",
                "input_schema": {
                    "type": "object",
                    "properties": {
                        "summary": {"type": "string", "description": "Brief summary of what was accomplished"},
                        "next_steps": {"type": "array", "items": {"type": "string"}, "description": "Suggested next steps (if any)"}
                    },
                    "required": ["summary"]
                }
            }),
            json!({
                "name": "request_help",
                "description": "Request human intervention when stuck or need clarification.",
                "input_schema": {
                    "type": "object",
                    "properties": {
                        "question": {"type": "string", "description": "What you need help with"},
                        "context": {"type": "string", "description": "Relevant context"},
                        "options": {"type": "array", "items": {"type": "string"}, "description": "Possible options if applicable"}
                    },
                    "required": ["question"]
                }
            }),
        ]
    }
}

/// Walk the path component by component, resolving symlinks as they are
/// encountered and applying `..` after resolution. Components past the
/// deepest existing ancestor are appended lexically — a path that does not
/// exist yet cannot contain symlinks.
fn resolve_symlinks(candidate: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => {
                out.push(other.as_os_str());
                if let Ok(meta) = std::fs::symlink_metadata(&out) {
                    if meta.file_type().is_symlink() {
                        if let Ok(canonical) = std::fs::canonicalize(&out) {
                            out = canonical;
                        }
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor(dir: &Path) -> ToolExecutor {
        ToolExecutor::new(dir, BashConfig::default(), GitConfig::default())
    }

    #[test]
    fn catalog_lists_all_tools_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let defs = executor(dir.path()).definitions();
        let names: Vec<&str> = defs.iter().filter_map(|d| d["name"].as_str()).collect();
        assert_eq!(
            names,
            vec![
                "read_file",
                "write_file",
                "edit_file",
                "bash",
                "glob",
                "grep",
                "list_dir",
                "phase_complete",
                "task_complete",
                "request_help",
            ]
        );
        for def in &defs {
            assert!(def["input_schema"]["type"] == "object", "schema for {}", def["name"]);
        }
    }

    #[test]
    fn resolves_relative_paths_inside_project() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let resolved = exec.resolve_path("src/main.rs").unwrap();
        assert!(resolved.starts_with(exec.project_dir()));
        assert!(resolved.ends_with("src/main.rs"));
    }

    #[test]
    fn rejects_parent_escape() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let err = exec.resolve_path("../../etc/passwd").unwrap_err();
        assert!(err.to_string().contains("outside project directory"));
    }

    #[test]
    fn rejects_absolute_escape() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let err = exec.resolve_path("/etc/passwd").unwrap_err();
        assert!(err.to_string().contains("outside project directory"));
    }

    #[test]
    fn rejects_escape_through_nonexistent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let err = exec.resolve_path("newdir/../../../etc/passwd").unwrap_err();
        assert!(err.to_string().contains("outside project directory"));
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlink_escape() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        std::os::unix::fs::symlink("/etc", exec.project_dir().join("link")).unwrap();

        let err = exec.resolve_path("link/passwd").unwrap_err();
        assert!(err.to_string().contains("outside project directory"));
    }

    #[test]
    fn accepts_absolute_path_inside_project() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let inside = exec.project_dir().join("a.txt");
        let resolved = exec.resolve_path(inside.to_str().unwrap()).unwrap();
        assert_eq!(resolved, inside);
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_result() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let (content, is_error) = exec.execute("teleport", &json!({})).await;
        assert!(is_error);
        assert!(content.contains("Unknown tool"));
    }

    #[tokio::test]
    async fn path_escape_surfaces_as_error_result() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let (content, is_error) = exec
            .execute("read_file", &json!({"path": "../../etc/passwd"}))
            .await;
        assert!(is_error);
        assert!(content.contains("outside project directory"));
    }
}
