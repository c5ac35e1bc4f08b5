use serde_json::Value;

use super::ToolExecutor;
use crate::error::ToolError;

/// Per-line display cap for read_file.
const MAX_LINE_CHARS: usize = 2000;
/// Default window when the model gives no limit.
const DEFAULT_READ_LIMIT: usize = 2000;

pub(crate) async fn read_file(exec: &ToolExecutor, input: &Value) -> Result<String, ToolError> {
    let path = input["path"]
        .as_str()
        .ok_or_else(|| ToolError::new("read_file: missing 'path'"))?;
    let offset = input["offset"].as_u64().unwrap_or(1).max(1) as usize;
    let limit = input["limit"].as_u64().unwrap_or(DEFAULT_READ_LIMIT as u64) as usize;

    let file_path = exec.resolve_path(path)?;
    let meta = tokio::fs::metadata(&file_path)
        .await
        .map_err(|_| ToolError::new(format!("File not found: {path}")))?;
    if !meta.is_file() {
        return Err(ToolError::new(format!("Not a file: {path}")));
    }

    let bytes = tokio::fs::read(&file_path)
        .await
        .map_err(|e| ToolError::new(format!("Cannot read file: {e}")))?;
    let content = String::from_utf8_lossy(&bytes);

    let lines: Vec<&str> = content.lines().collect();
    let total = lines.len();

    let start = (offset - 1).min(total);
    let end = (start + limit).min(total);

    let mut numbered = Vec::with_capacity(end - start);
    for (i, line) in lines[start..end].iter().enumerate() {
        let line = if line.chars().count() > MAX_LINE_CHARS {
            let truncated: String = line.chars().take(MAX_LINE_CHARS).collect();
            format!("{truncated}... [truncated]")
        } else {
            (*line).to_string()
        };
        numbered.push(format!("{:6}\t{}", start + i + 1, line));
    }

    let mut result = numbered.join("\n");
    if end < total {
        result.push_str(&format!("\n\n[... {} more lines]", total - end));
    }

    Ok(result)
}

pub(crate) async fn write_file(exec: &ToolExecutor, input: &Value) -> Result<String, ToolError> {
    let path = input["path"]
        .as_str()
        .ok_or_else(|| ToolError::new("write_file: missing 'path'"))?;
    let content = input["content"]
        .as_str()
        .ok_or_else(|| ToolError::new("write_file: missing 'content'"))?;

    let file_path = exec.resolve_path(path)?;
    if let Some(parent) = file_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ToolError::new(format!("Cannot create directories: {e}")))?;
    }

    tokio::fs::write(&file_path, content)
        .await
        .map_err(|e| ToolError::new(format!("Cannot write file: {e}")))?;

    Ok(format!(
        "Successfully wrote {} bytes to {path}",
        content.len()
    ))
}

pub(crate) async fn edit_file(exec: &ToolExecutor, input: &Value) -> Result<String, ToolError> {
    let path = input["path"]
        .as_str()
        .ok_or_else(|| ToolError::new("edit_file: missing 'path'"))?;
    let old_string = input["old_string"]
        .as_str()
        .ok_or_else(|| ToolError::new("edit_file: missing 'old_string'"))?;
    let new_string = input["new_string"]
        .as_str()
        .ok_or_else(|| ToolError::new("edit_file: missing 'new_string'"))?;
    let replace_all = input["replace_all"].as_bool().unwrap_or(false);

    let file_path = exec.resolve_path(path)?;
    if !file_path.is_file() {
        return Err(ToolError::new(format!("File not found: {path}")));
    }

    let content = tokio::fs::read_to_string(&file_path)
        .await
        .map_err(|e| ToolError::new(format!("Cannot read file: {e}")))?;

    let count = content.matches(old_string).count();
    if count == 0 {
        let preview: String = old_string.chars().take(100).collect();
        return Err(ToolError::new(format!(
            "String not found in file: {preview}..."
        )));
    }
    // The ambiguity rule: an unqualified edit must match exactly once, so
    // the caller is forced to add context rather than guess.
    if !replace_all && count > 1 {
        return Err(ToolError::new(format!(
            "String appears {count} times. Use replace_all=true or provide more context."
        )));
    }

    let (new_content, replaced) = if replace_all {
        (content.replace(old_string, new_string), count)
    } else {
        (content.replacen(old_string, new_string, 1), 1)
    };

    tokio::fs::write(&file_path, new_content)
        .await
        .map_err(|e| ToolError::new(format!("Cannot write file: {e}")))?;

    Ok(format!("Replaced {replaced} occurrence(s) in {path}"))
}

pub(crate) async fn list_dir(exec: &ToolExecutor, input: &Value) -> Result<String, ToolError> {
    let dir_path = match input["path"].as_str() {
        Some(path) => exec.resolve_path(path)?,
        None => exec.project_dir.clone(),
    };
    let display = input["path"].as_str().unwrap_or(".");

    let meta = tokio::fs::metadata(&dir_path)
        .await
        .map_err(|_| ToolError::new(format!("Directory not found: {display}")))?;
    if !meta.is_dir() {
        return Err(ToolError::new(format!("Not a directory: {display}")));
    }

    let mut reader = tokio::fs::read_dir(&dir_path)
        .await
        .map_err(|e| ToolError::new(format!("Cannot list directory: {e}")))?;

    let mut entries = Vec::new();
    while let Some(entry) = reader
        .next_entry()
        .await
        .map_err(|e| ToolError::new(format!("Cannot list directory: {e}")))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue; // hidden entries stay hidden, including .autopilot
        }
        let meta = entry
            .metadata()
            .await
            .map_err(|e| ToolError::new(format!("Cannot stat entry: {e}")))?;
        if meta.is_dir() {
            entries.push(format!("{name}/"));
        } else {
            entries.push(format!("{name} ({} bytes)", meta.len()));
        }
    }

    entries.sort();
    if entries.is_empty() {
        return Ok("[empty directory]".into());
    }
    Ok(entries.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BashConfig, GitConfig};
    use serde_json::json;

    fn executor(dir: &std::path::Path) -> ToolExecutor {
        ToolExecutor::new(dir, BashConfig::default(), GitConfig::default())
    }

    #[tokio::test]
    async fn write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());

        let result = write_file(&exec, &json!({"path": "a.txt", "content": "hello\n"}))
            .await
            .unwrap();
        assert_eq!(result, "Successfully wrote 6 bytes to a.txt");

        let result = read_file(&exec, &json!({"path": "a.txt"})).await.unwrap();
        assert!(result.starts_with("     1\thello"), "got: {result:?}");
    }

    #[tokio::test]
    async fn read_applies_offset_and_limit() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());

        let content: String = (1..=10).map(|i| format!("line {i}\n")).collect();
        write_file(&exec, &json!({"path": "b.txt", "content": content}))
            .await
            .unwrap();

        let result = read_file(&exec, &json!({"path": "b.txt", "offset": 3, "limit": 2}))
            .await
            .unwrap();
        assert!(result.contains("     3\tline 3"));
        assert!(result.contains("     4\tline 4"));
        assert!(!result.contains("line 5\n"));
        assert!(result.ends_with("[... 6 more lines]"));
    }

    #[tokio::test]
    async fn read_truncates_very_long_lines() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());

        let long = "x".repeat(3000);
        write_file(&exec, &json!({"path": "long.txt", "content": long}))
            .await
            .unwrap();

        let result = read_file(&exec, &json!({"path": "long.txt"})).await.unwrap();
        assert!(result.contains("... [truncated]"));
        assert!(!result.contains(&"x".repeat(2001)));
    }

    #[tokio::test]
    async fn read_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let err = read_file(&exec, &json!({"path": "nope.txt"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("File not found"));
    }

    #[tokio::test]
    async fn read_directory_errors() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        tokio::fs::create_dir(exec.project_dir().join("sub"))
            .await
            .unwrap();
        let err = read_file(&exec, &json!({"path": "sub"})).await.unwrap_err();
        assert!(err.to_string().contains("Not a file"));
    }

    #[tokio::test]
    async fn write_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        write_file(&exec, &json!({"path": "deep/nested/f.txt", "content": "x"}))
            .await
            .unwrap();
        assert!(exec.project_dir().join("deep/nested/f.txt").is_file());
    }

    #[tokio::test]
    async fn edit_replaces_unique_match() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        write_file(&exec, &json!({"path": "x.py", "content": "x = 1\ny = 2\n"}))
            .await
            .unwrap();

        let result = edit_file(
            &exec,
            &json!({"path": "x.py", "old_string": "x = 1", "new_string": "x = 3"}),
        )
        .await
        .unwrap();
        assert_eq!(result, "Replaced 1 occurrence(s) in x.py");

        let content = std::fs::read_to_string(exec.project_dir().join("x.py")).unwrap();
        assert_eq!(content, "x = 3\ny = 2\n");
    }

    #[tokio::test]
    async fn ambiguous_edit_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let original = "x = 1\nx = 1\n";
        write_file(&exec, &json!({"path": "x.py", "content": original}))
            .await
            .unwrap();

        let err = edit_file(
            &exec,
            &json!({"path": "x.py", "old_string": "x = 1", "new_string": "x = 2"}),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("appears 2 times"));

        let content = std::fs::read_to_string(exec.project_dir().join("x.py")).unwrap();
        assert_eq!(content, original, "file must be byte-identical");
    }

    #[tokio::test]
    async fn replace_all_replaces_every_occurrence() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        write_file(&exec, &json!({"path": "x.py", "content": "a\na\na\n"}))
            .await
            .unwrap();

        let result = edit_file(
            &exec,
            &json!({"path": "x.py", "old_string": "a", "new_string": "b", "replace_all": true}),
        )
        .await
        .unwrap();
        assert_eq!(result, "Replaced 3 occurrence(s) in x.py");

        let content = std::fs::read_to_string(exec.project_dir().join("x.py")).unwrap();
        assert_eq!(content, "b\nb\nb\n");
    }

    #[tokio::test]
    async fn edit_missing_string_errors() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        write_file(&exec, &json!({"path": "x.py", "content": "x = 1\n"}))
            .await
            .unwrap();

        let err = edit_file(
            &exec,
            &json!({"path": "x.py", "old_string": "absent", "new_string": "y"}),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("String not found"));
    }

    #[tokio::test]
    async fn list_dir_formats_entries() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        tokio::fs::create_dir(exec.project_dir().join("src"))
            .await
            .unwrap();
        write_file(&exec, &json!({"path": "a.txt", "content": "hi"}))
            .await
            .unwrap();
        tokio::fs::write(exec.project_dir().join(".hidden"), "x")
            .await
            .unwrap();

        let result = list_dir(&exec, &json!({})).await.unwrap();
        assert_eq!(result, "a.txt (2 bytes)\nsrc/");
    }

    #[tokio::test]
    async fn list_dir_on_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        write_file(&exec, &json!({"path": "a.txt", "content": "hi"}))
            .await
            .unwrap();
        let err = list_dir(&exec, &json!({"path": "a.txt"})).await.unwrap_err();
        assert!(err.to_string().contains("Not a directory"));
    }

    #[tokio::test]
    async fn list_dir_empty() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let result = list_dir(&exec, &json!({})).await.unwrap();
        assert_eq!(result, "[empty directory]");
    }
}
