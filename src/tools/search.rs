use std::path::Path;

use serde_json::Value;

use super::ToolExecutor;
use crate::error::ToolError;

/// Result caps keep tool output inside the context budget.
const MAX_GLOB_RESULTS: usize = 100;
const MAX_GREP_RESULTS: usize = 100;
const MAX_GREP_LINE_CHARS: usize = 200;

/// Extensions that are never worth grepping.
const BINARY_EXTENSIONS: &[&str] = &[
    "pyc", "so", "o", "a", "png", "jpg", "gif", "ico", "woff", "woff2", "ttf", "eot",
];

pub(crate) async fn glob(exec: &ToolExecutor, input: &Value) -> Result<String, ToolError> {
    let pattern_str = input["pattern"]
        .as_str()
        .ok_or_else(|| ToolError::new("glob: missing 'pattern'"))?;

    let search_dir = match input["path"].as_str() {
        Some(path) => exec.resolve_path(path)?,
        None => exec.project_dir.clone(),
    };
    if !search_dir.is_dir() {
        let display = input["path"].as_str().unwrap_or(".");
        return Err(ToolError::new(format!("Not a directory: {display}")));
    }

    let pattern = glob::Pattern::new(pattern_str)
        .map_err(|e| ToolError::new(format!("Invalid glob pattern: {e}")))?;
    // A bare file pattern matches names at any depth; a pattern with a
    // separator matches against the path relative to the search directory.
    let match_full_path = pattern_str.contains('/');

    let mut matches = Vec::new();
    for entry in ignore::WalkBuilder::new(&search_dir).build().flatten() {
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let path = entry.path();
        let matched = if match_full_path {
            path.strip_prefix(&search_dir)
                .map(|rel| pattern.matches_path(rel))
                .unwrap_or(false)
        } else {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| pattern.matches(n))
                .unwrap_or(false)
        };
        if matched {
            let rel = path.strip_prefix(&exec.project_dir).unwrap_or(path);
            matches.push(rel.display().to_string());
        }
    }

    if matches.is_empty() {
        return Ok(format!("No files matching '{pattern_str}'"));
    }

    matches.sort();
    if matches.len() > MAX_GLOB_RESULTS {
        let extra = matches.len() - MAX_GLOB_RESULTS;
        matches.truncate(MAX_GLOB_RESULTS);
        return Ok(format!(
            "{}\n\n[... {extra} more files]",
            matches.join("\n")
        ));
    }

    Ok(matches.join("\n"))
}

pub(crate) async fn grep(exec: &ToolExecutor, input: &Value) -> Result<String, ToolError> {
    let pattern_str = input["pattern"]
        .as_str()
        .ok_or_else(|| ToolError::new("grep: missing 'pattern'"))?;
    let case_insensitive = input["case_insensitive"].as_bool().unwrap_or(false);

    let regex = regex::RegexBuilder::new(pattern_str)
        .case_insensitive(case_insensitive)
        .build()
        .map_err(|e| ToolError::new(format!("Invalid regex: {e}")))?;

    let glob_filter = match input["glob_filter"].as_str() {
        Some(f) => Some(
            glob::Pattern::new(f)
                .map_err(|e| ToolError::new(format!("Invalid glob filter: {e}")))?,
        ),
        None => None,
    };

    let search_path = match input["path"].as_str() {
        Some(path) => exec.resolve_path(path)?,
        None => exec.project_dir.clone(),
    };

    let mut results = Vec::new();
    let mut files_searched = 0usize;

    if search_path.is_file() {
        search_file(exec, &search_path, &regex, &mut results, &mut files_searched);
    } else {
        for entry in ignore::WalkBuilder::new(&search_path).build().flatten() {
            if results.len() >= MAX_GREP_RESULTS {
                break;
            }
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            let path = entry.path();
            if let Some(filter) = &glob_filter {
                let name_matches = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| filter.matches(n))
                    .unwrap_or(false);
                if !name_matches {
                    continue;
                }
            }
            if is_binary(path) {
                continue;
            }
            search_file(exec, path, &regex, &mut results, &mut files_searched);
        }
    }

    if results.is_empty() {
        return Ok(format!(
            "No matches for '{pattern_str}' in {files_searched} files"
        ));
    }

    let mut output = results.join("\n");
    if results.len() >= MAX_GREP_RESULTS {
        output.push_str("\n\n[... results limited to 100 matches]");
    }
    Ok(output)
}

fn is_binary(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| BINARY_EXTENSIONS.contains(&ext))
}

fn search_file(
    exec: &ToolExecutor,
    path: &Path,
    regex: &regex::Regex,
    results: &mut Vec<String>,
    files_searched: &mut usize,
) {
    *files_searched += 1;

    let Ok(bytes) = std::fs::read(path) else {
        return;
    };
    let content = String::from_utf8_lossy(&bytes);
    let rel = path.strip_prefix(&exec.project_dir).unwrap_or(path);

    for (line_num, line) in content.lines().enumerate() {
        if regex.is_match(line) {
            let shown: String = line.chars().take(MAX_GREP_LINE_CHARS).collect();
            results.push(format!("{}:{}: {shown}", rel.display(), line_num + 1));
            if results.len() >= MAX_GREP_RESULTS {
                return;
            }
        }
    }
}
