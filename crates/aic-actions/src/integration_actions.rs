//! The three code-patching actions (`add_missing_call`, `add_null_check`,
//! `consolidate_duplicates`), ported from `actions_integration.py`. Unlike
//! the env/system actions, these mutate arbitrary source files, so each
//! handler carries enough of the previous file content in `rollback_data`
//! to restore it exactly.

use std::path::PathBuf;

use aic_protocol::{ActionKind, ActionParams, AicError};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::fs;
use tracing::{info, instrument};

use crate::{ActionHandler, Applied};

fn require_str(params: &ActionParams, key: &str) -> Result<String, AicError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| AicError::ActionFailed(format!("missing required param: {key}")))
}

fn require_u64(params: &ActionParams, key: &str) -> Result<u64, AicError> {
    params
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| AicError::ActionFailed(format!("missing required param: {key}")))
}

async fn read_file(path: &str) -> Result<String, AicError> {
    fs::read_to_string(path)
        .await
        .map_err(|e| AicError::ActionFailed(format!("reading {path}: {e}")))
}

async fn write_file(path: &str, content: &str) -> Result<(), AicError> {
    let tmp = format!("{path}.tmp");
    fs::write(&tmp, content)
        .await
        .map_err(|e| AicError::TransientStorage(format!("writing {tmp}: {e}")))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| AicError::TransientStorage(format!("renaming into {path}: {e}")))
}

/// Inserts `call_code` lines, indented to match the function body, right
/// after the function's signature line — a line-based stand-in for the
/// Python original's `ast`-based "first statement in the function" probe,
/// since there is no equivalent of Python's `ast` module here.
pub struct AddMissingCallHandler;

#[async_trait]
impl ActionHandler for AddMissingCallHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::AddMissingCall
    }

    #[instrument(skip(self, params))]
    async fn apply(&self, params: &ActionParams) -> Result<Applied, AicError> {
        let file = require_str(params, "file")?;
        let function = require_str(params, "function")?;
        let call_code: Vec<String> = params
            .get("call_code")
            .and_then(Value::as_array)
            .ok_or_else(|| AicError::ActionFailed("missing required param: call_code".to_owned()))?
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect();

        let original = read_file(&file).await?;
        let signature = format!("fn {function}");
        let lines: Vec<&str> = original.lines().collect();
        let Some(sig_idx) = lines.iter().position(|line| line.contains(&signature)) else {
            return Err(AicError::ActionFailed(format!("function {function} not found in {file}")));
        };

        let indent: String = lines
            .get(sig_idx + 1)
            .map(|line| line.chars().take_while(|c| c.is_whitespace()).collect())
            .unwrap_or_else(|| "    ".to_owned());

        let mut patched: Vec<String> = lines.iter().map(|s| s.to_string()).collect();
        let insert_at = sig_idx + 1;
        for (offset, line) in call_code.iter().enumerate() {
            patched.insert(insert_at + offset, format!("{indent}{line}"));
        }
        let mut rendered = patched.join("\n");
        rendered.push('\n');

        write_file(&file, &rendered).await?;
        Ok(Applied {
            action: ActionKind::AddMissingCall,
            rollback_data: json!({ "file": file, "original_content": original }),
        })
    }

    async fn rollback(&self, applied: &Applied) -> Result<(), AicError> {
        let file = applied
            .rollback_data
            .get("file")
            .and_then(Value::as_str)
            .ok_or_else(|| AicError::ActionFailed("rollback_data missing file".to_owned()))?;
        let original = applied
            .rollback_data
            .get("original_content")
            .and_then(Value::as_str)
            .ok_or_else(|| AicError::ActionFailed("rollback_data missing original_content".to_owned()))?;
        write_file(file, original).await
    }
}

/// Wraps `usage_line` in a `hasattr`-equivalent presence check, guarding a
/// field access behind a null check. Idempotent: the Python original skips
/// re-wrapping if the guard pattern already appears on the target line or
/// the line immediately before it, and this does exactly that with the
/// same pattern string.
pub struct AddNullCheckHandler;

impl AddNullCheckHandler {
    fn guard_pattern(component: &str) -> String {
        format!("if hasattr(self, '{component}') and self.{component}:")
    }
}

#[async_trait]
impl ActionHandler for AddNullCheckHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::AddNullCheck
    }

    #[instrument(skip(self, params))]
    async fn apply(&self, params: &ActionParams) -> Result<Applied, AicError> {
        let file = require_str(params, "file")?;
        let component = require_str(params, "component")?;
        let usage_line = require_u64(params, "usage_line")? as usize;

        let original = read_file(&file).await?;
        let lines: Vec<&str> = original.lines().collect();
        let idx = usage_line.checked_sub(1).ok_or_else(|| AicError::ActionFailed("usage_line must be >= 1".to_owned()))?;
        let Some(target_line) = lines.get(idx) else {
            return Err(AicError::ActionFailed(format!("usage_line {usage_line} out of range for {file}")));
        };

        let pattern = Self::guard_pattern(&component);
        let already_guarded = target_line.contains(&pattern)
            || idx.checked_sub(1).and_then(|prev| lines.get(prev)).is_some_and(|prev| prev.contains(&pattern));

        if already_guarded {
            info!(file, component, "null check already present, skipping");
            return Ok(Applied {
                action: ActionKind::AddNullCheck,
                rollback_data: json!({ "file": file, "no_op": true }),
            });
        }

        let indent: String = target_line.chars().take_while(|c| c.is_whitespace()).collect();
        let reindented = format!("    {target_line}");
        let mut patched: Vec<String> = lines.iter().map(|s| s.to_string()).collect();
        patched[idx] = reindented;
        patched.insert(idx, format!("{indent}{pattern}"));

        let mut rendered = patched.join("\n");
        rendered.push('\n');
        write_file(&file, &rendered).await?;

        Ok(Applied {
            action: ActionKind::AddNullCheck,
            rollback_data: json!({ "file": file, "original_content": original, "no_op": false }),
        })
    }

    async fn rollback(&self, applied: &Applied) -> Result<(), AicError> {
        if applied.rollback_data.get("no_op").and_then(Value::as_bool).unwrap_or(false) {
            return Ok(());
        }
        let file = applied
            .rollback_data
            .get("file")
            .and_then(Value::as_str)
            .ok_or_else(|| AicError::ActionFailed("rollback_data missing file".to_owned()))?;
        let original = applied
            .rollback_data
            .get("original_content")
            .and_then(Value::as_str)
            .ok_or_else(|| AicError::ActionFailed("rollback_data missing original_content".to_owned()))?;
        write_file(file, original).await
    }
}

/// Writes a markdown issue report instead of patching code, for findings
/// that need a human to design the fix (§6 "escalation" actions).
/// Mirrors the two report shapes in the Python original: an orphaned-queue
/// report (keyed by `channel`) and a duplicate-component report (keyed by
/// the first name in `components`).
pub struct ConsolidateDuplicatesHandler {
    issues_dir: PathBuf,
}

impl ConsolidateDuplicatesHandler {
    pub fn new(issues_dir: PathBuf) -> Self {
        Self { issues_dir }
    }

    fn report(params: &ActionParams) -> Result<(String, String), AicError> {
        if let Some(channel) = params.get("channel").and_then(Value::as_str) {
            let producer_file = params.get("producer_file").and_then(Value::as_str).unwrap_or("unknown");
            let evidence = params.get("evidence").and_then(Value::as_str).unwrap_or("");
            let name = format!("orphaned_queue_{channel}.md");
            let body = format!(
                "# Orphaned queue: {channel}\n\nProducer: {producer_file}\n\nEvidence:\n\n{evidence}\n"
            );
            Ok((name, body))
        } else if let Some(components) = params.get("components").and_then(Value::as_array) {
            let first = components
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| AicError::ActionFailed("components must be non-empty".to_owned()))?;
            let files = params.get("files").and_then(Value::as_array).cloned().unwrap_or_default();
            let responsibility = params.get("responsibility").and_then(Value::as_str).unwrap_or("");
            let name = format!("duplicate_{first}.md");
            let body = format!(
                "# Duplicate component: {first}\n\nFiles: {files:?}\n\nResponsibility: {responsibility}\n"
            );
            Ok((name, body))
        } else {
            Err(AicError::ActionFailed(
                "consolidate_duplicates requires either channel or components".to_owned(),
            ))
        }
    }
}

#[async_trait]
impl ActionHandler for ConsolidateDuplicatesHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::ConsolidateDuplicates
    }

    #[instrument(skip(self, params))]
    async fn apply(&self, params: &ActionParams) -> Result<Applied, AicError> {
        let (name, body) = Self::report(params)?;
        fs::create_dir_all(&self.issues_dir)
            .await
            .map_err(|e| AicError::TransientStorage(format!("creating {:?}: {e}", self.issues_dir)))?;
        let issue_file = self.issues_dir.join(&name);
        fs::write(&issue_file, body)
            .await
            .map_err(|e| AicError::TransientStorage(format!("writing {issue_file:?}: {e}")))?;
        Ok(Applied {
            action: ActionKind::ConsolidateDuplicates,
            rollback_data: json!({ "issue_file": issue_file.to_string_lossy() }),
        })
    }

    async fn rollback(&self, applied: &Applied) -> Result<(), AicError> {
        let issue_file = applied
            .rollback_data
            .get("issue_file")
            .and_then(Value::as_str)
            .ok_or_else(|| AicError::ActionFailed("rollback_data missing issue_file".to_owned()))?;
        match fs::remove_file(issue_file).await {
            Ok(()) | Err(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_null_check_skips_when_already_guarded() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("component.txt");
        let content = "line one\n    if hasattr(self, 'alert_manager') and self.alert_manager:\n    self.alert_manager.poll()\n";
        fs::write(&file, content).await.unwrap();

        let handler = AddNullCheckHandler;
        let mut params = ActionParams::new();
        params.insert("file".to_owned(), json!(file.to_str().unwrap()));
        params.insert("component".to_owned(), json!("alert_manager"));
        params.insert("usage_line".to_owned(), json!(3));

        let applied = handler.apply(&params).await.unwrap();
        assert_eq!(fs::read_to_string(&file).await.unwrap(), content);
        assert!(applied.rollback_data.get("no_op").and_then(Value::as_bool).unwrap());
    }

    #[tokio::test]
    async fn consolidate_duplicates_writes_orphaned_queue_report() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ConsolidateDuplicatesHandler::new(dir.path().join("issues"));
        let mut params = ActionParams::new();
        params.insert("channel".to_owned(), json!("telemetry.events"));
        params.insert("producer_file".to_owned(), json!("telemetry.rs"));
        params.insert("evidence".to_owned(), json!("no subscriber registered"));

        let applied = handler.apply(&params).await.unwrap();
        let issue_file = applied.rollback_data.get("issue_file").and_then(Value::as_str).unwrap().to_owned();
        assert!(fs::metadata(&issue_file).await.is_ok());

        handler.rollback(&applied).await.unwrap();
        assert!(fs::metadata(&issue_file).await.is_err());
    }
}
