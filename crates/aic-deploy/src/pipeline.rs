use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use aic_protocol::{
    AicError, AicResult, DeploymentResult, ImprovementProposal, ValidationOutcome,
};
use aic_sandbox::{SandboxLimits, SandboxRequest, SandboxRunner};
use tokio::sync::Mutex;
use tracing::{instrument, warn};

use crate::history::{self, DeploymentHistoryEntry};
use crate::plan::{self, validation_timeout_secs};

/// Deployment lock keyed by repo root — two deployments touching the same
/// working tree must never backup/apply/rollback concurrently. Mirrors the
/// per-path lock in `aic_protocol::storage`.
fn root_locks() -> &'static Mutex<HashMap<PathBuf, Arc<Mutex<()>>>> {
    static LOCKS: OnceLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();
    LOCKS.get_or_init(|| Mutex::new(HashMap::new()))
}

async fn lock_for_root(root: &Path) -> Arc<Mutex<()>> {
    let mut locks = root_locks().lock().await;
    locks
        .entry(root.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// Rewrites an env-style `KEY=value` file in place: `apply_map` updates
/// existing keys, `params` appends keys absent from the file under a
/// timestamped comment. Ported from `_deploy_configuration_changes`'s exact
/// "UPDATED k: old → new" / "ADDED k=v" change-log strings.
pub async fn apply_configuration(
    env_path: &Path,
    apply_map: &indexmap::IndexMap<String, String>,
    params: &indexmap::IndexMap<String, serde_json::Value>,
) -> AicResult<Vec<String>> {
    let existing = tokio::fs::read_to_string(env_path).await.unwrap_or_default();
    let mut lines: Vec<String> = existing.lines().map(str::to_owned).collect();
    let mut changes = Vec::new();

    for (key, new_value) in apply_map {
        let prefix = format!("{key}=");
        if let Some(line) = lines.iter_mut().find(|l| l.starts_with(&prefix)) {
            let old_value = line[prefix.len()..].to_owned();
            if old_value != *new_value {
                changes.push(format!("UPDATED {key}: {old_value} → {new_value}"));
                *line = format!("{key}={new_value}");
            }
        }
    }

    let mut new_vars = Vec::new();
    for (key, value) in params {
        let prefix = format!("{key}=");
        if lines.iter().any(|l| l.starts_with(&prefix)) {
            continue;
        }
        let value_str = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        new_vars.push(format!("{key}={value_str}"));
        changes.push(format!("ADDED {key}={value_str}"));
    }

    if !new_vars.is_empty() {
        lines.push(format!("# KLoROS autoconfig update ({})", chrono::Utc::now().to_rfc3339()));
        lines.extend(new_vars);
    }

    if !changes.is_empty() {
        if let Some(parent) = env_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AicError::TransientStorage(format!("creating {parent:?}: {e}")))?;
        }
        let mut content = lines.join("\n");
        content.push('\n');
        write_atomic(env_path, content.as_bytes()).await?;
    }

    Ok(changes)
}

/// Write-to-temp, fsync, rename-into-place, per §4.4 step 4. Leaves the
/// target file untouched if any step fails.
async fn write_atomic(path: &Path, content: &[u8]) -> AicResult<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = parent.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("env")
    ));

    let mut file = tokio::fs::File::create(&tmp)
        .await
        .map_err(|e| AicError::TransientStorage(format!("creating {tmp:?}: {e}")))?;
    tokio::io::AsyncWriteExt::write_all(&mut file, content)
        .await
        .map_err(|e| AicError::TransientStorage(format!("writing {tmp:?}: {e}")))?;
    file.sync_all()
        .await
        .map_err(|e| AicError::TransientStorage(format!("fsyncing {tmp:?}: {e}")))?;
    drop(file);

    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| AicError::TransientStorage(format!("renaming {tmp:?} into {path:?}: {e}")))
}

/// Two-stage guard against a proposal that describes a change without
/// actually producing one, ported from `deploy_improvement`'s post-hoc
/// check on `changes_applied`.
fn check_anti_fabrication(changes: &[String]) -> AicResult<()> {
    if changes.is_empty() {
        return Err(AicError::ActionFailed(
            "No changes to deploy - improvement missing implementation".to_owned(),
        ));
    }
    let all_real_edits = changes.iter().all(|c| c.starts_with("UPDATED") || c.starts_with("ADDED"));
    if !all_real_edits {
        return Err(AicError::ActionFailed(
            "ANTI-FABRICATION: Deployment returned descriptions instead of file modifications".to_owned(),
        ));
    }
    Ok(())
}

fn copy_dir_recursive<'a>(
    src: &'a Path,
    dest: &'a Path,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = AicResult<()>> + Send + 'a>> {
    Box::pin(async move {
        tokio::fs::create_dir_all(dest)
            .await
            .map_err(|e| AicError::TransientStorage(format!("creating {dest:?}: {e}")))?;
        let mut entries = tokio::fs::read_dir(src)
            .await
            .map_err(|e| AicError::TransientStorage(format!("reading {src:?}: {e}")))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AicError::TransientStorage(format!("reading {src:?}: {e}")))?
        {
            let from = entry.path();
            let to = dest.join(entry.file_name());
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| AicError::TransientStorage(format!("stat {from:?}: {e}")))?;
            if file_type.is_dir() {
                copy_dir_recursive(&from, &to).await?;
            } else {
                tokio::fs::copy(&from, &to)
                    .await
                    .map_err(|e| AicError::TransientStorage(format!("copying {from:?}: {e}")))?;
            }
        }
        Ok(())
    })
}

async fn backup_targets(
    root: &Path,
    backup_root: &Path,
    improvement_id: &str,
    target_files: &[String],
) -> AicResult<Option<PathBuf>> {
    if target_files.is_empty() {
        return Ok(None);
    }
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%3f");
    let backup_dir = backup_root.join(format!("{improvement_id}-{stamp}"));
    tokio::fs::create_dir_all(&backup_dir)
        .await
        .map_err(|e| AicError::TransientStorage(format!("creating {backup_dir:?}: {e}")))?;

    for target in target_files {
        let source = root.join(target);
        if !source.exists() {
            warn!(target, "backup target missing, skipping");
            continue;
        }
        let dest = backup_dir.join(target);
        if source.is_dir() {
            copy_dir_recursive(&source, &dest).await?;
        } else {
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| AicError::TransientStorage(format!("creating {parent:?}: {e}")))?;
            }
            tokio::fs::copy(&source, &dest)
                .await
                .map_err(|e| AicError::TransientStorage(format!("backing up {source:?}: {e}")))?;
        }
    }
    Ok(Some(backup_dir))
}

async fn restore_targets(root: &Path, backup_dir: &Path, target_files: &[String]) -> AicResult<()> {
    for target in target_files {
        let backup_path = backup_dir.join(target);
        if !backup_path.exists() {
            continue;
        }
        let dest = root.join(target);
        if backup_path.is_dir() {
            if dest.exists() {
                tokio::fs::remove_dir_all(&dest)
                    .await
                    .map_err(|e| AicError::TransientStorage(format!("clearing {dest:?}: {e}")))?;
            }
            copy_dir_recursive(&backup_path, &dest).await?;
        } else {
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| AicError::TransientStorage(format!("creating {parent:?}: {e}")))?;
            }
            tokio::fs::copy(&backup_path, &dest)
                .await
                .map_err(|e| AicError::TransientStorage(format!("restoring {dest:?}: {e}")))?;
        }
    }
    Ok(())
}

/// Orchestrates plan → backup → apply → anti-fabrication guard → validate →
/// rollback-on-failure → history log, for one approved improvement, against
/// one working tree (`root`). Ported from `deployment_pipeline.py`'s
/// `deploy_improvement`.
pub struct DeploymentPipeline {
    root: PathBuf,
    backup_root: PathBuf,
    history_file: PathBuf,
    sandbox: Arc<dyn SandboxRunner>,
}

impl DeploymentPipeline {
    pub fn new(root: PathBuf, backup_root: PathBuf, history_file: PathBuf, sandbox: Arc<dyn SandboxRunner>) -> Self {
        Self { root, backup_root, history_file, sandbox }
    }

    #[instrument(skip(self, improvement), fields(improvement_id = %improvement.task_id))]
    pub async fn deploy(
        &self,
        improvement: &ImprovementProposal,
        env_target_file: &Path,
    ) -> AicResult<DeploymentResult> {
        let _guard = lock_for_root(&self.root).await.lock_owned().await;

        let recommendations = improvement
            .parameter_recommendations
            .as_ref()
            .ok_or_else(|| AicError::IngestionRejected("Improvement missing implementation data".to_owned()))?;

        let plan = plan::plan(improvement, env_target_file);
        let abs_env_path = self.root.join(env_target_file);

        let backup_path = backup_targets(&self.root, &self.backup_root, &improvement.task_id, &plan.target_files).await?;

        let changes = apply_configuration(&abs_env_path, &recommendations.apply_map, &recommendations.params).await?;

        if let Err(err) = check_anti_fabrication(&changes) {
            if let Some(backup_dir) = &backup_path {
                restore_targets(&self.root, backup_dir, &plan.target_files).await?;
            }
            let result = DeploymentResult {
                success: false,
                deployed_at: chrono::Utc::now().to_rfc3339(),
                backup_path: backup_path.map(|p| p.display().to_string()),
                changes_applied: changes,
                validation_results: vec![],
                error_message: Some(err.to_string()),
                rollback_performed: true,
            };
            self.log(improvement, &plan.improvement_type, result.clone()).await?;
            return Ok(result);
        }

        let mut validation_results = Vec::with_capacity(plan.validation_commands.len());
        let mut all_passed = true;
        for command in &plan.validation_commands {
            let timeout_secs = validation_timeout_secs(command);
            let request = SandboxRequest {
                command: "sh".to_owned(),
                args: vec!["-c".to_owned(), command.clone()],
                cwd: self.root.clone(),
                env: BTreeMap::new(),
                read_only: false,
                limits: SandboxLimits { max_runtime_secs: timeout_secs, ..SandboxLimits::default() },
            };
            let outcome = match self.sandbox.run(request).await {
                Ok(execution) => ValidationOutcome {
                    command: command.clone(),
                    success: execution.succeeded(),
                    detail: Some(if execution.succeeded() { execution.stdout } else { execution.stderr }),
                },
                Err(err) => ValidationOutcome { command: command.clone(), success: false, detail: Some(err.to_string()) },
            };
            all_passed &= outcome.success;
            validation_results.push(outcome);
        }

        let rollback_performed = !all_passed;
        if rollback_performed {
            if let Some(backup_dir) = &backup_path {
                restore_targets(&self.root, backup_dir, &plan.target_files).await?;
            }
        }

        let result = DeploymentResult {
            success: all_passed,
            deployed_at: chrono::Utc::now().to_rfc3339(),
            backup_path: backup_path.map(|p| p.display().to_string()),
            changes_applied: changes,
            validation_results,
            error_message: if all_passed { None } else { Some("validation failed, changes rolled back".to_owned()) },
            rollback_performed,
        };
        self.log(improvement, &plan.improvement_type, result.clone()).await?;
        Ok(result)
    }

    async fn log(&self, improvement: &ImprovementProposal, improvement_type: &str, result: DeploymentResult) -> AicResult<()> {
        history::record(
            &self.history_file,
            DeploymentHistoryEntry {
                improvement_id: improvement.task_id.clone(),
                improvement_type: improvement_type.to_owned(),
                timestamp: result.deployed_at.clone(),
                result,
            },
        )
        .await
    }

    pub async fn status(&self, improvement_id: &str) -> AicResult<Option<DeploymentHistoryEntry>> {
        history::status(&self.history_file, improvement_id).await
    }

    pub async fn statistics(&self) -> AicResult<history::DeploymentStatistics> {
        history::statistics(&self.history_file).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aic_protocol::{ParameterRecommendations, RiskClass};
    use anyhow::Result as AnyResult;
    use async_trait::async_trait;
    use indexmap::IndexMap;

    struct ScriptedSandbox {
        succeed: bool,
    }

    #[async_trait]
    impl SandboxRunner for ScriptedSandbox {
        async fn run(&self, _request: SandboxRequest) -> AnyResult<aic_sandbox::SandboxExecution> {
            Ok(aic_sandbox::SandboxExecution {
                started_at: chrono::Utc::now(),
                ended_at: chrono::Utc::now(),
                duration_ms: 1,
                exit_code: if self.succeed { 0 } else { 1 },
                stdout: "ok".to_owned(),
                stderr: if self.succeed { String::new() } else { "boom".to_owned() },
                timed_out: false,
            })
        }
    }

    fn improvement(apply_map: IndexMap<String, String>) -> ImprovementProposal {
        ImprovementProposal {
            task_id: "imp-1".to_owned(),
            component: "kloros_config".to_owned(),
            description: "adjust a config parameter".to_owned(),
            expected_benefit: "fewer retries".to_owned(),
            risk_level: RiskClass::Low,
            confidence: 0.8,
            parameter_recommendations: Some(ParameterRecommendations { apply_map, params: IndexMap::new() }),
        }
    }

    #[tokio::test]
    async fn anti_fabrication_rejects_empty_changes() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        tokio::fs::write(root.join(".kloros_env"), "FOO=bar\n").await.unwrap();

        let pipeline = DeploymentPipeline::new(
            root.clone(),
            root.join(".backups"),
            root.join("history.json"),
            Arc::new(ScriptedSandbox { succeed: true }),
        );

        let improvement = improvement(IndexMap::new());
        let result = pipeline.deploy(&improvement, Path::new(".kloros_env")).await.unwrap();
        assert!(!result.success);
        assert!(result.error_message.unwrap().contains("missing implementation"));
    }

    #[tokio::test]
    async fn successful_deploy_updates_env_file_and_passes_validation() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        tokio::fs::write(root.join(".kloros_env"), "FOO=bar\n").await.unwrap();

        let mut apply_map = IndexMap::new();
        apply_map.insert("FOO".to_owned(), "baz".to_owned());

        let pipeline = DeploymentPipeline::new(
            root.clone(),
            root.join(".backups"),
            root.join("history.json"),
            Arc::new(ScriptedSandbox { succeed: true }),
        );

        let improvement = improvement(apply_map);
        let result = pipeline.deploy(&improvement, Path::new(".kloros_env")).await.unwrap();
        assert!(result.success);
        assert!(!result.rollback_performed);
        assert_eq!(result.changes_applied, vec!["UPDATED FOO: bar → baz"]);

        let content = tokio::fs::read_to_string(root.join(".kloros_env")).await.unwrap();
        assert!(content.contains("FOO=baz"));
    }

    #[tokio::test]
    async fn failed_validation_rolls_back_env_file() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        tokio::fs::write(root.join(".kloros_env"), "FOO=bar\n").await.unwrap();

        let mut apply_map = IndexMap::new();
        apply_map.insert("FOO".to_owned(), "baz".to_owned());

        let pipeline = DeploymentPipeline::new(
            root.clone(),
            root.join(".backups"),
            root.join("history.json"),
            Arc::new(ScriptedSandbox { succeed: false }),
        );

        let improvement = improvement(apply_map);
        let result = pipeline.deploy(&improvement, Path::new(".kloros_env")).await.unwrap();
        assert!(!result.success);
        assert!(result.rollback_performed);

        let content = tokio::fs::read_to_string(root.join(".kloros_env")).await.unwrap();
        assert_eq!(content, "FOO=bar\n");
    }

    #[tokio::test]
    async fn status_and_statistics_reflect_logged_deployments() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        tokio::fs::write(root.join(".kloros_env"), "FOO=bar\n").await.unwrap();

        let mut apply_map = IndexMap::new();
        apply_map.insert("FOO".to_owned(), "baz".to_owned());

        let pipeline = DeploymentPipeline::new(
            root.clone(),
            root.join(".backups"),
            root.join("history.json"),
            Arc::new(ScriptedSandbox { succeed: true }),
        );

        let improvement = improvement(apply_map);
        pipeline.deploy(&improvement, Path::new(".kloros_env")).await.unwrap();

        let status = pipeline.status("imp-1").await.unwrap();
        assert!(status.is_some());

        let stats = pipeline.statistics().await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.successful, 1);
    }
}
