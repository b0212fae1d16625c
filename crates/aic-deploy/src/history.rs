use std::path::Path;

use aic_protocol::{AicError, AicResult, DeploymentResult};
use serde::{Deserialize, Serialize};

/// Bounded JSON-array deployment log — not JSONL, since the teacher's
/// `_log_deployment` reads the whole array back, truncates to the last
/// `MAX_ENTRIES`, and rewrites the file every time.
const MAX_ENTRIES: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentHistoryEntry {
    pub improvement_id: String,
    pub improvement_type: String,
    pub timestamp: String,
    pub result: DeploymentResult,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DeploymentStatistics {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub rollbacks_performed: usize,
    pub rollback_rate: f64,
}

async fn load(path: &Path) -> AicResult<Vec<DeploymentHistoryEntry>> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(_) => return Ok(Vec::new()),
    };
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&raw).map_err(|e| AicError::Fatal(format!("parsing {path:?}: {e}")))
}

async fn store(path: &Path, history: &[DeploymentHistoryEntry]) -> AicResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| AicError::TransientStorage(format!("creating {parent:?}: {e}")))?;
    }
    let serialized = serde_json::to_string_pretty(history)
        .map_err(|e| AicError::Fatal(format!("serializing {path:?}: {e}")))?;
    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, serialized)
        .await
        .map_err(|e| AicError::TransientStorage(format!("writing {tmp_path:?}: {e}")))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| AicError::TransientStorage(format!("renaming into {path:?}: {e}")))?;
    Ok(())
}

/// Appends `entry`, keeping only the most recent `MAX_ENTRIES`.
pub async fn record(path: &Path, entry: DeploymentHistoryEntry) -> AicResult<()> {
    let mut history = load(path).await?;
    history.push(entry);
    if history.len() > MAX_ENTRIES {
        let excess = history.len() - MAX_ENTRIES;
        history.drain(0..excess);
    }
    store(path, &history).await
}

/// Most recent entry for `improvement_id`, searching newest-first.
pub async fn status(path: &Path, improvement_id: &str) -> AicResult<Option<DeploymentHistoryEntry>> {
    let history = load(path).await?;
    Ok(history.into_iter().rev().find(|e| e.improvement_id == improvement_id))
}

pub async fn statistics(path: &Path) -> AicResult<DeploymentStatistics> {
    let history = load(path).await?;
    let total = history.len();
    let successful = history.iter().filter(|e| e.result.success).count();
    let failed = total - successful;
    let rollbacks_performed = history.iter().filter(|e| e.result.rollback_performed).count();
    let success_rate = if total == 0 { 0.0 } else { successful as f64 / total as f64 };
    let rollback_rate = if total == 0 { 0.0 } else { rollbacks_performed as f64 / total as f64 };
    Ok(DeploymentStatistics { total, successful, failed, success_rate, rollbacks_performed, rollback_rate })
}

#[cfg(test)]
mod tests {
    use super::*;
    use aic_protocol::ValidationOutcome;

    fn entry(id: &str, success: bool, rollback: bool) -> DeploymentHistoryEntry {
        DeploymentHistoryEntry {
            improvement_id: id.to_owned(),
            improvement_type: "configuration".to_owned(),
            timestamp: "2026-01-01T00:00:00Z".to_owned(),
            result: DeploymentResult {
                success,
                deployed_at: "2026-01-01T00:00:00Z".to_owned(),
                backup_path: None,
                changes_applied: vec![],
                validation_results: vec![ValidationOutcome { command: "echo ok".to_owned(), success, detail: None }],
                error_message: None,
                rollback_performed: rollback,
            },
        }
    }

    #[tokio::test]
    async fn record_then_status_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");

        record(&path, entry("imp-1", true, false)).await.unwrap();
        record(&path, entry("imp-2", false, true)).await.unwrap();

        let found = status(&path, "imp-1").await.unwrap().unwrap();
        assert_eq!(found.improvement_id, "imp-1");

        let stats = statistics(&path).await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.successful, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.rollbacks_performed, 1);
    }

    #[tokio::test]
    async fn history_is_truncated_to_max_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");

        for i in 0..110 {
            record(&path, entry(&format!("imp-{i}"), true, false)).await.unwrap();
        }

        let history = load(&path).await.unwrap();
        assert_eq!(history.len(), MAX_ENTRIES);
        assert_eq!(history.first().unwrap().improvement_id, "imp-10");
        assert_eq!(history.last().unwrap().improvement_id, "imp-109");
    }

    #[tokio::test]
    async fn status_returns_none_for_unknown_improvement() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        record(&path, entry("imp-1", true, false)).await.unwrap();

        assert!(status(&path, "imp-unknown").await.unwrap().is_none());
    }
}
