//! The `GovernanceEngine` facade: quarantine, promotion gates, promotion,
//! and the read-only status queries the CLI's `synth` subcommands use.
//! Ported from `governance.py`'s `SynthesisGovernance`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use aic_protocol::{
    append_jsonl, read_jsonl, AicError, AicResult, CapabilityMetadata, CapabilityStatus, ProvenanceRecord,
    RiskClass, SloThresholds, TestOutcome, ToolVersion,
};
use aic_reasoning::{ProposedDecision, ReasoningCoordinator};
use aic_telemetry::TelemetryCollector;
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};

use crate::quotas::{count_today_synthesis, count_week_promotions};
use crate::risk::classify_risk;

fn risk_to_voi_scale(risk: RiskClass) -> f64 {
    match risk {
        RiskClass::Low => 0.1,
        RiskClass::Medium => 0.5,
        RiskClass::High => 0.9,
    }
}

fn prompt_hash(prompt: &str) -> String {
    let digest = Sha256::digest(prompt.as_bytes());
    hex::encode(digest)[..8].to_owned()
}

pub struct GovernanceEngine {
    quarantine_dir: PathBuf,
    promoted_dir: PathBuf,
    provenance_log: PathBuf,
    risk_policy_file: PathBuf,
    capabilities_file: PathBuf,
    daily_synthesis_quota: u32,
    weekly_promotion_quota: u32,
    reasoning: Option<Arc<ReasoningCoordinator>>,
    telemetry: Option<Arc<TelemetryCollector>>,
}

/// A single `tools.<name>` entry in `capabilities.yaml`, written on
/// promotion. Field order matches the Python original's
/// `yaml.safe_dump(..., sort_keys=False)` output.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct CapabilityEntry {
    version: String,
    risk: String,
    description: String,
    status: String,
    promoted_at: String,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
struct CapabilitiesFile {
    #[serde(default)]
    tools: indexmap::IndexMap<String, CapabilityEntry>,
}

impl GovernanceEngine {
    pub fn new(
        root: PathBuf,
        risk_policy_file: PathBuf,
        capabilities_file: PathBuf,
        daily_synthesis_quota: u32,
        weekly_promotion_quota: u32,
    ) -> Self {
        Self {
            quarantine_dir: root.join("synth").join("quarantine"),
            promoted_dir: root.join("synth").join("promoted"),
            provenance_log: root.join("tool_provenance.jsonl"),
            risk_policy_file,
            capabilities_file,
            daily_synthesis_quota,
            weekly_promotion_quota,
            reasoning: None,
            telemetry: None,
        }
    }

    pub fn with_reasoning(mut self, coordinator: Arc<ReasoningCoordinator>) -> Self {
        self.reasoning = Some(coordinator);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<TelemetryCollector>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    fn artifact_dir(&self, tool_name: &str, version: ToolVersion) -> PathBuf {
        self.quarantine_dir.join(tool_name).join(version.to_string())
    }

    /// Places a freshly synthesized artifact in quarantine at `0.1.0`,
    /// classifying its risk and writing a `synthesis` provenance record.
    #[instrument(skip(self, source, prompt))]
    pub async fn quarantine(
        &self,
        tool_name: &str,
        source: &str,
        reason: &str,
        model: &str,
        prompt: &str,
    ) -> AicResult<(String, ProvenanceRecord)> {
        let version = ToolVersion::quarantine();
        let versioned_name = format!("{tool_name}@{version}");
        let risk = classify_risk(source);

        let dir = self.artifact_dir(tool_name, version);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| AicError::TransientStorage(format!("creating {dir:?}: {e}")))?;

        tokio::fs::write(dir.join("artifact.src"), source)
            .await
            .map_err(|e| AicError::TransientStorage(format!("writing artifact for {tool_name}: {e}")))?;
        tokio::fs::write(dir.join("prompt.txt"), prompt)
            .await
            .map_err(|e| AicError::TransientStorage(format!("writing prompt for {tool_name}: {e}")))?;

        let now = chrono::Utc::now().to_rfc3339();
        let metadata = CapabilityMetadata {
            name: tool_name.to_owned(),
            version,
            status: CapabilityStatus::Quarantine,
            risk,
            reason: reason.to_owned(),
            created_at: now.clone(),
            updated_at: now,
            unit_tests: TestOutcome::Pending,
            e2e_tests: TestOutcome::Pending,
            slo: None,
        };
        self.write_metadata(&dir, &metadata).await?;

        let provenance =
            ProvenanceRecord::synthesis(tool_name, version, reason, model, prompt_hash(prompt), risk);
        append_jsonl(&self.provenance_log, &provenance).await?;

        info!(tool = tool_name, risk = risk.as_str(), "quarantined");
        Ok((versioned_name, provenance))
    }

    async fn write_metadata(&self, dir: &Path, metadata: &CapabilityMetadata) -> AicResult<()> {
        let raw = serde_json::to_string_pretty(metadata)
            .map_err(|e| AicError::Fatal(format!("serializing metadata: {e}")))?;
        tokio::fs::write(dir.join("metadata.json"), raw)
            .await
            .map_err(|e| AicError::TransientStorage(format!("writing metadata: {e}")))
    }

    async fn read_metadata(&self, dir: &Path) -> AicResult<CapabilityMetadata> {
        let raw = tokio::fs::read_to_string(dir.join("metadata.json"))
            .await
            .map_err(|_| AicError::GateFailed(vec!["missing metadata".to_owned()]))?;
        serde_json::from_str(&raw).map_err(|e| AicError::Fatal(format!("parsing metadata: {e}")))
    }

    async fn provenance_records(&self) -> AicResult<Vec<ProvenanceRecord>> {
        read_jsonl(&self.provenance_log).await
    }

    /// Checks the seven promotion gates (SPEC_FULL.md §4.2) and returns
    /// `Ok(())` iff every applicable one clears. Gates 1-4 (tests, daily
    /// synthesis quota, weekly promotion quota, high-risk policy) always
    /// run; when a `ReasoningCoordinator` is wired in, its debate verdict
    /// is consulted as an additional, seventh gate rather than a
    /// substitute for the first four.
    #[instrument(skip(self))]
    pub async fn check_promotion_gates(&self, tool_name: &str, version: ToolVersion) -> AicResult<()> {
        let dir = self.artifact_dir(tool_name, version);
        if !dir.exists() {
            return Err(AicError::GateFailed(vec!["tool not found in quarantine".to_owned()]));
        }
        let metadata = self.read_metadata(&dir).await?;

        let unit_pass = metadata.unit_tests == TestOutcome::Pass;
        let e2e_pass = metadata.e2e_tests == TestOutcome::Pass;

        let records = self.provenance_records().await?;
        let daily_quota_ok = count_today_synthesis(&records) < self.daily_synthesis_quota;
        let weekly_quota_ok = count_week_promotions(&records) < self.weekly_promotion_quota;

        let high_risk_policy_ok = if metadata.risk == RiskClass::High {
            match aic_policy::load_risk_policy_table(&self.risk_policy_file) {
                Ok(table) => table.contains_key(tool_name),
                Err(_) => false,
            }
        } else {
            true
        };

        let mut reasons = Vec::new();

        // Gates 1-4 are always evaluated, independent of whether a
        // ReasoningCoordinator is wired in; debate arbitration (gate 7,
        // below) is an additional required condition, never a substitute
        // for them.
        if !unit_pass {
            reasons.push("unit tests not passing".to_owned());
        }
        if !e2e_pass {
            reasons.push("e2e tests not passing".to_owned());
        }
        if !daily_quota_ok {
            reasons.push("daily synthesis quota exceeded".to_owned());
        }
        if !weekly_quota_ok {
            reasons.push("weekly promotion quota exceeded".to_owned());
        }
        if !high_risk_policy_ok {
            reasons.push("high-risk policy not configured".to_owned());
        }

        if let Some(coordinator) = &self.reasoning {
            let proposed = ProposedDecision {
                summary: format!("promote {tool_name}@{version}"),
                confidence: if unit_pass && e2e_pass { 0.8 } else { 0.5 },
                risk: risk_to_voi_scale(metadata.risk),
            };
            let verdict = coordinator.debate_decision(&proposed, 2);
            if verdict.verdict != aic_protocol::Verdict::Approved {
                reasons.push(format!("rejected by debate: {:?}", verdict.verdict));
            }
        }

        let models_file = self.quarantine_dir.join(tool_name).join("models.rs");
        if dir.join("manifest.yaml").exists() {
            match tokio::fs::read_to_string(&models_file).await {
                Err(_) => reasons.push("missing models.rs (required for manifest-backed tools)".to_owned()),
                Ok(content) => {
                    if !content.contains("InputModel") || !content.contains("OutputModel") {
                        reasons.push("models.rs missing InputModel/OutputModel declarations".to_owned());
                    }
                }
            }
        }

        let slo = metadata.slo.unwrap_or_default();
        let violations = self.check_slo(tool_name, &version.to_string(), &slo).await;
        for violation in &violations {
            reasons.push(format!("SLO violation: {violation}"));
        }
        if !violations.is_empty() {
            warn!(tool = tool_name, ?violations, "SLO gate failed");
        }

        if reasons.is_empty() {
            Ok(())
        } else {
            Err(AicError::GateFailed(reasons))
        }
    }

    async fn check_slo(&self, tool_name: &str, version: &str, slo: &SloThresholds) -> Vec<String> {
        let Some(telemetry) = &self.telemetry else {
            return vec!["no telemetry collector configured".to_owned()];
        };

        let metrics = match telemetry.get_metrics(tool_name, version) {
            Some(m) => Some(m),
            None => telemetry.load_metrics_from_file(tool_name, version).await.ok().flatten(),
        };

        let Some(metrics) = metrics else {
            return vec!["no telemetry data available".to_owned()];
        };

        let mut violations = Vec::new();
        if metrics.calls < slo.min_calls {
            violations.push(format!("insufficient data: {} calls (need {})", metrics.calls, slo.min_calls));
        }
        if let Some(p95) = metrics.p95_latency_ms() {
            if p95 as f64 > slo.p95_latency_ms {
                violations.push(format!("p95 latency too high: {p95}ms (max {}ms)", slo.p95_latency_ms));
            }
        }
        let error_rate = metrics.error_rate();
        if error_rate > slo.max_error_rate {
            violations.push(format!(
                "error rate too high: {:.1}% (max {:.0}%)",
                error_rate * 100.0,
                slo.max_error_rate * 100.0
            ));
        }
        violations
    }

    /// Promotes `tool_name` from quarantine to production. Idempotent: if
    /// the promoted directory already exists for this tool, re-promotion
    /// just re-checks the gates and re-writes the provenance trail rather
    /// than erroring.
    #[instrument(skip(self))]
    pub async fn promote(&self, tool_name: &str, from_version: ToolVersion) -> AicResult<String> {
        self.check_promotion_gates(tool_name, from_version).await?;

        let promoted_version = ToolVersion::promoted();
        let src_dir = self.artifact_dir(tool_name, from_version);
        let dst_dir = self.promoted_dir.join(tool_name).join(promoted_version.to_string());
        tokio::fs::create_dir_all(&dst_dir)
            .await
            .map_err(|e| AicError::TransientStorage(format!("creating {dst_dir:?}: {e}")))?;

        let mut entries = tokio::fs::read_dir(&src_dir)
            .await
            .map_err(|e| AicError::TransientStorage(format!("reading {src_dir:?}: {e}")))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AicError::TransientStorage(format!("iterating {src_dir:?}: {e}")))?
        {
            let dest = dst_dir.join(entry.file_name());
            tokio::fs::copy(entry.path(), &dest)
                .await
                .map_err(|e| AicError::TransientStorage(format!("copying into {dest:?}: {e}")))?;
        }

        let mut metadata = self.read_metadata(&dst_dir).await?;
        metadata.status = CapabilityStatus::Promoted;
        metadata.version = promoted_version;
        metadata.updated_at = chrono::Utc::now().to_rfc3339();
        self.write_metadata(&dst_dir, &metadata).await?;

        let promotion = ProvenanceRecord::promotion(tool_name, from_version, promoted_version, "auto@policy/v1");
        append_jsonl(&self.provenance_log, &promotion).await?;

        self.update_capabilities(tool_name, &metadata).await?;

        info!(tool = tool_name, version = %promoted_version, "promoted");
        Ok(format!("{tool_name}@{promoted_version}"))
    }

    /// Merges `tools.<name>` into `capabilities.yaml`, creating the file if
    /// absent. Ported from `governance.py`'s `_update_tools_config`: the
    /// registry is the promotion source of truth the CLI's `synth list`
    /// and the running heal/action layer consult to know a capability
    /// exists at all.
    async fn update_capabilities(&self, tool_name: &str, metadata: &CapabilityMetadata) -> AicResult<()> {
        let mut file = match tokio::fs::read_to_string(&self.capabilities_file).await {
            Ok(raw) => serde_yaml::from_str(&raw)
                .map_err(|e| AicError::Fatal(format!("parsing {:?}: {e}", self.capabilities_file)))?,
            Err(_) => CapabilitiesFile::default(),
        };

        file.tools.insert(
            tool_name.to_owned(),
            CapabilityEntry {
                version: metadata.version.to_string(),
                risk: metadata.risk.as_str().to_owned(),
                description: metadata.reason.clone(),
                status: "promoted".to_owned(),
                promoted_at: metadata.updated_at.clone(),
            },
        );

        if let Some(parent) = self.capabilities_file.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AicError::TransientStorage(format!("creating {parent:?}: {e}")))?;
        }
        let rendered = serde_yaml::to_string(&file)
            .map_err(|e| AicError::Fatal(format!("serializing capabilities.yaml: {e}")))?;
        let tmp = self.capabilities_file.with_extension("yaml.tmp");
        tokio::fs::write(&tmp, rendered)
            .await
            .map_err(|e| AicError::TransientStorage(format!("writing {tmp:?}: {e}")))?;
        tokio::fs::rename(&tmp, &self.capabilities_file)
            .await
            .map_err(|e| AicError::TransientStorage(format!("renaming into {:?}: {e}", self.capabilities_file)))
    }

    pub async fn get_status(&self, tool_name: &str) -> Option<CapabilityMetadata> {
        if let Some(metadata) = self.latest_in(&self.promoted_dir, tool_name).await {
            return Some(metadata);
        }
        self.latest_in(&self.quarantine_dir, tool_name).await
    }

    async fn latest_in(&self, base: &Path, tool_name: &str) -> Option<CapabilityMetadata> {
        let tool_dir = base.join(tool_name);
        let mut versions = Vec::new();
        let mut entries = tokio::fs::read_dir(&tool_dir).await.ok()?;
        while let Some(entry) = entries.next_entry().await.ok()? {
            if entry.file_type().await.ok()?.is_dir() {
                versions.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        versions.sort();
        let latest = versions.last()?;
        self.read_metadata(&tool_dir.join(latest)).await.ok()
    }

    pub async fn list_quarantined(&self) -> Vec<CapabilityMetadata> {
        self.list_all(&self.quarantine_dir).await
    }

    pub async fn list_promoted(&self) -> Vec<CapabilityMetadata> {
        self.list_all(&self.promoted_dir).await
    }

    async fn list_all(&self, base: &Path) -> Vec<CapabilityMetadata> {
        let mut out = Vec::new();
        let Ok(mut tool_dirs) = tokio::fs::read_dir(base).await else {
            return out;
        };
        while let Ok(Some(tool_entry)) = tool_dirs.next_entry().await {
            let Ok(mut version_dirs) = tokio::fs::read_dir(tool_entry.path()).await else {
                continue;
            };
            while let Ok(Some(version_entry)) = version_dirs.next_entry().await {
                if let Ok(metadata) = self.read_metadata(&version_entry.path()).await {
                    out.push(metadata);
                }
            }
        }
        out
    }

    pub async fn get_provenance(&self, tool_name: &str) -> AicResult<Vec<ProvenanceRecord>> {
        let records = self.provenance_records().await?;
        Ok(records.into_iter().filter(|r| r.tool == tool_name).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(root: &Path) -> GovernanceEngine {
        GovernanceEngine::new(
            root.to_path_buf(),
            root.join("synthesis_policy.json"),
            root.join("capabilities.yaml"),
            50,
            200,
        )
    }

    #[tokio::test]
    async fn quarantine_then_status_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let gov = engine(dir.path());

        let (versioned, _) = gov
            .quarantine("net_fetch", "fn fetch() {}", "needed for weather lookups", "gpt-4o", "write a fetch tool")
            .await
            .unwrap();
        assert_eq!(versioned, "net_fetch@0.1.0");

        let status = gov.get_status("net_fetch").await.unwrap();
        assert_eq!(status.status, CapabilityStatus::Quarantine);
        assert_eq!(status.risk, RiskClass::Low);
    }

    #[tokio::test]
    async fn promotion_blocked_until_tests_pass() {
        let dir = tempfile::tempdir().unwrap();
        let gov = engine(dir.path());
        gov.quarantine("net_fetch", "fn fetch() {}", "why", "gpt-4o", "prompt").await.unwrap();

        let err = gov.check_promotion_gates("net_fetch", ToolVersion::quarantine()).await.unwrap_err();
        match err {
            AicError::GateFailed(reasons) => {
                assert!(reasons.iter().any(|r| r.contains("unit tests")));
            }
            other => panic!("expected GateFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn high_risk_without_policy_table_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let gov = engine(dir.path());
        let (_, _) = gov
            .quarantine("net_publish", "Command::new(\"curl\").spawn()", "why", "gpt-4o", "prompt")
            .await
            .unwrap();

        let artifact_dir = dir.path().join("synth/quarantine/net_publish/0.1.0");
        let mut metadata = gov.read_metadata(&artifact_dir).await.unwrap();
        metadata.unit_tests = TestOutcome::Pass;
        metadata.e2e_tests = TestOutcome::Pass;
        gov.write_metadata(&artifact_dir, &metadata).await.unwrap();

        let err = gov.check_promotion_gates("net_publish", ToolVersion::quarantine()).await.unwrap_err();
        match err {
            AicError::GateFailed(reasons) => {
                assert!(reasons.iter().any(|r| r.contains("high-risk policy")));
            }
            other => panic!("expected GateFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn promote_moves_artifact_and_updates_status() {
        let dir = tempfile::tempdir().unwrap();
        let gov = engine(dir.path());
        gov.quarantine("calc", "fn add(a: i32, b: i32) -> i32 { a + b }", "why", "gpt-4o", "prompt").await.unwrap();

        let artifact_dir = dir.path().join("synth/quarantine/calc/0.1.0");
        let mut metadata = gov.read_metadata(&artifact_dir).await.unwrap();
        metadata.unit_tests = TestOutcome::Pass;
        metadata.e2e_tests = TestOutcome::Pass;
        gov.write_metadata(&artifact_dir, &metadata).await.unwrap();

        // Telemetry gate needs a collector with qualifying metrics.
        let telemetry = Arc::new(TelemetryCollector::new(dir.path().join("skill_metrics.jsonl")));
        for _ in 0..10 {
            telemetry.record_execution("calc", "0.1.0", 100, true, 0, 0, None).await;
        }
        let gov = gov.with_telemetry(telemetry);

        let promoted = gov.promote("calc", ToolVersion::quarantine()).await.unwrap();
        assert_eq!(promoted, "calc@1.0.0");

        let status = gov.get_status("calc").await.unwrap();
        assert_eq!(status.status, CapabilityStatus::Promoted);

        let capabilities = tokio::fs::read_to_string(dir.path().join("capabilities.yaml")).await.unwrap();
        assert!(capabilities.contains("calc:"));
        assert!(capabilities.contains("status: promoted"));
        assert!(capabilities.contains("version: 1.0.0"));
    }

    #[tokio::test]
    async fn promote_merges_with_existing_capabilities_entries() {
        let dir = tempfile::tempdir().unwrap();
        let gov = engine(dir.path());
        tokio::fs::write(
            dir.path().join("capabilities.yaml"),
            "tools:\n  other_tool:\n    version: 1.0.0\n    risk: low\n    description: existing\n    status: promoted\n    promoted_at: '2020-01-01T00:00:00+00:00'\n",
        )
        .await
        .unwrap();

        gov.quarantine("calc", "fn add(a: i32, b: i32) -> i32 { a + b }", "why", "gpt-4o", "prompt").await.unwrap();
        let artifact_dir = dir.path().join("synth/quarantine/calc/0.1.0");
        let mut metadata = gov.read_metadata(&artifact_dir).await.unwrap();
        metadata.unit_tests = TestOutcome::Pass;
        metadata.e2e_tests = TestOutcome::Pass;
        gov.write_metadata(&artifact_dir, &metadata).await.unwrap();

        let telemetry = Arc::new(TelemetryCollector::new(dir.path().join("skill_metrics.jsonl")));
        for _ in 0..10 {
            telemetry.record_execution("calc", "0.1.0", 100, true, 0, 0, None).await;
        }
        let gov = gov.with_telemetry(telemetry);
        gov.promote("calc", ToolVersion::quarantine()).await.unwrap();

        let capabilities = tokio::fs::read_to_string(dir.path().join("capabilities.yaml")).await.unwrap();
        assert!(capabilities.contains("other_tool:"));
        assert!(capabilities.contains("calc:"));
    }
}
