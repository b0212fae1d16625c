use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::ToolVersion;

/// Derived from static inspection of an artifact's source (§3 `RiskClass`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskClass {
    Low,
    Medium,
    High,
}

impl RiskClass {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskClass::Low => "low",
            RiskClass::Medium => "medium",
            RiskClass::High => "high",
        }
    }
}

/// Risk-keyed execution quotas (§3 `ToolBudget`). Defaults per risk class
/// are normative, not illustrative.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ToolBudget {
    pub max_calls_per_hour: u32,
    pub max_side_effect_bytes: u64,
    pub max_execution_time_ms: u64,
}

impl ToolBudget {
    pub fn for_risk(risk: RiskClass) -> Self {
        match risk {
            RiskClass::Low => Self { max_calls_per_hour: 1000, max_side_effect_bytes: 0, max_execution_time_ms: 5_000 },
            RiskClass::Medium => Self { max_calls_per_hour: 100, max_side_effect_bytes: 1 << 20, max_execution_time_ms: 10_000 },
            RiskClass::High => Self { max_calls_per_hour: 10, max_side_effect_bytes: 1 << 20, max_execution_time_ms: 30_000 },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestOutcome {
    Pass,
    Fail,
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityStatus {
    Quarantine,
    Shadow,
    Promoted,
    Deprecated,
    Failed,
}

/// SLO preconditions a capability's telemetry must clear before promotion
/// (§4.2 gate 6). Defaults match the spec verbatim.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SloThresholds {
    pub min_calls: u64,
    pub p95_latency_ms: f64,
    pub max_error_rate: f64,
}

impl Default for SloThresholds {
    fn default() -> Self {
        Self { min_calls: 10, p95_latency_ms: 5_000.0, max_error_rate: 0.10 }
    }
}

/// `metadata.json` contents for a capability artifact (§3
/// `CapabilityArtifact`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityMetadata {
    pub name: String,
    pub version: ToolVersion,
    pub status: CapabilityStatus,
    pub risk: RiskClass,
    pub reason: String,
    pub created_at: String,
    pub updated_at: String,
    pub unit_tests: TestOutcome,
    pub e2e_tests: TestOutcome,
    #[serde(default)]
    pub slo: Option<SloThresholds>,
}

/// Append-only synthesis/promotion ledger entry (§3 `ProvenanceRecord`).
///
/// `#[serde(flatten)]`-free and with `#[serde(default)]` on every optional
/// field so that round-tripping an entry written by a future, richer
/// version of this struct silently preserves fields this binary doesn't
/// know about, matching "readers must tolerate unknown fields".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub event: String, // "synthesis" | "promotion"
    pub tool: String,
    pub version: ToolVersion,
    #[serde(default)]
    pub from_version: Option<ToolVersion>,
    #[serde(default)]
    pub to_version: Option<ToolVersion>,
    #[serde(default)]
    pub origin: Option<String>, // synthesis | manual | evolution
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub prompt_hash: Option<String>,
    #[serde(default)]
    pub diff_added: Option<u64>,
    #[serde(default)]
    pub diff_removed: Option<u64>,
    #[serde(default)]
    pub unit_tests: Option<TestOutcome>,
    #[serde(default)]
    pub e2e_tests: Option<TestOutcome>,
    #[serde(default)]
    pub risk: Option<RiskClass>,
    #[serde(default)]
    pub approved_by: Option<String>,
    pub date: String,
    #[serde(default)]
    pub metadata: Value,
}

impl ProvenanceRecord {
    pub fn synthesis(
        tool: impl Into<String>,
        version: ToolVersion,
        reason: impl Into<String>,
        model: impl Into<String>,
        prompt_hash: impl Into<String>,
        risk: RiskClass,
    ) -> Self {
        Self {
            event: "synthesis".to_string(),
            tool: tool.into(),
            version,
            from_version: None,
            to_version: None,
            origin: Some("synthesis".to_string()),
            reason: Some(reason.into()),
            seed: None,
            model: Some(model.into()),
            prompt_hash: Some(prompt_hash.into()),
            diff_added: None,
            diff_removed: None,
            unit_tests: Some(TestOutcome::Pending),
            e2e_tests: Some(TestOutcome::Pending),
            risk: Some(risk),
            approved_by: None,
            date: chrono::Utc::now().to_rfc3339(),
            metadata: Value::Null,
        }
    }

    pub fn promotion(
        tool: impl Into<String>,
        from_version: ToolVersion,
        to_version: ToolVersion,
        approved_by: impl Into<String>,
    ) -> Self {
        Self {
            event: "promotion".to_string(),
            tool: tool.into(),
            version: to_version,
            from_version: Some(from_version),
            to_version: Some(to_version),
            origin: None,
            reason: None,
            seed: None,
            model: None,
            prompt_hash: None,
            diff_added: None,
            diff_removed: None,
            unit_tests: None,
            e2e_tests: None,
            risk: None,
            approved_by: Some(approved_by.into()),
            date: chrono::Utc::now().to_rfc3339(),
            metadata: Value::Null,
        }
    }
}

/// Derived urgency bucket for an `ImprovementAlert`, from confidence (see
/// SPEC_FULL.md §3 SUPPLEMENT for the thresholds, ground-truthed against
/// the original alert manager).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Critical,
    High,
    Medium,
    Low,
}

impl Urgency {
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 0.9 {
            Urgency::Critical
        } else if confidence >= 0.7 {
            Urgency::High
        } else if confidence >= 0.5 {
            Urgency::Medium
        } else {
            Urgency::Low
        }
    }
}

/// Input to alerts and deployment (§6 "Improvement proposal").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementProposal {
    pub task_id: String,
    pub component: String,
    pub description: String,
    #[serde(default)]
    pub expected_benefit: String,
    pub risk_level: RiskClass,
    pub confidence: f64,
    #[serde(default)]
    pub parameter_recommendations: Option<ParameterRecommendations>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterRecommendations {
    pub apply_map: indexmap::IndexMap<String, String>,
    pub params: indexmap::IndexMap<String, Value>,
}

impl ImprovementProposal {
    /// Ingestion validation: an improvement lacking implementation data
    /// must be rejected before it ever reaches governance or deployment.
    pub fn validate(&self) -> crate::AicResult<()> {
        if self.parameter_recommendations.is_none() {
            return Err(crate::AicError::IngestionRejected(
                "Improvement missing implementation data".to_string(),
            ));
        }
        Ok(())
    }
}

/// Queued proposal for human or automatic approval (§3 `ImprovementAlert`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementAlert {
    pub request_id: String,
    pub component: String,
    pub description: String,
    pub expected_benefit: String,
    pub risk_level: RiskClass,
    pub confidence: f64,
    pub urgency: Urgency,
    pub detected_at: String,
    #[serde(default)]
    pub parameter_recommendations: Option<ParameterRecommendations>,
}

impl ImprovementAlert {
    pub fn from_proposal(proposal: &ImprovementProposal) -> Self {
        Self {
            request_id: proposal.task_id.clone(),
            component: proposal.component.clone(),
            description: proposal.description.clone(),
            expected_benefit: proposal.expected_benefit.clone(),
            risk_level: proposal.risk_level,
            confidence: proposal.confidence,
            urgency: Urgency::from_confidence(proposal.confidence),
            detected_at: chrono::Utc::now().to_rfc3339(),
            parameter_recommendations: proposal.parameter_recommendations.clone(),
        }
    }
}

/// §3 `DeploymentPlan`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentPlan {
    pub improvement_id: String,
    pub improvement_type: String,
    pub target_files: Vec<String>,
    pub backup_required: bool,
    pub validation_commands: Vec<String>,
    pub rollback_plan: String, // "backup_restore"
    pub risk: RiskClass,
    pub estimated_duration_sec: u64,
}

/// §3 `DeploymentResult`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentResult {
    pub success: bool,
    pub deployed_at: String,
    #[serde(default)]
    pub backup_path: Option<String>,
    pub changes_applied: Vec<String>,
    pub validation_results: Vec<ValidationOutcome>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub rollback_performed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub command: String,
    pub success: bool,
    #[serde(default)]
    pub detail: Option<String>,
}
