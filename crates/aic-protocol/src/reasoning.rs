use serde::{Deserialize, Serialize};

/// Depth of deliberation requested from the reasoning coordinator. Governs
/// beam width and whether debate runs; see `aic-reasoning`'s mode router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningMode {
    Light,
    Standard,
    Deep,
    Critical,
}

/// A candidate the reasoning coordinator is choosing between. `expected_gain`,
/// `expected_cost`, and `expected_risk` feed VOI; `voi` is filled in once
/// scored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alternative {
    pub name: String,
    pub expected_gain: f64,
    pub expected_cost: f64,
    pub expected_risk: f64,
    pub voi: Option<f64>,
}

impl Alternative {
    pub fn new(name: impl Into<String>, expected_gain: f64, expected_cost: f64, expected_risk: f64) -> Self {
        Self {
            name: name.into(),
            expected_gain,
            expected_cost,
            expected_risk,
            voi: None,
        }
    }
}

/// Judge output from a multi-agent debate round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approved,
    Conditional,
    NeedsRevision,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateVerdict {
    pub verdict: Verdict,
    pub confidence: f64,
    pub requires_revision: bool,
}

/// What the coordinator recommends the caller do with its decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Proceed,
    ProceedWithMonitoring,
    GatherMoreData,
}

impl RecommendedAction {
    /// `confidence > 0.75 -> proceed`; `> 0.5 -> proceed with monitoring`;
    /// else `gather more data`.
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence > 0.75 {
            Self::Proceed
        } else if confidence > 0.5 {
            Self::ProceedWithMonitoring
        } else {
            Self::GatherMoreData
        }
    }
}

/// A full decision record from the reasoning coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningResult {
    pub decision: String,
    pub alternatives_explored: usize,
    pub best_alternative: Option<Alternative>,
    pub confidence: f64,
    pub voi_score: f64,
    pub reasoning_trace: Vec<String>,
    pub debate_verdict: Option<DebateVerdict>,
    pub recommended_action: RecommendedAction,
}
