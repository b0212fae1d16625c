//! Canonical, dependency-light contract crate for the AIC engines.
//!
//! No engine in this workspace talks directly to the filesystem or the
//! network without going through types defined here first: events,
//! playbooks, provenance, deployment artifacts, reasoning results, the
//! config shape, and the shared append-only JSONL storage helpers.

mod action;
mod config;
mod engine;
mod error;
mod event;
mod governance;
mod ids;
mod playbook;
mod reasoning;
mod storage;

pub use action::{ActionKind, ActionParams};
pub use config::{
    AicConfig, GovernanceConfig, GuardrailMode, GuardrailsConfig, PathsConfig, ReasoningConfig,
    ShadowConfig,
};
pub use engine::{ExecutionOutcome, ExecutionState, PlaybookExecutor};
pub use error::{AicError, AicResult};
pub use event::{HealEvent, Severity};
pub use governance::{
    CapabilityMetadata, CapabilityStatus, DeploymentPlan, DeploymentResult, ImprovementAlert,
    ImprovementProposal, ParameterRecommendations, ProvenanceRecord, RiskClass, SloThresholds,
    TestOutcome, ToolBudget, Urgency, ValidationOutcome,
};
pub use ids::{short_id, ToolVersion};
pub use playbook::{find_matching, MatchPattern, Playbook, PlaybookStep, ValidateProbe};
pub use reasoning::{Alternative, DebateVerdict, ReasoningMode, ReasoningResult, RecommendedAction, Verdict};
pub use storage::{append_jsonl, read_jsonl, with_retry};
