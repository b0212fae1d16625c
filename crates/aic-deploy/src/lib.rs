//! Deployment Pipeline: classifies an approved improvement, builds a
//! `DeploymentPlan`, backs up target files, applies configuration changes,
//! validates the result, and rolls back on failure — with a bounded
//! history log and aggregate statistics. Ported from
//! `deployment_pipeline.py`'s `DeploymentPipeline`.

mod classify;
mod history;
mod plan;
mod pipeline;

pub use classify::{classify, ImprovementType};
pub use history::{DeploymentHistoryEntry, DeploymentStatistics};
pub use pipeline::{apply_configuration, DeploymentPipeline};
pub use plan::{plan as build_plan, validation_timeout_secs};
