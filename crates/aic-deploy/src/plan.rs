use std::path::Path;

use aic_protocol::{DeploymentPlan, ImprovementProposal, RiskClass};

use crate::classify::{classify, ImprovementType};

/// Builds a `DeploymentPlan` for `improvement`, dispatching on
/// `classify`'s bucket. Every bucket besides `General` is config-based
/// (touches only `env_target_file` and, for the richer types, a handful of
/// subsystem paths under `root`) — ported from `_analyze_improvement`'s
/// per-type `_plan_*_deployment` builders.
pub fn plan(improvement: &ImprovementProposal, env_target_file: &Path) -> DeploymentPlan {
    let env_file = env_target_file.display().to_string();
    match classify(&improvement.component, &improvement.description) {
        ImprovementType::Evolutionary => DeploymentPlan {
            improvement_id: improvement.task_id.clone(),
            improvement_type: ImprovementType::Evolutionary.as_str().to_owned(),
            target_files: vec![env_file.clone()],
            backup_required: true,
            validation_commands: vec![
                format!("test -f {env_file}"),
                format!("grep -q 'KLR_' {env_file} || true"),
            ],
            rollback_plan: "backup_restore".to_owned(),
            risk: RiskClass::Low,
            estimated_duration_sec: 15,
        },
        ImprovementType::Configuration => DeploymentPlan {
            improvement_id: improvement.task_id.clone(),
            improvement_type: ImprovementType::Configuration.as_str().to_owned(),
            target_files: vec![env_file.clone(), "src/config.rs".to_owned()],
            backup_required: true,
            validation_commands: vec![
                format!("test -f {env_file}"),
                format!("grep -q 'KLR_' {env_file} || true"),
            ],
            rollback_plan: "backup_restore".to_owned(),
            risk: RiskClass::Low,
            estimated_duration_sec: 15,
        },
        ImprovementType::Memory => DeploymentPlan {
            improvement_id: improvement.task_id.clone(),
            improvement_type: ImprovementType::Memory.as_str().to_owned(),
            target_files: vec![env_file, "src/memory/".to_owned()],
            backup_required: true,
            validation_commands: vec!["echo memory subsystem validation placeholder".to_owned()],
            rollback_plan: "backup_restore".to_owned(),
            risk: improvement.risk_level,
            estimated_duration_sec: 45,
        },
        ImprovementType::Speech => DeploymentPlan {
            improvement_id: improvement.task_id.clone(),
            improvement_type: ImprovementType::Speech.as_str().to_owned(),
            target_files: vec![env_file, "src/speech/".to_owned(), "src/stt/".to_owned()],
            backup_required: true,
            validation_commands: vec!["echo speech subsystem validation placeholder".to_owned()],
            rollback_plan: "backup_restore".to_owned(),
            risk: improvement.risk_level,
            estimated_duration_sec: 90,
        },
        ImprovementType::Reasoning => DeploymentPlan {
            improvement_id: improvement.task_id.clone(),
            improvement_type: ImprovementType::Reasoning.as_str().to_owned(),
            target_files: vec![env_file, "src/reasoning/".to_owned()],
            backup_required: true,
            validation_commands: vec!["echo reasoning subsystem validation placeholder".to_owned()],
            rollback_plan: "backup_restore".to_owned(),
            risk: improvement.risk_level,
            estimated_duration_sec: 75,
        },
        ImprovementType::General => DeploymentPlan {
            improvement_id: improvement.task_id.clone(),
            improvement_type: ImprovementType::General.as_str().to_owned(),
            target_files: vec![],
            backup_required: true,
            validation_commands: vec!["echo basic validation passed".to_owned()],
            rollback_plan: "backup_restore".to_owned(),
            risk: improvement.risk_level,
            estimated_duration_sec: 30,
        },
    }
}

/// Timeout tier for a validation command (§4.4): `grep`-prefixed checks get
/// 10s, env-file existence checks get 30s, everything else (subsystem
/// probes) gets the full 60s.
pub fn validation_timeout_secs(command: &str) -> u64 {
    if command.trim_start().starts_with("grep") {
        10
    } else if command.contains("test -f") {
        30
    } else {
        60
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aic_protocol::ImprovementProposal;
    use std::path::PathBuf;

    fn improvement(component: &str, description: &str) -> ImprovementProposal {
        ImprovementProposal {
            task_id: "imp-1".to_owned(),
            component: component.to_owned(),
            description: description.to_owned(),
            expected_benefit: String::new(),
            risk_level: RiskClass::Medium,
            confidence: 0.9,
            parameter_recommendations: None,
        }
    }

    #[test]
    fn evolutionary_plan_is_low_risk_and_env_only() {
        let plan = plan(&improvement("tool_synthesis", "evolutionary tuning"), &PathBuf::from(".kloros_env"));
        assert_eq!(plan.improvement_type, "evolutionary");
        assert_eq!(plan.target_files, vec![".kloros_env"]);
        assert_eq!(plan.risk, RiskClass::Low);
        assert_eq!(plan.estimated_duration_sec, 15);
    }

    #[test]
    fn memory_plan_keeps_caller_supplied_risk() {
        let mut improvement = improvement("kloros_memory", "memory improvement");
        improvement.risk_level = RiskClass::High;
        let plan = plan(&improvement, &PathBuf::from(".kloros_env"));
        assert_eq!(plan.risk, RiskClass::High);
        assert_eq!(plan.estimated_duration_sec, 45);
    }

    #[test]
    fn validation_timeout_tiers() {
        assert_eq!(validation_timeout_secs("grep -q foo bar"), 10);
        assert_eq!(validation_timeout_secs("test -f .kloros_env"), 30);
        assert_eq!(validation_timeout_secs("echo validation"), 60);
    }
}
