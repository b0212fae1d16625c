//! `CoreContext`: the single facade that wires the bus, guardrails,
//! governance, shadow tester, reasoning coordinator, deployment pipeline,
//! and telemetry collector into one value (SPEC_FULL.md §9, "singletons ...
//! become explicit construction and injection"). Every crate above this one
//! only ever talks to its declared dependencies; `aic-core` is the only
//! place all of them are wired together, and the only thing `apps/kloros`
//! depends on besides `aic-protocol`.

use std::path::PathBuf;
use std::sync::Arc;

use aic_actions::{ActionDispatcher, ActionRegistry};
use aic_bus::{load_playbooks, HealBus, HealBusBuilder};
use aic_deploy::DeploymentPipeline;
use aic_governance::GovernanceEngine;
use aic_policy::Guardrails;
use aic_protocol::{
    AicConfig, AicError, AicResult, ImprovementAlert, ImprovementProposal, RiskClass,
};
use aic_reasoning::{ProposedDecision, ReasoningCoordinator};
use aic_sandbox::{LocalSandboxRunner, SandboxRunner};
use aic_shadow::ShadowTester;
use aic_telemetry::TelemetryCollector;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

/// Components named in an improvement proposal that are never eligible for
/// auto-approval regardless of confidence or risk — a hard veto ahead of
/// any reasoning arbitration (SPEC_FULL.md §9 Open Question 4, S3).
const CRITICAL_COMPONENTS: &[&str] = &["authentication", "auth", "security", "payments", "credentials"];

/// Commands `aic-actions`' system handlers and `aic-shadow`'s sandboxed
/// runs are permitted to invoke. Narrower than a blanket allow-all, wider
/// than any single playbook's needs.
const DEFAULT_ALLOWED_COMMANDS: &[&str] =
    &["echo", "systemctl", "pkill", "pgrep", "ps", "kill", "fuser", "swapoff", "swapon", "sh"];

/// What `CoreContext::submit_improvement` actually did with a proposal.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// Auto-approved and deployed; carries the deployment result.
    Deployed(aic_protocol::DeploymentResult),
    /// Denied auto-approval and queued for manual review.
    Queued(ImprovementAlert),
}

/// Builds a [`CoreContext`] from config, wiring every engine the same way
/// regardless of caller (CLI, future daemon).
pub struct CoreContextBuilder {
    config: AicConfig,
    allowed_commands: Vec<String>,
}

impl CoreContextBuilder {
    pub fn new(config: AicConfig) -> Self {
        Self {
            config,
            allowed_commands: DEFAULT_ALLOWED_COMMANDS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn allowed_commands(mut self, allowed_commands: Vec<String>) -> Self {
        self.allowed_commands = allowed_commands;
        self
    }

    pub fn build(self) -> CoreContext {
        let root = self.config.paths.root.clone();
        let env_target_file_abs = root.join(&self.config.paths.env_target_file);
        let risk_policy_file = root.join(&self.config.paths.risk_policy_file);
        let capabilities_file = root.join(&self.config.paths.capabilities_file);
        let playbook_file = root.join("playbooks.yaml");
        let heal_journal = root.join("heal_events.jsonl");
        let provenance_root = root.clone();
        let shadow_results_log = root.join("shadow_results.jsonl");
        let metrics_file = root.join("skill_metrics.jsonl");
        let backup_root = root.join("backups");
        let deploy_history_file = root.join("deployment_history.json");
        let approval_queue_file = root.join("approval_queue.json");
        let issues_dir = root.join("synth").join("issues");

        let sandbox: Arc<dyn SandboxRunner> = Arc::new(LocalSandboxRunner::new(self.allowed_commands));

        let guardrails = Arc::new(Guardrails::new(
            self.config.guardrails.mode,
            self.config.guardrails.rate_limit_per_minute,
        ));

        let reasoning = Arc::new(ReasoningCoordinator::new(
            self.config.reasoning.cost_weight,
            self.config.reasoning.risk_weight,
        ));

        let telemetry = Arc::new(TelemetryCollector::new(metrics_file));

        let governance = Arc::new(
            GovernanceEngine::new(
                provenance_root,
                risk_policy_file,
                capabilities_file,
                self.config.governance.daily_synthesis_quota,
                self.config.governance.weekly_promotion_quota,
            )
            .with_reasoning(reasoning.clone())
            .with_telemetry(telemetry.clone()),
        );

        let shadow = Arc::new(ShadowTester::new(shadow_results_log, sandbox.clone()));

        let deploy = Arc::new(DeploymentPipeline::new(
            root.clone(),
            backup_root,
            deploy_history_file,
            sandbox.clone(),
        ));

        let registry = ActionRegistry::new(
            env_target_file_abs.clone(),
            sandbox.clone(),
            root.clone(),
            issues_dir,
        );
        let dispatcher = Arc::new(ActionDispatcher::new(
            guardrails.clone(),
            registry,
            env_target_file_abs,
        ));

        let playbooks = load_playbooks(&playbook_file);
        let bus = HealBusBuilder::new(heal_journal)
            .playbooks(playbooks)
            .executor(dispatcher)
            .build();

        CoreContext {
            config: self.config,
            bus,
            guardrails,
            governance,
            shadow,
            reasoning,
            deploy,
            telemetry,
            sandbox,
            approval_queue: Mutex::new(Vec::new()),
            approval_queue_file,
        }
    }
}

/// The wired-together Autonomous Improvement Core. Holds one instance of
/// every engine; nothing outside this struct owns a bus, a governance
/// directory, or a deployment lock.
pub struct CoreContext {
    config: AicConfig,
    bus: HealBus,
    guardrails: Arc<Guardrails>,
    governance: Arc<GovernanceEngine>,
    shadow: Arc<ShadowTester>,
    reasoning: Arc<ReasoningCoordinator>,
    deploy: Arc<DeploymentPipeline>,
    telemetry: Arc<TelemetryCollector>,
    sandbox: Arc<dyn SandboxRunner>,
    approval_queue: Mutex<Vec<ImprovementAlert>>,
    approval_queue_file: PathBuf,
}

impl CoreContext {
    pub fn config(&self) -> &AicConfig {
        &self.config
    }

    pub fn bus(&self) -> &HealBus {
        &self.bus
    }

    pub fn guardrails(&self) -> &Arc<Guardrails> {
        &self.guardrails
    }

    pub fn governance(&self) -> &Arc<GovernanceEngine> {
        &self.governance
    }

    pub fn shadow(&self) -> &Arc<ShadowTester> {
        &self.shadow
    }

    pub fn reasoning(&self) -> &Arc<ReasoningCoordinator> {
        &self.reasoning
    }

    pub fn deploy(&self) -> &Arc<DeploymentPipeline> {
        &self.deploy
    }

    pub fn telemetry(&self) -> &Arc<TelemetryCollector> {
        &self.telemetry
    }

    pub fn sandbox(&self) -> &Arc<dyn SandboxRunner> {
        &self.sandbox
    }

    fn critical_component(component: &str) -> bool {
        let component = component.to_lowercase();
        CRITICAL_COMPONENTS.iter().any(|needle| component.contains(needle))
    }

    /// `_check_auto_approval`'s heuristic (SPEC_FULL.md §9 Open Question 4):
    /// risk in `{low, medium}`, confidence >= 0.6, component not critical.
    fn heuristic_auto_approve(proposal: &ImprovementProposal) -> bool {
        !Self::critical_component(&proposal.component)
            && matches!(proposal.risk_level, RiskClass::Low | RiskClass::Medium)
            && proposal.confidence >= 0.6
    }

    /// Consults the reasoning coordinator's debate first; an outright,
    /// non-revision-requiring approval wins. Anything else — rejected,
    /// conditional, needs-revision — falls back to the heuristic, which is
    /// itself vetoed by the critical-component denylist regardless of what
    /// the debate said (S3: `authentication` never auto-deploys).
    fn decide_auto_approval(&self, proposal: &ImprovementProposal) -> bool {
        if Self::critical_component(&proposal.component) {
            return false;
        }

        let proposed = ProposedDecision {
            summary: format!("auto-approve {}: {}", proposal.task_id, proposal.description),
            confidence: proposal.confidence,
            risk: match proposal.risk_level {
                RiskClass::Low => 0.1,
                RiskClass::Medium => 0.5,
                RiskClass::High => 0.9,
            },
        };
        let verdict = self.reasoning.debate_decision(&proposed, 2);
        if verdict.verdict == aic_protocol::Verdict::Approved && !verdict.requires_revision {
            return true;
        }

        Self::heuristic_auto_approve(proposal)
    }

    async fn load_approval_queue(&self) -> Vec<ImprovementAlert> {
        match tokio::fs::read_to_string(&self.approval_queue_file).await {
            Ok(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw).unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Write-replace: serialize to a sibling temp file, then rename into
    /// place (§5 "persistent JSON file with a write-replace pattern").
    async fn store_approval_queue(&self, queue: &[ImprovementAlert]) -> AicResult<()> {
        if let Some(parent) = self.approval_queue_file.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AicError::TransientStorage(format!("creating {parent:?}: {e}")))?;
        }
        let rendered = serde_json::to_string_pretty(queue)
            .map_err(|e| AicError::Fatal(format!("serializing approval queue: {e}")))?;
        let tmp = self.approval_queue_file.with_extension("json.tmp");
        tokio::fs::write(&tmp, rendered)
            .await
            .map_err(|e| AicError::TransientStorage(format!("writing {tmp:?}: {e}")))?;
        tokio::fs::rename(&tmp, &self.approval_queue_file)
            .await
            .map_err(|e| AicError::TransientStorage(format!("renaming into {:?}: {e}", self.approval_queue_file)))
    }

    async fn queue_for_review(&self, alert: ImprovementAlert) -> AicResult<()> {
        let mut queue = self.approval_queue.lock().await;
        if queue.is_empty() {
            *queue = self.load_approval_queue().await;
        }
        queue.push(alert);
        self.store_approval_queue(&queue).await
    }

    pub async fn pending_approvals(&self) -> Vec<ImprovementAlert> {
        let queue = self.approval_queue.lock().await;
        if queue.is_empty() {
            self.load_approval_queue().await
        } else {
            queue.clone()
        }
    }

    /// Ingests an improvement proposal: rejects malformed input outright
    /// (§7 `IngestionRejected`), then either deploys it immediately (auto-
    /// approval) or queues it as an `ImprovementAlert` for manual review.
    /// Never applies a change without having gone through
    /// `DeploymentPipeline::deploy`'s backup/validate/rollback workflow.
    #[instrument(skip(self, proposal), fields(task_id = %proposal.task_id, component = %proposal.component))]
    pub async fn submit_improvement(&self, proposal: ImprovementProposal) -> AicResult<SubmitOutcome> {
        proposal.validate()?;

        if self.decide_auto_approval(&proposal) {
            info!(task_id = %proposal.task_id, "auto-approved, deploying");
            let result = self
                .deploy
                .deploy(&proposal, &self.config.paths.env_target_file)
                .await?;
            Ok(SubmitOutcome::Deployed(result))
        } else {
            let alert = ImprovementAlert::from_proposal(&proposal);
            warn!(task_id = %proposal.task_id, "auto-approval denied, queued for manual review");
            self.queue_for_review(alert.clone()).await?;
            Ok(SubmitOutcome::Queued(alert))
        }
    }

    /// Graceful shutdown: stop accepting new heal events and drain the bus
    /// worker (§5, default 5s deadline — enforced inside `HealBus::shutdown`).
    pub async fn shutdown(self) {
        self.bus.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aic_protocol::ParameterRecommendations;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    fn config_with_root(root: PathBuf) -> AicConfig {
        let mut config = AicConfig::default();
        config.paths.root = root;
        config
    }

    fn proposal(task_id: &str, component: &str, risk: RiskClass, confidence: f64) -> ImprovementProposal {
        let mut apply_map = indexmap::IndexMap::new();
        apply_map.insert("k".to_string(), "KLR_K".to_string());
        let mut params = indexmap::IndexMap::new();
        params.insert("k".to_string(), serde_json::json!(200));

        ImprovementProposal {
            task_id: task_id.to_string(),
            component: component.to_string(),
            description: "tune a parameter".to_string(),
            expected_benefit: "lower latency".to_string(),
            risk_level: risk,
            confidence,
            parameter_recommendations: Some(ParameterRecommendations { apply_map, params }),
        }
    }

    #[tokio::test]
    async fn low_risk_high_confidence_auto_deploys() {
        let root = unique_root("aic-core-s2");
        let core = CoreContextBuilder::new(config_with_root(root.clone())).build();

        let outcome = core
            .submit_improvement(proposal("t1", "latency_tuner", RiskClass::Low, 0.85))
            .await
            .unwrap();

        match outcome {
            SubmitOutcome::Deployed(result) => {
                assert!(result.changes_applied.iter().any(|c| c.starts_with("UPDATED") || c.starts_with("ADDED")));
            }
            SubmitOutcome::Queued(_) => panic!("expected auto-deployment"),
        }

        let _ = tokio::fs::remove_dir_all(root).await;
    }

    #[tokio::test]
    async fn critical_component_is_always_queued() {
        let root = unique_root("aic-core-s3");
        let core = CoreContextBuilder::new(config_with_root(root.clone())).build();

        let outcome = core
            .submit_improvement(proposal("t2", "authentication", RiskClass::Low, 0.95))
            .await
            .unwrap();

        match outcome {
            SubmitOutcome::Queued(alert) => assert_eq!(alert.component, "authentication"),
            SubmitOutcome::Deployed(_) => panic!("authentication must never auto-deploy"),
        }

        let env_file = root.join(".kloros_env");
        assert!(!env_file.exists(), "no file should have been touched for a queued improvement");

        let _ = tokio::fs::remove_dir_all(root).await;
    }

    #[tokio::test]
    async fn missing_implementation_data_is_rejected_at_ingestion() {
        let root = unique_root("aic-core-ingestion");
        let core = CoreContextBuilder::new(config_with_root(root.clone())).build();

        let mut bad = proposal("t3", "reasoning", RiskClass::Low, 0.9);
        bad.parameter_recommendations = None;

        let error = core.submit_improvement(bad).await.unwrap_err();
        assert!(matches!(error, AicError::IngestionRejected(_)));

        let _ = tokio::fs::remove_dir_all(root).await;
    }

    #[tokio::test]
    async fn pending_approvals_persist_across_contexts() {
        let root = unique_root("aic-core-queue");
        let core = CoreContextBuilder::new(config_with_root(root.clone())).build();
        core.submit_improvement(proposal("t4", "payments", RiskClass::Low, 0.9)).await.unwrap();

        let reopened = CoreContextBuilder::new(config_with_root(root.clone())).build();
        let pending = reopened.pending_approvals().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].component, "payments");

        let _ = tokio::fs::remove_dir_all(root).await;
    }
}
