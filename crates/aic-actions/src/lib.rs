//! The twelve whitelisted heal actions (§6) and the playbook-step dispatcher
//! that consults Guardrails before executing each one and rolls back
//! previously-applied steps, in reverse order, on failure.

mod env_actions;
mod integration_actions;
mod system_actions;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use aic_policy::{GuardrailDecision, Guardrails};
use aic_protocol::{
    ActionKind, ActionParams, AicError, ExecutionOutcome, ExecutionState, HealEvent, Playbook,
    PlaybookExecutor, ValidateProbe,
};
use aic_sandbox::SandboxRunner;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, instrument, warn};

pub use env_actions::EnvVarHandler;
pub use integration_actions::{AddMissingCallHandler, AddNullCheckHandler, ConsolidateDuplicatesHandler};
pub use system_actions::SystemActionHandler;

/// Carries the private state an action captured during `apply`, opaque to
/// the dispatcher. `rollback` replays it to undo the action (§3 `HealAction`,
/// §9 "exception-for-control-flow ... becomes result values").
#[derive(Debug, Clone)]
pub struct Applied {
    pub action: ActionKind,
    pub rollback_data: Value,
}

/// One whitelisted action's `apply`/`rollback` pair. `apply` must either
/// succeed and return `Applied` with enough `rollback_data` to undo it, or
/// fail cleanly with no observable side effect.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn kind(&self) -> ActionKind;
    async fn apply(&self, params: &ActionParams) -> Result<Applied, AicError>;
    async fn rollback(&self, applied: &Applied) -> Result<(), AicError>;
}

/// Constructs the full twelve-entry handler table. There is no runtime
/// string-to-callable step (§9): every whitelisted name is wired to a
/// concrete handler at startup.
pub struct ActionRegistry {
    handlers: HashMap<ActionKind, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new(
        env_target_file: PathBuf,
        sandbox: Arc<dyn SandboxRunner>,
        working_dir: PathBuf,
        issues_dir: PathBuf,
    ) -> Self {
        let mut handlers: HashMap<ActionKind, Arc<dyn ActionHandler>> = HashMap::new();

        for kind in [
            ActionKind::SetFlag,
            ActionKind::SetTimeout,
            ActionKind::LowerThreshold,
            ActionKind::EnforceMuteWrapper,
            ActionKind::EnableAck,
        ] {
            handlers.insert(kind, Arc::new(EnvVarHandler::new(kind, env_target_file.clone())));
        }

        for kind in [
            ActionKind::ClearSwap,
            ActionKind::KillDuplicateProcess,
            ActionKind::KillStuckProcesses,
            ActionKind::RestartService,
        ] {
            handlers.insert(
                kind,
                Arc::new(SystemActionHandler::new(kind, sandbox.clone(), working_dir.clone())),
            );
        }

        handlers.insert(ActionKind::AddMissingCall, Arc::new(AddMissingCallHandler));
        handlers.insert(ActionKind::AddNullCheck, Arc::new(AddNullCheckHandler));
        handlers.insert(
            ActionKind::ConsolidateDuplicates,
            Arc::new(ConsolidateDuplicatesHandler::new(issues_dir)),
        );

        Self { handlers }
    }

    pub fn get(&self, kind: ActionKind) -> Option<&Arc<dyn ActionHandler>> {
        self.handlers.get(&kind)
    }
}

/// Runs a playbook's `validate` probe (§3 `Playbook.validate`). Only
/// `env_var_equals` is wired up; any other probe name fails closed rather
/// than silently passing, since an unimplemented probe is not evidence the
/// post-condition held.
async fn run_validate(probe: &ValidateProbe, env_target_file: &std::path::Path) -> bool {
    match probe.probe.as_str() {
        "env_var_equals" => {
            let Some(var) = probe.args.get("var").and_then(Value::as_str) else {
                return false;
            };
            let Some(expected) = probe.args.get("value").and_then(Value::as_str) else {
                return false;
            };
            let content = tokio::fs::read_to_string(env_target_file).await.unwrap_or_default();
            let prefix = format!("{var}=");
            content
                .lines()
                .find_map(|line| line.strip_prefix(&prefix))
                .is_some_and(|value| value == expected)
        }
        other => {
            warn!(probe = other, "unrecognized validate probe, failing closed");
            false
        }
    }
}

/// Dispatches a matched playbook's steps through Guardrails and the action
/// registry, rolling back previously-applied steps in reverse order on any
/// failure (guardrail denial, action failure, or validation failure).
pub struct ActionDispatcher {
    guardrails: Arc<Guardrails>,
    registry: ActionRegistry,
    env_target_file: PathBuf,
}

impl ActionDispatcher {
    pub fn new(guardrails: Arc<Guardrails>, registry: ActionRegistry, env_target_file: PathBuf) -> Self {
        Self { guardrails, registry, env_target_file }
    }

    async fn rollback_all(&self, applied: &[Applied]) {
        for step in applied.iter().rev() {
            if let Some(handler) = self.registry.get(step.action) {
                if let Err(error) = handler.rollback(step).await {
                    warn!(action = step.action.name(), %error, "rollback failed");
                }
            }
        }
    }
}

#[async_trait]
impl PlaybookExecutor for ActionDispatcher {
    #[instrument(skip(self, event, playbook), fields(event_id = %event.id, playbook = %playbook.name))]
    async fn execute(&self, event: &HealEvent, playbook: &Playbook) -> ExecutionOutcome {
        let mut applied: Vec<Applied> = Vec::new();

        for step in &playbook.steps {
            let Some(kind) = ActionKind::from_name(&step.action) else {
                return ExecutionOutcome {
                    event_id: event.id.clone(),
                    playbook: Some(playbook.name.clone()),
                    state: ExecutionState::GuardrailDenied,
                    detail: format!("unknown action: {}", step.action),
                };
            };

            match self.guardrails.evaluate(&event.source, kind, &step.params) {
                GuardrailDecision::Denied(reason) => {
                    self.rollback_all(&applied).await;
                    return ExecutionOutcome {
                        event_id: event.id.clone(),
                        playbook: Some(playbook.name.clone()),
                        state: ExecutionState::GuardrailDenied,
                        detail: reason,
                    };
                }
                GuardrailDecision::DryRun => {
                    info!(action = kind.name(), "dry-run: would execute, not executing");
                    continue;
                }
                GuardrailDecision::Allowed => {
                    let handler = match self.registry.get(kind) {
                        Some(handler) => handler,
                        None => {
                            self.rollback_all(&applied).await;
                            return ExecutionOutcome {
                                event_id: event.id.clone(),
                                playbook: Some(playbook.name.clone()),
                                state: ExecutionState::RolledBack,
                                detail: format!("no handler registered for {}", kind.name()),
                            };
                        }
                    };
                    match handler.apply(&step.params).await {
                        Ok(result) => applied.push(result),
                        Err(error) => {
                            self.rollback_all(&applied).await;
                            return ExecutionOutcome {
                                event_id: event.id.clone(),
                                playbook: Some(playbook.name.clone()),
                                state: ExecutionState::RolledBack,
                                detail: format!("action {} failed: {error}", kind.name()),
                            };
                        }
                    }
                }
            }
        }

        if let Some(probe) = &playbook.validate {
            if !run_validate(probe, &self.env_target_file).await {
                self.rollback_all(&applied).await;
                return ExecutionOutcome {
                    event_id: event.id.clone(),
                    playbook: Some(playbook.name.clone()),
                    state: ExecutionState::RolledBack,
                    detail: format!("validate probe {} failed", probe.probe),
                };
            }
            return ExecutionOutcome {
                event_id: event.id.clone(),
                playbook: Some(playbook.name.clone()),
                state: ExecutionState::Validated,
                detail: "steps applied and validated".to_owned(),
            };
        }

        ExecutionOutcome {
            event_id: event.id.clone(),
            playbook: Some(playbook.name.clone()),
            state: ExecutionState::Applied,
            detail: format!("{} step(s) applied", applied.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aic_protocol::{MatchPattern, PlaybookStep, Severity, ValidateProbe};
    use indexmap::IndexMap;
    use serde_json::json;

    struct UnusedRunner;

    #[async_trait]
    impl SandboxRunner for UnusedRunner {
        async fn run(&self, _request: aic_sandbox::SandboxRequest) -> anyhow::Result<aic_sandbox::SandboxExecution> {
            anyhow::bail!("sandbox not used in this test")
        }
    }

    fn dispatcher(env_file: PathBuf, issues_dir: PathBuf) -> ActionDispatcher {
        let guardrails = Arc::new(Guardrails::new(aic_protocol::GuardrailMode::Auto, 100));
        let registry = ActionRegistry::new(
            env_file.clone(),
            Arc::new(UnusedRunner),
            env_file.parent().unwrap().to_owned(),
            issues_dir,
        );
        ActionDispatcher::new(guardrails, registry, env_file)
    }

    fn event() -> HealEvent {
        HealEvent::new("rag", "synthesis_timeout", Severity::Error, IndexMap::new())
    }

    #[tokio::test]
    async fn rollback_on_validation_failure_restores_state() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join(".kloros_env");
        tokio::fs::write(&env_file, "A=0\n").await.unwrap();

        let code_file = dir.path().join("component.txt");
        let original = "line one\n    self.alert_manager.poll()\nline three\n";
        tokio::fs::write(&code_file, original).await.unwrap();

        let mut set_flag_params = ActionParams::new();
        set_flag_params.insert("var".to_owned(), json!("A"));
        set_flag_params.insert("value".to_owned(), json!("1"));

        let mut null_check_params = ActionParams::new();
        null_check_params.insert("file".to_owned(), json!(code_file.to_str().unwrap()));
        null_check_params.insert("component".to_owned(), json!("alert_manager"));
        null_check_params.insert("usage_line".to_owned(), json!(2));

        let playbook = Playbook {
            name: "test".to_owned(),
            rank: 50,
            match_pattern: MatchPattern::default(),
            steps: vec![
                PlaybookStep { action: "set_flag".to_owned(), params: set_flag_params },
                PlaybookStep { action: "add_null_check".to_owned(), params: null_check_params },
            ],
            validate: Some(ValidateProbe { probe: "always_fails".to_owned(), args: IndexMap::new() }),
            canary_scope: None,
        };

        let dispatcher = dispatcher(env_file.clone(), dir.path().join("issues"));
        let outcome = dispatcher.execute(&event(), &playbook).await;

        assert_eq!(outcome.state, ExecutionState::RolledBack);
        assert_eq!(tokio::fs::read_to_string(&env_file).await.unwrap(), "A=0\n");
        assert_eq!(tokio::fs::read_to_string(&code_file).await.unwrap(), original);
    }

    #[tokio::test]
    async fn add_null_check_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let code_file = dir.path().join("component.txt");
        tokio::fs::write(&code_file, "line one\n    self.alert_manager.poll()\nline three\n")
            .await
            .unwrap();

        let handler = AddNullCheckHandler;
        let mut params = ActionParams::new();
        params.insert("file".to_owned(), json!(code_file.to_str().unwrap()));
        params.insert("component".to_owned(), json!("alert_manager"));
        params.insert("usage_line".to_owned(), json!(2));

        handler.apply(&params).await.unwrap();
        let after_first = tokio::fs::read_to_string(&code_file).await.unwrap();

        let mut second_params = params.clone();
        second_params.insert("usage_line".to_owned(), json!(3));
        handler.apply(&second_params).await.unwrap();
        let after_second = tokio::fs::read_to_string(&code_file).await.unwrap();

        assert_eq!(after_first, after_second);
    }
}
