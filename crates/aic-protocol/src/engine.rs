use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::event::HealEvent;
use crate::playbook::Playbook;

/// Terminal state of one event's run through the self-heal state machine
/// (§4.1): `received -> matched -> (guardrails ok | denied) -> (applied ->
/// validated | rolled_back) -> done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    NoMatch,
    GuardrailDenied,
    Applied,
    Validated,
    RolledBack,
}

/// Structured outcome record logged for every processed event, per §4.1's
/// requirement that terminal states be logged this way rather than via ad
/// hoc messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub event_id: String,
    pub playbook: Option<String>,
    pub state: ExecutionState,
    pub detail: String,
}

/// Executes the steps of a matched playbook against an event: guardrail
/// checks, action dispatch, rollback-on-failure. Implemented by `aic-actions`
/// and injected into `aic-bus`'s `HealBus` by `aic-core`, so the bus never
/// depends on the action/guardrail crates directly.
#[async_trait]
pub trait PlaybookExecutor: Send + Sync {
    async fn execute(&self, event: &HealEvent, playbook: &Playbook) -> ExecutionOutcome;
}
