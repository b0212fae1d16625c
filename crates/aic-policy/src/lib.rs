//! Guardrails (mode, rate limiter, action whitelist, parameter bounds) and
//! the risk-policy table governance consults for high-risk promotions.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::time::{Duration, Instant};

use aic_protocol::{ActionKind, ActionParams, GuardrailMode, RiskClass};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
const RESTART_SERVICE_ALLOW_LIST: &[&str] = &["kloros.service", "kloros-observer.service"];
const SET_TIMEOUT_MAX_SECONDS: u64 = 300;

#[derive(Debug, Clone, PartialEq)]
pub enum GuardrailDecision {
    Allowed,
    DryRun,
    Denied(String),
}

impl GuardrailDecision {
    pub fn is_execute(&self) -> bool {
        matches!(self, GuardrailDecision::Allowed)
    }
}

/// Per-source sliding-window rate limiter plus mode/whitelist/parameter
/// checks (§4.1 Guardrails). The window resets on process restart since
/// state is purely in-memory (§8 property 3).
pub struct Guardrails {
    mode: GuardrailMode,
    rate_limit_per_minute: u32,
    buckets: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl Guardrails {
    pub fn new(mode: GuardrailMode, rate_limit_per_minute: u32) -> Self {
        Self {
            mode,
            rate_limit_per_minute,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> GuardrailMode {
        self.mode
    }

    fn check_rate_limit(&self, source: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let deque = buckets.entry(source.to_owned()).or_default();

        while let Some(&oldest) = deque.front() {
            if now.duration_since(oldest) >= RATE_LIMIT_WINDOW {
                deque.pop_front();
            } else {
                break;
            }
        }

        if deque.len() as u32 >= self.rate_limit_per_minute {
            warn!(source, "guardrails: rate limit exceeded");
            false
        } else {
            deque.push_back(now);
            true
        }
    }

    fn check_params(&self, action: ActionKind, params: &ActionParams) -> Result<(), String> {
        match action {
            ActionKind::SetTimeout => {
                let new_timeout_s = params.get("new_timeout_s").and_then(|v| v.as_u64()).unwrap_or(0);
                if new_timeout_s > SET_TIMEOUT_MAX_SECONDS {
                    return Err(format!("timeout too large: {new_timeout_s}s"));
                }
            }
            ActionKind::RestartService => {
                let service = params.get("service").and_then(|v| v.as_str()).unwrap_or("");
                if !RESTART_SERVICE_ALLOW_LIST.contains(&service) {
                    return Err(format!("service restart not allowed: {service}"));
                }
            }
            ActionKind::KillStuckProcesses => {
                let pattern = params.get("pattern").and_then(|v| v.as_str()).unwrap_or("");
                if pattern.is_empty() {
                    return Err("kill_stuck_processes requires a non-empty pattern".to_owned());
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Full guardrail evaluation for one playbook step: mode short-circuits
    /// in DRY-RUN, otherwise rate limit then parameter bounds are checked
    /// in order (matching the original's `should_heal` + `is_action_allowed`
    /// composition).
    pub fn evaluate(&self, source: &str, action: ActionKind, params: &ActionParams) -> GuardrailDecision {
        if self.mode == GuardrailMode::DryRun {
            return GuardrailDecision::DryRun;
        }

        if !self.check_rate_limit(source) {
            return GuardrailDecision::Denied(format!("rate limit exceeded for source {source}"));
        }

        if let Err(reason) = self.check_params(action, params) {
            return GuardrailDecision::Denied(reason);
        }

        GuardrailDecision::Allowed
    }
}

/// One entry of the risk-policy table (§6 "Risk policy file").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskPolicyEntry {
    pub risk: RiskClass,
    #[serde(default)]
    pub allowed_brokers: Vec<String>,
    #[serde(default)]
    pub allowed_topics: Vec<String>,
    #[serde(default)]
    pub payload_schema: Option<serde_json::Value>,
    #[serde(default)]
    pub read_only: bool,
}

/// Loads the risk-policy table keyed by tool name. Per the fail-closed
/// resolution (SPEC_FULL.md §9), a missing file is `Err`, not an empty-but-ok
/// table — callers evaluating gate 4 for a `high`-risk artifact must treat
/// that as a gate failure, never a silent allow.
pub fn load_risk_policy_table(path: &Path) -> aic_protocol::AicResult<HashMap<String, RiskPolicyEntry>> {
    if !path.exists() {
        return Err(aic_protocol::AicError::GateFailed(vec![
            "risk policy unavailable".to_owned(),
        ]));
    }

    let raw = std::fs::read_to_string(path)
        .map_err(|e| aic_protocol::AicError::Fatal(format!("reading risk policy {path:?}: {e}")))?;
    serde_json::from_str(&raw)
        .map_err(|e| aic_protocol::AicError::Fatal(format!("parsing risk policy {path:?}: {e}")))
}
