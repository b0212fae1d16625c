use serde::{Deserialize, Serialize};

/// The exactly-twelve whitelisted action names (§6). Unknown action names
/// never construct one of these — they are denied at the whitelist
/// boundary before this type is even consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    SetFlag,
    SetTimeout,
    LowerThreshold,
    EnforceMuteWrapper,
    EnableAck,
    ClearSwap,
    KillDuplicateProcess,
    KillStuckProcesses,
    RestartService,
    AddMissingCall,
    AddNullCheck,
    ConsolidateDuplicates,
}

impl ActionKind {
    pub fn name(self) -> &'static str {
        match self {
            ActionKind::SetFlag => "set_flag",
            ActionKind::SetTimeout => "set_timeout",
            ActionKind::LowerThreshold => "lower_threshold",
            ActionKind::EnforceMuteWrapper => "enforce_mute_wrapper",
            ActionKind::EnableAck => "enable_ack",
            ActionKind::ClearSwap => "clear_swap",
            ActionKind::KillDuplicateProcess => "kill_duplicate_process",
            ActionKind::KillStuckProcesses => "kill_stuck_processes",
            ActionKind::RestartService => "restart_service",
            ActionKind::AddMissingCall => "add_missing_call",
            ActionKind::AddNullCheck => "add_null_check",
            ActionKind::ConsolidateDuplicates => "consolidate_duplicates",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "set_flag" => ActionKind::SetFlag,
            "set_timeout" => ActionKind::SetTimeout,
            "lower_threshold" => ActionKind::LowerThreshold,
            "enforce_mute_wrapper" => ActionKind::EnforceMuteWrapper,
            "enable_ack" => ActionKind::EnableAck,
            "clear_swap" => ActionKind::ClearSwap,
            "kill_duplicate_process" => ActionKind::KillDuplicateProcess,
            "kill_stuck_processes" => ActionKind::KillStuckProcesses,
            "restart_service" => ActionKind::RestartService,
            "add_missing_call" => ActionKind::AddMissingCall,
            "add_null_check" => ActionKind::AddNullCheck,
            "consolidate_duplicates" => ActionKind::ConsolidateDuplicates,
            _ => return None,
        })
    }
}

/// Action-specific parameters, read from the playbook's YAML `params:`
/// block. Kept as a loosely-typed map (rather than a per-variant struct)
/// because the playbook loader has no a-priori reason to reject unknown
/// keys — `aic-policy`'s parameter-bound checks and each
/// `ActionHandler` impl pull out only the fields they need and report a
/// precise `ActionFailed` if a required one is missing.
pub type ActionParams = serde_json::Map<String, serde_json::Value>;
