use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AicError, AicResult};

/// Filesystem layout the rest of the core reads and writes under.
///
/// `capabilities_file` is the single canonical path for the promotion
/// registry; see the config-conflict check in `AicConfig::load`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub root: PathBuf,
    pub capabilities_file: PathBuf,
    pub risk_policy_file: PathBuf,
    pub env_target_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".kloros"),
            capabilities_file: PathBuf::from("config/capabilities.yaml"),
            risk_policy_file: PathBuf::from("config/synthesis_policy.json"),
            env_target_file: PathBuf::from(".kloros_env"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GuardrailMode {
    Safe,
    Auto,
    #[serde(rename = "DRY-RUN")]
    DryRun,
}

impl Default for GuardrailMode {
    fn default() -> Self {
        Self::Safe
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailsConfig {
    pub mode: GuardrailMode,
    pub rate_limit_per_minute: u32,
}

impl Default for GuardrailsConfig {
    fn default() -> Self {
        Self {
            mode: GuardrailMode::Safe,
            rate_limit_per_minute: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    pub daily_synthesis_quota: u32,
    pub weekly_promotion_quota: u32,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            daily_synthesis_quota: 50,
            weekly_promotion_quota: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowConfig {
    pub min_samples: u32,
    pub min_accuracy: f64,
    pub max_error_rate: f64,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            min_samples: 10,
            min_accuracy: 0.8,
            max_error_rate: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReasoningConfig {
    pub cost_weight: f64,
    pub risk_weight: f64,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            cost_weight: 1.0,
            risk_weight: 0.5,
        }
    }
}

/// Top-level config loaded from `--config` (default `./kloros.toml`). Every
/// field has a default, so a missing file is not itself an error — callers
/// that need fail-closed behavior (the risk-policy gate) check file
/// existence separately from config loading.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AicConfig {
    pub paths: PathsConfig,
    pub guardrails: GuardrailsConfig,
    pub governance: GovernanceConfig,
    pub shadow: ShadowConfig,
    pub reasoning: ReasoningConfig,
}

impl AicConfig {
    /// Loads from `path` if it exists, else returns defaults. Env vars
    /// named in §6 override the matching field after file load.
    pub fn load(path: &Path) -> AicResult<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| AicError::Fatal(format!("reading config {path:?}: {e}")))?;
            toml::from_str(&raw)
                .map_err(|e| AicError::Fatal(format!("parsing config {path:?}: {e}")))?
        } else {
            Self::default()
        };

        if let Ok(mode) = std::env::var("KLR_HEAL_MODE") {
            config.guardrails.mode = match mode.as_str() {
                "SAFE" => GuardrailMode::Safe,
                "AUTO" => GuardrailMode::Auto,
                "DRY-RUN" => GuardrailMode::DryRun,
                other => {
                    return Err(AicError::Fatal(format!(
                        "invalid KLR_HEAL_MODE: {other}"
                    )));
                }
            };
        }
        if let Ok(limit) = std::env::var("KLR_HEAL_RATE_LIMIT") {
            config.guardrails.rate_limit_per_minute = limit
                .parse()
                .map_err(|_| AicError::Fatal(format!("invalid KLR_HEAL_RATE_LIMIT: {limit}")))?;
        }

        Ok(config)
    }

    /// Fails loudly if a `--config`-declared capabilities path and this
    /// config's own path disagree, per the "two YAML paths" resolution.
    pub fn require_consistent_capabilities_path(&self, cli_override: Option<&Path>) -> AicResult<()> {
        if let Some(cli_path) = cli_override {
            if cli_path != self.paths.capabilities_file {
                return Err(AicError::Fatal(format!(
                    "capabilities path mismatch: config declares {:?}, CLI passed {:?}",
                    self.paths.capabilities_file, cli_path
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = AicConfig::default();
        assert_eq!(config.guardrails.rate_limit_per_minute, 6);
        assert_eq!(config.governance.daily_synthesis_quota, 50);
        assert_eq!(config.governance.weekly_promotion_quota, 200);
        assert_eq!(config.shadow.min_samples, 10);
        assert!((config.shadow.min_accuracy - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let config = AicConfig::load(Path::new("/nonexistent/kloros.toml")).unwrap();
        assert_eq!(config.paths.root, PathBuf::from(".kloros"));
    }

    #[test]
    fn mismatched_capabilities_path_errors() {
        let config = AicConfig::default();
        let err = config
            .require_consistent_capabilities_path(Some(Path::new("other.yaml")))
            .unwrap_err();
        assert!(matches!(err, AicError::Fatal(_)));
    }
}
