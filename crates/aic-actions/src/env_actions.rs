//! The five env-var actions (`set_flag`, `set_timeout`, `lower_threshold`,
//! `enforce_mute_wrapper`, `enable_ack`): all read/write the same
//! `.kloros_env` line-oriented file, so they share one handler keyed by
//! which env var and value each `ActionKind` writes.

use std::path::PathBuf;

use aic_protocol::{ActionKind, ActionParams, AicError};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::fs;
use tracing::instrument;

use crate::{ActionHandler, Applied};

/// Maps an `ActionKind` to the env var it sets, per §6's action table.
fn target_var(kind: ActionKind, params: &ActionParams) -> Result<(String, String), AicError> {
    match kind {
        ActionKind::SetFlag => {
            let var = require_str(params, "var")?;
            let value = require_str(params, "value")?;
            Ok((var, value))
        }
        ActionKind::SetTimeout => {
            let new_timeout_s = params
                .get("new_timeout_s")
                .and_then(Value::as_u64)
                .ok_or_else(|| AicError::ActionFailed("set_timeout requires new_timeout_s".to_owned()))?;
            Ok(("KLR_TIMEOUT_S".to_owned(), new_timeout_s.to_string()))
        }
        ActionKind::LowerThreshold => {
            let new_threshold = params
                .get("new_threshold")
                .and_then(Value::as_f64)
                .ok_or_else(|| AicError::ActionFailed("lower_threshold requires new_threshold".to_owned()))?;
            Ok(("KLR_THRESHOLD".to_owned(), new_threshold.to_string()))
        }
        ActionKind::EnforceMuteWrapper => Ok(("KLR_MUTE_WRAPPER".to_owned(), "1".to_owned())),
        ActionKind::EnableAck => Ok(("KLR_ACK_ENABLED".to_owned(), "1".to_owned())),
        other => Err(AicError::ActionFailed(format!("{} is not an env var action", other.name()))),
    }
}

fn require_str(params: &ActionParams, key: &str) -> Result<String, AicError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| AicError::ActionFailed(format!("missing required param: {key}")))
}

/// Reads `env_target_file` as `KEY=VALUE` lines, returning the previous
/// value of `var` if present so it can be restored on rollback.
async fn read_current(env_target_file: &std::path::Path, var: &str) -> Option<String> {
    let content = fs::read_to_string(env_target_file).await.ok()?;
    let prefix = format!("{var}=");
    content.lines().find_map(|line| line.strip_prefix(&prefix)).map(str::to_owned)
}

/// Rewrites `env_target_file` so `var` is set to `new_value`, preserving
/// every other line and appending a fresh `var=new_value` line if it
/// wasn't already present.
async fn write_var(env_target_file: &std::path::Path, var: &str, new_value: &str) -> Result<(), AicError> {
    let content = fs::read_to_string(env_target_file).await.unwrap_or_default();
    let prefix = format!("{var}=");
    let mut found = false;
    let mut lines: Vec<String> = content
        .lines()
        .map(|line| {
            if line.starts_with(&prefix) {
                found = true;
                format!("{var}={new_value}")
            } else {
                line.to_owned()
            }
        })
        .collect();
    if !found {
        lines.push(format!("{var}={new_value}"));
    }
    let mut rendered = lines.join("\n");
    rendered.push('\n');

    let tmp = env_target_file.with_extension("tmp");
    fs::write(&tmp, rendered)
        .await
        .map_err(|e| AicError::TransientStorage(format!("writing {env_target_file:?}: {e}")))?;
    fs::rename(&tmp, env_target_file)
        .await
        .map_err(|e| AicError::TransientStorage(format!("renaming into {env_target_file:?}: {e}")))
}

/// Removes `var`'s line entirely, used by rollback when the var did not
/// previously exist.
async fn remove_var(env_target_file: &std::path::Path, var: &str) -> Result<(), AicError> {
    let content = fs::read_to_string(env_target_file).await.unwrap_or_default();
    let prefix = format!("{var}=");
    let mut rendered: String = content
        .lines()
        .filter(|line| !line.starts_with(&prefix))
        .collect::<Vec<_>>()
        .join("\n");
    if !rendered.is_empty() {
        rendered.push('\n');
    }
    let tmp = env_target_file.with_extension("tmp");
    fs::write(&tmp, rendered)
        .await
        .map_err(|e| AicError::TransientStorage(format!("writing {env_target_file:?}: {e}")))?;
    fs::rename(&tmp, env_target_file)
        .await
        .map_err(|e| AicError::TransientStorage(format!("renaming into {env_target_file:?}: {e}")))
}

pub struct EnvVarHandler {
    kind: ActionKind,
    env_target_file: PathBuf,
}

impl EnvVarHandler {
    pub fn new(kind: ActionKind, env_target_file: PathBuf) -> Self {
        Self { kind, env_target_file }
    }
}

#[async_trait]
impl ActionHandler for EnvVarHandler {
    fn kind(&self) -> ActionKind {
        self.kind
    }

    #[instrument(skip(self, params), fields(action = self.kind.name()))]
    async fn apply(&self, params: &ActionParams) -> Result<Applied, AicError> {
        let (var, new_value) = target_var(self.kind, params)?;
        let previous = read_current(&self.env_target_file, &var).await;
        write_var(&self.env_target_file, &var, &new_value).await?;
        Ok(Applied {
            action: self.kind,
            rollback_data: json!({ "var": var, "previous": previous }),
        })
    }

    async fn rollback(&self, applied: &Applied) -> Result<(), AicError> {
        let var = applied
            .rollback_data
            .get("var")
            .and_then(Value::as_str)
            .ok_or_else(|| AicError::ActionFailed("rollback_data missing var".to_owned()))?;
        match applied.rollback_data.get("previous").and_then(Value::as_str) {
            Some(previous) => write_var(&self.env_target_file, var, previous).await,
            None => remove_var(&self.env_target_file, var).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_flag_then_rollback_restores_previous_value() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join(".kloros_env");
        fs::write(&env_file, "A=0\nB=1\n").await.unwrap();

        let handler = EnvVarHandler::new(ActionKind::SetFlag, env_file.clone());
        let mut params = ActionParams::new();
        params.insert("var".to_owned(), json!("A"));
        params.insert("value".to_owned(), json!("1"));

        let applied = handler.apply(&params).await.unwrap();
        assert_eq!(fs::read_to_string(&env_file).await.unwrap(), "A=1\nB=1\n");

        handler.rollback(&applied).await.unwrap();
        assert_eq!(fs::read_to_string(&env_file).await.unwrap(), "A=0\nB=1\n");
    }

    #[tokio::test]
    async fn set_flag_on_fresh_var_rolls_back_by_removal() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join(".kloros_env");
        fs::write(&env_file, "B=1\n").await.unwrap();

        let handler = EnvVarHandler::new(ActionKind::SetFlag, env_file.clone());
        let mut params = ActionParams::new();
        params.insert("var".to_owned(), json!("A"));
        params.insert("value".to_owned(), json!("1"));

        let applied = handler.apply(&params).await.unwrap();
        handler.rollback(&applied).await.unwrap();
        assert_eq!(fs::read_to_string(&env_file).await.unwrap(), "B=1\n");
    }
}
