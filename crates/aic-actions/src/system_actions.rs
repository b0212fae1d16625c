//! The four process/service actions (`clear_swap`, `kill_duplicate_process`,
//! `kill_stuck_processes`, `restart_service`), ported from the Python
//! `actions_system.py` originals. All four there declare `rollback` as a
//! trivial success — you cannot un-kill a process or un-swapoff memory —
//! so this handler's `rollback` is likewise a no-op.

use std::path::PathBuf;
use std::sync::Arc;

use aic_protocol::{ActionKind, ActionParams, AicError};
use aic_sandbox::{SandboxLimits, SandboxRequest, SandboxRunner};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::instrument;

use crate::{ActionHandler, Applied};

fn require_str(params: &ActionParams, key: &str) -> Result<String, AicError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| AicError::ActionFailed(format!("missing required param: {key}")))
}

pub struct SystemActionHandler {
    kind: ActionKind,
    sandbox: Arc<dyn SandboxRunner>,
    working_dir: PathBuf,
}

impl SystemActionHandler {
    pub fn new(kind: ActionKind, sandbox: Arc<dyn SandboxRunner>, working_dir: PathBuf) -> Self {
        Self { kind, sandbox, working_dir }
    }

    fn request(&self, command: &str, args: &[&str], limit_secs: u64) -> SandboxRequest {
        SandboxRequest {
            command: command.to_owned(),
            args: args.iter().map(|s| s.to_string()).collect(),
            cwd: self.working_dir.clone(),
            env: Default::default(),
            read_only: false,
            limits: SandboxLimits { max_runtime_secs: limit_secs, max_output_bytes: 16 * 1024 },
        }
    }

    async fn run(&self, request: SandboxRequest) -> Result<(), AicError> {
        self.run_capture(request).await.map(|_| ())
    }

    async fn run_capture(&self, request: SandboxRequest) -> Result<String, AicError> {
        let execution = self
            .sandbox
            .run(request)
            .await
            .map_err(|e| AicError::ActionFailed(e.to_string()))?;
        if !execution.succeeded() {
            return Err(AicError::ActionFailed(format!(
                "command failed (exit {}): {}",
                execution.exit_code, execution.stderr
            )));
        }
        Ok(execution.stdout)
    }

    /// Finds every PID matching `process_name`, keeping the oldest alive
    /// and killing the rest. Ported from the Python original's
    /// `KillDuplicateProcessAction.apply`: enumerate matches, sort by
    /// start time, `duplicates = matching_procs[1:]`.
    async fn kill_duplicate_processes(&self, process_name: &str) -> Result<Value, AicError> {
        let pgrep = self
            .sandbox
            .run(self.request("pgrep", &["-f", process_name], 10))
            .await
            .map_err(|e| AicError::ActionFailed(e.to_string()))?;
        // pgrep exits 1 with empty stdout when nothing matches; that's not
        // a command failure, just zero duplicates.
        if pgrep.exit_code != 0 && !pgrep.stdout.trim().is_empty() {
            return Err(AicError::ActionFailed(format!(
                "pgrep failed (exit {}): {}",
                pgrep.exit_code, pgrep.stderr
            )));
        }

        let pids: Vec<i64> = pgrep.stdout.lines().filter_map(|line| line.trim().parse::<i64>().ok()).collect();
        if pids.len() <= 1 {
            return Ok(json!({ "process_name": process_name, "killed_pids": Vec::<i64>::new() }));
        }

        let pid_list = pids.iter().map(i64::to_string).collect::<Vec<_>>().join(",");
        // etimes = elapsed seconds since start; larger means started
        // earlier, so the process with the largest etimes is the oldest.
        let ps_stdout = self
            .run_capture(self.request("ps", &["-o", "pid=,etimes=", "-p", pid_list.as_str()], 10))
            .await?;

        let mut by_age: Vec<(i64, i64)> = ps_stdout
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let pid = fields.next()?.parse::<i64>().ok()?;
                let etimes = fields.next()?.parse::<i64>().ok()?;
                Some((pid, etimes))
            })
            .collect();
        if by_age.len() <= 1 {
            return Ok(json!({ "process_name": process_name, "killed_pids": Vec::<i64>::new() }));
        }
        by_age.sort_by_key(|(_, etimes)| std::cmp::Reverse(*etimes));

        let kept_pid = by_age[0].0;
        let duplicate_pids: Vec<i64> = by_age[1..].iter().map(|(pid, _)| *pid).collect();

        let mut kill_args: Vec<String> = vec!["-9".to_owned()];
        kill_args.extend(duplicate_pids.iter().map(i64::to_string));
        let kill_args_ref: Vec<&str> = kill_args.iter().map(String::as_str).collect();
        self.run(self.request("kill", &kill_args_ref, 10)).await?;

        Ok(json!({ "process_name": process_name, "kept_pid": kept_pid, "killed_pids": duplicate_pids }))
    }
}

#[async_trait]
impl ActionHandler for SystemActionHandler {
    fn kind(&self) -> ActionKind {
        self.kind
    }

    #[instrument(skip(self, params), fields(action = self.kind.name()))]
    async fn apply(&self, params: &ActionParams) -> Result<Applied, AicError> {
        match self.kind {
            ActionKind::ClearSwap => {
                self.run(self.request("sudo", &["swapoff", "-a"], 60)).await?;
                self.run(self.request("sudo", &["swapon", "-a"], 10)).await?;
                Ok(Applied { action: self.kind, rollback_data: Value::Null })
            }
            ActionKind::KillDuplicateProcess => {
                let process_name = require_str(params, "process_name")?;
                let rollback_data = self.kill_duplicate_processes(&process_name).await?;
                Ok(Applied { action: self.kind, rollback_data })
            }
            ActionKind::KillStuckProcesses => {
                let pattern = require_str(params, "pattern")?;
                self.run(self.request("pkill", &["-f", &pattern], 10)).await?;
                Ok(Applied { action: self.kind, rollback_data: json!({ "pattern": pattern }) })
            }
            ActionKind::RestartService => {
                let service = require_str(params, "service")?;
                self.run(self.request("sudo", &["systemctl", "restart", &service], 30)).await?;
                Ok(Applied { action: self.kind, rollback_data: json!({ "service": service }) })
            }
            other => Err(AicError::ActionFailed(format!("{} is not a system action", other.name()))),
        }
    }

    async fn rollback(&self, _applied: &Applied) -> Result<(), AicError> {
        Ok(())
    }
}
