//! `kloros`: the Autonomous Improvement Core's CLI surface — `heal`,
//! `synth`, `deploy`, `shadow`, `alert`, `reason`. Every subcommand talks to
//! one [`aic_core::CoreContext`]; exit codes follow §6's 0/2/3/4/5 scheme.

use std::path::PathBuf;
use std::process::ExitCode;

use aic_core::{CoreContextBuilder, SubmitOutcome};
use aic_protocol::{AicConfig, AicError, AicResult, GuardrailMode, HealEvent, ImprovementProposal, Severity};
use clap::{Parser, Subcommand};
use indexmap::IndexMap;
use serde_json::Value;
use tracing::error;

#[derive(Debug, Parser)]
#[command(name = "kloros", about = "Autonomous Improvement Core CLI")]
struct Cli {
    /// Overrides the config file's guardrail mode for this invocation.
    #[arg(long, global = true)]
    mode: Option<ModeArg>,
    #[arg(long, global = true, default_value = "kloros.toml")]
    config: PathBuf,
    /// Overrides/confirms the config file's `paths.capabilities_file`;
    /// a disagreement is a startup error (SPEC_FULL.md §9, "two different
    /// YAML paths").
    #[arg(long, global = true)]
    capabilities: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum ModeArg {
    #[value(name = "SAFE")]
    Safe,
    #[value(name = "AUTO")]
    Auto,
    #[value(name = "DRY-RUN")]
    DryRun,
}

impl From<ModeArg> for GuardrailMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Safe => GuardrailMode::Safe,
            ModeArg::Auto => GuardrailMode::Auto,
            ModeArg::DryRun => GuardrailMode::DryRun,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Self-heal event bus.
    Heal {
        #[command(subcommand)]
        action: HealCommand,
    },
    /// Synthesis governance: quarantine/promoted capability registry.
    Synth {
        #[command(subcommand)]
        action: SynthCommand,
    },
    /// Deploys an already-approved improvement directly.
    Deploy {
        #[arg(long)]
        improvement: String,
    },
    /// Shadow-test traffic routing.
    Shadow {
        #[command(subcommand)]
        action: ShadowCommand,
    },
    /// Improvement intake, subject to auto-approval arbitration.
    Alert {
        #[command(subcommand)]
        action: AlertCommand,
    },
    /// Reasoning coordinator's Tree-of-Thought walk.
    Reason {
        #[command(subcommand)]
        action: ReasonCommand,
    },
}

#[derive(Debug, Subcommand)]
enum HealCommand {
    /// Runs the playbook matcher against `--event` without executing any
    /// action or touching the bus (§6: "run playbook matcher without side
    /// effects").
    DryRun {
        #[arg(long)]
        event: String,
    },
}

#[derive(Debug, Subcommand)]
enum SynthCommand {
    List {
        #[arg(long)]
        status: Option<String>,
    },
    Promote {
        name: String,
    },
}

#[derive(Debug, Subcommand)]
enum ShadowCommand {
    Enable {
        name: String,
        #[arg(long)]
        percent: f64,
    },
    Stats {
        name: String,
    },
}

#[derive(Debug, Subcommand)]
enum AlertCommand {
    Submit {
        #[arg(long)]
        proposal: String,
    },
}

#[derive(Debug, Subcommand)]
enum ReasonCommand {
    Explore {
        #[arg(long)]
        problem: String,
        #[arg(long, default_value_t = 4)]
        depth: usize,
    },
}

/// Minimal JSON shape accepted by `heal dry-run --event`; the bus itself
/// stamps `id`/`ts_wall`/`ts_mono` on construction, so a hand-authored
/// probe event only needs to supply what it's testing a match against.
#[derive(Debug, serde::Deserialize)]
struct HealEventInput {
    source: String,
    kind: String,
    #[serde(default = "default_severity")]
    severity: Severity,
    #[serde(default)]
    context: IndexMap<String, Value>,
}

fn default_severity() -> Severity {
    Severity::Warn
}

fn print_json(value: &impl serde::Serialize) {
    match serde_json::to_string_pretty(value) {
        Ok(rendered) => println!("{rendered}"),
        Err(error) => eprintln!("failed to render output: {error}"),
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(raw: &str, what: &str) -> AicResult<T> {
    serde_json::from_str(raw).map_err(|e| AicError::IngestionRejected(format!("invalid {what}: {e}")))
}

async fn run(cli: Cli) -> AicResult<i32> {
    let mut config = AicConfig::load(&cli.config)?;
    config.require_consistent_capabilities_path(cli.capabilities.as_deref())?;
    if let Some(mode) = cli.mode {
        config.guardrails.mode = mode.into();
    }
    let ctx = CoreContextBuilder::new(config).build();

    match cli.command {
        Command::Heal { action: HealCommand::DryRun { event } } => {
            let input: HealEventInput = parse_json(&event, "heal event")?;
            let probe = HealEvent::new(input.source, input.kind, input.severity, input.context);
            let playbook_file = ctx.config().paths.root.join("playbooks.yaml");
            let playbooks = aic_bus::load_playbooks(&playbook_file);
            let matches = aic_protocol::find_matching(&probe, &playbooks);
            print_json(&serde_json::json!({
                "event": probe,
                "matched_playbooks": matches.iter().map(|pb| &pb.name).collect::<Vec<_>>(),
            }));
            Ok(0)
        }

        Command::Synth { action: SynthCommand::List { status } } => {
            let metadata = match status.as_deref() {
                Some("promoted") => ctx.governance().list_promoted().await,
                Some("quarantine") => ctx.governance().list_quarantined().await,
                Some(other) => {
                    return Err(AicError::IngestionRejected(format!(
                        "unknown --status {other}, expected quarantine|promoted"
                    )));
                }
                None => {
                    let mut all = ctx.governance().list_quarantined().await;
                    all.extend(ctx.governance().list_promoted().await);
                    all
                }
            };
            print_json(&metadata);
            Ok(0)
        }

        Command::Synth { action: SynthCommand::Promote { name } } => {
            let (tool_name, version) = match name.split_once('@') {
                Some((tool_name, version)) => {
                    (tool_name.to_owned(), version.parse::<aic_protocol::ToolVersion>()?)
                }
                None => (name, aic_protocol::ToolVersion::quarantine()),
            };
            match ctx.governance().promote(&tool_name, version).await {
                Ok(promoted) => {
                    print_json(&serde_json::json!({ "promoted": promoted }));
                    Ok(0)
                }
                Err(error @ AicError::GateFailed(_)) => {
                    print_json(&serde_json::json!({ "error": error.to_string() }));
                    Err(error)
                }
                Err(error) => Err(error),
            }
        }

        Command::Deploy { improvement } => {
            let proposal: ImprovementProposal = parse_json(&improvement, "improvement")?;
            proposal.validate()?;
            let env_target_file = ctx.config().paths.env_target_file.clone();
            let result = ctx.deploy().deploy(&proposal, &env_target_file).await?;
            let rollback = result.rollback_performed;
            let succeeded = result.success;
            print_json(&result);
            if rollback {
                Ok(5)
            } else if succeeded {
                Ok(0)
            } else {
                Ok(4)
            }
        }

        Command::Shadow { action: ShadowCommand::Enable { name, percent } } => {
            ctx.shadow().enable_shadow(&name, percent)?;
            print_json(&serde_json::json!({ "enabled": name, "percent": percent }));
            Ok(0)
        }

        Command::Shadow { action: ShadowCommand::Stats { name } } => {
            match ctx.shadow().get_shadow_stats(&name).await {
                Some(stats) => print_json(&stats),
                None => print_json(&serde_json::json!({ "tool_name": name, "sample_count": 0 })),
            }
            Ok(0)
        }

        Command::Alert { action: AlertCommand::Submit { proposal } } => {
            let proposal: ImprovementProposal = parse_json(&proposal, "improvement")?;
            match ctx.submit_improvement(proposal).await? {
                SubmitOutcome::Deployed(result) => {
                    let rollback = result.rollback_performed;
                    print_json(&SubmitOutcome::Deployed(result));
                    Ok(if rollback { 5 } else { 0 })
                }
                outcome @ SubmitOutcome::Queued(_) => {
                    print_json(&outcome);
                    Ok(0)
                }
            }
        }

        Command::Reason { action: ReasonCommand::Explore { problem, depth } } => {
            let exploration = ctx.reasoning().explore_solutions(&problem, depth);
            print_json(&exploration);
            Ok(0)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter("info").compact().init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => ExitCode::from(code as u8),
        Err(error) => {
            error!(%error, "kloros command failed");
            eprintln!("error: {error}");
            ExitCode::from(error.exit_code() as u8)
        }
    }
}
