//! fleetmendd — the fleetmend daemon and operator CLI.
//!
//! One binary, one subcommand per process role:
//!
//! ```text
//! fleetmendd toggle --action drain --backend api --server web1
//! fleetmendd dispatch --loop
//! fleetmendd ops | watchdog | policy | detect | worker
//! fleetmendd enqueue restart --node web3 --reason "FATAL in app.log"
//! fleetmendd rules --logs /var/log/app/app.log --limit 50
//! ```
//!
//! Every role reads the same TOML file (`--config`); roles coordinate only
//! through the directories under `[paths] base`.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use fleetmend_core::{FleetConfig, JobOp, Scope};
use tracing::error;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "fleetmendd", about = "Self-healing fleet orchestrator", version)]
struct Cli {
    /// Configuration file. Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drain, disable or enable one server under the capacity floor, or
    /// retry the deferred ledger.
    Toggle {
        #[arg(long, value_enum)]
        action: ToggleAction,
        #[arg(long)]
        backend: Option<String>,
        #[arg(long)]
        server: Option<String>,
    },
    /// Run queued restart jobs under the admission limits.
    Dispatch {
        /// Keep running pass after pass until interrupted.
        #[arg(long = "loop")]
        looping: bool,
        /// Delay between passes, e.g. `5s` (overrides `[dispatcher] interval`).
        #[arg(long)]
        interval: Option<String>,
    },
    /// Execute LB operation jobs from the ops queue.
    Ops {
        /// Single pass instead of a loop.
        #[arg(long)]
        once: bool,
    },
    /// Requeue or fail stuck jobs and report unanswered restart flags.
    Watchdog {
        #[arg(long)]
        once: bool,
    },
    /// Queue drain/heal ops from 5xx rates and restart verdicts.
    Policy {
        #[arg(long)]
        once: bool,
    },
    /// Follow application logs and react to rule matches.
    Detect {
        /// Log files to follow (overrides `[detector] logs`).
        #[arg(long, num_args = 1..)]
        logs: Vec<PathBuf>,
        /// Enqueue restart jobs instead of restarting in-process.
        #[arg(long)]
        queue: bool,
    },
    /// Answer restart flags for this node.
    Worker {
        /// Node name (overrides `[worker] node`, default: hostname).
        #[arg(long)]
        node: Option<String>,
        #[arg(long)]
        once: bool,
    },
    /// Put a job on the restart or ops queue.
    Enqueue {
        #[arg(value_enum)]
        op: OpArg,
        #[arg(long, default_value = "")]
        backend: String,
        #[arg(long, default_value = "")]
        server: String,
        #[arg(long, value_enum, default_value = "runtime")]
        scope: ScopeArg,
        /// Required for `weight`.
        #[arg(long)]
        weight: Option<u32>,
        /// Node to restart (`restart` only, defaults to `--server`).
        #[arg(long)]
        node: Option<String>,
        #[arg(long, default_value = "")]
        reason: String,
        #[arg(long)]
        take_out_cmd: Option<String>,
        #[arg(long)]
        restore_cmd: Option<String>,
    },
    /// Dry-run the detector rules against log files.
    Rules {
        /// TOML or JSON rules file (default: `[detector] rules`).
        #[arg(long)]
        rules_file: Option<PathBuf>,
        #[arg(long, num_args = 1..)]
        logs: Vec<PathBuf>,
        #[arg(long, default_value = "100")]
        limit: usize,
        /// Append matches to this JSONL file as well.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ToggleAction {
    Drain,
    Disable,
    Enable,
    Retry,
}

#[derive(Clone, Copy, ValueEnum)]
enum OpArg {
    Drain,
    Disable,
    Enable,
    Weight,
    Comment,
    Uncomment,
    Restart,
}

impl From<OpArg> for JobOp {
    fn from(op: OpArg) -> Self {
        match op {
            OpArg::Drain => JobOp::Drain,
            OpArg::Disable => JobOp::Disable,
            OpArg::Enable => JobOp::Enable,
            OpArg::Weight => JobOp::Weight,
            OpArg::Comment => JobOp::Comment,
            OpArg::Uncomment => JobOp::Uncomment,
            OpArg::Restart => JobOp::Restart,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ScopeArg {
    Runtime,
    Cfg,
    Both,
}

impl From<ScopeArg> for Scope {
    fn from(scope: ScopeArg) -> Self {
        match scope {
            ScopeArg::Runtime => Scope::Runtime,
            ScopeArg::Cfg => Scope::Cfg,
            ScopeArg::Both => Scope::Both,
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fleetmend=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<FleetConfig> {
    match path {
        Some(path) => FleetConfig::from_file(path)
            .map_err(|e| anyhow::anyhow!("cannot load {}: {e}", path.display())),
        None => Ok(FleetConfig::default()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "fleetmendd failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Toggle {
            action,
            backend,
            server,
        } => commands::toggle::run(&config, action, backend, server).await,
        Command::Dispatch { looping, interval } => {
            if let Some(interval) = interval {
                config.dispatcher.interval = fleetmend_core::time::parse_duration(&interval)
                    .ok_or_else(|| anyhow::anyhow!("invalid interval: {interval}"))?;
            }
            commands::daemon::dispatch(&config, looping).await
        }
        Command::Ops { once } => commands::daemon::ops(&config, once).await,
        Command::Watchdog { once } => commands::daemon::watchdog(&config, once).await,
        Command::Policy { once } => commands::daemon::policy(&config, once).await,
        Command::Detect { logs, queue } => {
            if !logs.is_empty() {
                config.detector.logs = logs;
            }
            config.detector.queue_mode |= queue;
            commands::daemon::detect(&config).await
        }
        Command::Worker { node, once } => {
            if node.is_some() {
                config.worker.node = node;
            }
            commands::daemon::worker(&config, once).await
        }
        Command::Enqueue {
            op,
            backend,
            server,
            scope,
            weight,
            node,
            reason,
            take_out_cmd,
            restore_cmd,
        } => commands::enqueue::run(
            &config,
            commands::enqueue::EnqueueArgs {
                op: op.into(),
                backend,
                server,
                scope: scope.into(),
                weight,
                node,
                reason,
                take_out_cmd,
                restore_cmd,
            },
        ),
        Command::Rules {
            rules_file,
            logs,
            limit,
            out,
        } => commands::rules::run(&config, rules_file, logs, limit, out),
    }
}
