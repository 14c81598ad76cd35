//! `fleetmendd enqueue`: restart jobs go to the restart queue, LB
//! operations to the ops queue.

use std::process::ExitCode;

use fleetmend_core::{FleetConfig, Job, JobOp, RestartSpec, Scope};
use fleetmend_store::{FileQueue, JobStore};
use tracing::info;

pub struct EnqueueArgs {
    pub op: JobOp,
    pub backend: String,
    pub server: String,
    pub scope: Scope,
    pub weight: Option<u32>,
    pub node: Option<String>,
    pub reason: String,
    pub take_out_cmd: Option<String>,
    pub restore_cmd: Option<String>,
}

/// Build the job, or say why the arguments do not describe one.
fn build(args: EnqueueArgs) -> Result<Job, String> {
    match args.op {
        JobOp::Restart => {
            let node = args
                .node
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| args.server.clone());
            if node.is_empty() {
                return Err("restart needs --node or --server".to_string());
            }
            let spec = RestartSpec {
                node,
                reason: args.reason,
                take_out_cmd: args.take_out_cmd,
                restore_cmd: args.restore_cmd,
            };
            Ok(Job::restart(&spec, &args.backend, &args.server))
        }
        op => {
            if args.backend.is_empty() || args.server.is_empty() {
                return Err(format!("{op} needs --backend and --server"));
            }
            let job = Job::new(op, &args.backend, &args.server).with_scope(args.scope);
            match (op, args.weight) {
                (JobOp::Weight, Some(weight)) => Ok(job.with_weight(weight)),
                (JobOp::Weight, None) => Err("weight needs --weight".to_string()),
                _ => Ok(job),
            }
        }
    }
}

pub fn run(config: &FleetConfig, args: EnqueueArgs) -> anyhow::Result<ExitCode> {
    let root = if args.op == JobOp::Restart {
        config.paths.restart_queue()
    } else {
        config.paths.ops_queue()
    };
    let job = match build(args) {
        Ok(job) => job,
        Err(msg) => {
            eprintln!("{msg}");
            return Ok(ExitCode::from(2));
        }
    };

    let ticket = FileQueue::new(root).enqueue(&job)?;
    info!(job = %ticket.name, op = %job.op, "job enqueued");
    println!("{}", ticket.path.display());
    Ok(ExitCode::SUCCESS)
}
