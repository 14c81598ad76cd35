//! Long-running roles. Each one builds its component from the config and
//! either runs a single pass or loops until Ctrl-C.

use std::process::ExitCode;
use std::sync::Arc;

use fleetmend_core::{FleetConfig, host};
use fleetmend_detector::Detector;
use fleetmend_dispatch::{Dispatcher, OpsWorker, PolicyWorker, Watchdog};
use fleetmend_restart::NodeWorker;
use fleetmend_store::HandshakeFlags;
use tracing::info;

use super::shutdown_on_ctrl_c;

pub async fn dispatch(config: &FleetConfig, looping: bool) -> anyhow::Result<ExitCode> {
    let mut dispatcher = Dispatcher::from_config(config);
    if looping {
        dispatcher.run(shutdown_on_ctrl_c()).await;
        return Ok(ExitCode::SUCCESS);
    }

    let report = dispatcher.run_once().await?;
    for (job, refusal) in &report.held {
        println!("held {job}: {refusal}");
    }
    let finished = dispatcher.wait_idle().await;
    println!(
        "dispatch: started={} held={} finished={} malformed={}",
        report.started.len(),
        report.held.len(),
        report.finished + finished,
        report.malformed
    );
    Ok(ExitCode::SUCCESS)
}

pub async fn ops(config: &FleetConfig, once: bool) -> anyhow::Result<ExitCode> {
    let worker = OpsWorker::from_config(config);
    if !once {
        worker.run(shutdown_on_ctrl_c()).await;
        return Ok(ExitCode::SUCCESS);
    }

    let report = worker.run_once().await?;
    let retry = worker.guard().retry_deferred().await?;
    println!(
        "ops: done={} deferred={} failed={} ledger_applied={} ledger_remaining={}",
        report.done, report.deferred, report.failed, retry.applied, retry.remaining
    );
    Ok(ExitCode::SUCCESS)
}

pub async fn watchdog(config: &FleetConfig, once: bool) -> anyhow::Result<ExitCode> {
    let mut watchdog = Watchdog::from_config(config);
    if !once {
        watchdog.run(shutdown_on_ctrl_c()).await;
        return Ok(ExitCode::SUCCESS);
    }

    let report = watchdog.run_once()?;
    if report.skipped {
        println!("watchdog: another pass is running");
    } else {
        println!(
            "watchdog: requeued={} failed={} stale_flags={} pruned={}",
            report.requeued.len(),
            report.failed.len(),
            report.stale_flags.len(),
            report.pruned
        );
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn policy(config: &FleetConfig, once: bool) -> anyhow::Result<ExitCode> {
    let policy = PolicyWorker::from_config(config);
    if !once {
        policy.run(shutdown_on_ctrl_c()).await;
        return Ok(ExitCode::SUCCESS);
    }

    let report = policy.run_once().await?;
    if report.skipped {
        println!("policy: another pass is running");
    } else {
        println!(
            "policy: drained={:?} healed={:?}",
            report.drained, report.healed
        );
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn detect(config: &FleetConfig) -> anyhow::Result<ExitCode> {
    if config.detector.logs.is_empty() {
        anyhow::bail!("no log files to follow: set [detector] logs or pass --logs");
    }
    let detector = Detector::from_config(config)?;
    info!(node = %detector.node(), queue_mode = config.detector.queue_mode, "detector configured");
    detector
        .run(
            config.detector.logs.clone(),
            config.detector.poll_interval,
            shutdown_on_ctrl_c(),
        )
        .await;
    Ok(ExitCode::SUCCESS)
}

pub async fn worker(config: &FleetConfig, once: bool) -> anyhow::Result<ExitCode> {
    let node = config
        .worker
        .node
        .clone()
        .unwrap_or_else(|| host::hostname().to_string());
    let worker = NodeWorker::new(
        &node,
        Arc::new(HandshakeFlags::new(config.paths.flags())),
        config.worker.clone(),
    );
    if !once {
        worker.run(shutdown_on_ctrl_c()).await;
        return Ok(ExitCode::SUCCESS);
    }

    match worker.run_once().await? {
        Some(report) => print!("{}", report.render(&node)),
        None => println!("worker: no restart request for {node}"),
    }
    Ok(ExitCode::SUCCESS)
}
