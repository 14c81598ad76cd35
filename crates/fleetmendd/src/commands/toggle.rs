//! `fleetmendd toggle`: one guarded LB action, or a ledger retry pass.
//!
//! Exit codes: 0 applied (or deferred), 2 missing arguments, 1 runtime
//! error.

use std::process::ExitCode;

use fleetmend_core::{FleetConfig, GuardAction};
use fleetmend_guard::{Admission, AdmissionGuard};
use tracing::info;

use crate::ToggleAction;

pub async fn run(
    config: &FleetConfig,
    action: ToggleAction,
    backend: Option<String>,
    server: Option<String>,
) -> anyhow::Result<ExitCode> {
    let guard = AdmissionGuard::from_config(config);

    let action = match action {
        ToggleAction::Retry => {
            let report = guard.retry_deferred().await?;
            println!(
                "retry: applied={} remaining={}",
                report.applied, report.remaining
            );
            return Ok(ExitCode::SUCCESS);
        }
        ToggleAction::Drain => GuardAction::Drain,
        ToggleAction::Disable => GuardAction::Disable,
        ToggleAction::Enable => GuardAction::Enable,
    };

    let (Some(backend), Some(server)) = (backend, server) else {
        eprintln!("--backend and --server are required for {action}");
        return Ok(ExitCode::from(2));
    };

    match guard.apply(action, &backend, &server).await? {
        Admission::Applied => {
            info!(%backend, %server, %action, "toggle applied");
            println!("{action} {backend}/{server}: applied");
        }
        Admission::Deferred(assessment) => {
            println!(
                "{action} {backend}/{server}: deferred ({})",
                assessment.reason()
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}
