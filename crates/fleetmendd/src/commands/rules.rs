//! `fleetmendd rules`: show what the detector would match, without acting.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use fleetmend_core::FleetConfig;
use fleetmend_detector::RuleSet;

pub fn run(
    config: &FleetConfig,
    rules_file: Option<PathBuf>,
    logs: Vec<PathBuf>,
    limit: usize,
    out: Option<PathBuf>,
) -> anyhow::Result<ExitCode> {
    let rules = match &rules_file {
        Some(path) => RuleSet::load_file(path)?,
        None => RuleSet::from_config(&config.detector.rules)?,
    };
    let logs = if logs.is_empty() {
        config.detector.logs.clone()
    } else {
        logs
    };
    if logs.is_empty() {
        eprintln!("no log files: pass --logs or set [detector] logs");
        return Ok(ExitCode::from(2));
    }

    let matches = rules.scan(&logs, Some(limit).filter(|l| *l > 0))?;
    let mut lines = Vec::with_capacity(matches.len());
    for m in &matches {
        lines.push(serde_json::to_string(m)?);
    }
    for line in &lines {
        println!("{line}");
    }

    if let Some(out) = out {
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&out)?;
        for line in &lines {
            writeln!(file, "{line}")?;
        }
    }
    eprintln!("{} rules, {} matches", rules.len(), matches.len());
    Ok(ExitCode::SUCCESS)
}
