//! Parser for HAProxy `show stat` CSV.
//!
//! The first line is the header, prefixed with `# `. Proxy-level rows
//! (`FRONTEND`, `BACKEND`) are skipped; only real servers are kept.

use std::collections::{BTreeMap, HashMap};

use fleetmend_core::ServerState;

use crate::error::{LbError, LbResult};

/// All columns of one server row, keyed by header name.
pub type StatRow = HashMap<String, String>;

/// Server rows keyed by `(backend, server)`.
pub type StatTable = BTreeMap<(String, String), StatRow>;

/// Parse `show stat` output into a table.
pub fn parse_stat(text: &str) -> LbResult<StatTable> {
    let mut header: Option<Vec<String>> = None;
    let mut body = String::new();
    for line in text.lines() {
        if let Some(h) = line.strip_prefix("# ") {
            header = Some(h.split(',').map(|c| c.trim().to_string()).collect());
            continue;
        }
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        body.push_str(line);
        body.push('\n');
    }
    let Some(header) = header else {
        if body.is_empty() {
            return Ok(StatTable::new());
        }
        return Err(LbError::Stat("missing `# ` header line".to_string()));
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(body.as_bytes());

    let mut table = StatTable::new();
    for record in reader.records() {
        let record = record.map_err(|e| LbError::Stat(e.to_string()))?;
        if record.len() < 2 {
            continue;
        }
        let row: StatRow = header
            .iter()
            .enumerate()
            .filter(|(_, name)| !name.is_empty())
            .map(|(i, name)| (name.clone(), record.get(i).unwrap_or_default().to_string()))
            .collect();
        let backend = row.get("pxname").cloned().unwrap_or_default();
        let server = row.get("svname").cloned().unwrap_or_default();
        if backend.is_empty() || server.is_empty() || server == "FRONTEND" || server == "BACKEND" {
            continue;
        }
        table.insert((backend, server), row);
    }
    Ok(table)
}

/// Project a stat row onto the fields the guard and policy care about.
pub fn to_server_state(backend: &str, server: &str, row: &StatRow) -> ServerState {
    let num = |key: &str| row.get(key).and_then(|v| v.trim().parse::<u64>().ok());
    ServerState {
        backend: backend.to_string(),
        server: server.to_string(),
        status: row.get("status").cloned().unwrap_or_default(),
        admin: row.get("admin").cloned().unwrap_or_default(),
        weight: num("weight").and_then(|w| u32::try_from(w).ok()).unwrap_or(0),
        sessions: num("scur").unwrap_or(0),
        http_5xx: num("hrsp_5xx").unwrap_or(0),
    }
}

/// Servers of one backend, in name order.
pub fn servers_of(table: &StatTable, backend: &str) -> Vec<ServerState> {
    table
        .iter()
        .filter(|((b, _), _)| b == backend)
        .map(|((b, s), row)| to_server_state(b, s, row))
        .collect()
}
