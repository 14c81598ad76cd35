//! fleetmend-core — shared vocabulary for the fleetmend orchestrator.
//!
//! Every other crate in the workspace speaks in terms of the types defined
//! here: queued [`Job`]s, [`DeferredAction`] ledger rows, [`ServerState`]
//! snapshots read from the load balancer, and append-only [`AuditRow`]s.
//!
//! # Ambient services
//!
//! ```text
//! fleetmend-core
//!   ├── config   FleetConfig (TOML, every section defaulted)
//!   ├── audit    AuditLog (CSV, append-only, flock-serialized)
//!   ├── events   EventSink (operator-visible JSON events)
//!   ├── command  run_shell (timeout-bounded /bin/sh -c)
//!   ├── fsutil   write_atomic / remove_if_exists
//!   └── time     timestamps + duration parsing
//! ```

pub mod audit;
pub mod command;
pub mod config;
pub mod error;
pub mod events;
pub mod fsutil;
pub mod host;
pub mod time;
pub mod types;

pub use audit::{AuditLog, AuditRow};
pub use config::{FleetConfig, ProviderConfig, RuleConfig};
pub use error::{CoreError, CoreResult};
pub use events::{Event, EventSink};
pub use types::*;
