//! fleetmend-lb — load-balancer control.
//!
//! Two ways to take a server out of rotation:
//!
//! ```text
//!  runtime   RuntimeClient ──unix socket──▶ HAProxy admin API
//!            (show stat, set server state, weight; lost on reload)
//!
//!  config    ConfigPatcher ──lock, backup, atomic write──▶ haproxy.cfg
//!            then validate (rollback on failure) and reload
//! ```
//!
//! [`Provider`] generalizes the runtime side so a backend can also be an
//! nginx upstream file or a group of systemd units.

pub mod cfg;
pub mod error;
pub mod provider;
pub mod runtime;
pub mod stat;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use cfg::{ConfigPatcher, PatchOutcome, ToggleOutcome, ToggleStyle, toggle_server};
pub use error::{LbError, LbResult};
pub use provider::{Provider, Providers};
pub use runtime::{AdminState, RuntimeClient};
