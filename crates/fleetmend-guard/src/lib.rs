//! fleetmend-guard — capacity floor for load-balancer pools.
//!
//! # Admission rule
//!
//! ```text
//! enabled_now = servers with status UP/OPEN and not MAINT
//! would_left  = enabled_now - 1   if the target is enabled
//!               enabled_now       otherwise
//!
//! drain/disable: would_left < min_enabled(backend)  → Deferred (ledgered)
//!                otherwise                           → Applied
//! enable:        always Applied
//! ```
//!
//! Deferred rows are re-evaluated by a periodic retry pass.

pub mod error;
pub mod guard;
pub mod ledger;

pub use error::{GuardError, GuardResult};
pub use guard::{Admission, AdmissionGuard, Assessment, CapacityFloor, RetryReport, assess};
pub use ledger::DeferredLedger;
