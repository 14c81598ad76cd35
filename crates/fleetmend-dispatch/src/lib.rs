//! fleetmend-dispatch — the controller-side queue consumers.
//!
//! - [`Dispatcher`] runs queued restart jobs concurrently, within the
//!   limits tracked by [`SchedulerState`].
//! - [`OpsWorker`] executes LB operations from the ops queue.
//! - [`Watchdog`] requeues or fails stuck jobs and reports unanswered
//!   restart flags.
//! - [`PolicyWorker`] queues drain/heal ops from 5xx rates and restart
//!   verdicts.

pub mod dispatcher;
pub mod error;
pub mod ops;
pub mod policy;
pub mod scheduler;
pub mod watchdog;

pub use dispatcher::{Dispatcher, PassReport};
pub use error::{DispatchError, DispatchResult};
pub use ops::{OpOutcome, OpsReport, OpsWorker};
pub use policy::{POLICY_LOCK, PolicyReport, PolicyWorker};
pub use scheduler::{Limits, Refusal, SchedulerState};
pub use watchdog::{WATCHDOG_LOCK, Watchdog, WatchdogReport};
