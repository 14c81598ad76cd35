//! fleetmend-restart — both ends of a node restart.
//!
//! [`RestartWorkflow`] runs on the controller: take the node out, signal it,
//! wait for the verdict and restore (or leave it out). [`NodeWorker`] runs on
//! the node itself and answers the signal.

pub mod error;
pub mod pool;
pub mod worker;
pub mod workflow;

pub use error::{RestartError, RestartResult};
pub use pool::{PoolControl, PoolStep};
pub use worker::{NodeWorker, WorkerReport};
pub use workflow::{LeftOut, RestartRequest, RestartWorkflow, WorkflowOutcome};
