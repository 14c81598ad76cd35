//! fleetmend-store — the filesystem coordination layer.
//!
//! Independent processes (detector, dispatcher, ops worker, watchdog, node
//! workers) share no memory; they coordinate through three on-disk
//! primitives, each behind a small interface:
//!
//! ```text
//!   FileQueue (JobStore)      queue/ → inprogress/ → done/ | failed/
//!                             claim = rename(2), one winner
//!   LockManager               <locks>/<name>.lock, flock(2), RAII guard
//!   HandshakeFlags (FlagStore) restart_<node>.txt → done_<node>.txt
//! ```
//!
//! Every mutation is a rename or an atomic replace; nothing is ever
//! edited in place.

pub mod error;
pub mod flags;
pub mod lock;
pub mod queue;

pub use error::{StoreError, StoreResult};
pub use flags::{FlagStore, HandshakeFlags, wait_for_completion};
pub use lock::{LockGuard, LockManager};
pub use queue::{ClaimOutcome, FileQueue, JobState, JobStore, JobTicket};
