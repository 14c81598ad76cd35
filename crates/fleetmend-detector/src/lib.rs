//! fleetmend-detector — turns application log lines into restarts.
//!
//! Lines are classified by an ordered [`RuleSet`] (first match wins), gated
//! by debounce and cooldown timers, then either run through the restart
//! workflow in-process or enqueued as `restart` jobs for the dispatcher.

pub mod detector;
pub mod error;
pub mod follower;
pub mod gate;
pub mod rules;

pub use detector::{Decision, Detector, Mode};
pub use error::{DetectorError, DetectorResult};
pub use follower::{LogFollower, LogLine};
pub use gate::{Blocked, Gate};
pub use rules::{DEFAULT_RULES, Rule, RuleMatch, RuleSet};
