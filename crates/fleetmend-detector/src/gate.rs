//! Debounce and cooldown timers guarding detector actions.

use std::fmt;
use std::time::{Duration, Instant};

/// Why a match was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocked {
    /// Within the debounce window of the previous match.
    Debounced,
    /// Within the cooldown window of the last completed action.
    Cooldown,
}

impl fmt::Display for Blocked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Debounced => "debounced",
            Self::Cooldown => "cooldown",
        })
    }
}

/// Two independent timers, both checked before any side effect.
///
/// Debounce runs from the last admitted match; blocked matches do not move
/// it, so a steady stream of matches is admitted once per `debounce`.
/// Cooldown only starts when an action completes.
#[derive(Debug, Clone)]
pub struct Gate {
    debounce: Duration,
    cooldown: Duration,
    last_match: Option<Instant>,
    last_action: Option<Instant>,
}

impl Gate {
    pub fn new(debounce: Duration, cooldown: Duration) -> Self {
        Self {
            debounce,
            cooldown,
            last_match: None,
            last_action: None,
        }
    }

    /// Decide whether a match at `now` may act. Only an admitted match is
    /// recorded.
    pub fn admit(&mut self, now: Instant) -> Result<(), Blocked> {
        if self
            .last_match
            .is_some_and(|t| now.saturating_duration_since(t) < self.debounce)
        {
            return Err(Blocked::Debounced);
        }
        if self
            .last_action
            .is_some_and(|t| now.saturating_duration_since(t) < self.cooldown)
        {
            return Err(Blocked::Cooldown);
        }
        self.last_match = Some(now);
        Ok(())
    }

    /// Start the cooldown window.
    pub fn action_completed(&mut self, now: Instant) {
        self.last_action = Some(now);
    }
}
