//! Admission limits for restart workflows.
//!
//! Owned by exactly one dispatcher instance. Checks run in a fixed order and
//! the first failing one is reported:
//!
//! 1. global concurrency  `active < max_concurrent`
//! 2. per node            not already running, and `per_node_cooldown`
//!                        elapsed since its last finish
//! 3. burst               starts within `burst_window` `< burst_limit`
//! 4. group               active members of the node's group `< per_group_max`
//! 5. stagger             `stagger` elapsed since the last start

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use fleetmend_core::config::DispatcherConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    GlobalLimit,
    NodeBusy,
    NodeCooldown,
    BurstLimit,
    GroupLimit,
    Stagger,
}

impl fmt::Display for Refusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::GlobalLimit => "global_limit",
            Self::NodeBusy => "node_busy",
            Self::NodeCooldown => "node_cooldown",
            Self::BurstLimit => "burst_limit",
            Self::GroupLimit => "group_limit",
            Self::Stagger => "stagger",
        })
    }
}

#[derive(Debug, Clone)]
pub struct Limits {
    pub max_concurrent: usize,
    pub per_node_cooldown: Duration,
    pub burst_window: Duration,
    pub burst_limit: usize,
    pub per_group_max: usize,
    pub stagger: Duration,
}

impl Limits {
    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent,
            per_node_cooldown: config.per_node_cooldown,
            burst_window: config.burst_window,
            burst_limit: config.burst_limit,
            per_group_max: config.per_group_max,
            stagger: config.stagger,
        }
    }
}

#[derive(Debug)]
pub struct SchedulerState {
    limits: Limits,
    /// node → group
    groups: HashMap<String, String>,
    active: HashMap<String, Instant>,
    group_active: HashMap<String, usize>,
    last_finish: HashMap<String, Instant>,
    starts: VecDeque<Instant>,
}

impl SchedulerState {
    pub fn new(limits: Limits, groups: &HashMap<String, Vec<String>>) -> Self {
        let groups = groups
            .iter()
            .flat_map(|(group, nodes)| nodes.iter().map(move |n| (n.clone(), group.clone())))
            .collect();
        Self {
            limits,
            groups,
            active: HashMap::new(),
            group_active: HashMap::new(),
            last_finish: HashMap::new(),
            starts: VecDeque::new(),
        }
    }

    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self::new(Limits::from_config(config), &config.groups)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, node: &str) -> bool {
        self.active.contains_key(node)
    }

    fn elapsed(now: Instant, since: Instant) -> Duration {
        now.saturating_duration_since(since)
    }

    /// Whether `node` may start now.
    pub fn can_start(&mut self, node: &str, now: Instant) -> Result<(), Refusal> {
        if self.active.len() >= self.limits.max_concurrent {
            return Err(Refusal::GlobalLimit);
        }

        if self.active.contains_key(node) {
            return Err(Refusal::NodeBusy);
        }
        let cooling = self
            .last_finish
            .get(node)
            .is_some_and(|last| Self::elapsed(now, *last) < self.limits.per_node_cooldown);
        if cooling {
            return Err(Refusal::NodeCooldown);
        }

        while let Some(oldest) = self.starts.front() {
            if Self::elapsed(now, *oldest) >= self.limits.burst_window {
                self.starts.pop_front();
            } else {
                break;
            }
        }
        if self.starts.len() >= self.limits.burst_limit {
            return Err(Refusal::BurstLimit);
        }

        if let Some(group) = self.groups.get(node) {
            if self.group_active.get(group).copied().unwrap_or(0) >= self.limits.per_group_max {
                return Err(Refusal::GroupLimit);
            }
        }

        if self
            .starts
            .back()
            .is_some_and(|last| Self::elapsed(now, *last) < self.limits.stagger)
        {
            return Err(Refusal::Stagger);
        }
        Ok(())
    }

    pub fn mark_started(&mut self, node: &str, now: Instant) {
        self.active.insert(node.to_string(), now);
        self.starts.push_back(now);
        if let Some(group) = self.groups.get(node) {
            *self.group_active.entry(group.clone()).or_default() += 1;
        }
    }

    /// Release the node's slot. Safe to call for a node that is not active.
    pub fn mark_finished(&mut self, node: &str, now: Instant) {
        if self.active.remove(node).is_none() {
            return;
        }
        self.last_finish.insert(node.to_string(), now);
        if let Some(count) = self
            .groups
            .get(node)
            .and_then(|group| self.group_active.get_mut(group))
        {
            *count = count.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const S: Duration = Duration::from_secs(1);

    fn limits() -> Limits {
        Limits {
            max_concurrent: 2,
            per_node_cooldown: 60 * S,
            burst_window: 100 * S,
            burst_limit: 3,
            per_group_max: 1,
            stagger: 5 * S,
        }
    }

    fn state(limits: Limits) -> SchedulerState {
        let groups = HashMap::from([("rack-a".to_string(), vec!["a1".to_string(), "a2".to_string()])]);
        SchedulerState::new(limits, &groups)
    }

    #[test]
    fn global_limit_is_checked_first() {
        let t0 = Instant::now();
        let mut s = state(Limits {
            stagger: Duration::ZERO,
            ..limits()
        });
        s.mark_started("n1", t0);
        s.mark_started("n2", t0);
        // n1 is also busy, but the global limit wins.
        assert_eq!(s.can_start("n1", t0), Err(Refusal::GlobalLimit));
        assert_eq!(s.can_start("n3", t0), Err(Refusal::GlobalLimit));
    }

    #[test]
    fn node_busy_then_cooldown() {
        let t0 = Instant::now();
        let mut s = state(limits());
        s.mark_started("n1", t0);
        assert_eq!(s.can_start("n1", t0 + 10 * S), Err(Refusal::NodeBusy));
        s.mark_finished("n1", t0 + 20 * S);
        assert_eq!(s.can_start("n1", t0 + 50 * S), Err(Refusal::NodeCooldown));
        assert_eq!(s.can_start("n1", t0 + 80 * S), Ok(()));
    }

    #[test]
    fn burst_counts_starts_in_trailing_window() {
        let t0 = Instant::now();
        let mut s = state(Limits {
            max_concurrent: 10,
            per_node_cooldown: Duration::ZERO,
            ..limits()
        });
        for (i, node) in ["n1", "n2", "n3"].iter().enumerate() {
            let t = t0 + (i as u32 * 10) * S;
            assert_eq!(s.can_start(node, t), Ok(()));
            s.mark_started(node, t);
            s.mark_finished(node, t + S);
        }
        assert_eq!(s.can_start("n4", t0 + 30 * S), Err(Refusal::BurstLimit));
        // The first start falls out of the window at t0+100s.
        assert_eq!(s.can_start("n4", t0 + 101 * S), Ok(()));
    }

    #[test]
    fn group_exclusivity() {
        let t0 = Instant::now();
        let mut s = state(Limits {
            stagger: Duration::ZERO,
            ..limits()
        });
        s.mark_started("a1", t0);
        assert_eq!(s.can_start("a2", t0), Err(Refusal::GroupLimit));
        assert_eq!(s.can_start("b1", t0), Ok(()));
        s.mark_finished("a1", t0 + S);
        assert_eq!(s.can_start("a2", t0 + S), Ok(()));
    }

    #[test]
    fn stagger_spaces_starts() {
        let t0 = Instant::now();
        let mut s = state(limits());
        s.mark_started("n1", t0);
        assert_eq!(s.can_start("n2", t0 + 2 * S), Err(Refusal::Stagger));
        assert_eq!(s.can_start("n2", t0 + 5 * S), Ok(()));
    }

    #[test]
    fn finishing_an_inactive_node_is_harmless() {
        let t0 = Instant::now();
        let mut s = state(limits());
        s.mark_finished("ghost", t0);
        assert_eq!(s.active_count(), 0);
        assert_eq!(s.can_start("ghost", t0), Ok(()));
    }
}
