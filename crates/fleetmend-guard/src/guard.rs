//! Admission guard — enforces a minimum live capacity per backend.
//!
//! Every LB mutation for a backend runs under the `backend:<name>` lock so
//! the count-then-act sequence cannot interleave with another process.
//! Capacity-reducing actions that would leave fewer than `min_enabled`
//! servers are refused and, for [`AdmissionGuard::apply`], written to the
//! deferred ledger for a later [`AdmissionGuard::retry_deferred`] pass.
//!
//! Lock order: `backend:*` may be held while taking `ledger`, never the
//! reverse. The retry pass holds `ledger-retry` for its whole run and takes
//! the other two one at a time.

use std::collections::HashMap;
use std::time::Duration;

use fleetmend_core::{DeferredAction, FleetConfig, GuardAction, ServerState};
use fleetmend_lb::Providers;
use fleetmend_store::{LockGuard, LockManager};
use tracing::{info, warn};

use crate::error::GuardResult;
use crate::ledger::DeferredLedger;

const RETRY_LOCK: &str = "ledger-retry";

/// Per-backend capacity floors.
#[derive(Debug, Clone)]
pub struct CapacityFloor {
    pub global: usize,
    pub backends: HashMap<String, usize>,
}

impl CapacityFloor {
    pub fn uniform(min_enabled: usize) -> Self {
        Self {
            global: min_enabled,
            backends: HashMap::new(),
        }
    }

    pub fn from_config(config: &FleetConfig) -> Self {
        let mut backends = config.guard.backends.clone();
        for (name, cluster) in &config.clusters {
            if let Some(min) = cluster.min_enabled {
                backends.insert(name.clone(), min);
            }
        }
        Self {
            global: config.guard.min_enabled,
            backends,
        }
    }

    pub fn for_backend(&self, backend: &str) -> usize {
        self.backends.get(backend).copied().unwrap_or(self.global)
    }
}

/// Capacity arithmetic for one proposed action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assessment {
    pub enabled_now: usize,
    pub would_left: usize,
    pub min_enabled: usize,
}

impl Assessment {
    pub fn allowed(&self) -> bool {
        self.would_left >= self.min_enabled
    }

    pub fn reason(&self) -> String {
        format!(
            "enabled={}, would_left={}, min={}",
            self.enabled_now, self.would_left, self.min_enabled
        )
    }
}

/// Count what would remain if `server` left the pool.
pub fn assess(servers: &[ServerState], server: &str, min_enabled: usize) -> Assessment {
    let enabled_now = servers.iter().filter(|s| s.is_enabled()).count();
    let target_enabled = servers.iter().any(|s| s.server == server && s.is_enabled());
    Assessment {
        enabled_now,
        would_left: if target_enabled { enabled_now - 1 } else { enabled_now },
        min_enabled,
    }
}

/// Result of a guarded action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Performed against the load balancer.
    Applied,
    /// Refused by the capacity floor; the LB was not touched.
    Deferred(Assessment),
}

impl Admission {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Outcome of one retry pass over the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub applied: usize,
    pub remaining: usize,
}

#[derive(Debug, Clone)]
pub struct AdmissionGuard {
    providers: Providers,
    locks: LockManager,
    ledger: DeferredLedger,
    floor: CapacityFloor,
    lock_timeout: Duration,
}

impl AdmissionGuard {
    pub fn new(
        providers: Providers,
        locks: LockManager,
        ledger: DeferredLedger,
        floor: CapacityFloor,
    ) -> Self {
        Self {
            providers,
            locks,
            ledger,
            floor,
            lock_timeout: Duration::from_secs(30),
        }
    }

    pub fn from_config(config: &FleetConfig) -> Self {
        let locks = LockManager::new(config.paths.locks());
        let ledger = DeferredLedger::new(
            config.paths.ledger(),
            locks.clone(),
            config.guard.lock_timeout,
        );
        Self::new(
            Providers::from_config(config),
            locks,
            ledger,
            CapacityFloor::from_config(config),
        )
        .with_lock_timeout(config.guard.lock_timeout)
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn ledger(&self) -> &DeferredLedger {
        &self.ledger
    }

    pub fn providers(&self) -> &Providers {
        &self.providers
    }

    async fn lock_backend(&self, backend: &str) -> GuardResult<LockGuard> {
        Ok(self
            .locks
            .acquire(&format!("backend:{backend}"), Some(self.lock_timeout))
            .await?)
    }

    /// Apply `action`, ledgering it when the floor refuses.
    pub async fn apply(
        &self,
        action: GuardAction,
        backend: &str,
        server: &str,
    ) -> GuardResult<Admission> {
        let _lock = self.lock_backend(backend).await?;
        let admission = self.check_and_act(action, backend, server).await?;
        if let Admission::Deferred(assessment) = &admission {
            self.ledger
                .append(&DeferredAction::new(action, backend, server, assessment.reason()))
                .await?;
        }
        Ok(admission)
    }

    /// Like [`apply`](Self::apply) but a refusal is only reported, not
    /// ledgered. For callers that keep their own retry state.
    pub async fn try_apply(
        &self,
        action: GuardAction,
        backend: &str,
        server: &str,
    ) -> GuardResult<Admission> {
        let _lock = self.lock_backend(backend).await?;
        self.check_and_act(action, backend, server).await
    }

    /// Return a server to the pool. Never refused.
    pub async fn enable(&self, backend: &str, server: &str) -> GuardResult<()> {
        let _lock = self.lock_backend(backend).await?;
        self.act(GuardAction::Enable, backend, server).await
    }

    pub async fn set_weight(&self, backend: &str, server: &str, weight: u32) -> GuardResult<()> {
        let _lock = self.lock_backend(backend).await?;
        self.providers
            .for_backend(backend)
            .set_weight(backend, server, weight)
            .await?;
        info!(%backend, %server, weight, "weight set");
        Ok(())
    }

    /// Current capacity of a backend, for reporting.
    pub async fn assess(&self, backend: &str, server: &str) -> GuardResult<Assessment> {
        let servers = self.providers.for_backend(backend).servers(backend).await?;
        Ok(assess(&servers, server, self.floor.for_backend(backend)))
    }

    /// Caller holds the backend lock.
    async fn check_and_act(
        &self,
        action: GuardAction,
        backend: &str,
        server: &str,
    ) -> GuardResult<Admission> {
        if action.reduces_capacity() {
            let assessment = self.assess(backend, server).await?;
            if !assessment.allowed() {
                warn!(
                    %backend, %server, %action,
                    enabled_now = assessment.enabled_now,
                    would_left = assessment.would_left,
                    min_enabled = assessment.min_enabled,
                    "action deferred by capacity floor"
                );
                return Ok(Admission::Deferred(assessment));
            }
        }
        self.act(action, backend, server).await?;
        Ok(Admission::Applied)
    }

    async fn act(&self, action: GuardAction, backend: &str, server: &str) -> GuardResult<()> {
        self.providers
            .for_backend(backend)
            .set_state(backend, server, action)
            .await?;
        info!(%backend, %server, %action, "pool action applied");
        Ok(())
    }

    /// Re-evaluate every ledger row. Rows that pass are executed and
    /// dropped; the rest are kept with a fresh reason. Rows appended by
    /// other processes while the pass runs are preserved.
    pub async fn retry_deferred(&self) -> GuardResult<RetryReport> {
        let _pass = self
            .locks
            .acquire(RETRY_LOCK, Some(self.lock_timeout))
            .await?;

        let snapshot = {
            let _ledger = self.ledger.lock().await?;
            self.ledger.read()?
        };
        if snapshot.is_empty() {
            return Ok(RetryReport::default());
        }

        let mut kept = Vec::new();
        let mut applied = 0;
        for mut row in snapshot.iter().cloned() {
            let result = async {
                let _lock = self.lock_backend(&row.backend).await?;
                self.check_and_act(row.action, &row.backend, &row.server).await
            }
            .await;
            match result {
                Ok(Admission::Applied) => {
                    info!(backend = %row.backend, server = %row.server, action = %row.action, "deferred action applied");
                    applied += 1;
                }
                Ok(Admission::Deferred(assessment)) => {
                    row.reason = assessment.reason();
                    kept.push(row);
                }
                Err(e) => {
                    warn!(backend = %row.backend, server = %row.server, error = %e, "deferred action failed");
                    row.reason = format!("error: {e}");
                    kept.push(row);
                }
            }
        }

        let _ledger = self.ledger.lock().await?;
        let current = self.ledger.read()?;
        // Only retry passes rewrite the ledger and they are serialized, so
        // the first `snapshot.len()` rows are the ones processed above.
        kept.extend(current.into_iter().skip(snapshot.len()));
        self.ledger.rewrite_locked(&kept)?;

        let report = RetryReport {
            applied,
            remaining: kept.len(),
        };
        info!(applied = report.applied, remaining = report.remaining, "deferred retry pass finished");
        Ok(report)
    }
}
