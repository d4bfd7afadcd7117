//! Per-tenant, per-billing-period usage metering.
//!
//! ## Reserve / finalize protocol
//!
//! Admission reasons about committed-but-unspent resources: a reservation is
//! granted only while `reserved + consumed + estimate <= limit`, and the check
//! and the increment happen under the same per-tenant lock. Finalizing swaps
//! the reservation for actual consumption; releasing drops it.
//!
//! Actual consumption above the estimate is charged only up to the headroom
//! left after every other in-flight reservation, so the admission invariant
//! keeps holding. Whatever cannot be charged becomes an [`OverageEvent`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use quotaflow_core::{
    Clock, EngineError, EngineResult, QuotaDenial, ReservationId, ResourceKind, ResourceUsage,
    TenantId, Tier,
};

use crate::policy::{Limit, PolicyHandle};
use crate::tenants::{BillingPeriod, TenantAccount, TenantDirectory};

/// A provisional hold on quota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub tenant_id: TenantId,
    /// Billing period the hold was taken in; settlement always targets it.
    pub period_start: DateTime<Utc>,
    pub estimate: ResourceUsage,
    pub created_at: DateTime<Utc>,
}

/// Consumption that exceeded the tenant's limit and was not charged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverageEvent {
    pub tenant_id: TenantId,
    pub reservation_id: ReservationId,
    pub resource: ResourceKind,
    pub period_start: DateTime<Utc>,
    /// Actual amount reported for the resource.
    pub requested: u64,
    pub charged: u64,
    pub overflow: u64,
    pub at: DateTime<Utc>,
}

/// How a reservation was settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum Settlement {
    Finalized {
        charged: ResourceUsage,
        overages: Vec<OverageEvent>,
    },
    Released,
}

impl Settlement {
    pub fn has_overage(&self) -> bool {
        matches!(self, Settlement::Finalized { overages, .. } if !overages.is_empty())
    }
}

/// Billing collaborator that invoices overages.
pub trait OverageSink: Send + Sync {
    fn record(&self, event: &OverageEvent);
}

/// Overage sink that keeps everything in memory.
#[derive(Debug, Default)]
pub struct InMemoryOverageLog {
    events: Mutex<Vec<OverageEvent>>,
}

impl InMemoryOverageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<OverageEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl OverageSink for InMemoryOverageLog {
    fn record(&self, event: &OverageEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// One resource line of a tenant's usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageLine {
    pub resource: ResourceKind,
    pub reserved: u64,
    pub consumed: u64,
    pub limit: Limit,
}

impl UsageLine {
    pub fn used(&self) -> u64 {
        self.reserved.saturating_add(self.consumed)
    }
}

/// Current-period usage of one tenant, for dashboards and invoicing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageReport {
    pub tenant_id: TenantId,
    pub tier: Tier,
    pub period: BillingPeriod,
    pub lines: Vec<UsageLine>,
}

impl UsageReport {
    pub fn line(&self, resource: ResourceKind) -> Option<&UsageLine> {
        self.lines.iter().find(|l| l.resource == resource)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceTotals {
    pub reserved: u64,
    pub consumed: u64,
}

/// Usage summed over every tenant of a tier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TierUsage {
    pub tenants: usize,
    pub resources: BTreeMap<ResourceKind, ResourceTotals>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counter {
    reserved: u64,
    consumed: u64,
}

#[derive(Debug, Default)]
struct PeriodLedger {
    counters: BTreeMap<ResourceKind, Counter>,
}

impl PeriodLedger {
    fn counter(&self, kind: ResourceKind) -> Counter {
        self.counters.get(&kind).copied().unwrap_or_default()
    }

    fn counter_mut(&mut self, kind: ResourceKind) -> &mut Counter {
        self.counters.entry(kind).or_default()
    }
}

/// Settled reservations remembered per tenant, so repeated settlement
/// returns the first outcome.
pub const DEFAULT_SETTLED_RETENTION: usize = 1024;

/// Everything metered for one tenant; guarded by a single mutex so that
/// check-and-reserve is one atomic step.
#[derive(Debug, Default)]
struct TenantLedger {
    periods: BTreeMap<DateTime<Utc>, PeriodLedger>,
    open: HashMap<ReservationId, Reservation>,
    settled: HashMap<ReservationId, Settlement>,
    settled_order: VecDeque<ReservationId>,
}

impl TenantLedger {
    /// Move an open reservation to the settled set, forgetting the oldest
    /// settlements beyond `retention`.
    fn settle(&mut self, reservation_id: ReservationId, settlement: Settlement, retention: usize) {
        self.open.remove(&reservation_id);
        self.settled.insert(reservation_id, settlement);
        self.settled_order.push_back(reservation_id);
        while self.settled_order.len() > retention {
            if let Some(oldest) = self.settled_order.pop_front() {
                self.settled.remove(&oldest);
            }
        }
    }

    /// Drop ledgers of periods before `current` that no open reservation
    /// still points at.
    fn prune_before(&mut self, current: DateTime<Utc>) {
        let open = &self.open;
        self.periods
            .retain(|start, _| *start >= current || open.values().any(|r| r.period_start == *start));
    }
}

/// Atomic increment-and-check of consumable counters against the quota policy.
pub struct UsageMeter {
    policy: Arc<PolicyHandle>,
    tenants: Arc<dyn TenantDirectory>,
    clock: Arc<dyn Clock>,
    overage_sink: Option<Arc<dyn OverageSink>>,
    ledgers: RwLock<HashMap<TenantId, Arc<Mutex<TenantLedger>>>>,
    settled_retention: usize,
    overage_events: AtomicU64,
}

impl UsageMeter {
    pub fn new(
        policy: Arc<PolicyHandle>,
        tenants: Arc<dyn TenantDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            policy,
            tenants,
            clock,
            overage_sink: None,
            ledgers: RwLock::new(HashMap::new()),
            settled_retention: DEFAULT_SETTLED_RETENTION,
            overage_events: AtomicU64::new(0),
        }
    }

    /// How many settled reservations each tenant remembers (at least one).
    pub fn with_settled_retention(mut self, retention: usize) -> Self {
        self.settled_retention = retention.max(1);
        self
    }

    pub fn with_overage_sink(mut self, sink: Arc<dyn OverageSink>) -> Self {
        self.overage_sink = Some(sink);
        self
    }

    pub fn policy(&self) -> &Arc<PolicyHandle> {
        &self.policy
    }

    pub fn tenants(&self) -> &Arc<dyn TenantDirectory> {
        &self.tenants
    }

    /// Number of overage events recorded since startup.
    pub fn overage_events(&self) -> u64 {
        self.overage_events.load(Ordering::Relaxed)
    }

    fn account(&self, tenant_id: TenantId) -> EngineResult<TenantAccount> {
        self.tenants
            .account(tenant_id)
            .ok_or_else(|| EngineError::TenantNotFound(tenant_id.to_string()))
    }

    fn ledger(&self, tenant_id: TenantId) -> EngineResult<Arc<Mutex<TenantLedger>>> {
        {
            let ledgers = self.ledgers.read().map_err(|_| EngineError::poisoned())?;
            if let Some(ledger) = ledgers.get(&tenant_id) {
                return Ok(ledger.clone());
            }
        }
        let mut ledgers = self.ledgers.write().map_err(|_| EngineError::poisoned())?;
        Ok(ledgers.entry(tenant_id).or_default().clone())
    }

    fn existing_ledger(&self, tenant_id: TenantId) -> EngineResult<Option<Arc<Mutex<TenantLedger>>>> {
        let ledgers = self.ledgers.read().map_err(|_| EngineError::poisoned())?;
        Ok(ledgers.get(&tenant_id).cloned())
    }

    /// Reserve `estimate` for the tenant's current billing period.
    ///
    /// Every resource named in the estimate must fit, or nothing is reserved.
    /// Fails with `QuotaExceeded` naming the first resource that does not fit.
    pub fn reserve(&self, tenant_id: TenantId, estimate: &ResourceUsage) -> EngineResult<Reservation> {
        let account = self.account(tenant_id)?;
        let policy = self.policy.current();
        let limits = policy.limits(account.tier);
        let now = self.clock.now();
        let period = account.period.rolled_to(now);

        let ledger = self.ledger(tenant_id)?;
        let mut ledger = ledger.lock().map_err(|_| EngineError::poisoned())?;
        if !ledger.periods.contains_key(&period.start) {
            ledger.prune_before(period.start);
        }
        let period_ledger = ledger.periods.entry(period.start).or_default();

        for (kind, amount) in estimate.iter() {
            let counter = period_ledger.counter(kind);
            let used = counter.reserved.saturating_add(counter.consumed);
            if let Limit::Finite(limit) = limits.resource(kind) {
                if used.saturating_add(amount) > limit {
                    let denial = QuotaDenial {
                        resource: kind,
                        used,
                        requested: amount,
                        limit,
                    };
                    info!(
                        tenant_id = %tenant_id,
                        tier = %account.tier,
                        resource = %kind,
                        used,
                        requested = amount,
                        limit,
                        "reservation denied"
                    );
                    return Err(EngineError::QuotaExceeded(denial));
                }
            }
        }

        for (kind, amount) in estimate.iter() {
            let counter = period_ledger.counter_mut(kind);
            counter.reserved = counter.reserved.saturating_add(amount);
        }

        let reservation = Reservation {
            id: ReservationId::new(),
            tenant_id,
            period_start: period.start,
            estimate: estimate.clone(),
            created_at: now,
        };
        ledger.open.insert(reservation.id, reservation.clone());

        debug!(
            tenant_id = %tenant_id,
            reservation_id = %reservation.id,
            estimate = ?estimate,
            "reservation granted"
        );
        Ok(reservation)
    }

    /// Convert a reservation into consumption of `actual`.
    ///
    /// Settling twice is a no-op that returns the first settlement, as long as
    /// the reservation is still within the settled retention.
    pub fn finalize(
        &self,
        tenant_id: TenantId,
        reservation_id: ReservationId,
        actual: &ResourceUsage,
    ) -> EngineResult<Settlement> {
        let account = self.account(tenant_id)?;
        let policy = self.policy.current();
        let limits = policy.limits(account.tier);
        let now = self.clock.now();

        let ledger = self.ledger(tenant_id)?;
        let settlement = {
            let mut ledger = ledger.lock().map_err(|_| EngineError::poisoned())?;
            if let Some(settlement) = ledger.settled.get(&reservation_id) {
                return Ok(settlement.clone());
            }
            let reservation = ledger
                .open
                .get(&reservation_id)
                .cloned()
                .ok_or_else(|| unknown_reservation(reservation_id))?;

            let period_start = reservation.period_start;
            let period_ledger = ledger.periods.entry(period_start).or_default();

            for (kind, amount) in reservation.estimate.iter() {
                let counter = period_ledger.counter_mut(kind);
                counter.reserved = counter.reserved.saturating_sub(amount);
            }

            let mut charged = ResourceUsage::new();
            let mut overages = Vec::new();
            for (kind, amount) in actual.iter() {
                let counter = period_ledger.counter_mut(kind);
                let used = counter.reserved.saturating_add(counter.consumed);
                let charge = match limits.resource(kind).headroom(used) {
                    Some(headroom) => amount.min(headroom),
                    None => amount,
                };
                counter.consumed = counter.consumed.saturating_add(charge);
                charged.set(kind, charge);

                if charge < amount {
                    overages.push(OverageEvent {
                        tenant_id,
                        reservation_id,
                        resource: kind,
                        period_start,
                        requested: amount,
                        charged: charge,
                        overflow: amount - charge,
                        at: now,
                    });
                }
            }

            let settlement = Settlement::Finalized { charged, overages };
            ledger.settle(reservation_id, settlement.clone(), self.settled_retention);
            settlement
        };

        if let Settlement::Finalized { overages, .. } = &settlement {
            for event in overages {
                warn!(
                    tenant_id = %tenant_id,
                    resource = %event.resource,
                    overflow = event.overflow,
                    "usage exceeded limit; overage recorded"
                );
                self.overage_events.fetch_add(1, Ordering::Relaxed);
                if let Some(sink) = &self.overage_sink {
                    sink.record(event);
                }
            }
        }

        debug!(tenant_id = %tenant_id, reservation_id = %reservation_id, "reservation finalized");
        Ok(settlement)
    }

    /// Drop a reservation without charging anything (cancellation).
    pub fn release(&self, tenant_id: TenantId, reservation_id: ReservationId) -> EngineResult<Settlement> {
        let ledger = self.ledger(tenant_id)?;
        let mut ledger = ledger.lock().map_err(|_| EngineError::poisoned())?;
        if let Some(settlement) = ledger.settled.get(&reservation_id) {
            return Ok(settlement.clone());
        }
        let reservation = ledger
            .open
            .get(&reservation_id)
            .cloned()
            .ok_or_else(|| unknown_reservation(reservation_id))?;

        let period_ledger = ledger.periods.entry(reservation.period_start).or_default();
        for (kind, amount) in reservation.estimate.iter() {
            let counter = period_ledger.counter_mut(kind);
            counter.reserved = counter.reserved.saturating_sub(amount);
        }
        ledger.settle(reservation_id, Settlement::Released, self.settled_retention);

        debug!(tenant_id = %tenant_id, reservation_id = %reservation_id, "reservation released");
        Ok(Settlement::Released)
    }

    /// Reserved / consumed / limit for every resource in the current period.
    pub fn current_usage(&self, tenant_id: TenantId) -> EngineResult<UsageReport> {
        let account = self.account(tenant_id)?;
        let policy = self.policy.current();
        let limits = policy.limits(account.tier);
        let period = account.period.rolled_to(self.clock.now());

        let counters: BTreeMap<ResourceKind, Counter> = match self.existing_ledger(tenant_id)? {
            Some(ledger) => {
                let ledger = ledger.lock().map_err(|_| EngineError::poisoned())?;
                ledger
                    .periods
                    .get(&period.start)
                    .map(|p| p.counters.clone())
                    .unwrap_or_default()
            }
            None => BTreeMap::new(),
        };

        let lines = ResourceKind::ALL
            .iter()
            .map(|kind| {
                let counter = counters.get(kind).copied().unwrap_or_default();
                UsageLine {
                    resource: *kind,
                    reserved: counter.reserved,
                    consumed: counter.consumed,
                    limit: limits.resource(*kind),
                }
            })
            .collect();

        Ok(UsageReport {
            tenant_id,
            tier: account.tier,
            period,
            lines,
        })
    }

    /// Current-period usage summed per tier.
    pub fn usage_by_tier(&self) -> BTreeMap<Tier, TierUsage> {
        let mut out: BTreeMap<Tier, TierUsage> = BTreeMap::new();
        for account in self.tenants.accounts() {
            let tier = out.entry(account.tier).or_default();
            tier.tenants += 1;

            // Tenants that never reserved anything have nothing to add.
            if !matches!(self.existing_ledger(account.id), Ok(Some(_))) {
                continue;
            }
            let Ok(report) = self.current_usage(account.id) else {
                continue;
            };
            for line in report.lines {
                let totals = tier.resources.entry(line.resource).or_default();
                totals.reserved += line.reserved;
                totals.consumed += line.consumed;
            }
        }
        out
    }

    /// Fail with `ModelLimitReached` when `in_use` already fills the tier's allowance.
    pub fn check_model_slot(&self, tenant_id: TenantId, in_use: u64) -> EngineResult<()> {
        let account = self.account(tenant_id)?;
        match self.policy.current().limits(account.tier).max_models {
            Limit::Finite(limit) if in_use >= limit => {
                info!(tenant_id = %tenant_id, in_use, limit, "model limit reached");
                Err(EngineError::ModelLimitReached { in_use, limit })
            }
            _ => Ok(()),
        }
    }

    /// Per-tenant concurrency cap from the tenant's tier.
    pub fn max_concurrent_jobs(&self, tenant_id: TenantId) -> EngineResult<Limit> {
        let account = self.account(tenant_id)?;
        Ok(self.policy.current().limits(account.tier).max_concurrent_jobs)
    }
}

fn unknown_reservation(id: ReservationId) -> EngineError {
    EngineError::validation(format!("unknown reservation: {id}"))
}
