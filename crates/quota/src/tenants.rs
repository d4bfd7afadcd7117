//! Tenant accounts as supplied by the billing/subscription service.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};

use quotaflow_core::{TenantId, Tier};

/// A monthly billing window, `[start, end)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BillingPeriod {
    /// One calendar month starting at `start`.
    pub fn monthly(start: DateTime<Utc>) -> Self {
        let end = start
            .checked_add_months(Months::new(1))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self { start, end }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    pub fn next(&self) -> Self {
        Self::monthly(self.end)
    }

    /// The period containing `at`, rolling forward month by month when the
    /// billing service has not advanced the account yet.
    pub fn rolled_to(&self, at: DateTime<Utc>) -> Self {
        let mut period = *self;
        while at >= period.end && period.end < DateTime::<Utc>::MAX_UTC {
            period = period.next();
        }
        period
    }
}

/// Subscription state of a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantAccount {
    pub id: TenantId,
    pub tier: Tier,
    pub period: BillingPeriod,
}

impl TenantAccount {
    pub fn new(id: TenantId, tier: Tier, period: BillingPeriod) -> Self {
        Self { id, tier, period }
    }
}

/// Tenant lookup (billing collaborator).
pub trait TenantDirectory: Send + Sync {
    fn account(&self, tenant_id: TenantId) -> Option<TenantAccount>;

    fn accounts(&self) -> Vec<TenantAccount>;
}

impl<S> TenantDirectory for Arc<S>
where
    S: TenantDirectory + ?Sized,
{
    fn account(&self, tenant_id: TenantId) -> Option<TenantAccount> {
        (**self).account(tenant_id)
    }

    fn accounts(&self) -> Vec<TenantAccount> {
        (**self).accounts()
    }
}

/// In-memory directory for tests, embedding and demos.
#[derive(Debug, Default)]
pub struct InMemoryTenantDirectory {
    inner: RwLock<HashMap<TenantId, TenantAccount>>,
}

impl InMemoryTenantDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, account: TenantAccount) {
        if let Ok(mut map) = self.inner.write() {
            map.insert(account.id, account);
        }
    }

    /// Change a tenant's tier; takes effect on the next quota check.
    pub fn set_tier(&self, tenant_id: TenantId, tier: Tier) -> bool {
        match self.inner.write() {
            Ok(mut map) => match map.get_mut(&tenant_id) {
                Some(account) => {
                    account.tier = tier;
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }
}

impl TenantDirectory for InMemoryTenantDirectory {
    fn account(&self, tenant_id: TenantId) -> Option<TenantAccount> {
        let map = self.inner.read().ok()?;
        map.get(&tenant_id).cloned()
    }

    fn accounts(&self) -> Vec<TenantAccount> {
        match self.inner.read() {
            Ok(map) => map.values().cloned().collect(),
            Err(_) => vec![],
        }
    }
}
