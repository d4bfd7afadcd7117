//! Tiered quotas and per-tenant usage metering.
//!
//! ## Components
//!
//! - `QuotaPolicy`: immutable tier → limits table; `PolicyHandle` swaps it on reload
//! - `TenantDirectory`: tenant tier and billing period (billing collaborator)
//! - `UsageMeter`: reserve / finalize / release against the tenant's limits
//! - `OverageSink`: receives consumption that could not be charged within a limit

pub mod meter;
pub mod policy;
pub mod tenants;

pub use meter::{
    DEFAULT_SETTLED_RETENTION, InMemoryOverageLog, OverageEvent, OverageSink, Reservation, ResourceTotals, Settlement,
    TierUsage, UsageLine, UsageMeter, UsageReport,
};
pub use policy::{Limit, PolicyError, PolicyHandle, QuotaPolicy, TierLimits};
pub use tenants::{BillingPeriod, InMemoryTenantDirectory, TenantAccount, TenantDirectory};
