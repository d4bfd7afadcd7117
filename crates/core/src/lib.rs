//! `quotaflow-core`: shared building blocks for the job and metering engine.
//!
//! Identifiers, subscription tiers, resource quantities, the engine-wide error
//! model and the clock abstraction live here. Nothing in this crate performs IO
//! or holds shared state.

pub mod clock;
pub mod error;
pub mod id;
pub mod resource;
pub mod tier;
pub mod version;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{EngineError, EngineResult, QuotaDenial};
pub use id::{JobId, ReservationId, TenantId};
pub use resource::{ResourceKind, ResourceUsage};
pub use tier::Tier;
pub use version::ExpectedVersion;
