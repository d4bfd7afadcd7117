//! Job lifecycle: registry, state machine, live progress and admission.
//!
//! ## Design
//!
//! - Jobs are tenant-scoped and move through `queued → running → {completed | failed | stopped}`
//! - Submission reserves quota up front; terminal transitions settle it
//! - Every mutation is a compare-and-swap on the job's version, so racing
//!   callers serialize per job without locking the whole registry
//! - The scheduler admits queued work round-robin across tenants and retries
//!   executor start-up failures with backoff
//!
//! ## Components
//!
//! - `Job` / `JobState`: entity and transition table
//! - `JobStore`: persistence abstraction (in-memory implementation included)
//! - `ProgressTracker`: per-job progress with sequence ordering and ETA
//! - `JobRegistry`: submit / transition / get / list
//! - `JobScheduler`: admission under global and per-tenant caps
//! - `JobExecutor`: the external runner the scheduler starts jobs on

pub mod executor;
pub mod progress;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod types;

pub use executor::{ExecutorError, JobExecutor, JobStart};
pub use progress::{DEFAULT_FINISHED_RETENTION, ProgressReport, ProgressSnapshot, ProgressTracker};
pub use registry::{JobCursor, JobDetail, JobRegistry, JobRequest, ReportOutcome};
pub use retry::RetryPolicy;
pub use scheduler::{JobScheduler, SchedulerConfig, TickReport};
pub use store::{InMemoryJobStore, JobCounts, JobStore, JobStoreError, ListPosition};
pub use types::{JOB_LOG_CAPACITY, Job, JobKind, JobLogEntry, JobState, TransitionInfo};
