//! `orchestra-scheduler` — recurring alert and experiment jobs for probes.
//!
//! # Overview
//!
//! Jobs carry an ISO-8601 repeating interval (`R<n>/<start>/P<duration>`).
//! The [`engine::Scheduler`] arms one Tokio task per active job; each run
//! resolves the job's target probes, pushes the payload through a
//! [`orchestra_notify::Notifier`] and persists the job's run counters.
//!
//! | Job kind     | Each run                                               |
//! |--------------|--------------------------------------------------------|
//! | `alert`      | Push the same message to every matching probe          |
//! | `experiment` | Verify the signed experiment, create one work item per |
//! |              | probe, push a `run_experiment` data message            |
//!
//! Work items then move `ready -> notified -> accepted -> done|rejected`
//! driven by the probes themselves (see [`work_items`]).

pub mod admin;
pub mod db;
pub mod engine;
pub mod error;
pub mod job;
pub mod keystore;
pub mod schedule;
pub mod store;
pub mod targets;
pub mod types;
pub mod work_items;

pub use admin::{AdminHandle, AlertJobRequest, ExperimentJobRequest};
pub use engine::{JobRegistry, RetryPolicy, Scheduler};
pub use error::{Result, SchedulerError};
pub use job::{Job, RunContext, RunOutcome, RunReport};
pub use keystore::{ExperimentClaims, Keystore};
pub use schedule::{Repeat, Schedule, ScheduleDuration};
pub use store::{JobStore, ProbeRegistry, SqliteStore};
pub use types::{JobKind, JobPayload, JobRecord, TargetFilter, WorkItem, WorkItemState};
