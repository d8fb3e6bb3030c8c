//! Generation job domain: jobs, steps, content versions and their comparison.
//!
//! Deterministic state machines only (no IO, no locking, no storage). The
//! infra crate persists these records and drives the transitions.

pub mod compare;
pub mod job;
pub mod request;
pub mod step;
pub mod version;

pub use compare::{ChangedField, ContentDiff, FieldValue, VersionComparison, VersionRef, compare_versions, diff};
pub use job::{Job, JobStatus};
pub use request::JobRequest;
pub use step::{Step, StepStatus};
pub use version::{Actor, ContentVersion, ExecutionKey, NewVersion, VersionError, VersionOrigin, VersionSummary};
