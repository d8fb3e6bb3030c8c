//! `contentforge-core` - shared building blocks for the generation pipeline.
//!
//! Identifiers, the step vocabulary, the domain error model, and the aggregate
//! traits used by the ledger and job crates. No infrastructure concerns live here.

pub mod aggregate;
pub mod error;
pub mod id;
pub mod step;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use error::{DomainError, DomainResult};
pub use id::{AgencyId, CampaignId, ClientId, JobId, ReservationId, UserId, VersionId};
pub use step::StepKind;
