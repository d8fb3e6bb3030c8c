//! Infrastructure for the generation pipeline: configuration, stores, the
//! token ledger service, and the async job pipeline itself.

pub mod config;
pub mod error;
pub mod ledger;
pub mod pipeline;
pub mod store;

#[cfg(test)]
mod integration_tests;

pub use config::{BackoffStrategy, ConfigError, PipelineConfig, RetryPolicy, StepEstimates};
pub use error::{PipelineError, PipelineResult};
pub use ledger::{InMemoryTokenLedger, TokenLedger};
pub use pipeline::{
    CampaignJobsView, JobOrchestrator, JobQuery, JobStatusView, Pipeline, StatusCounts, StepExecutor,
    StepOutcome, StepView,
};
pub use store::{InMemoryJobStore, InMemoryVersionStore, JobStats, JobStore, StoreError, VersionStore};
