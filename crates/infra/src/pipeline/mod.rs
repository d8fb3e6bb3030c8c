//! Job pipeline: step execution, orchestration and the query facade.
//!
//! - `StepExecutor`: one attempt at one step (generate, commit, version)
//! - `JobOrchestrator`: job lifecycle, retries, cancellation, agency limits
//! - `JobQuery`: status views, campaign rollups and version management

pub mod executor;
pub mod gates;
pub mod orchestrator;
pub mod query;

use std::sync::Arc;

pub use executor::{StepExecutor, StepOutcome};
pub use gates::{AgencyLimits, JobGates};
pub use orchestrator::JobOrchestrator;
pub use query::{CampaignJobsView, JobQuery, JobStatusView, StatusCounts, StepView};

use contentforge_ai::ContentGenerator;

use crate::config::PipelineConfig;
use crate::ledger::{InMemoryTokenLedger, TokenLedger};
use crate::store::{InMemoryJobStore, InMemoryVersionStore, JobStore, VersionStore};

/// Orchestrator, query facade and the stores they share.
#[derive(Clone)]
pub struct Pipeline {
    pub orchestrator: JobOrchestrator,
    pub query: JobQuery,
    pub jobs: Arc<dyn JobStore>,
    pub versions: Arc<dyn VersionStore>,
    pub ledger: Arc<dyn TokenLedger>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        jobs: Arc<dyn JobStore>,
        versions: Arc<dyn VersionStore>,
        ledger: Arc<dyn TokenLedger>,
        generator: Arc<dyn ContentGenerator>,
    ) -> Self {
        let query = JobQuery::new(config.clone(), jobs.clone(), versions.clone());
        let orchestrator = JobOrchestrator::new(config, jobs.clone(), versions.clone(), ledger.clone(), generator);
        Self {
            orchestrator,
            query,
            jobs,
            versions,
            ledger,
        }
    }

    /// Pipeline backed by the in-memory stores and ledger.
    pub fn in_memory(config: PipelineConfig, generator: Arc<dyn ContentGenerator>) -> Self {
        Self::new(
            config,
            InMemoryJobStore::arc(),
            InMemoryVersionStore::arc(),
            InMemoryTokenLedger::arc(),
            generator,
        )
    }
}
