use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use contentforge_core::{AgencyId, JobId, StepKind, VersionId};

/// Active output of a step that ran earlier in the same job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorOutput {
    pub step: StepKind,
    pub version_id: VersionId,
    pub version_number: u32,
    pub content: JsonValue,
}

/// Everything a provider sees when generating one step.
///
/// `prior_outputs` holds the *active* version of every earlier step, in
/// execution order. It is assembled by the pipeline; providers never read
/// storage themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationContext {
    pub job_id: JobId,
    pub agency_id: AgencyId,
    pub step: StepKind,
    /// 1-based attempt number within the current run.
    pub attempt: u32,
    pub prompt: String,
    /// Brand / campaign parameters supplied with the request.
    pub parameters: JsonValue,
    pub prior_outputs: Vec<PriorOutput>,
}

impl GenerationContext {
    pub fn prior(&self, step: StepKind) -> Option<&PriorOutput> {
        self.prior_outputs.iter().find(|p| p.step == step)
    }
}
