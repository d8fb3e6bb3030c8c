use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use contentforge_core::{CampaignId, ClientId, DomainError, DomainResult, StepKind};

/// A caller's request for a new generation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub client_id: ClientId,
    pub campaign_id: Option<CampaignId>,
    pub steps: Vec<StepKind>,
    pub prompt: String,
    /// Brand / campaign parameters handed to every step.
    #[serde(default)]
    pub parameters: JsonValue,
}

impl JobRequest {
    /// Request for the full idea → final design pipeline.
    pub fn full_pipeline(client_id: ClientId, prompt: impl Into<String>) -> Self {
        Self {
            client_id,
            campaign_id: None,
            steps: StepKind::ALL.to_vec(),
            prompt: prompt.into(),
            parameters: JsonValue::Null,
        }
    }

    pub fn with_campaign(mut self, campaign_id: CampaignId) -> Self {
        self.campaign_id = Some(campaign_id);
        self
    }

    pub fn with_steps(mut self, steps: Vec<StepKind>) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_parameters(mut self, parameters: JsonValue) -> Self {
        self.parameters = parameters;
        self
    }

    /// Steps must be non-empty, unique, and listed in canonical order.
    pub fn validate(&self) -> DomainResult<()> {
        if self.prompt.trim().is_empty() {
            return Err(DomainError::validation("prompt cannot be empty"));
        }
        if self.steps.is_empty() {
            return Err(DomainError::validation("a job needs at least one step"));
        }
        for pair in self.steps.windows(2) {
            if pair[0] == pair[1] {
                return Err(DomainError::validation(format!("duplicate step: {}", pair[0])));
            }
            if pair[0] > pair[1] {
                return Err(DomainError::validation(format!(
                    "step {} must run before {}",
                    pair[1], pair[0]
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_pipeline_is_valid() {
        assert!(JobRequest::full_pipeline(ClientId::new(), "launch").validate().is_ok());
    }

    #[test]
    fn rejects_empty_prompt_and_steps() {
        let req = JobRequest::full_pipeline(ClientId::new(), "  ");
        assert!(req.validate().is_err());

        let req = JobRequest::full_pipeline(ClientId::new(), "launch").with_steps(vec![]);
        assert!(req.validate().is_err());
    }

    #[test]
    fn rejects_duplicates_and_out_of_order_steps() {
        let dup = JobRequest::full_pipeline(ClientId::new(), "x")
            .with_steps(vec![StepKind::CopyDesign, StepKind::CopyDesign]);
        assert!(matches!(dup.validate(), Err(DomainError::Validation(m)) if m.contains("duplicate")));

        let reversed = JobRequest::full_pipeline(ClientId::new(), "x")
            .with_steps(vec![StepKind::FinalDesign, StepKind::IdeaGeneration]);
        assert!(reversed.validate().is_err());
    }

    #[test]
    fn subset_in_order_is_accepted() {
        let req = JobRequest::full_pipeline(ClientId::new(), "x")
            .with_steps(vec![StepKind::CopyDesign, StepKind::FinalDesign]);
        assert!(req.validate().is_ok());
    }
}
