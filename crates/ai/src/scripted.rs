//! Deterministic generator for tests, demos, and local development.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};

use contentforge_core::{JobId, StepKind};

use crate::context::GenerationContext;
use crate::generator::ContentGenerator;
use crate::result::{GeneratedContent, GenerationError};

/// One scripted response for a step.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    /// Return this content and cost.
    Succeed { content: JsonValue, token_cost: u64 },
    /// Return the default content with a specific cost.
    Cost(u64),
    /// Fail with the given error.
    Fail(GenerationError),
    /// Never resolve (exercises timeouts and cancellation).
    Hang,
    /// Sleep, then behave like the inner outcome.
    Delayed(Duration, Box<ScriptedOutcome>),
}

/// Record of one call made against the generator.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationCall {
    pub job_id: JobId,
    pub step: StepKind,
    pub attempt: u32,
    pub prior_steps: Vec<StepKind>,
    pub prior_version_numbers: Vec<u32>,
}

/// Generator that replays queued outcomes per step.
///
/// When a step has nothing queued it succeeds with a small JSON payload and
/// the step's default cost.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    default_costs: HashMap<StepKind, u64>,
    scripts: Mutex<HashMap<StepKind, VecDeque<ScriptedOutcome>>>,
    calls: Mutex<Vec<GenerationCall>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default cost for a step when no outcome is queued.
    pub fn with_cost(mut self, step: StepKind, token_cost: u64) -> Self {
        self.default_costs.insert(step, token_cost);
        self
    }

    /// Queue an outcome for the next call to `step`.
    pub fn push(&self, step: StepKind, outcome: ScriptedOutcome) {
        let mut scripts = self.scripts.lock().unwrap_or_else(|p| p.into_inner());
        scripts.entry(step).or_default().push_back(outcome);
    }

    /// Queue the same outcome `times` times.
    pub fn push_repeated(&self, step: StepKind, outcome: ScriptedOutcome, times: usize) {
        for _ in 0..times {
            self.push(step, outcome.clone());
        }
    }

    pub fn calls(&self) -> Vec<GenerationCall> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn calls_for(&self, step: StepKind) -> usize {
        self.calls().iter().filter(|c| c.step == step).count()
    }

    fn default_content(context: &GenerationContext) -> JsonValue {
        json!({
            "step": context.step.as_str(),
            "prompt": context.prompt,
            "attempt": context.attempt,
            "builds_on": context
                .prior_outputs
                .iter()
                .map(|p| format!("{}#{}", p.step, p.version_number))
                .collect::<Vec<_>>(),
        })
    }

    fn next_outcome(&self, step: StepKind) -> Option<ScriptedOutcome> {
        let mut scripts = self.scripts.lock().unwrap_or_else(|p| p.into_inner());
        scripts.get_mut(&step).and_then(VecDeque::pop_front)
    }

    fn record(&self, context: &GenerationContext) {
        let mut calls = self.calls.lock().unwrap_or_else(|p| p.into_inner());
        calls.push(GenerationCall {
            job_id: context.job_id,
            step: context.step,
            attempt: context.attempt,
            prior_steps: context.prior_outputs.iter().map(|p| p.step).collect(),
            prior_version_numbers: context.prior_outputs.iter().map(|p| p.version_number).collect(),
        });
    }
}

#[async_trait]
impl ContentGenerator for ScriptedGenerator {
    async fn generate(&self, context: &GenerationContext) -> Result<GeneratedContent, GenerationError> {
        self.record(context);

        let mut outcome = self.next_outcome(context.step);
        loop {
            match outcome {
                None => {
                    let cost = self.default_costs.get(&context.step).copied().unwrap_or(1);
                    return Ok(GeneratedContent::new(Self::default_content(context), cost));
                }
                Some(ScriptedOutcome::Succeed { content, token_cost }) => {
                    return Ok(GeneratedContent::new(content, token_cost));
                }
                Some(ScriptedOutcome::Cost(token_cost)) => {
                    return Ok(GeneratedContent::new(Self::default_content(context), token_cost));
                }
                Some(ScriptedOutcome::Fail(err)) => return Err(err),
                Some(ScriptedOutcome::Hang) => return std::future::pending().await,
                Some(ScriptedOutcome::Delayed(delay, inner)) => {
                    tokio::time::sleep(delay).await;
                    outcome = Some(*inner);
                }
            }
        }
    }
}
