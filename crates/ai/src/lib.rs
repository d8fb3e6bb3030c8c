//! `contentforge-ai`
//!
//! **Responsibility:** boundary to the external content-generation capability.
//!
//! This crate only describes what the pipeline asks of a model provider:
//! - It must not depend on job, ledger, or version types.
//! - It must not mutate pipeline state.
//! - A provider returns content plus a token cost, or a classified failure.

pub mod context;
pub mod generator;
pub mod result;
pub mod scripted;

pub use context::{GenerationContext, PriorOutput};
pub use generator::ContentGenerator;
pub use result::{FailureClass, GeneratedContent, GenerationError};
pub use scripted::{GenerationCall, ScriptedGenerator, ScriptedOutcome};
