//! Generation step vocabulary.

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// One stage of content generation.
///
/// Declaration order is the canonical execution order: a job may request any
/// subset of steps, but they always run idea → copy → base image → final design.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepKind {
    IdeaGeneration,
    CopyDesign,
    BaseImage,
    FinalDesign,
}

impl StepKind {
    pub const ALL: [StepKind; 4] = [
        StepKind::IdeaGeneration,
        StepKind::CopyDesign,
        StepKind::BaseImage,
        StepKind::FinalDesign,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StepKind::IdeaGeneration => "IDEA_GENERATION",
            StepKind::CopyDesign => "COPY_DESIGN",
            StepKind::BaseImage => "BASE_IMAGE",
            StepKind::FinalDesign => "FINAL_DESIGN",
        }
    }
}

impl core::fmt::Display for StepKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for StepKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| DomainError::validation(format!("unknown step: {s}")))
    }
}
