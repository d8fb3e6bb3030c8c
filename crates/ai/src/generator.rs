use async_trait::async_trait;

use crate::context::GenerationContext;
use crate::result::{GeneratedContent, GenerationError};

/// External content-generation capability.
///
/// Implementations wrap a model provider. The pipeline bounds every call with
/// a timeout and drops the future when the owning job is cancelled, so
/// implementations should not spawn detached work that outlives the call.
#[async_trait]
pub trait ContentGenerator: Send + Sync + 'static {
    async fn generate(&self, context: &GenerationContext) -> Result<GeneratedContent, GenerationError>;
}
