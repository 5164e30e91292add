//! Model completion capability
//!
//! The dispatcher only depends on the `CompletionClient` trait; the Gemini
//! implementation lives in [`gemini`]. Tests substitute scripted clients.

use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::models::ConversationTurn;
use crate::Result;

pub mod gemini;
pub use gemini::GeminiClient;

/// One incremental unit of a streamed model response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelDelta {
    /// Plain text to forward verbatim.
    pub content: Option<String>,
    /// Partial or complete tool-call data.
    pub tool_call: Option<ToolCallFragment>,
}

/// Tool-call data carried by a single delta. Depending on the wire shape
/// this is either a fully-formed call (name and parseable arguments
/// together) or one fragment of an incrementally accumulated call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCallFragment {
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

impl ModelDelta {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_call: None,
        }
    }
}

pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<ModelDelta>> + Send>>;

/// The completion/streaming capability the turn pipeline is built on.
/// Retry policy is the implementation's concern, none is imposed here.
#[async_trait::async_trait]
pub trait CompletionClient: Send + Sync {
    /// Request a streamed completion for the transcript with the given tool
    /// schemas attached.
    async fn stream_turn(
        &self,
        transcript: &ConversationTurn,
        tools: &[serde_json::Value],
    ) -> Result<DeltaStream>;

    /// Request a single non-streamed completion.
    async fn complete(&self, system: &str, user: &str) -> Result<String>;
}
