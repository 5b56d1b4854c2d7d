pub mod anthropic;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ProviderError;
use crate::types::{ContentBlock, InferenceRequest, InferenceResponse, StopReason, StreamChunk, Usage};

/// Pure LLM API call. No state, no history, no context management.
/// Request in, response out.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn generate(&self, request: InferenceRequest)
        -> Result<InferenceResponse, ProviderError>;

    /// Streamed variant: chunks go to `tx` as they arrive and the collated
    /// response is returned. The default emits the whole response as one
    /// chunk, so non-streaming providers work everywhere.
    async fn generate_streaming(
        &self,
        request: InferenceRequest,
        tx: mpsc::Sender<StreamChunk>,
    ) -> Result<InferenceResponse, ProviderError> {
        let response = self.generate(request).await?;
        let _ = tx
            .send(StreamChunk {
                delta: Some(response.text()),
                tool_call: None,
                finish_reason: Some(response.stop_reason),
                usage: Some(response.usage),
            })
            .await;
        Ok(response)
    }

    /// Whether independent tool calls from one turn may run concurrently.
    fn supports_parallel_tools(&self) -> bool {
        false
    }
}

/// Blanket impl so `Box<dyn Provider>` slots in wherever a provider is
/// expected.
#[async_trait]
impl Provider for Box<dyn Provider> {
    async fn generate(
        &self,
        request: InferenceRequest,
    ) -> Result<InferenceResponse, ProviderError> {
        (**self).generate(request).await
    }

    async fn generate_streaming(
        &self,
        request: InferenceRequest,
        tx: mpsc::Sender<StreamChunk>,
    ) -> Result<InferenceResponse, ProviderError> {
        (**self).generate_streaming(request, tx).await
    }

    fn supports_parallel_tools(&self) -> bool {
        (**self).supports_parallel_tools()
    }
}

/// Fold a chunk sequence into one response: deltas concatenate into a text
/// block, tool calls accumulate, the last finish reason and usage win.
pub fn collate(chunks: &[StreamChunk]) -> InferenceResponse {
    let mut text = String::new();
    let mut content = Vec::new();
    let mut stop_reason = StopReason::EndTurn;
    let mut usage = Usage::default();

    for chunk in chunks {
        if let Some(delta) = &chunk.delta {
            text.push_str(delta);
        }
        if let Some(call) = &chunk.tool_call {
            content.push(call.clone());
        }
        if let Some(reason) = chunk.finish_reason {
            stop_reason = reason;
        }
        if let Some(u) = chunk.usage {
            usage = u;
        }
    }

    if !text.is_empty() {
        content.insert(0, ContentBlock::Text { text });
    }

    InferenceResponse {
        stop_reason,
        content,
        usage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn collate_concatenates_deltas_and_orders_blocks() {
        let chunks = vec![
            StreamChunk {
                delta: Some("Hel".into()),
                tool_call: None,
                finish_reason: None,
                usage: None,
            },
            StreamChunk {
                delta: Some("lo".into()),
                tool_call: Some(ContentBlock::ToolUse {
                    id: "c1".into(),
                    name: "click".into(),
                    input: json!({}),
                }),
                finish_reason: None,
                usage: None,
            },
            StreamChunk {
                delta: None,
                tool_call: None,
                finish_reason: Some(StopReason::ToolUse),
                usage: Some(Usage {
                    input_tokens: 10,
                    output_tokens: 4,
                }),
            },
        ];

        let response = collate(&chunks);
        assert_eq!(response.stop_reason, StopReason::ToolUse);
        assert_eq!(response.text(), "Hello");
        assert_eq!(response.tool_calls().len(), 1);
        assert_eq!(response.usage.total(), 14);
    }

    #[test]
    fn collate_empty_is_empty_end_turn() {
        let response = collate(&[]);
        assert_eq!(response.stop_reason, StopReason::EndTurn);
        assert!(response.content.is_empty());
    }
}
