use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::Provider;
use crate::error::ProviderError;
use crate::types::{ContentBlock, InferenceRequest, InferenceResponse, StopReason, Usage};

/// OpenAI-compatible provider. Works with the hosted API, vLLM, LM Studio,
/// Ollama, OpenRouter, or anything else speaking `/v1/chat/completions`.
pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: None,
        }
    }

    /// Set an API key (required for the hosted API and OpenRouter).
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Bridge the engine's tool schemas to OpenAI function-calling format.
    fn convert_tools(tools: &[Value]) -> Vec<Value> {
        tools
            .iter()
            .filter_map(|tool| {
                let name = tool["name"].as_str()?;
                let description = tool.get("description").cloned().unwrap_or(Value::Null);
                let parameters = tool
                    .get("input_schema")
                    .cloned()
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}}));

                Some(json!({
                    "type": "function",
                    "function": {
                        "name": name,
                        "description": description,
                        "parameters": parameters,
                    }
                }))
            })
            .collect()
    }

    /// Bridge the engine's message shapes to OpenAI chat format. Tool
    /// results become `tool`-role messages; an error flag has no slot
    /// there, so failed results get an `ERROR:` prefix the model can see.
    fn convert_messages(system: Option<&str>, messages: &[Value]) -> Vec<Value> {
        let mut out = Vec::new();

        if let Some(sys) = system {
            out.push(json!({ "role": "system", "content": sys }));
        }

        for msg in messages {
            let role = msg["role"].as_str().unwrap_or("user");
            let Some(blocks) = msg["content"].as_array() else {
                // Plain-string content maps one to one.
                out.push(json!({ "role": role, "content": msg["content"] }));
                continue;
            };

            if role == "user" {
                let mut text_parts = Vec::new();
                for block in blocks {
                    match block["type"].as_str() {
                        Some("tool_result") => {
                            let content = block["content"].as_str().unwrap_or("");
                            let content = if block["is_error"].as_bool().unwrap_or(false) {
                                format!("ERROR: {content}")
                            } else {
                                content.to_string()
                            };
                            out.push(json!({
                                "role": "tool",
                                "tool_call_id": block["tool_use_id"],
                                "content": content,
                            }));
                        }
                        Some("text") => {
                            if let Some(t) = block["text"].as_str() {
                                text_parts.push(t.to_string());
                            }
                        }
                        Some("image") => text_parts.push("[image attached]".into()),
                        _ => {}
                    }
                }
                if !text_parts.is_empty() {
                    out.push(json!({ "role": "user", "content": text_parts.join("\n") }));
                }
                continue;
            }

            // Assistant blocks: text collapses, tool_use becomes tool_calls.
            let mut text_parts = Vec::new();
            let mut tool_calls = Vec::new();
            for block in blocks {
                match block["type"].as_str() {
                    Some("text") => {
                        if let Some(t) = block["text"].as_str() {
                            text_parts.push(t.to_string());
                        }
                    }
                    Some("tool_use") => {
                        tool_calls.push(json!({
                            "id": block["id"],
                            "type": "function",
                            "function": {
                                "name": block["name"],
                                "arguments": block["input"].to_string(),
                            }
                        }));
                    }
                    _ => {}
                }
            }
            let mut assistant_msg =
                json!({ "role": "assistant", "content": text_parts.join("\n") });
            if !tool_calls.is_empty() {
                assistant_msg["tool_calls"] = Value::Array(tool_calls);
            }
            out.push(assistant_msg);
        }

        out
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn generate(
        &self,
        request: InferenceRequest,
    ) -> Result<InferenceResponse, ProviderError> {
        let messages = Self::convert_messages(request.system.as_deref(), &request.messages);

        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "messages": messages,
        });

        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(Self::convert_tools(&request.tools));
        }

        debug!(
            model = %request.model,
            messages = messages.len(),
            "chat-completions inference request"
        );

        let mut req = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("content-type", "application/json");

        if let Some(ref key) = self.api_key {
            req = req.header("authorization", format!("Bearer {key}"));
        }

        let resp = req
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Request(e.to_string()))?;

        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .map_err(|e| ProviderError::Request(e.to_string()))?;

        if status != 200 {
            return Err(ProviderError::Api { status, body: text });
        }

        let parsed: Value =
            serde_json::from_str(&text).map_err(|e| ProviderError::Parse(e.to_string()))?;

        let choice = &parsed["choices"][0];

        let stop_reason = match choice["finish_reason"].as_str().unwrap_or("stop") {
            "stop" => StopReason::EndTurn,
            "tool_calls" => StopReason::ToolUse,
            "length" => StopReason::MaxTokens,
            other => {
                debug!(finish_reason = %other, "unknown finish_reason, treating as EndTurn");
                StopReason::EndTurn
            }
        };

        let message = &choice["message"];
        let mut content = Vec::new();

        if let Some(text) = message["content"].as_str() {
            if !text.is_empty() {
                content.push(ContentBlock::Text {
                    text: text.to_string(),
                });
            }
        }

        if let Some(tool_calls) = message["tool_calls"].as_array() {
            for tc in tool_calls {
                let id = tc["id"].as_str().unwrap_or("").to_string();
                let name = tc["function"]["name"].as_str().unwrap_or("").to_string();
                let args_str = tc["function"]["arguments"].as_str().unwrap_or("{}");
                let input: Value = serde_json::from_str(args_str).unwrap_or_else(|_| json!({}));

                content.push(ContentBlock::ToolUse { id, name, input });
            }
        }

        let usage = Usage {
            input_tokens: parsed["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: parsed["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
        };

        Ok(InferenceResponse {
            stop_reason,
            content,
            usage,
        })
    }

    fn supports_parallel_tools(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_schema_bridge() {
        let tools = vec![json!({
            "name": "click",
            "description": "Click an element",
            "input_schema": {"type": "object", "properties": {"selector": {"type": "string"}}}
        })];
        let converted = OpenAiProvider::convert_tools(&tools);
        assert_eq!(converted[0]["type"], "function");
        assert_eq!(converted[0]["function"]["name"], "click");
        assert!(converted[0]["function"]["parameters"]["properties"]["selector"].is_object());
    }

    #[test]
    fn message_bridge_maps_tool_results_to_tool_role() {
        let messages = vec![
            json!({"role": "user", "content": "hello"}),
            json!({"role": "assistant", "content": [
                {"type": "text", "text": "Clicking."},
                {"type": "tool_use", "id": "c1", "name": "click", "input": {"selector": "#a"}},
            ]}),
            json!({"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "c1", "tool_name": "click", "content": "ok"},
            ]}),
        ];

        let converted = OpenAiProvider::convert_messages(Some("be brief"), &messages);
        assert_eq!(converted[0]["role"], "system");
        assert_eq!(converted[1]["role"], "user");
        assert_eq!(converted[2]["role"], "assistant");
        assert_eq!(converted[2]["tool_calls"][0]["function"]["name"], "click");
        assert_eq!(converted[3]["role"], "tool");
        assert_eq!(converted[3]["tool_call_id"], "c1");
    }

    #[test]
    fn error_tool_results_are_prefixed() {
        let messages = vec![json!({"role": "user", "content": [
            {"type": "tool_result", "tool_use_id": "c9", "tool_name": "click",
             "content": "no such element", "is_error": true},
        ]})];
        let converted = OpenAiProvider::convert_messages(None, &messages);
        assert_eq!(converted[0]["role"], "tool");
        assert!(converted[0]["content"]
            .as_str()
            .unwrap()
            .starts_with("ERROR:"));
    }
}
