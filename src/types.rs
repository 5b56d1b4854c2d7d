use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Well-known priority levels. Higher survives longer.
pub mod priority {
    pub const EPHEMERAL: u16 = 10;
    pub const LOW: u16 = 25;
    pub const NORMAL: u16 = 50;
    pub const HIGH: u16 = 75;
    pub const CRITICAL: u16 = 150;
    pub const SYSTEM: u16 = 200;
}

/// A content block inside a message. Stored messages and provider responses
/// share this shape; responses only ever contain `Text` and `ToolUse`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        source: Value,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        tool_name: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

/// Message body: a plain string or a block sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Concatenated text of all textual parts. Tool results count: their
    /// content is what the model reads.
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.clone()),
                    ContentBlock::ToolResult { content, .. } => Some(content.clone()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Extra message facts the engine tracks but the model never sees directly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageMeta {
    pub tool_name: Option<String>,
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    /// Marked critical at insertion: pinned to the system tier.
    #[serde(default)]
    pub critical: bool,
    /// Ids of the messages a compression summary replaced.
    #[serde(default)]
    pub summarized_from: Vec<String>,
}

/// A stored conversation entry. Identity is stable until the message is
/// replaced by a compression summary carrying `summarized_from`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: MessageContent,
    pub timestamp: DateTime<Utc>,
    /// Estimated size, computed once at construction.
    pub tokens: u32,
    pub priority: u16,
    pub compressible: bool,
    #[serde(default)]
    pub meta: MessageMeta,
}

impl Message {
    fn build(role: Role, content: MessageContent, prio: u16, compressible: bool) -> Self {
        let mut msg = Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content,
            timestamp: Utc::now(),
            tokens: 0,
            priority: prio,
            compressible,
            meta: MessageMeta::default(),
        };
        msg.tokens = crate::context::budget::estimate_message(&msg);
        msg
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::build(
            Role::User,
            MessageContent::Text(text.into()),
            priority::NORMAL,
            true,
        )
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::build(
            Role::Assistant,
            MessageContent::Text(text.into()),
            priority::NORMAL,
            true,
        )
    }

    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self::build(
            Role::Assistant,
            MessageContent::Blocks(blocks),
            priority::NORMAL,
            true,
        )
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::build(
            Role::System,
            MessageContent::Text(text.into()),
            priority::SYSTEM,
            false,
        )
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        tool: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        let call_id = call_id.into();
        let tool = tool.into();
        let mut msg = Self::build(
            Role::Tool,
            MessageContent::Blocks(vec![ContentBlock::ToolResult {
                tool_use_id: call_id.clone(),
                tool_name: tool.clone(),
                content: content.into(),
                is_error,
            }]),
            priority::NORMAL,
            true,
        );
        msg.meta.tool_name = Some(tool);
        msg.meta.tool_call_id = Some(call_id);
        msg.meta.is_error = is_error;
        msg
    }

    pub fn with_priority(mut self, prio: u16) -> Self {
        self.priority = prio;
        self
    }

    pub fn with_compressible(mut self, compressible: bool) -> Self {
        self.compressible = compressible;
        self
    }

    /// Re-estimate after content was rewritten in place.
    pub fn reestimate(&mut self) {
        self.tokens = crate::context::budget::estimate_message(self);
    }
}

// ---------------------------------------------------------------------------
// Provider request / response
// ---------------------------------------------------------------------------

/// Fully-formed request. The provider just sends it.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub system: Option<String>,
    pub tools: Vec<Value>,
    pub messages: Vec<Value>,
    pub stream: bool,
}

/// What came back from the LLM.
#[derive(Debug, Clone)]
pub struct InferenceResponse {
    pub stop_reason: StopReason,
    pub content: Vec<ContentBlock>,
    pub usage: Usage,
}

impl InferenceResponse {
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn tool_calls(&self) -> Vec<&ContentBlock> {
        self.content
            .iter()
            .filter(|b| matches!(b, ContentBlock::ToolUse { .. }))
            .collect()
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
}

/// One chunk of a streamed response. The loop collates these into a single
/// `InferenceResponse`.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub delta: Option<String>,
    pub tool_call: Option<ContentBlock>,
    pub finish_reason: Option<StopReason>,
    pub usage: Option<Usage>,
}

/// Token usage for a single inference call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }

    pub fn accumulate(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

// ---------------------------------------------------------------------------
// Adapter results and state
// ---------------------------------------------------------------------------

/// Outcome of one adapter action. Failures are values, not panics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<ActionError>,
    pub metadata: ActionMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionError {
    pub code: String,
    pub message: String,
    pub recoverable: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionMetadata {
    pub duration_ms: u64,
    #[serde(default)]
    pub retries: u32,
}

impl ActionResult {
    pub fn ok(data: Value, duration_ms: u64) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            metadata: ActionMetadata {
                duration_ms,
                retries: 0,
            },
        }
    }

    pub fn fail(
        code: impl Into<String>,
        message: impl Into<String>,
        recoverable: bool,
        duration_ms: u64,
    ) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ActionError {
                code: code.into(),
                message: message.into(),
                recoverable,
            }),
            metadata: ActionMetadata {
                duration_ms,
                retries: 0,
            },
        }
    }

    /// Flatten for the model: data as pretty JSON, or the error message.
    pub fn output_text(&self) -> String {
        if self.success {
            match &self.data {
                Some(Value::String(s)) => s.clone(),
                Some(v) => serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string()),
                None => String::new(),
            }
        } else {
            self.error
                .as_ref()
                .map(|e| format!("{}: {}", e.code, e.message))
                .unwrap_or_else(|| "unknown error".into())
        }
    }
}

/// A point-in-time view of the adapter's backing domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub summary: String,
    pub version: Option<u64>,
    #[serde(default)]
    pub data: Map<String, Value>,
    pub tokens_used: u32,
}

impl StateSnapshot {
    /// All identifiers visible in the snapshot data. Used for staleness
    /// checks against tool results that reference ids.
    pub fn known_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        collect_ids(&Value::Object(self.data.clone()), &mut ids);
        ids
    }
}

fn collect_ids(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(id)) = map.get("id") {
                out.push(id.clone());
            }
            for v in map.values() {
                collect_ids(v, out);
            }
        }
        Value::Array(items) => {
            for v in items {
                collect_ids(v, out);
            }
        }
        _ => {}
    }
}

/// A bounded derived view of adapter state, sized for a prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Awareness {
    pub summary: String,
    pub available_actions: Vec<String>,
    pub tokens_used: u32,
    pub skeleton: Option<Value>,
    pub relevant: Option<Value>,
}

// ---------------------------------------------------------------------------
// Tool call records
// ---------------------------------------------------------------------------

/// How old a tool result is, in loop iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgeStage {
    Fresh,
    Ageing,
    Stale,
    Archived,
}

impl AgeStage {
    pub fn from_age(iterations: u32) -> Self {
        match iterations {
            0..=4 => AgeStage::Fresh,
            5..=9 => AgeStage::Ageing,
            10..=19 => AgeStage::Stale,
            _ => AgeStage::Archived,
        }
    }
}

/// Bookkeeping for one executed tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool: String,
    pub arguments: Value,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub age: AgeStage,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_constructors_set_roles_and_priorities() {
        let user = Message::user("hi");
        assert_eq!(user.role, Role::User);
        assert_eq!(user.priority, priority::NORMAL);
        assert!(user.compressible);

        let sys = Message::system("rules");
        assert_eq!(sys.role, Role::System);
        assert_eq!(sys.priority, priority::SYSTEM);
        assert!(!sys.compressible);
    }

    #[test]
    fn tool_result_carries_meta() {
        let msg = Message::tool_result("call_1", "read", "contents", false);
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.meta.tool_name.as_deref(), Some("read"));
        assert_eq!(msg.meta.tool_call_id.as_deref(), Some("call_1"));
        assert!(!msg.meta.is_error);
    }

    #[test]
    fn age_stage_boundaries() {
        assert_eq!(AgeStage::from_age(0), AgeStage::Fresh);
        assert_eq!(AgeStage::from_age(4), AgeStage::Fresh);
        assert_eq!(AgeStage::from_age(5), AgeStage::Ageing);
        assert_eq!(AgeStage::from_age(10), AgeStage::Stale);
        assert_eq!(AgeStage::from_age(19), AgeStage::Stale);
        assert_eq!(AgeStage::from_age(20), AgeStage::Archived);
    }

    #[test]
    fn snapshot_collects_nested_ids() {
        let mut data = Map::new();
        data.insert(
            "elements".into(),
            json!([
                {"id": "el-1", "children": [{"id": "el-2"}]},
                {"id": "el-3"}
            ]),
        );
        let snap = StateSnapshot {
            id: "s1".into(),
            timestamp: Utc::now(),
            summary: String::new(),
            version: None,
            data,
            tokens_used: 0,
        };
        let ids = snap.known_ids();
        assert!(ids.contains(&"el-1".to_string()));
        assert!(ids.contains(&"el-2".to_string()));
        assert!(ids.contains(&"el-3".to_string()));
    }

    #[test]
    fn action_result_output_text() {
        let ok = ActionResult::ok(json!("plain"), 5);
        assert_eq!(ok.output_text(), "plain");

        let err = ActionResult::fail("E_TIMEOUT", "took too long", true, 30_000);
        assert_eq!(err.output_text(), "E_TIMEOUT: took too long");
        assert!(err.error.unwrap().recoverable);
    }
}
