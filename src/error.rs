/// Top-level engine error. Anything that stops a task dead.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),
    #[error("tool error: {0}")]
    Tool(#[from] ToolError),
    #[error("task cancelled")]
    Cancelled,
    #[error("session error: {0}")]
    Session(String),
    #[error("context error: {0}")]
    Context(String),
}

/// LLM call failures. Non-recoverable above the provider boundary.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("API returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("failed to parse response: {0}")]
    Parse(String),
}

/// Adapter-side failures that cannot be expressed as a tool result.
/// Execution failures travel as `ActionResult` values instead.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("adapter not connected")]
    NotConnected,
}

/// Tool dispatch failures surfaced before the adapter is ever reached.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    Unknown(String),
    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },
    #[error("hook {hook} aborted {tool}: {reason}")]
    HookAborted {
        hook: String,
        tool: String,
        reason: String,
    },
}

impl ToolError {
    /// Schema violations are protocol errors the model cannot retry its way
    /// out of; hook aborts are recoverable by changing course.
    pub fn recoverable(&self) -> bool {
        matches!(self, ToolError::HookAborted { .. })
    }
}

/// Alias resolution failures. Collected per-alias; a failed alias becomes
/// an inline `[Error: …]` marker rather than failing the whole rewrite.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AliasError {
    #[error("unknown alias: @{0}")]
    Unknown(String),
    #[error("@{name} requires {required} argument(s), got {given}")]
    Arity {
        name: String,
        required: usize,
        given: usize,
    },
    #[error("@{name} argument '{arg}' does not match expected pattern")]
    ArgPattern { name: String, arg: String },
    #[error("@{name} skipped: token budget exhausted")]
    Budget { name: String },
    #[error("@{name} timed out after {ms}ms")]
    Timeout { name: String, ms: u64 },
    #[error("@{name} failed: {reason}")]
    Resolution { name: String, reason: String },
}
