use std::time::Duration;

/// Model selection: a capability alias or an explicit model id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelChoice {
    Fast,
    Balanced,
    Powerful,
    Explicit(String),
}

impl ModelChoice {
    /// Resolve an alias to a concrete model id. Explicit ids pass through.
    pub fn resolve(&self) -> &str {
        match self {
            ModelChoice::Fast => "claude-3-5-haiku-20241022",
            ModelChoice::Balanced => "claude-sonnet-4-20250514",
            ModelChoice::Powerful => "claude-opus-4-20250514",
            ModelChoice::Explicit(id) => id,
        }
    }
}

impl Default for ModelChoice {
    fn default() -> Self {
        ModelChoice::Balanced
    }
}

/// Session configuration. Adapter, provider, and hooks are wired at
/// construction; this holds the knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub model: ModelChoice,
    /// Max output tokens per inference call.
    pub max_tokens: u32,
    pub max_iterations: u32,
    pub token_budget: u32,
    /// Consecutive hard errors before the loop gives up.
    pub max_errors: u32,
    pub max_retries: u32,
    /// Checkpoint cadence in iterations, when a store is configured.
    pub checkpoint_interval: u32,
    pub enable_parallel_delegation: bool,
    pub max_history_entries: usize,
    /// Concurrency bound for independent tool calls in one Act phase.
    /// Only consulted when the provider advertises parallel capability.
    pub parallel_tool_limit: usize,
    /// Per-tool-call timeout. None = unbounded.
    pub tool_timeout: Option<Duration>,
    pub system_prompt: Option<String>,
    pub verbose: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: ModelChoice::default(),
            max_tokens: 4096,
            max_iterations: 20,
            token_budget: 200_000,
            max_errors: 3,
            max_retries: 3,
            checkpoint_interval: 5,
            enable_parallel_delegation: true,
            max_history_entries: 50,
            parallel_tool_limit: 4,
            tool_timeout: None,
            system_prompt: None,
            verbose: false,
        }
    }
}
