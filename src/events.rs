use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::context::hygiene::Severity;
use crate::toad::LoopState;
use crate::types::Usage;

/// One entry on the engine → caller stream. Emitted in occurrence order,
/// single-producer/single-consumer.
#[derive(Debug, Clone)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

impl Event {
    pub fn now(kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// Everything a UI or harness can observe about a running task.
/// The final event for any task is exactly one of Complete | Failed | Cancelled.
#[derive(Debug, Clone)]
pub enum EventKind {
    /// First event of a task: what the session is wired to.
    System {
        tools: Vec<String>,
        model: String,
        session_id: String,
        agents: Vec<String>,
    },
    Iteration {
        n: u32,
    },
    Thinking {
        text: Option<String>,
        delta: Option<String>,
        token_count: Option<u32>,
    },
    ToolCall {
        id: String,
        tool: String,
        input: Value,
    },
    ToolResult {
        id: String,
        tool: String,
        output: String,
        duration_ms: u64,
        success: bool,
    },
    Observation {
        notes: Vec<String>,
    },
    Decision {
        next: LoopState,
        reason: String,
    },
    Context {
        tokens_used: u32,
        compressions: u32,
    },
    LoopDetection {
        tool: String,
        severity: Severity,
        count: u32,
    },
    Error {
        code: String,
        message: String,
        recoverable: bool,
    },
    Complete {
        summary: String,
        usage: Usage,
        turns: u32,
        tool_calls: u32,
        duration_ms: u64,
    },
    Failed {
        reason: FailureReason,
        usage: Usage,
    },
    Cancelled {
        reason: String,
    },
}

impl EventKind {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::Complete { .. } | EventKind::Failed { .. } | EventKind::Cancelled { .. }
        )
    }
}

/// Why a task failed short of completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    IterationCap,
    BudgetExhausted,
    ErrorCap,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::IterationCap => write!(f, "iteration_cap"),
            FailureReason::BudgetExhausted => write!(f, "budget_exhausted"),
            FailureReason::ErrorCap => write!(f, "error_cap"),
        }
    }
}
