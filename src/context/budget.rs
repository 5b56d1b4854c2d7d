use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{ContentBlock, Message, MessageContent, Role};

/// Flat cost charged per image block.
const IMAGE_TOKENS: u32 = 1_000;

/// Estimate tokens for a plain string. chars/4, rounded up, with an ~8%
/// surcharge when multi-byte sequences are present. Deterministic and
/// monotone in string length; good enough for trend detection.
pub fn estimate_str(s: &str) -> u32 {
    let chars = s.chars().count() as u32;
    let base = chars.div_ceil(4);
    if s.len() as u32 > chars {
        // Multi-byte text tokenizes denser per char.
        (base * 108).div_ceil(100)
    } else {
        base
    }
}

/// Per-message overhead for role framing.
fn role_overhead(role: Role) -> u32 {
    match role {
        Role::System | Role::User | Role::Assistant => 3,
        Role::Tool => 5,
    }
}

/// Estimate a full message: content + role overhead, images at flat cost.
pub fn estimate_message(message: &Message) -> u32 {
    let content = match &message.content {
        MessageContent::Text(t) => estimate_str(t),
        MessageContent::Blocks(blocks) => blocks.iter().map(estimate_block).sum(),
    };
    content + role_overhead(message.role)
}

fn estimate_block(block: &ContentBlock) -> u32 {
    match block {
        ContentBlock::Text { text } => estimate_str(text),
        ContentBlock::Image { .. } => IMAGE_TOKENS,
        ContentBlock::ToolUse { name, input, .. } => {
            estimate_str(name) + estimate_str(&input.to_string())
        }
        ContentBlock::ToolResult {
            content, tool_name, ..
        } => estimate_str(content) + estimate_str(tool_name),
    }
}

/// How full the window is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetLevel {
    Ok,
    Warning,
    Critical,
}

/// Tracks the window cap, named allocations, and reservations.
/// Observational only: thresholds surface as events, nothing is enforced
/// here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBudget {
    max_tokens: u32,
    allocations: HashMap<String, u32>,
    reservations: Vec<Reservation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub purpose: String,
    pub tokens: u32,
}

impl TokenBudget {
    pub fn new(max_tokens: u32) -> Self {
        Self {
            max_tokens,
            allocations: HashMap::new(),
            reservations: Vec::new(),
        }
    }

    pub fn set_max(&mut self, max_tokens: u32) {
        self.max_tokens = max_tokens;
    }

    pub fn max(&self) -> u32 {
        self.max_tokens
    }

    /// Hold tokens aside for a purpose ("response", "tools", …).
    /// A second reserve for the same purpose replaces the first.
    pub fn reserve(&mut self, purpose: impl Into<String>, tokens: u32) {
        let purpose = purpose.into();
        self.reservations.retain(|r| r.purpose != purpose);
        self.reservations.push(Reservation { purpose, tokens });
    }

    /// Drop a reservation. Returns the released count, if it existed.
    pub fn release(&mut self, purpose: &str) -> Option<u32> {
        let idx = self.reservations.iter().position(|r| r.purpose == purpose)?;
        Some(self.reservations.remove(idx).tokens)
    }

    pub fn allocate(&mut self, bucket: impl Into<String>, tokens: u32) {
        *self.allocations.entry(bucket.into()).or_insert(0) += tokens;
    }

    pub fn deallocate(&mut self, bucket: &str, tokens: u32) {
        if let Some(used) = self.allocations.get_mut(bucket) {
            *used = used.saturating_sub(tokens);
        }
    }

    pub fn set_allocation(&mut self, bucket: impl Into<String>, tokens: u32) {
        self.allocations.insert(bucket.into(), tokens);
    }

    pub fn allocation(&self, bucket: &str) -> u32 {
        self.allocations.get(bucket).copied().unwrap_or(0)
    }

    /// Sum of all named allocations.
    pub fn used(&self) -> u32 {
        self.allocations.values().sum()
    }

    pub fn reserved(&self) -> u32 {
        self.reservations.iter().map(|r| r.tokens).sum()
    }

    /// Tokens still available after allocations and reservations.
    pub fn remaining(&self) -> u32 {
        self.max_tokens
            .saturating_sub(self.used())
            .saturating_sub(self.reserved())
    }

    /// used / max, ignoring reservations.
    pub fn utilization(&self) -> f32 {
        if self.max_tokens == 0 {
            return 1.0;
        }
        self.used() as f32 / self.max_tokens as f32
    }

    pub fn level(&self) -> BudgetLevel {
        let u = self.utilization();
        if u > 0.9 {
            BudgetLevel::Critical
        } else if u > 0.7 {
            BudgetLevel::Warning
        } else {
            BudgetLevel::Ok
        }
    }
}
