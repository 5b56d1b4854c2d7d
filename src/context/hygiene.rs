use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use crate::types::{AgeStage, StateSnapshot};

/// How bad a detected error loop is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Critical,
}

/// A repeated-error loop: the model keeps hitting the same wall.
#[derive(Debug, Clone)]
pub struct LoopDetection {
    pub tool: String,
    pub error: String,
    pub count: u32,
    pub severity: Severity,
}

/// Why a correction is being injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectionKind {
    InvalidId,
    StaleState,
    RepeatedError,
    Contradiction,
}

impl CorrectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CorrectionKind::InvalidId => "invalid_id",
            CorrectionKind::StaleState => "stale_state",
            CorrectionKind::RepeatedError => "repeated_error",
            CorrectionKind::Contradiction => "contradiction",
        }
    }
}

/// A pending system-message correction. Queued by detection, consumed when
/// formatted into the next request.
#[derive(Debug, Clone)]
pub struct Correction {
    pub kind: CorrectionKind,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct HygieneConfig {
    /// Identical (tool, error) pairs within the window before a loop fires.
    pub loop_threshold: u32,
    pub error_window: Duration,
    /// Cap on the formatted correction block, in characters.
    pub max_correction_chars: usize,
}

impl Default for HygieneConfig {
    fn default() -> Self {
        Self {
            loop_threshold: 2,
            error_window: Duration::from_secs(60),
            max_correction_chars: 1_600,
        }
    }
}

#[derive(Clone)]
struct ErrorEvent {
    tool: String,
    error: String,
    at: Instant,
}

/// Defenses against context rot: tool-result ageing, stale-id detection,
/// and echo-poisoning (error loop) tracking.
#[derive(Clone)]
pub struct Hygiene {
    config: HygieneConfig,
    /// message id → iterations since the result was recorded.
    ages: HashMap<String, u32>,
    errors: VecDeque<ErrorEvent>,
    corrections: Vec<Correction>,
}

impl Hygiene {
    pub fn new(config: HygieneConfig) -> Self {
        Self {
            config,
            ages: HashMap::new(),
            errors: VecDeque::new(),
            corrections: Vec::new(),
        }
    }

    /// Start tracking a freshly recorded tool result.
    pub fn track(&mut self, message_id: impl Into<String>) {
        self.ages.insert(message_id.into(), 0);
    }

    pub fn forget(&mut self, message_id: &str) {
        self.ages.remove(message_id);
    }

    /// One loop iteration passed: everything gets older.
    pub fn age_all(&mut self) {
        for age in self.ages.values_mut() {
            *age += 1;
        }
    }

    pub fn stage_of(&self, message_id: &str) -> Option<AgeStage> {
        self.ages.get(message_id).map(|&a| AgeStage::from_age(a))
    }

    /// Results old enough for aggressive compression.
    pub fn ageing_ids(&self) -> Vec<String> {
        self.ages
            .iter()
            .filter(|(_, &a)| AgeStage::from_age(a) != AgeStage::Fresh)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Results old enough to drop entirely, unless a live correction still
    /// references them.
    pub fn droppable_ids(&self) -> Vec<String> {
        self.ages
            .iter()
            .filter(|(_, &a)| AgeStage::from_age(a) == AgeStage::Archived)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Flag identifiers a tool result mentions that the latest snapshot no
    /// longer contains. Queues a stale-state correction describing the delta.
    pub fn check_staleness(
        &mut self,
        referenced_ids: &[String],
        snapshot: &StateSnapshot,
    ) -> Vec<String> {
        let known = snapshot.known_ids();
        let missing: Vec<String> = referenced_ids
            .iter()
            .filter(|id| !known.contains(id))
            .cloned()
            .collect();

        if !missing.is_empty() {
            warn!(missing = missing.len(), "stale identifiers detected");
            let current_preview: Vec<&str> =
                known.iter().take(8).map(|s| s.as_str()).collect();
            self.queue(
                CorrectionKind::StaleState,
                format!(
                    "These identifiers no longer exist: {}. Current state contains: {}. \
                     Re-read state before acting on old identifiers.",
                    missing.join(", "),
                    if current_preview.is_empty() {
                        "(nothing)".to_string()
                    } else {
                        current_preview.join(", ")
                    }
                ),
            );
        }
        missing
    }

    /// Record a tool error and check the rolling window for a loop.
    pub fn record_error(&mut self, tool: &str, error: &str) -> Option<LoopDetection> {
        let now = Instant::now();
        self.errors.push_back(ErrorEvent {
            tool: tool.to_string(),
            error: error.to_string(),
            at: now,
        });

        // Expire events outside the window.
        while let Some(front) = self.errors.front() {
            if now.duration_since(front.at) > self.config.error_window {
                self.errors.pop_front();
            } else {
                break;
            }
        }

        let count = self
            .errors
            .iter()
            .filter(|e| e.tool == tool && e.error == error)
            .count() as u32;

        if count < self.config.loop_threshold {
            return None;
        }

        let severity = if count >= self.config.loop_threshold + 1 {
            Severity::Critical
        } else {
            Severity::Warning
        };

        if severity == Severity::Critical {
            self.queue(
                CorrectionKind::RepeatedError,
                format!(
                    "The tool '{tool}' has failed {count} times with the same error: \
                     \"{error}\". Stop repeating this call; change the arguments or the \
                     approach."
                ),
            );
        }

        Some(LoopDetection {
            tool: tool.to_string(),
            error: error.to_string(),
            count,
            severity,
        })
    }

    pub fn queue(&mut self, kind: CorrectionKind, text: String) {
        self.corrections.push(Correction { kind, text });
    }

    pub fn has_corrections(&self) -> bool {
        !self.corrections.is_empty()
    }

    /// Format queued corrections into one bounded block and clear the queue.
    pub fn format_corrections(&mut self) -> Option<String> {
        if self.corrections.is_empty() {
            return None;
        }
        let mut block = String::from("Context corrections:\n");
        for c in self.corrections.drain(..) {
            block.push_str(&format!("- [{}] {}\n", c.kind.as_str(), c.text));
        }
        if block.chars().count() > self.config.max_correction_chars {
            block = block
                .chars()
                .take(self.config.max_correction_chars)
                .collect();
            block.push('…');
        }
        Some(block)
    }
}

impl Default for Hygiene {
    fn default() -> Self {
        Self::new(HygieneConfig::default())
    }
}
