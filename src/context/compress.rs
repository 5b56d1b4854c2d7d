use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::budget::estimate_str;
use super::compressors::{
    importance_patterns, CompressionLevel, CompressorOptions, ToolCompressorRegistry,
};
use crate::types::{ContentBlock, Message, MessageContent, Role};

/// How a batch of messages was shrunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Minify,
    Extract,
    Summarize,
    ToolAware,
}

/// Ledger entry for one compression pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionRecord {
    pub strategy: Strategy,
    pub original_tokens: u32,
    pub compressed_tokens: u32,
    pub ratio: f32,
    pub preserved: Vec<String>,
    pub dropped: Vec<String>,
    pub summary: String,
}

/// Pluggable summary generation. Without one, summarization degrades to
/// extraction, never to a silent no-op.
pub type Summarizer = Arc<dyn Fn(&[&Message]) -> String + Send + Sync>;

/// Replacements plus the record describing what happened.
pub struct CompressionOutcome {
    pub replacements: Vec<Message>,
    pub record: CompressionRecord,
}

/// The compression pipeline: three general strategies plus per-tool
/// dispatch.
pub struct Compressor {
    registry: ToolCompressorRegistry,
    summarizer: Option<Summarizer>,
}

impl Compressor {
    pub fn new() -> Self {
        Self {
            registry: ToolCompressorRegistry::with_builtins(),
            summarizer: None,
        }
    }

    pub fn with_summarizer(mut self, summarizer: Summarizer) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn registry_mut(&mut self) -> &mut ToolCompressorRegistry {
        &mut self.registry
    }

    /// Pick a strategy from the keep-ratio the caller needs: gentle ratios
    /// get minification, tight ones a summary. Tool content always routes
    /// through the per-tool compressors.
    pub fn select_strategy(&self, keep_ratio: f32, has_tool_content: bool) -> Strategy {
        if has_tool_content {
            return Strategy::ToolAware;
        }
        if keep_ratio >= 0.7 {
            Strategy::Minify
        } else if keep_ratio >= 0.4 {
            Strategy::Extract
        } else {
            Strategy::Summarize
        }
    }

    /// Compress a batch down toward `target_tokens`. Replacement messages
    /// carry `summarized_from` pointing at the originals.
    pub fn compress(&self, messages: &[&Message], target_tokens: u32) -> CompressionOutcome {
        let original_tokens: u32 = messages.iter().map(|m| m.tokens).sum();
        let keep_ratio = if original_tokens == 0 {
            1.0
        } else {
            target_tokens as f32 / original_tokens as f32
        };
        let has_tool_content = batch_has_tool_content(messages);
        let strategy = self.select_strategy(keep_ratio, has_tool_content);

        let mut outcome = match strategy {
            Strategy::Minify => self.rewrite_each(messages, strategy, |text| minify(text)),
            Strategy::Extract => self.rewrite_each(messages, strategy, |text| extract(text)),
            Strategy::Summarize => self.summarize_batch(messages, target_tokens),
            Strategy::ToolAware => self.tool_aware(messages, target_tokens),
        };

        // Per-message rewrites can't shrink short one-liners; escalate to a
        // batch summary rather than report a no-op.
        if outcome.record.compressed_tokens >= outcome.record.original_tokens
            && matches!(strategy, Strategy::Minify | Strategy::Extract)
        {
            outcome = self.summarize_batch(messages, target_tokens);
        }

        debug!(
            strategy = ?outcome.record.strategy,
            original = outcome.record.original_tokens,
            compressed = outcome.record.compressed_tokens,
            "compression pass"
        );
        outcome
    }

    /// Per-message text rewrite keeping roles and ids traceable.
    fn rewrite_each(
        &self,
        messages: &[&Message],
        strategy: Strategy,
        f: impl Fn(&str) -> String,
    ) -> CompressionOutcome {
        let original_tokens: u32 = messages.iter().map(|m| m.tokens).sum();
        let mut replacements = Vec::with_capacity(messages.len());
        for msg in messages {
            let rewritten = f(&msg.content.as_text());
            let mut replacement = match msg.role {
                Role::Assistant => Message::assistant(rewritten),
                _ => Message::user(rewritten),
            };
            replacement.priority = msg.priority;
            replacement.meta.summarized_from = vec![msg.id.clone()];
            replacements.push(replacement);
        }
        let compressed_tokens: u32 = replacements.iter().map(|m| m.tokens).sum();

        CompressionOutcome {
            record: record(
                strategy,
                original_tokens,
                compressed_tokens,
                vec!["salient lines".into()],
                vec!["boilerplate".into()],
                String::new(),
            ),
            replacements,
        }
    }

    /// Whole-batch summary: one replacement message. Falls back to
    /// extraction when no summarizer is plugged in.
    fn summarize_batch(&self, messages: &[&Message], target_tokens: u32) -> CompressionOutcome {
        let original_tokens: u32 = messages.iter().map(|m| m.tokens).sum();

        let (summary, strategy) = match &self.summarizer {
            Some(summarize) => (summarize(messages), Strategy::Summarize),
            None => {
                let joined = messages
                    .iter()
                    .map(|m| m.content.as_text())
                    .collect::<Vec<_>>()
                    .join("\n");
                (extract(&joined), Strategy::Extract)
            }
        };

        let mut replacement =
            Message::assistant(format!("[Conversation summary]\n{summary}"));
        replacement.meta.summarized_from = messages.iter().map(|m| m.id.clone()).collect();
        let compressed_tokens = replacement.tokens;
        let _ = target_tokens;

        CompressionOutcome {
            record: record(
                strategy,
                original_tokens,
                compressed_tokens,
                vec!["summary".into()],
                vec![format!("{} messages", messages.len())],
                summary,
            ),
            replacements: vec![replacement],
        }
    }

    /// Route tool results through their registered compressors; everything
    /// else gets extraction.
    fn tool_aware(&self, messages: &[&Message], target_tokens: u32) -> CompressionOutcome {
        let original_tokens: u32 = messages.iter().map(|m| m.tokens).sum();
        let per_message_budget = (target_tokens / messages.len().max(1) as u32).max(64);

        let mut replacements = Vec::with_capacity(messages.len());
        let mut preserved = Vec::new();
        let mut dropped = Vec::new();

        for msg in messages {
            if let (Role::Tool, Some(tool)) = (msg.role, msg.meta.tool_name.as_deref()) {
                let opts = CompressorOptions::new(per_message_budget, CompressionLevel::Moderate);
                let out = self.registry.compress(tool, &msg.content.as_text(), &opts);
                preserved.extend(out.preserved);
                dropped.extend(out.dropped);

                let call_id = msg.meta.tool_call_id.clone().unwrap_or_default();
                let mut replacement =
                    Message::tool_result(call_id, tool, out.content, msg.meta.is_error);
                replacement.priority = msg.priority;
                replacement.meta.summarized_from = vec![msg.id.clone()];
                replacements.push(replacement);
            } else {
                let mut replacement = match msg.role {
                    Role::Assistant => Message::assistant(extract(&msg.content.as_text())),
                    _ => Message::user(extract(&msg.content.as_text())),
                };
                replacement.priority = msg.priority;
                replacement.meta.summarized_from = vec![msg.id.clone()];
                replacements.push(replacement);
            }
        }
        let compressed_tokens: u32 = replacements.iter().map(|m| m.tokens).sum();

        CompressionOutcome {
            record: record(
                Strategy::ToolAware,
                original_tokens,
                compressed_tokens,
                preserved,
                dropped,
                String::new(),
            ),
            replacements,
        }
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new()
    }
}

fn record(
    strategy: Strategy,
    original_tokens: u32,
    compressed_tokens: u32,
    preserved: Vec<String>,
    dropped: Vec<String>,
    summary: String,
) -> CompressionRecord {
    CompressionRecord {
        strategy,
        original_tokens,
        compressed_tokens,
        ratio: if original_tokens == 0 {
            1.0
        } else {
            compressed_tokens as f32 / original_tokens as f32
        },
        preserved,
        dropped,
        summary,
    }
}

/// Whitespace normalization: collapse runs of blank lines, strip trailing
/// whitespace and full-line comments. Safe for all text.
pub fn minify(text: &str) -> String {
    let mut out = Vec::new();
    let mut blank_run = 0usize;
    for line in text.lines() {
        let trimmed = line.trim_end();
        let lead = trimmed.trim_start();
        if lead.starts_with("//") || lead.starts_with('#') && !lead.starts_with("#!") {
            continue;
        }
        if trimmed.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push(trimmed);
    }
    out.join("\n")
}

/// Keep lines matching the importance patterns, replacing the gaps with a
/// marker. The head and tail lines always survive for orientation.
pub fn extract(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= 6 {
        return text.to_string();
    }

    let mut out: Vec<String> = Vec::new();
    let mut omitted = 0usize;
    for (idx, line) in lines.iter().enumerate() {
        let keep = idx < 2
            || idx >= lines.len() - 2
            || importance_patterns().iter().any(|p| p.is_match(line));
        if keep {
            if omitted > 0 {
                out.push(format!("[… {omitted} lines omitted …]"));
                omitted = 0;
            }
            out.push(line.to_string());
        } else {
            omitted += 1;
        }
    }
    out.join("\n")
}

/// Did compression actually help, and by roughly how much?
pub fn savings(record: &CompressionRecord) -> u32 {
    record
        .original_tokens
        .saturating_sub(record.compressed_tokens)
}

/// Compression-driving thresholds shared by the context facade.
pub const COMPRESS_AT_UTILIZATION: f32 = 0.70;
pub const EVICT_AT_UTILIZATION: f32 = 0.90;

/// True when any message carries tool-result blocks.
pub fn batch_has_tool_content(messages: &[&Message]) -> bool {
    messages.iter().any(|m| {
        m.role == Role::Tool
            || matches!(
                &m.content,
                MessageContent::Blocks(blocks)
                    if blocks.iter().any(|b| matches!(b, ContentBlock::ToolResult { .. }))
            )
    })
}
