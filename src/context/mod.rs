pub mod budget;
pub mod compress;
pub mod compressors;
pub mod hygiene;
pub mod tiers;

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::EngineError;
use crate::types::{priority, ContentBlock, Message, MessageContent, MessageMeta, Role, StateSnapshot};
use budget::{BudgetLevel, TokenBudget};
use compress::{CompressionRecord, Compressor, Summarizer, COMPRESS_AT_UTILIZATION, EVICT_AT_UTILIZATION};
use hygiene::{Hygiene, HygieneConfig, LoopDetection};
use tiers::{MemoryStats, Tier, TieredMemory};

/// Schema version for persisted context state. Bump on breaking changes.
const SNAPSHOT_VERSION: u64 = 1;

/// Context window configuration.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub max_tokens: u32,
    /// Held back for the model's response.
    pub response_reserve: u32,
    /// Held back for tool schemas.
    pub tool_reserve: u32,
    pub enable_caching: bool,
    pub compression_threshold: f32,
    pub eviction_threshold: f32,
    /// User turns kept in the recent tier.
    pub recent_window: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: 200_000,
            response_reserve: 4_096,
            tool_reserve: 2_000,
            enable_caching: false,
            compression_threshold: COMPRESS_AT_UTILIZATION,
            eviction_threshold: EVICT_AT_UTILIZATION,
            recent_window: 10,
        }
    }
}

impl ContextConfig {
    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = max;
        self
    }
}

/// Observable context happenings, drained by the loop and forwarded as
/// engine events.
#[derive(Debug, Clone)]
pub enum ContextEvent {
    MessageAdded { id: String, tier: Tier },
    MessageEvicted { id: String, tier: Tier },
    CompressionStarted { tier: Tier },
    CompressionCompleted { record: CompressionRecord },
    BudgetWarning { utilization: f32 },
    BudgetCritical { utilization: f32 },
}

/// Per-add overrides.
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    pub tier: Option<Tier>,
    pub priority: Option<u16>,
    pub metadata: Option<MessageMeta>,
    pub skip_compression: bool,
}

/// Knobs for request assembly.
#[derive(Debug, Clone)]
pub struct PrepareOptions {
    pub include_system: bool,
    pub max_messages: Option<usize>,
    pub additional_reserve: u32,
    pub force_compression: bool,
}

impl Default for PrepareOptions {
    fn default() -> Self {
        Self {
            include_system: true,
            max_messages: None,
            additional_reserve: 0,
            force_compression: false,
        }
    }
}

/// What `prepare_for_request` hands the loop.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    /// Wire-form messages, system prefix first.
    pub messages: Vec<Value>,
    pub total_tokens: u32,
    pub response_tokens_available: u32,
    pub was_compressed: bool,
    /// Indices after which a prompt-cache prefix may end.
    pub cache_breakpoints: Vec<usize>,
}

/// Aggregate counters.
#[derive(Debug, Clone)]
pub struct ContextStats {
    pub memory: MemoryStats,
    pub compressions: usize,
    pub evictions: usize,
    pub utilization: f32,
}

/// Facade over the tiered memory, token budget, compression pipeline, and
/// hygiene defenses. The one place all context decisions happen.
pub struct ContextManager {
    config: ContextConfig,
    memory: TieredMemory,
    budget: TokenBudget,
    compressor: Arc<Compressor>,
    hygiene: Hygiene,
    compressions: Vec<CompressionRecord>,
    evictions: usize,
    events: VecDeque<ContextEvent>,
    last_level: BudgetLevel,
}

impl ContextManager {
    pub fn new(config: ContextConfig) -> Self {
        let mut budget = TokenBudget::new(config.max_tokens);
        budget.reserve("response", config.response_reserve);
        budget.reserve("tools", config.tool_reserve);
        let memory =
            TieredMemory::new(config.max_tokens).with_recent_window(config.recent_window);
        Self {
            config,
            memory,
            budget,
            compressor: Arc::new(Compressor::new()),
            hygiene: Hygiene::new(HygieneConfig::default()),
            compressions: Vec::new(),
            evictions: 0,
            events: VecDeque::new(),
            last_level: BudgetLevel::Ok,
        }
    }

    pub fn with_summarizer(mut self, summarizer: Summarizer) -> Self {
        self.compressor = Arc::new(Compressor::new().with_summarizer(summarizer));
        self
    }

    // -- insertion ----------------------------------------------------------

    pub fn add(&mut self, mut message: Message, opts: AddOptions) -> String {
        if let Some(prio) = opts.priority {
            message.priority = prio;
        }
        if let Some(meta) = opts.metadata {
            message.meta = meta;
        }
        let id = message.id.clone();
        let is_tool = message.role == Role::Tool;

        // Keep the window rolling: demote the oldest recent turns so a new
        // user turn still lands in `recent`.
        if message.role == Role::User && opts.tier.is_none() {
            while self.memory.user_turns_in_recent() >= self.config.recent_window
                && !self.memory.demote(1).is_empty()
            {}
        }

        let tier = self.memory.add(message, opts.tier);
        if is_tool {
            self.hygiene.track(id.clone());
        }

        self.events.push_back(ContextEvent::MessageAdded {
            id: id.clone(),
            tier,
        });
        self.sync_budget();

        if !opts.skip_compression && self.utilization() > self.config.compression_threshold {
            self.maintain(false);
        }
        id
    }

    pub fn add_user(&mut self, text: impl Into<String>) -> String {
        self.add(Message::user(text), AddOptions::default())
    }

    pub fn add_assistant(&mut self, text: impl Into<String>) -> String {
        self.add(Message::assistant(text), AddOptions::default())
    }

    pub fn add_assistant_blocks(&mut self, blocks: Vec<ContentBlock>) -> String {
        self.add(Message::assistant_blocks(blocks), AddOptions::default())
    }

    pub fn add_system(&mut self, text: impl Into<String>) -> String {
        self.add(Message::system(text), AddOptions::default())
    }

    pub fn add_tool_result(
        &mut self,
        call_id: impl Into<String>,
        tool: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> String {
        self.add(
            Message::tool_result(call_id, tool, content, is_error),
            AddOptions::default(),
        )
    }

    // -- hygiene ------------------------------------------------------------

    /// Advance tool-result ages by one loop iteration and drop archived
    /// results that nothing references anymore.
    pub fn age_results(&mut self) {
        self.hygiene.age_all();
        if self.hygiene.has_corrections() {
            // Live corrections may cite old results; keep them this round.
            return;
        }
        for id in self.hygiene.droppable_ids() {
            if let Some(tier) = self.memory.tier_of(&id) {
                if self.memory.remove(&id).is_some() {
                    self.evictions += 1;
                    self.events
                        .push_back(ContextEvent::MessageEvicted { id: id.clone(), tier });
                }
            }
            self.hygiene.forget(&id);
        }
        self.sync_budget();
    }

    /// Compare identifiers mentioned by stored tool results against the
    /// latest adapter snapshot; stale references queue a correction.
    pub fn observe_snapshot(&mut self, snapshot: &StateSnapshot) {
        let mut referenced = Vec::new();
        for msg in self.memory.get(Tier::Tools) {
            if let MessageContent::Blocks(blocks) = &msg.content {
                for block in blocks {
                    if let ContentBlock::ToolResult { content, .. } = block {
                        if let Ok(value) = serde_json::from_str::<Value>(content) {
                            collect_id_strings(&value, &mut referenced);
                        }
                    }
                }
            }
        }
        referenced.sort();
        referenced.dedup();
        if !referenced.is_empty() {
            self.hygiene.check_staleness(&referenced, snapshot);
        }
    }

    pub fn record_tool_error(&mut self, tool: &str, error: &str) -> Option<LoopDetection> {
        self.hygiene.record_error(tool, error)
    }

    pub fn queue_correction(&mut self, kind: hygiene::CorrectionKind, text: String) {
        self.hygiene.queue(kind, text);
    }

    // -- request assembly ---------------------------------------------------

    pub fn prepare_for_request(&mut self, opts: PrepareOptions) -> PreparedRequest {
        let was_compressed = if opts.force_compression
            || self.utilization() > self.config.compression_threshold
        {
            self.maintain(opts.force_compression)
        } else {
            false
        };

        // Corrections ride along as one bounded system message, consumed here.
        let correction = self.hygiene.format_corrections();

        let mut ordered: Vec<&Message> = self.memory.get_all();
        if !opts.include_system {
            ordered.retain(|m| m.role != Role::System);
        }
        if let Some(cap) = opts.max_messages {
            if ordered.len() > cap {
                // Never drop the system prefix; trim the oldest of the rest.
                let system: Vec<&Message> =
                    ordered.iter().filter(|m| m.role == Role::System).copied().collect();
                let mut rest: Vec<&Message> =
                    ordered.into_iter().filter(|m| m.role != Role::System).collect();
                let keep = cap.saturating_sub(system.len());
                if rest.len() > keep {
                    rest.drain(..rest.len() - keep);
                }
                ordered = system;
                ordered.extend(rest);
            }
        }

        let mut messages: Vec<Value> = Vec::with_capacity(ordered.len() + 1);
        let mut system_prefix_end = 0usize;
        for msg in &ordered {
            if msg.role == Role::System && system_prefix_end == messages.len() {
                messages.push(to_wire(msg));
                system_prefix_end = messages.len();
            } else {
                messages.push(to_wire(msg));
            }
        }
        if let Some(text) = correction {
            messages.insert(
                system_prefix_end,
                json!({"role": "system", "content": text}),
            );
            system_prefix_end += 1;
        }

        let mut cache_breakpoints = Vec::new();
        if self.config.enable_caching {
            if system_prefix_end > 0 {
                cache_breakpoints.push(system_prefix_end);
            }
            // A contiguous run of tool-result entries right after the system
            // prefix is a stable tool block worth caching when long enough.
            let tool_block_len = ordered
                .iter()
                .skip_while(|m| m.role == Role::System)
                .take_while(|m| m.role == Role::Tool)
                .count();
            if tool_block_len >= 3 {
                cache_breakpoints.push(system_prefix_end + tool_block_len);
            }
        }

        let total_tokens = self.memory.total_tokens();
        let response_tokens_available = self
            .budget
            .max()
            .saturating_sub(self.budget.used())
            .saturating_sub(self.budget.reserved())
            .saturating_sub(opts.additional_reserve);

        PreparedRequest {
            messages,
            total_tokens,
            response_tokens_available,
            was_compressed,
            cache_breakpoints,
        }
    }

    /// Summarize the recent tier down to `ratio` of its current size.
    /// No-ops when recent is already comfortably under the compression
    /// threshold, which makes back-to-back compaction idempotent.
    pub fn compact(&mut self, ratio: f32) {
        let recent_tokens = self.memory.tier_tokens(Tier::Recent);
        let recent_cap = self.memory.config(Tier::Recent).max_tokens;
        if recent_tokens == 0
            || (recent_tokens as f32) <= recent_cap as f32 * self.config.compression_threshold
        {
            return;
        }

        let target = (recent_tokens as f32 * ratio.clamp(0.05, 1.0)) as u32;
        self.compress_tier(Tier::Recent, target);
        self.sync_budget();
    }

    // -- maintenance --------------------------------------------------------

    /// One compression/eviction cycle. Returns true if anything changed.
    fn maintain(&mut self, force: bool) -> bool {
        let mut acted = false;

        // Compress over-cap compressible tiers, ephemeral-adjacent first.
        for tier in [
            Tier::Ephemeral,
            Tier::Tools,
            Tier::Resources,
            Tier::Archived,
            Tier::Recent,
        ] {
            let cap = self.memory.config(tier).max_tokens;
            let used = self.memory.tier_tokens(tier);
            let over = used > cap || (force && used > 0);
            if over && self.memory.config(tier).compressible {
                let ratio = self.memory.config(tier).target_ratio.unwrap_or(0.5);
                let target = (cap as f32 * ratio) as u32;
                acted |= self.compress_tier(tier, target);
            }
        }
        self.sync_budget();

        // If compression alone didn't help enough, evict. Ephemeral goes
        // strictly first.
        if self.utilization() > self.config.eviction_threshold {
            for tier in [
                Tier::Ephemeral,
                Tier::Archived,
                Tier::Tools,
                Tier::Resources,
                Tier::Recent,
            ] {
                let cap = self.memory.config(tier).max_tokens;
                let target = (cap as f32 * 0.5) as u32;
                let evicted = self.memory.evict(tier, target);
                for msg in &evicted {
                    self.hygiene.forget(&msg.id);
                    self.events.push_back(ContextEvent::MessageEvicted {
                        id: msg.id.clone(),
                        tier,
                    });
                }
                if !evicted.is_empty() {
                    self.evictions += evicted.len();
                    acted = true;
                }
                self.sync_budget();
                if self.utilization() <= self.config.eviction_threshold {
                    break;
                }
            }
        }

        if acted {
            info!(
                utilization = self.utilization(),
                compressions = self.compressions.len(),
                evictions = self.evictions,
                "context maintenance cycle"
            );
        }
        acted
    }

    /// Compress every compressible message of a tier toward `target` tokens.
    fn compress_tier(&mut self, tier: Tier, target: u32) -> bool {
        let candidates: Vec<(String, bool)> = self
            .memory
            .get(tier)
            .iter()
            .map(|m| (m.id.clone(), m.compressible && m.priority < priority::CRITICAL))
            .collect();
        let old_ids: Vec<String> = candidates
            .iter()
            .filter(|(_, ok)| *ok)
            .map(|(id, _)| id.clone())
            .collect();
        if old_ids.len() < 2 && self.memory.tier_tokens(tier) <= target {
            return false;
        }
        if old_ids.is_empty() {
            return false;
        }

        self.events
            .push_back(ContextEvent::CompressionStarted { tier });

        let compressor = Arc::clone(&self.compressor);
        let refs: Vec<&Message> = old_ids
            .iter()
            .filter_map(|id| self.memory.get_message(id))
            .collect();
        let outcome = compressor.compress(&refs, target);

        // Only swap if it actually shrinks things.
        if outcome.record.compressed_tokens >= outcome.record.original_tokens {
            return false;
        }

        // Tool results that were replaced keep their hygiene tracking under
        // the new ids.
        let replaced_tool_ids: Vec<String> = outcome
            .replacements
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.id.clone())
            .collect();
        for id in &old_ids {
            self.hygiene.forget(id);
        }
        for id in replaced_tool_ids {
            self.hygiene.track(id);
        }

        self.memory.replace(tier, &old_ids, outcome.replacements);
        self.events.push_back(ContextEvent::CompressionCompleted {
            record: outcome.record.clone(),
        });
        self.compressions.push(outcome.record);
        true
    }

    fn sync_budget(&mut self) {
        self.budget
            .set_allocation("history", self.memory.total_tokens());
        let level = self.budget.level();
        if level != self.last_level {
            match level {
                BudgetLevel::Warning => self.events.push_back(ContextEvent::BudgetWarning {
                    utilization: self.utilization(),
                }),
                BudgetLevel::Critical => self.events.push_back(ContextEvent::BudgetCritical {
                    utilization: self.utilization(),
                }),
                BudgetLevel::Ok => {}
            }
            self.last_level = level;
        }
    }

    // -- observation --------------------------------------------------------

    pub fn utilization(&self) -> f32 {
        if self.config.max_tokens == 0 {
            return 1.0;
        }
        self.memory.total_tokens() as f32 / self.config.max_tokens as f32
    }

    pub fn total_tokens(&self) -> u32 {
        self.memory.total_tokens()
    }

    pub fn budget(&self) -> &TokenBudget {
        &self.budget
    }

    pub fn stats(&self) -> ContextStats {
        ContextStats {
            memory: self.memory.stats(),
            compressions: self.compressions.len(),
            evictions: self.evictions,
            utilization: self.utilization(),
        }
    }

    pub fn compressions(&self) -> &[CompressionRecord] {
        &self.compressions
    }

    pub fn message_ids(&self) -> Vec<String> {
        self.memory.get_all().iter().map(|m| m.id.clone()).collect()
    }

    pub fn message_count(&self) -> usize {
        self.memory.len()
    }

    pub fn drain_events(&mut self) -> Vec<ContextEvent> {
        self.events.drain(..).collect()
    }

    // -- persistence --------------------------------------------------------

    /// Serialize for the session store.
    pub fn to_snapshot(&self) -> Value {
        let mut tiers = serde_json::Map::new();
        for tier in Tier::ORDERED {
            let msgs: Vec<&Message> = self.memory.get(tier);
            tiers.insert(
                tier.as_str().to_string(),
                serde_json::to_value(msgs).unwrap_or_else(|_| json!([])),
            );
        }
        json!({
            "version": SNAPSHOT_VERSION,
            "config": {
                "maxTokens": self.config.max_tokens,
                "responseReserve": self.config.response_reserve,
                "toolReserve": self.config.tool_reserve,
                "enableCaching": self.config.enable_caching,
                "compressionThreshold": self.config.compression_threshold,
                "evictionThreshold": self.config.eviction_threshold,
            },
            "tiers": Value::Object(tiers),
            "budget": serde_json::to_value(&self.budget).unwrap_or(Value::Null),
            "compressions": serde_json::to_value(&self.compressions).unwrap_or(json!([])),
        })
    }

    /// Restore from a serialized snapshot. Future schema versions are
    /// rejected rather than guessed at.
    pub fn restore(&mut self, snapshot: &Value) -> Result<(), EngineError> {
        let version = snapshot["version"].as_u64().unwrap_or(0);
        if version > SNAPSHOT_VERSION {
            return Err(EngineError::Context(format!(
                "snapshot version {version} is newer than supported {SNAPSHOT_VERSION}"
            )));
        }

        let config = &snapshot["config"];
        self.config.max_tokens = config["maxTokens"].as_u64().unwrap_or(200_000) as u32;
        self.config.response_reserve =
            config["responseReserve"].as_u64().unwrap_or(4_096) as u32;
        self.config.tool_reserve = config["toolReserve"].as_u64().unwrap_or(2_000) as u32;
        self.config.enable_caching = config["enableCaching"].as_bool().unwrap_or(false);

        self.memory = TieredMemory::new(self.config.max_tokens)
            .with_recent_window(self.config.recent_window);
        let tiers = snapshot["tiers"]
            .as_object()
            .ok_or_else(|| EngineError::Context("missing tiers in snapshot".into()))?;
        for tier in Tier::ORDERED {
            let Some(list) = tiers.get(tier.as_str()).and_then(Value::as_array) else {
                continue;
            };
            for raw in list {
                let msg: Message = serde_json::from_value(raw.clone())
                    .map_err(|e| EngineError::Context(format!("bad message: {e}")))?;
                self.memory.add(msg, Some(tier));
            }
        }

        if let Ok(budget) = serde_json::from_value::<TokenBudget>(snapshot["budget"].clone()) {
            self.budget = budget;
        }
        if let Ok(records) =
            serde_json::from_value::<Vec<CompressionRecord>>(snapshot["compressions"].clone())
        {
            self.compressions = records;
        }
        self.sync_budget();
        debug!(messages = self.memory.len(), "context restored from snapshot");
        Ok(())
    }
}

impl Clone for ContextManager {
    /// Deep, independent copy. The compressor is stateless and shared.
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            memory: self.memory.clone(),
            budget: self.budget.clone(),
            compressor: Arc::clone(&self.compressor),
            hygiene: self.hygiene.clone(),
            compressions: self.compressions.clone(),
            evictions: self.evictions,
            events: VecDeque::new(),
            last_level: self.last_level,
        }
    }
}

/// Wire form for a stored message, Anthropic-flavored like the rest of the
/// engine's internal shapes.
fn to_wire(msg: &Message) -> Value {
    match (&msg.role, &msg.content) {
        (Role::System, content) => json!({"role": "system", "content": content.as_text()}),
        (Role::Tool, MessageContent::Blocks(blocks)) => json!({
            "role": "user",
            "content": blocks,
        }),
        (Role::Tool, MessageContent::Text(t)) => json!({"role": "user", "content": t}),
        (role, MessageContent::Text(t)) => json!({
            "role": if *role == Role::Assistant { "assistant" } else { "user" },
            "content": t,
        }),
        (role, MessageContent::Blocks(blocks)) => json!({
            "role": if *role == Role::Assistant { "assistant" } else { "user" },
            "content": blocks,
        }),
    }
}

fn collect_id_strings(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                if k == "id" || k.ends_with("Id") || k.ends_with("_id") {
                    if let Value::String(s) = v {
                        out.push(s.clone());
                    }
                }
                collect_id_strings(v, out);
            }
        }
        Value::Array(items) => {
            for v in items {
                collect_id_strings(v, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn small_manager(max: u32) -> ContextManager {
        ContextManager::new(ContextConfig {
            max_tokens: max,
            response_reserve: 0,
            tool_reserve: 0,
            ..Default::default()
        })
    }

    #[test]
    fn token_conservation_across_operations() {
        let mut ctx = small_manager(50_000);
        ctx.add_system("be helpful");
        for i in 0..20 {
            ctx.add_user(format!("question {i} with some body text"));
            ctx.add_assistant(format!("answer {i} with some body text"));
        }
        ctx.add_tool_result("c1", "read", "file contents", false);

        let stats = ctx.stats();
        let tier_sum: u32 = stats.memory.tiers.values().map(|t| t.tokens).sum();
        assert_eq!(stats.memory.total_tokens, tier_sum);
        assert_eq!(stats.memory.total_tokens, ctx.total_tokens());
    }

    #[test]
    fn overflow_triggers_compression_and_stays_under_cap() {
        let mut ctx = small_manager(2_000);
        for i in 0..60 {
            ctx.add_assistant(format!(
                "assistant message {i}: {}",
                "padding text ".repeat(10)
            ));
        }
        let prepared = ctx.prepare_for_request(PrepareOptions::default());
        assert!(prepared.total_tokens <= 2_000, "still over: {}", prepared.total_tokens);
        assert!(ctx.stats().compressions + ctx.stats().evictions > 0);
    }

    #[test]
    fn system_messages_survive_pressure() {
        let mut ctx = small_manager(1_500);
        ctx.add_system("the system prompt");
        for i in 0..50 {
            ctx.add_user(format!("filler {i} {}", "x".repeat(50)));
        }
        ctx.prepare_for_request(PrepareOptions::default());

        let stats = ctx.stats();
        assert_eq!(stats.memory.tiers["system"].messages, 1);
    }

    #[test]
    fn compact_is_idempotent_at_equilibrium() {
        let mut ctx = small_manager(1_000);
        for i in 0..10 {
            ctx.add(
                Message::user(format!("turn {i} {}", "words ".repeat(20))),
                AddOptions {
                    skip_compression: true,
                    ..Default::default()
                },
            );
        }
        ctx.compact(0.5);
        let after_first = ctx.compressions().len();
        assert!(after_first > 0, "first compact should act");

        ctx.compact(0.5);
        assert_eq!(
            ctx.compressions().len(),
            after_first,
            "second compact should be a no-op"
        );
    }

    #[test]
    fn prepare_orders_system_first() {
        let mut ctx = small_manager(50_000);
        ctx.add_user("hello");
        ctx.add_system("rules");
        let prepared = ctx.prepare_for_request(PrepareOptions::default());
        assert_eq!(prepared.messages[0]["role"], "system");
    }

    #[test]
    fn cache_breakpoints_cover_system_prefix() {
        let mut ctx = ContextManager::new(ContextConfig {
            max_tokens: 50_000,
            enable_caching: true,
            ..Default::default()
        });
        ctx.add_system("rules one");
        ctx.add_system("rules two");
        ctx.add_user("go");
        let prepared = ctx.prepare_for_request(PrepareOptions::default());
        assert_eq!(prepared.cache_breakpoints, vec![2]);
    }

    #[test]
    fn cache_breakpoint_after_tool_block() {
        let mut ctx = ContextManager::new(ContextConfig {
            max_tokens: 50_000,
            enable_caching: true,
            ..Default::default()
        });
        ctx.add_system("rules");
        for i in 0..3 {
            ctx.add_tool_result(format!("c{i}"), "read", format!("out {i}"), false);
        }
        ctx.add_user("go");
        let prepared = ctx.prepare_for_request(PrepareOptions::default());
        assert_eq!(prepared.cache_breakpoints, vec![1, 4]);
    }

    #[test]
    fn corrections_appear_once_in_next_request() {
        let mut ctx = small_manager(50_000);
        ctx.add_user("hi");
        ctx.record_tool_error("click", "no such element");
        ctx.record_tool_error("click", "no such element");
        ctx.record_tool_error("click", "no such element");

        let prepared = ctx.prepare_for_request(PrepareOptions::default());
        let has_correction = prepared
            .messages
            .iter()
            .any(|m| m["content"].as_str().is_some_and(|c| c.contains("repeated_error")));
        assert!(has_correction);

        let second = ctx.prepare_for_request(PrepareOptions::default());
        let again = second
            .messages
            .iter()
            .any(|m| m["content"].as_str().is_some_and(|c| c.contains("repeated_error")));
        assert!(!again, "correction must be consumed after formatting");
    }

    #[test]
    fn staleness_detection_against_snapshot() {
        let mut ctx = small_manager(50_000);
        ctx.add_tool_result("c1", "canvas_read", r#"{"id": "el-404"}"#, false);

        let snap = StateSnapshot {
            id: "s".into(),
            timestamp: Utc::now(),
            summary: String::new(),
            version: None,
            data: serde_json::Map::from_iter([("elements".to_string(), json!([{"id": "el-1"}]))]),
            tokens_used: 0,
        };
        ctx.observe_snapshot(&snap);

        let prepared = ctx.prepare_for_request(PrepareOptions::default());
        let has_stale = prepared
            .messages
            .iter()
            .any(|m| m["content"].as_str().is_some_and(|c| c.contains("el-404")));
        assert!(has_stale);
    }

    #[test]
    fn clone_is_independent() {
        let mut ctx = small_manager(50_000);
        ctx.add_user("original");
        let mut copy = ctx.clone();
        copy.add_user("only in copy");

        assert_eq!(ctx.message_count(), 1);
        assert_eq!(copy.message_count(), 2);
    }

    #[test]
    fn snapshot_restore_roundtrip() {
        let mut ctx = small_manager(50_000);
        ctx.add_system("persist me");
        ctx.add_user("a question");
        let snap = ctx.to_snapshot();

        let mut restored = small_manager(1);
        restored.restore(&snap).unwrap();
        assert_eq!(restored.message_count(), 2);
        assert_eq!(restored.stats().memory.tiers["system"].messages, 1);
    }

    #[test]
    fn future_snapshot_version_rejected() {
        let mut ctx = small_manager(1_000);
        let err = ctx
            .restore(&json!({"version": 99, "tiers": {}}))
            .unwrap_err();
        assert!(err.to_string().contains("99"));
    }

    #[test]
    fn response_headroom_accounts_for_reserves() {
        let mut ctx = ContextManager::new(ContextConfig {
            max_tokens: 10_000,
            response_reserve: 1_000,
            tool_reserve: 500,
            ..Default::default()
        });
        ctx.add_user("abcd");
        let prepared = ctx.prepare_for_request(PrepareOptions {
            additional_reserve: 100,
            ..Default::default()
        });
        let used = ctx.total_tokens();
        assert_eq!(
            prepared.response_tokens_available,
            10_000 - used - 1_000 - 500 - 100
        );
    }

    #[test]
    fn events_are_drained_in_order() {
        let mut ctx = small_manager(50_000);
        ctx.add_user("one");
        ctx.add_user("two");
        let events = ctx.drain_events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ContextEvent::MessageAdded { .. }));
        assert!(ctx.drain_events().is_empty());
    }
}
