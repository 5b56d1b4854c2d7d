use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use super::budget::estimate_str;

/// How hard to squeeze.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionLevel {
    Light,
    Moderate,
    Aggressive,
}

impl CompressionLevel {
    /// (head %, tail %, middle budget %) of lines kept by the file reader
    /// compressor.
    fn read_split(&self) -> (usize, usize, usize) {
        match self {
            CompressionLevel::Light => (35, 35, 30),
            CompressionLevel::Moderate => (30, 30, 20),
            CompressionLevel::Aggressive => (25, 25, 10),
        }
    }

    /// Matches sampled per file by the grep compressor.
    fn grep_samples(&self) -> usize {
        match self {
            CompressionLevel::Light => 5,
            CompressionLevel::Moderate => 3,
            CompressionLevel::Aggressive => 2,
        }
    }
}

/// Inputs to a per-tool compressor.
pub struct CompressorOptions {
    /// Output token budget.
    pub budget: u32,
    pub level: CompressionLevel,
    /// Extra user-supplied line patterns that must survive extraction.
    pub preserve_patterns: Vec<Regex>,
    pub metadata: Option<Value>,
}

impl CompressorOptions {
    pub fn new(budget: u32, level: CompressionLevel) -> Self {
        Self {
            budget,
            level,
            preserve_patterns: Vec::new(),
            metadata: None,
        }
    }
}

/// What a compressor produced, with labels for the compression record.
pub struct CompressorOutput {
    pub content: String,
    pub preserved: Vec<String>,
    pub dropped: Vec<String>,
}

pub type CompressorFn = Box<dyn Fn(&str, &CompressorOptions) -> CompressorOutput + Send + Sync>;

/// Lines worth keeping when extracting the middle of a file: declarations,
/// imports/exports, and anything that smells like a problem.
pub fn importance_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"^\s*(pub\s+)?(async\s+)?(fn|struct|enum|trait|impl|mod|type|const|static)\b",
            r"^\s*(use|import|export|from|require|#include|package)\b",
            r"^\s*(def|class|function|interface)\b",
            r"(?i)\b(error|panic|fatal|exception|fail(ed|ure)?)\b",
            r"\b(TODO|FIXME|XXX|HACK)\b",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static pattern compiles"))
        .collect()
    })
}

fn is_important(line: &str, extra: &[Regex]) -> bool {
    importance_patterns().iter().any(|p| p.is_match(line))
        || extra.iter().any(|p| p.is_match(line))
}

/// Registry of per-tool compressors, keyed by case-folded tool name.
pub struct ToolCompressorRegistry {
    compressors: HashMap<String, CompressorFn>,
}

impl ToolCompressorRegistry {
    /// Registry pre-loaded with the built-in compressors.
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            compressors: HashMap::new(),
        };
        registry.register("read", Box::new(compress_read));
        registry.register("grep", Box::new(compress_grep));
        registry.register("bash", Box::new(compress_bash));
        registry.register("glob", Box::new(compress_glob));
        registry.register("canvas_read", Box::new(compress_structured));
        registry
    }

    pub fn register(&mut self, tool: impl Into<String>, f: CompressorFn) {
        self.compressors.insert(tool.into().to_lowercase(), f);
    }

    pub fn has(&self, tool: &str) -> bool {
        self.compressors.contains_key(&tool.to_lowercase())
    }

    /// Compress through the registered compressor, or the generic fallback.
    pub fn compress(
        &self,
        tool: &str,
        content: &str,
        opts: &CompressorOptions,
    ) -> CompressorOutput {
        match self.compressors.get(&tool.to_lowercase()) {
            Some(f) => f(content, opts),
            None => compress_generic(content, opts),
        }
    }
}

impl Default for ToolCompressorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

// ---------------------------------------------------------------------------
// Built-in compressors
// ---------------------------------------------------------------------------

/// File reads: head + tail windows plus important middle lines, with an
/// omission marker counting what fell out.
fn compress_read(content: &str, opts: &CompressorOptions) -> CompressorOutput {
    let lines: Vec<&str> = content.lines().collect();
    let (head_pct, tail_pct, middle_pct) = opts.level.read_split();

    let head_n = lines.len() * head_pct / 100;
    let tail_n = lines.len() * tail_pct / 100;
    if head_n + tail_n >= lines.len() {
        return CompressorOutput {
            content: content.to_string(),
            preserved: vec!["full content".into()],
            dropped: vec![],
        };
    }

    let middle = &lines[head_n..lines.len() - tail_n];
    let middle_budget = (lines.len() * middle_pct / 100).max(1);
    let mut kept_middle = Vec::new();
    for line in middle {
        if kept_middle.len() >= middle_budget {
            break;
        }
        if is_important(line, &opts.preserve_patterns) {
            kept_middle.push(*line);
        }
    }

    let omitted = middle.len() - kept_middle.len();
    let mut out: Vec<String> = Vec::with_capacity(head_n + kept_middle.len() + tail_n + 1);
    out.extend(lines[..head_n].iter().map(|l| l.to_string()));
    out.extend(kept_middle.iter().map(|l| l.to_string()));
    out.push(format!("[… {omitted} lines omitted …]"));
    out.extend(lines[lines.len() - tail_n..].iter().map(|l| l.to_string()));

    CompressorOutput {
        content: out.join("\n"),
        preserved: vec![
            format!("first {head_n} lines"),
            format!("last {tail_n} lines"),
            format!("{} important middle lines", kept_middle.len()),
        ],
        dropped: vec![format!("{omitted} middle lines")],
    }
}

/// Grep output: `path:line:text` lines (or a JSON array of matches), grouped
/// by file with totals and first/middle/last samples.
fn compress_grep(content: &str, opts: &CompressorOptions) -> CompressorOutput {
    let mut by_file: BTreeMap<String, Vec<String>> = BTreeMap::new();

    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(content) {
        for item in &items {
            let file = item["path"]
                .as_str()
                .or_else(|| item["file"].as_str())
                .unwrap_or("unknown")
                .to_string();
            let line = item["line"].as_u64().unwrap_or(0);
            let text = item["text"]
                .as_str()
                .or_else(|| item["match"].as_str())
                .unwrap_or("");
            by_file
                .entry(file)
                .or_default()
                .push(format!("{line}: {}", text.trim()));
        }
    } else {
        for raw in content.lines() {
            let mut parts = raw.splitn(3, ':');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(path), Some(line), Some(text)) if line.parse::<u64>().is_ok() => {
                    by_file
                        .entry(path.to_string())
                        .or_default()
                        .push(format!("{line}: {}", text.trim()));
                }
                _ => {
                    if !raw.trim().is_empty() {
                        by_file.entry("".into()).or_default().push(raw.to_string());
                    }
                }
            }
        }
    }

    let total: usize = by_file.values().map(Vec::len).sum();
    let samples = opts.level.grep_samples();
    let mut out = vec![format!(
        "{total} match(es) across {} file(s)",
        by_file.len()
    )];
    let mut dropped = 0usize;

    for (file, matches) in &by_file {
        let label = if file.is_empty() { "(no file)" } else { file };
        out.push(format!("{label} ({} matches):", matches.len()));
        for m in sample_first_middle_last(matches, samples) {
            out.push(format!("  {m}"));
        }
        dropped += matches.len().saturating_sub(samples.min(matches.len()));
    }

    CompressorOutput {
        content: out.join("\n"),
        preserved: vec![format!("totals + {} samples/file", samples)],
        dropped: vec![format!("{dropped} matches")],
    }
}

fn sample_first_middle_last<T: Clone>(items: &[T], n: usize) -> Vec<T> {
    if items.len() <= n {
        return items.to_vec();
    }
    match n {
        0 => vec![],
        1 => vec![items[0].clone()],
        2 => vec![items[0].clone(), items[items.len() - 1].clone()],
        _ => {
            // Evenly spaced from first through last; n=3 degenerates to
            // first/middle/last.
            (0..n)
                .map(|i| items[i * (items.len() - 1) / (n - 1)].clone())
                .collect()
        }
    }
}

/// Shell output: the exit code always survives. Failures keep stderr first;
/// successes split the budget 70/30 stdout/stderr.
fn compress_bash(content: &str, opts: &CompressorOptions) -> CompressorOutput {
    let (stdout, stderr, exit_code) = split_bash_output(content);
    let budget_chars = (opts.budget as usize) * 4;

    let (first, first_label, second, second_label, first_share) = if exit_code != 0 {
        (stderr, "stderr", stdout, "stdout", 0.7)
    } else {
        (stdout, "stdout", stderr, "stderr", 0.7)
    };

    let first_budget = (budget_chars as f32 * first_share) as usize;
    let second_budget = budget_chars - first_budget.min(budget_chars);

    let mut sections = vec![format!("exit code: {exit_code}")];
    let mut dropped = Vec::new();
    for (text, label, budget) in [
        (first, first_label, first_budget),
        (second, second_label, second_budget),
    ] {
        if text.is_empty() {
            continue;
        }
        let (kept, omitted) = truncate_middle(&text, budget);
        sections.push(format!("--- {label} ---\n{kept}"));
        if omitted > 0 {
            dropped.push(format!("{omitted} {label} chars"));
        }
    }

    CompressorOutput {
        content: sections.join("\n"),
        preserved: vec!["exit code".into(), first_label.to_string()],
        dropped,
    }
}

/// Accept either a JSON `{stdout, stderr, exit_code}` envelope or plain text
/// (treated as stdout from a successful run).
fn split_bash_output(content: &str) -> (String, String, i64) {
    if let Ok(v) = serde_json::from_str::<Value>(content) {
        if v.is_object() {
            return (
                v["stdout"].as_str().unwrap_or("").to_string(),
                v["stderr"].as_str().unwrap_or("").to_string(),
                v["exit_code"].as_i64().unwrap_or(0),
            );
        }
    }
    (content.to_string(), String::new(), 0)
}

/// Keep the head and tail of a string within a char budget; returns the kept
/// text and how many chars were omitted.
fn truncate_middle(text: &str, budget_chars: usize) -> (String, usize) {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= budget_chars || budget_chars == 0 {
        if budget_chars == 0 && !chars.is_empty() {
            return (String::new(), chars.len());
        }
        return (text.to_string(), 0);
    }
    let head = budget_chars / 2;
    let tail = budget_chars - head;
    let omitted = chars.len() - budget_chars;
    let mut out: String = chars[..head].iter().collect();
    out.push_str(&format!("\n[… {omitted} characters omitted …]\n"));
    out.extend(chars[chars.len() - tail..].iter());
    (out, omitted)
}

/// Glob output: per-directory counts with sampled filenames.
fn compress_glob(content: &str, opts: &CompressorOptions) -> CompressorOutput {
    let mut by_dir: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut total = 0usize;
    for line in content.lines() {
        let path = line.trim();
        if path.is_empty() {
            continue;
        }
        total += 1;
        let (dir, name) = match path.rfind('/') {
            Some(idx) => (path[..idx].to_string(), path[idx + 1..].to_string()),
            None => (".".to_string(), path.to_string()),
        };
        by_dir.entry(dir).or_default().push(name);
    }

    let samples = opts.level.grep_samples();
    let mut out = vec![format!("{total} path(s) in {} director(ies)", by_dir.len())];
    let mut dropped = 0usize;
    for (dir, names) in &by_dir {
        let shown: Vec<&String> = names.iter().take(samples).collect();
        dropped += names.len().saturating_sub(shown.len());
        let suffix = if names.len() > shown.len() {
            format!(", … {} more", names.len() - shown.len())
        } else {
            String::new()
        };
        out.push(format!(
            "{dir}/ ({}): {}{suffix}",
            names.len(),
            shown
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }

    CompressorOutput {
        content: out.join("\n"),
        preserved: vec!["per-directory counts".into()],
        dropped: vec![format!("{dropped} filenames")],
    }
}

/// Style keys that survive structured-element compression.
const KEY_STYLE_KEYS: [&str; 6] = ["fill", "stroke", "opacity", "font", "fontSize", "color"];
const KEPT_KEYS: [&str; 7] = ["id", "type", "position", "size", "name", "x", "y"];

/// Structured domain objects (canvas elements and the like): keep identity,
/// geometry, and key style; summarize deep or wide children; drop verbose
/// metadata.
fn compress_structured(content: &str, opts: &CompressorOptions) -> CompressorOutput {
    let Ok(value) = serde_json::from_str::<Value>(content) else {
        return compress_generic(content, opts);
    };

    let compacted = compact_element(&value, 0);
    let out = serde_json::to_string_pretty(&compacted).unwrap_or_else(|_| compacted.to_string());

    CompressorOutput {
        content: out,
        preserved: vec!["ids, geometry, key style".into()],
        dropped: vec!["verbose metadata, deep children".into()],
    }
}

fn compact_element(value: &Value, depth: usize) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                if KEPT_KEYS.contains(&k.as_str()) || KEY_STYLE_KEYS.contains(&k.as_str()) {
                    out.insert(k.clone(), v.clone());
                } else if k == "children" {
                    if let Value::Array(children) = v {
                        if depth >= 1 || children.len() > 5 {
                            out.insert(
                                "children".into(),
                                Value::String(format!("[{} children]", children.len())),
                            );
                        } else {
                            out.insert(
                                "children".into(),
                                Value::Array(
                                    children
                                        .iter()
                                        .map(|c| compact_element(c, depth + 1))
                                        .collect(),
                                ),
                            );
                        }
                    }
                } else if k == "style" {
                    if let Value::Object(style) = v {
                        let kept: serde_json::Map<String, Value> = style
                            .iter()
                            .filter(|(sk, _)| KEY_STYLE_KEYS.contains(&sk.as_str()))
                            .map(|(sk, sv)| (sk.clone(), sv.clone()))
                            .collect();
                        if !kept.is_empty() {
                            out.insert("style".into(), Value::Object(kept));
                        }
                    }
                }
                // Everything else is verbose metadata: dropped.
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| compact_element(v, depth)).collect()),
        other => other.clone(),
    }
}

/// Fallback: head/tail with an omission marker, sized to the budget.
pub fn compress_generic(content: &str, opts: &CompressorOptions) -> CompressorOutput {
    let budget_chars = (opts.budget as usize).saturating_mul(4).max(64);
    let (kept, omitted) = truncate_middle(content, budget_chars);
    CompressorOutput {
        content: kept,
        preserved: vec!["head and tail".into()],
        dropped: if omitted > 0 {
            vec![format!("{omitted} chars")]
        } else {
            vec![]
        },
    }
}

/// Estimate the output cost of a compressor result.
pub fn output_tokens(output: &CompressorOutput) -> u32 {
    estimate_str(&output.content)
}
