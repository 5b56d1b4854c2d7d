use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::AliasError;

/// An `@name(args)` occurrence in user-authored text.
#[derive(Debug, Clone)]
pub struct AliasMatch {
    /// The full matched text, `@` included.
    pub matched: String,
    pub name: String,
    pub args: Vec<String>,
    pub raw_args: Option<String>,
    pub start: usize,
    pub end: usize,
    pub valid: bool,
    pub error: Option<AliasError>,
}

/// What a registered alias declares about itself.
#[derive(Clone)]
pub struct AliasDefinition {
    pub name: String,
    pub description: String,
    pub required_args: usize,
    /// Optional per-argument shape check.
    pub arg_pattern: Option<Regex>,
}

impl AliasDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required_args: 0,
            arg_pattern: None,
        }
    }

    pub fn with_required_args(mut self, n: usize) -> Self {
        self.required_args = n;
        self
    }

    pub fn with_arg_pattern(mut self, pattern: Regex) -> Self {
        self.arg_pattern = Some(pattern);
        self
    }
}

/// What an alias resolves to.
#[derive(Debug, Clone)]
pub struct ResolvedAlias {
    /// One-line form for inline substitution.
    pub summary: String,
    /// Full form for the context block.
    pub value: String,
    pub token_estimate: u32,
}

/// Ambient data handed to resolvers (selection, hints, whatever the session
/// knows).
#[derive(Debug, Clone, Default)]
pub struct ResolveContext {
    pub data: Value,
}

/// Binds an alias name to content.
#[async_trait]
pub trait AliasResolver: Send + Sync {
    async fn resolve(
        &self,
        args: &[String],
        context: &ResolveContext,
    ) -> Result<ResolvedAlias, String>;
}

/// Both rewrites of the original text, plus what went wrong.
#[derive(Debug, Clone)]
pub struct ResolvedText {
    /// Aliases replaced by their `[summary]` form.
    pub summary_text: String,
    /// Aliases replaced by their full value blocks, still bounded.
    pub context_text: String,
    pub errors: Vec<AliasError>,
    pub tokens_used: u32,
}

/// Registry of `@name` aliases and the resolution engine over them.
pub struct AliasRegistry {
    entries: HashMap<String, (AliasDefinition, Arc<dyn AliasResolver>)>,
    timeout: Option<Duration>,
    continue_on_error: bool,
}

impl AliasRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            timeout: None,
            continue_on_error: true,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    pub fn register(
        &mut self,
        definition: AliasDefinition,
        resolver: impl AliasResolver + 'static,
    ) {
        self.entries.insert(
            definition.name.clone(),
            (definition, Arc::new(resolver)),
        );
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn definition(&self, name: &str) -> Option<&AliasDefinition> {
        self.entries.get(name).map(|(d, _)| d)
    }

    /// Find every alias occurrence. The `regex` crate has no lookbehind, so
    /// the "not inside an identifier or email" rule is an explicit check on
    /// the preceding character.
    pub fn extract(&self, text: &str) -> Vec<AliasMatch> {
        static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
        let pattern = PATTERN.get_or_init(|| {
            Regex::new(r"@([A-Za-z][A-Za-z0-9_]*)(?:\(([^)]*)\))?").expect("alias pattern compiles")
        });

        let mut matches = Vec::new();
        for caps in pattern.captures_iter(text) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            let start = whole.start();

            // Reject matches glued to an identifier or an email local part.
            if start > 0 {
                let prev = text[..start].chars().next_back().unwrap_or(' ');
                if prev.is_ascii_alphanumeric() || prev == '_' {
                    continue;
                }
            }

            let name = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
            let raw_args = caps.get(2).map(|m| m.as_str().to_string());
            let args: Vec<String> = raw_args
                .as_deref()
                .map(|raw| {
                    raw.split(',')
                        .map(|a| a.trim().to_string())
                        .filter(|a| !a.is_empty())
                        .collect()
                })
                .unwrap_or_default();

            let error = self.validate(&name, &args);
            matches.push(AliasMatch {
                matched: whole.as_str().to_string(),
                name,
                args,
                raw_args,
                start,
                end: whole.end(),
                valid: error.is_none(),
                error,
            });
        }
        matches
    }

    fn validate(&self, name: &str, args: &[String]) -> Option<AliasError> {
        let Some((def, _)) = self.entries.get(name) else {
            return Some(AliasError::Unknown(name.to_string()));
        };
        if args.len() < def.required_args {
            return Some(AliasError::Arity {
                name: name.to_string(),
                required: def.required_args,
                given: args.len(),
            });
        }
        if let Some(pattern) = &def.arg_pattern {
            for arg in args {
                if !pattern.is_match(arg) {
                    return Some(AliasError::ArgPattern {
                        name: name.to_string(),
                        arg: arg.clone(),
                    });
                }
            }
        }
        None
    }

    /// Resolve every alias in `text` within `budget_tokens`, producing the
    /// summary and context rewrites. Failed aliases become `[Error: …]`
    /// markers; with `continue_on_error` unset the first failure stops the
    /// pass.
    pub async fn resolve_text(
        &self,
        text: &str,
        budget_tokens: u32,
        context: &ResolveContext,
    ) -> ResolvedText {
        let matches = self.extract(text);
        let mut errors = Vec::new();
        let mut tokens_used = 0u32;

        // Resolutions keyed by match index.
        let mut outcomes: Vec<Option<Result<ResolvedAlias, AliasError>>> =
            vec![None; matches.len()];

        for (idx, m) in matches.iter().enumerate() {
            if let Some(err) = &m.error {
                errors.push(err.clone());
                outcomes[idx] = Some(Err(err.clone()));
                if !self.continue_on_error {
                    break;
                }
                continue;
            }

            if tokens_used >= budget_tokens {
                let err = AliasError::Budget {
                    name: m.name.clone(),
                };
                errors.push(err.clone());
                outcomes[idx] = Some(Err(err));
                continue;
            }

            let (_, resolver) = &self.entries[&m.name];
            let resolved = match self.timeout {
                Some(t) => match tokio::time::timeout(t, resolver.resolve(&m.args, context)).await
                {
                    Ok(r) => r,
                    Err(_) => {
                        let err = AliasError::Timeout {
                            name: m.name.clone(),
                            ms: t.as_millis() as u64,
                        };
                        warn!(alias = %m.name, "alias resolution timed out");
                        errors.push(err.clone());
                        outcomes[idx] = Some(Err(err));
                        if !self.continue_on_error {
                            break;
                        }
                        continue;
                    }
                },
                None => resolver.resolve(&m.args, context).await,
            };

            match resolved {
                Ok(resolution) => {
                    if tokens_used + resolution.token_estimate > budget_tokens {
                        let err = AliasError::Budget {
                            name: m.name.clone(),
                        };
                        errors.push(err.clone());
                        outcomes[idx] = Some(Err(err));
                        continue;
                    }
                    tokens_used += resolution.token_estimate;
                    debug!(alias = %m.name, tokens = resolution.token_estimate, "alias resolved");
                    outcomes[idx] = Some(Ok(resolution));
                }
                Err(reason) => {
                    let err = AliasError::Resolution {
                        name: m.name.clone(),
                        reason,
                    };
                    errors.push(err.clone());
                    outcomes[idx] = Some(Err(err));
                    if !self.continue_on_error {
                        break;
                    }
                }
            }
        }

        let summary_text = rewrite(text, &matches, &outcomes, |r| format!("[{}]", r.summary));
        let context_text = rewrite(text, &matches, &outcomes, |r| r.value.clone());

        ResolvedText {
            summary_text,
            context_text,
            errors,
            tokens_used,
        }
    }
}

impl Default for AliasRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Rebuild `text`, substituting each matched span.
fn rewrite(
    text: &str,
    matches: &[AliasMatch],
    outcomes: &[Option<Result<ResolvedAlias, AliasError>>],
    render: impl Fn(&ResolvedAlias) -> String,
) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0usize;
    for (m, outcome) in matches.iter().zip(outcomes) {
        out.push_str(&text[cursor..m.start]);
        match outcome {
            Some(Ok(resolution)) => out.push_str(&render(resolution)),
            Some(Err(err)) => out.push_str(&format!("[Error: {err}]")),
            // Unprocessed (continue_on_error=false aborted earlier): keep as-is.
            None => out.push_str(&m.matched),
        }
        cursor = m.end;
    }
    out.push_str(&text[cursor..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::budget::estimate_str;

    struct StaticResolver {
        summary: &'static str,
        value: &'static str,
    }

    #[async_trait]
    impl AliasResolver for StaticResolver {
        async fn resolve(
            &self,
            _args: &[String],
            _context: &ResolveContext,
        ) -> Result<ResolvedAlias, String> {
            Ok(ResolvedAlias {
                summary: self.summary.to_string(),
                value: self.value.to_string(),
                token_estimate: estimate_str(self.value),
            })
        }
    }

    struct FailingResolver;

    #[async_trait]
    impl AliasResolver for FailingResolver {
        async fn resolve(
            &self,
            _args: &[String],
            _context: &ResolveContext,
        ) -> Result<ResolvedAlias, String> {
            Err("backend unavailable".into())
        }
    }

    struct SlowResolver;

    #[async_trait]
    impl AliasResolver for SlowResolver {
        async fn resolve(
            &self,
            _args: &[String],
            _context: &ResolveContext,
        ) -> Result<ResolvedAlias, String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!("test should time out first")
        }
    }

    fn registry() -> AliasRegistry {
        let mut reg = AliasRegistry::new();
        reg.register(
            AliasDefinition::new("selection", "current selection"),
            StaticResolver {
                summary: "3 elements selected",
                value: "Selected elements:\n- el-1\n- el-2\n- el-3",
            },
        );
        reg.register(
            AliasDefinition::new("element", "element by id")
                .with_required_args(1)
                .with_arg_pattern(Regex::new(r"^el-\d+$").unwrap()),
            StaticResolver {
                summary: "element detail",
                value: "Element data",
            },
        );
        reg
    }

    #[test]
    fn extracts_bare_and_parenthesized() {
        let reg = registry();
        let matches = reg.extract("use @selection and @element(el-1) here");
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].name, "selection");
        assert!(matches[0].args.is_empty());
        assert_eq!(matches[1].name, "element");
        assert_eq!(matches[1].args, vec!["el-1".to_string()]);
        assert!(matches.iter().all(|m| m.valid));
    }

    #[test]
    fn no_match_inside_identifiers_or_emails() {
        let reg = registry();
        assert!(reg.extract("mail me at user@selection.com").is_empty());
        assert!(reg.extract("var foo_@selection = 1").is_empty());
        assert!(reg.extract("x9@selection").is_empty());
        // But punctuation or start-of-string is fine.
        assert_eq!(reg.extract("(@selection)").len(), 1);
        assert_eq!(reg.extract("@selection").len(), 1);
    }

    #[test]
    fn unknown_alias_is_invalid() {
        let reg = registry();
        let matches = reg.extract("@nonexistent");
        assert_eq!(matches.len(), 1);
        assert!(!matches[0].valid);
        assert!(matches!(matches[0].error, Some(AliasError::Unknown(_))));
    }

    #[test]
    fn arity_and_pattern_validation() {
        let reg = registry();
        let missing = reg.extract("@element");
        assert!(matches!(missing[0].error, Some(AliasError::Arity { .. })));

        let bad_arg = reg.extract("@element(not-an-id)");
        assert!(matches!(
            bad_arg[0].error,
            Some(AliasError::ArgPattern { .. })
        ));
    }

    #[tokio::test]
    async fn resolution_produces_both_rewrites() {
        let reg = registry();
        let resolved = reg
            .resolve_text("context: @selection please", 10_000, &ResolveContext::default())
            .await;
        assert_eq!(
            resolved.summary_text,
            "context: [3 elements selected] please"
        );
        assert!(resolved.context_text.contains("el-2"));
        assert!(resolved.errors.is_empty());
        assert!(resolved.tokens_used > 0);
    }

    #[tokio::test]
    async fn failed_resolution_becomes_error_marker() {
        let mut reg = AliasRegistry::new();
        reg.register(AliasDefinition::new("broken", ""), FailingResolver);
        let resolved = reg
            .resolve_text("try @broken now", 10_000, &ResolveContext::default())
            .await;
        assert!(resolved.summary_text.contains("[Error:"));
        assert!(resolved.summary_text.contains("backend unavailable"));
        assert_eq!(resolved.errors.len(), 1);
    }

    #[tokio::test]
    async fn over_budget_alias_skipped_with_error() {
        let reg = registry();
        let resolved = reg
            .resolve_text("@selection", 1, &ResolveContext::default())
            .await;
        assert!(matches!(resolved.errors[0], AliasError::Budget { .. }));
        assert!(resolved.summary_text.contains("[Error:"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_resolver_times_out_and_rest_continue() {
        let mut reg = AliasRegistry::new().with_timeout(Duration::from_millis(50));
        reg.register(AliasDefinition::new("slow", ""), SlowResolver);
        reg.register(
            AliasDefinition::new("fast", ""),
            StaticResolver {
                summary: "quick",
                value: "quick value",
            },
        );

        let resolved = reg
            .resolve_text("@slow then @fast", 10_000, &ResolveContext::default())
            .await;
        assert!(matches!(resolved.errors[0], AliasError::Timeout { .. }));
        assert!(resolved.summary_text.contains("[quick]"));
    }

    #[tokio::test]
    async fn text_without_aliases_passes_through() {
        let reg = registry();
        let resolved = reg
            .resolve_text("plain text, nothing to do", 100, &ResolveContext::default())
            .await;
        assert_eq!(resolved.summary_text, "plain text, nothing to do");
        assert_eq!(resolved.tokens_used, 0);
    }
}
