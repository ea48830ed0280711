//! Policy rules: the speed layer's tier 2 (SPEC_FULL.md §4.4).
//!
//! An ordered list of predicates, each carrying a decision. The first rule
//! whose predicate matches the command wins. Rules reload atomically: a
//! reload builds a new `Vec<Rule>` and swaps it in behind a lock, so an
//! in-flight evaluation never sees a half-updated rule set.
//!
//! Rule sets load from a JSON file at startup and can be hot-reloaded
//! without restarting the broker.

use regex::Regex;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Block,
}

#[derive(Debug, Clone)]
pub enum Predicate {
    /// Glob-style match against the tool name (`*`, `**` supported).
    ToolGlob(String),
    /// Regex match against the command's serialized arguments.
    ArgPattern(Regex),
    /// Matches every command; used for default-allow/default-block rules.
    Any,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub priority: u32,
    pub predicate: Predicate,
    pub decision: Decision,
    pub label: String,
}

pub struct PolicyEngine {
    rules: RwLock<Vec<Rule>>,
}

impl PolicyEngine {
    pub fn new(mut rules: Vec<Rule>) -> Self {
        rules.sort_by_key(|r| r.priority);
        Self {
            rules: RwLock::new(rules),
        }
    }

    pub fn denylist_safelist_default() -> Self {
        Self::new(vec![
            Rule {
                priority: 0,
                predicate: Predicate::ToolGlob(".env*".to_string()),
                decision: Decision::Block,
                label: "deny-dotenv".to_string(),
            },
            Rule {
                priority: 0,
                predicate: Predicate::ToolGlob("**/secrets/**".to_string()),
                decision: Decision::Block,
                label: "deny-secrets-dir".to_string(),
            },
            Rule {
                priority: 100,
                predicate: Predicate::Any,
                decision: Decision::Block,
                label: "default-deny".to_string(),
            },
        ])
    }

    /// Replaces the active rule set atomically. Existing evaluations in
    /// flight complete against whichever snapshot they already locked.
    pub fn reload(&self, mut rules: Vec<Rule>) {
        rules.sort_by_key(|r| r.priority);
        let mut guard = self.rules.write().expect("policy engine lock poisoned");
        *guard = rules;
    }

    /// Evaluates `tool_name`/`args` against the ordered rule list,
    /// returning the first matching rule's decision, or `None` if no rule
    /// matched (the caller then escalates to the expert tier).
    pub fn evaluate(&self, tool_name: &str, args: &str) -> Option<(Decision, String)> {
        let rules = self.rules.read().expect("policy engine lock poisoned");
        for rule in rules.iter() {
            let matched = match &rule.predicate {
                Predicate::ToolGlob(pattern) => glob_match(pattern, tool_name),
                Predicate::ArgPattern(re) => re.is_match(args),
                Predicate::Any => true,
            };
            if matched {
                return Some((rule.decision, rule.label.clone()));
            }
        }
        None
    }
}

fn glob_match(pattern: &str, text: &str) -> bool {
    if pattern.contains("**") {
        let parts: Vec<&str> = pattern.split("**").collect();
        if parts.len() == 2 {
            let prefix = parts[0];
            let suffix = parts[1];
            return (suffix.is_empty() || text.ends_with(suffix))
                && (prefix.is_empty() || text.starts_with(prefix));
        }
    }

    if pattern.contains('*') && !pattern.contains("**") {
        let parts: Vec<&str> = pattern.split('*').collect();
        if parts.len() == 2 {
            return text.starts_with(parts[0]) && text.ends_with(parts[1]);
        }
    }

    pattern == text
}
