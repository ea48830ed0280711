//! The three-tier speed-layer dispatcher (SPEC_FULL.md §4.4).
//!
//! A validation request moves through tiers in order until one of them
//! reaches a decision: memory cache (bloom filter + bounded LRU) → policy
//! rules → expert escalation. Each tier is fronted by its own circuit
//! breaker; an open breaker skips straight to the next tier rather than
//! failing the request.
//!
//! The memory tier is a bloom-filter-fronted bounded LRU: a negative bloom
//! lookup skips the map entirely, so a fingerprint never seen before costs a
//! handful of bit checks rather than a hash-map miss.

use crate::bloom::BloomFilter;
use crate::config::FallbackPolicy;
use crate::core::circuit_breaker::CircuitBreaker;
use crate::core::policy::{Decision as PolicyDecision, PolicyEngine};
use crate::error::LighthouseError;
use crate::lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Read-only tools considered safe enough to auto-approve under
/// `FallbackPolicy::SafeAllowElseBlock` when every validation tier is
/// unavailable (SPEC_FULL.md §4.4 "Fallback policy on expert timeout").
const DEFAULT_SAFE_TOOLS: &[&str] = &["read_file", "list_files", "search", "health"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationDecision {
    Approved,
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Memory,
    Policy,
    Expert,
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub decision: ValidationDecision,
    pub tier: Tier,
    pub reason: String,
    pub latency_ms: u64,
}

/// A pending expert escalation: the dispatcher hands this to
/// `ExpertRegistry::delegate` and blocks (bounded by `expert_timeout`) for
/// a response.
pub trait ExpertEscalator: Send + Sync {
    fn escalate(
        &self,
        fingerprint: &str,
        tool_name: &str,
        args: &str,
        timeout: Duration,
    ) -> Result<ValidationDecision, LighthouseError>;
}

struct MemoryTier {
    bloom: BloomFilter,
    cache: Mutex<LruCache<ValidationDecision>>,
}

pub struct SpeedLayerDispatcher {
    memory: MemoryTier,
    policy: PolicyEngine,
    memory_breaker: CircuitBreaker,
    policy_breaker: CircuitBreaker,
    expert_breaker: CircuitBreaker,
    expert_timeout: Duration,
    fallback_policy: FallbackPolicy,
    safe_tools: HashSet<String>,
}

impl SpeedLayerDispatcher {
    pub fn new(
        memory_cache_size: usize,
        policy: PolicyEngine,
        expert_timeout: Duration,
        fallback_policy: FallbackPolicy,
    ) -> Self {
        Self {
            memory: MemoryTier {
                bloom: BloomFilter::new(memory_cache_size.max(1024), 0.01),
                cache: Mutex::new(LruCache::new(memory_cache_size, Duration::from_secs(300))),
            },
            policy,
            memory_breaker: CircuitBreaker::new(0.5, 20, Duration::from_secs(10)),
            policy_breaker: CircuitBreaker::new(0.5, 20, Duration::from_secs(10)),
            expert_breaker: CircuitBreaker::new(0.5, 10, Duration::from_secs(30)),
            expert_timeout,
            fallback_policy,
            safe_tools: DEFAULT_SAFE_TOOLS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// The decision applied when every tier has failed to reach one.
    /// `AlwaysBlock` never approves; `SafeAllowElseBlock` approves only
    /// tools on the built-in read-only safelist.
    fn fallback_decision(&self, tool_name: &str) -> ValidationDecision {
        match self.fallback_policy {
            FallbackPolicy::AlwaysBlock => ValidationDecision::Blocked,
            FallbackPolicy::SafeAllowElseBlock => {
                if self.safe_tools.contains(tool_name) {
                    ValidationDecision::Approved
                } else {
                    ValidationDecision::Blocked
                }
            }
        }
    }

    pub fn fingerprint(tool_name: &str, args: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(tool_name.as_bytes());
        hasher.update(b"\0");
        hasher.update(args.as_bytes());
        let digest = hasher.finalize();
        let mut out = String::with_capacity(digest.len() * 2);
        for b in digest {
            out.push_str(&format!("{:02x}", b));
        }
        out
    }

    /// Dispatches a validation request through the three tiers in order.
    /// `escalator` is invoked only if both the memory and policy tiers
    /// fail to reach a decision.
    pub fn validate(
        &self,
        tool_name: &str,
        args: &str,
        escalator: &dyn ExpertEscalator,
    ) -> ValidationResult {
        let started = Instant::now();
        let fingerprint = Self::fingerprint(tool_name, args);

        if self.memory_breaker.allow() {
            if self.memory.bloom.might_contain(&fingerprint) {
                let mut cache = self.memory.cache.lock().expect("memory tier lock poisoned");
                if let Some(decision) = cache.get(&fingerprint) {
                    self.memory_breaker.record_success();
                    return ValidationResult {
                        decision,
                        tier: Tier::Memory,
                        reason: "memory cache hit".to_string(),
                        latency_ms: started.elapsed().as_millis() as u64,
                    };
                }
            }
        }

        if self.policy_breaker.allow() {
            if let Some((policy_decision, label)) = self.policy.evaluate(tool_name, args) {
                self.policy_breaker.record_success();
                let decision = match policy_decision {
                    PolicyDecision::Allow => ValidationDecision::Approved,
                    PolicyDecision::Block => ValidationDecision::Blocked,
                };
                self.remember(&fingerprint, decision);
                return ValidationResult {
                    decision,
                    tier: Tier::Policy,
                    reason: format!("policy rule: {}", label),
                    latency_ms: started.elapsed().as_millis() as u64,
                };
            }
        }

        if self.expert_breaker.allow() {
            match escalator.escalate(&fingerprint, tool_name, args, self.expert_timeout) {
                Ok(decision) => {
                    self.expert_breaker.record_success();
                    self.remember(&fingerprint, decision);
                    return ValidationResult {
                        decision,
                        tier: Tier::Expert,
                        reason: "expert escalation".to_string(),
                        latency_ms: started.elapsed().as_millis() as u64,
                    };
                }
                Err(err) => {
                    self.expert_breaker.record_failure();
                    return ValidationResult {
                        decision: self.fallback_decision(tool_name),
                        tier: Tier::Fallback,
                        reason: format!("expert escalation failed ({}), applying fallback policy", err),
                        latency_ms: started.elapsed().as_millis() as u64,
                    };
                }
            }
        }

        ValidationResult {
            decision: self.fallback_decision(tool_name),
            tier: Tier::Fallback,
            reason: "all tiers unavailable, applying fallback policy".to_string(),
            latency_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn remember(&self, fingerprint: &str, decision: ValidationDecision) {
        self.memory.bloom.insert(fingerprint);
        self.memory
            .cache
            .lock()
            .expect("memory tier lock poisoned")
            .put(fingerprint.to_string(), decision);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::policy::{Predicate, Rule};

    struct AlwaysApprove;
    impl ExpertEscalator for AlwaysApprove {
        fn escalate(
            &self,
            _fingerprint: &str,
            _tool_name: &str,
            _args: &str,
            _timeout: Duration,
        ) -> Result<ValidationDecision, LighthouseError> {
            Ok(ValidationDecision::Approved)
        }
    }

    struct AlwaysFails;
    impl ExpertEscalator for AlwaysFails {
        fn escalate(
            &self,
            _fingerprint: &str,
            _tool_name: &str,
            _args: &str,
            _timeout: Duration,
        ) -> Result<ValidationDecision, LighthouseError> {
            Err(LighthouseError::Timeout("expert did not respond".to_string()))
        }
    }

    #[test]
    fn test_policy_tier_blocks_dotenv() {
        let dispatcher = SpeedLayerDispatcher::new(
            100,
            PolicyEngine::new(vec![Rule {
                priority: 0,
                predicate: Predicate::ToolGlob(".env*".to_string()),
                decision: PolicyDecision::Block,
                label: "deny-dotenv".to_string(),
            }]),
            Duration::from_secs(5),
            FallbackPolicy::AlwaysBlock,
        );
        let result = dispatcher.validate(".env", "{}", &AlwaysApprove);
        assert_eq!(result.decision, ValidationDecision::Blocked);
        assert_eq!(result.tier, Tier::Policy);
    }

    #[test]
    fn test_expert_escalation_on_policy_miss() {
        let dispatcher = SpeedLayerDispatcher::new(
            100,
            PolicyEngine::new(vec![]),
            Duration::from_secs(5),
            FallbackPolicy::AlwaysBlock,
        );
        let result = dispatcher.validate("read_file", "{}", &AlwaysApprove);
        assert_eq!(result.decision, ValidationDecision::Approved);
        assert_eq!(result.tier, Tier::Expert);
    }

    #[test]
    fn test_memory_tier_hits_after_first_decision() {
        let dispatcher = SpeedLayerDispatcher::new(
            100,
            PolicyEngine::new(vec![]),
            Duration::from_secs(5),
            FallbackPolicy::AlwaysBlock,
        );
        let first = dispatcher.validate("read_file", "{}", &AlwaysApprove);
        assert_eq!(first.tier, Tier::Expert);

        let second = dispatcher.validate("read_file", "{}", &AlwaysApprove);
        assert_eq!(second.tier, Tier::Memory);
        assert_eq!(second.decision, ValidationDecision::Approved);
    }

    #[test]
    fn test_expert_failure_applies_fallback() {
        let dispatcher = SpeedLayerDispatcher::new(
            100,
            PolicyEngine::new(vec![]),
            Duration::from_secs(5),
            FallbackPolicy::AlwaysBlock,
        );
        let result = dispatcher.validate("mystery_tool", "{}", &AlwaysFails);
        assert_eq!(result.decision, ValidationDecision::Blocked);
        assert_eq!(result.tier, Tier::Fallback);
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = SpeedLayerDispatcher::fingerprint("read_file", "{\"path\":\"a\"}");
        let b = SpeedLayerDispatcher::fingerprint("read_file", "{\"path\":\"a\"}");
        let c = SpeedLayerDispatcher::fingerprint("read_file", "{\"path\":\"b\"}");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_safe_allow_fallback_approves_safelisted_tool_only() {
        let dispatcher = SpeedLayerDispatcher::new(
            100,
            PolicyEngine::new(vec![]),
            Duration::from_secs(5),
            FallbackPolicy::SafeAllowElseBlock,
        );
        let safe = dispatcher.validate("read_file", "{}", &AlwaysFails);
        assert_eq!(safe.decision, ValidationDecision::Approved);
        assert_eq!(safe.tier, Tier::Fallback);

        let unsafe_result = dispatcher.validate("delete_file", "{}", &AlwaysFails);
        assert_eq!(unsafe_result.decision, ValidationDecision::Blocked);
    }
}
