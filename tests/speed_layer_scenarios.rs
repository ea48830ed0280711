//! End-to-end speed-layer scenarios lifted directly from SPEC_FULL.md §8.

use lighthouse_broker::core::circuit_breaker::CircuitBreaker;
use lighthouse_broker::core::policy::{Decision, PolicyEngine, Predicate, Rule};
use lighthouse_broker::core::speed_layer::{
    ExpertEscalator, SpeedLayerDispatcher, Tier, ValidationDecision,
};
use lighthouse_broker::config::FallbackPolicy;
use lighthouse_broker::error::LighthouseError;
use std::time::Duration;

struct NoExpertRegistered;
impl ExpertEscalator for NoExpertRegistered {
    fn escalate(
        &self,
        _fingerprint: &str,
        _tool_name: &str,
        _args: &str,
        _timeout: Duration,
    ) -> Result<ValidationDecision, LighthouseError> {
        Err(LighthouseError::Timeout("no expert registered".to_string()))
    }
}

fn safelist_policy() -> PolicyEngine {
    PolicyEngine::new(vec![
        Rule {
            priority: 0,
            predicate: Predicate::ToolGlob("Read".to_string()),
            decision: Decision::Allow,
            label: "safe tool".to_string(),
        },
        Rule {
            priority: 1,
            predicate: Predicate::ArgPattern(regex::Regex::new(r"rm -rf").unwrap()),
            decision: Decision::Block,
            label: "matches protected-path denylist".to_string(),
        },
    ])
}

// Scenario 1: happy path validation.
#[test]
fn happy_path_read_is_approved_by_the_policy_tier() {
    let dispatcher = SpeedLayerDispatcher::new(
        1000,
        safelist_policy(),
        Duration::from_secs(5),
        FallbackPolicy::AlwaysBlock,
    );

    let result = dispatcher.validate(
        "Read",
        r#"{"path": "./README.md"}"#,
        &NoExpertRegistered,
    );

    assert_eq!(result.decision, ValidationDecision::Approved);
    assert_eq!(result.tier, Tier::Policy);
    assert!(result.latency_ms <= 5);
}

// Scenario 2: denylist block, no escalation.
#[test]
fn denylist_block_short_circuits_before_expert_tier() {
    let dispatcher = SpeedLayerDispatcher::new(
        1000,
        safelist_policy(),
        Duration::from_secs(5),
        FallbackPolicy::AlwaysBlock,
    );

    let result = dispatcher.validate(
        "Bash",
        r#"{"command": "rm -rf /"}"#,
        &NoExpertRegistered,
    );

    assert_eq!(result.decision, ValidationDecision::Blocked);
    assert_eq!(result.tier, Tier::Policy);
}

// Scenario 3: expert escalation with timeout fallback, AlwaysBlock policy.
#[test]
fn unmatched_tool_escalates_then_falls_back_to_block() {
    // No rule matches "Bash" with a non-rm command, so the policy tier
    // defers and the dispatcher must reach the expert tier.
    let dispatcher = SpeedLayerDispatcher::new(
        1000,
        safelist_policy(),
        Duration::from_millis(50),
        FallbackPolicy::AlwaysBlock,
    );

    let result = dispatcher.validate(
        "Bash",
        r#"{"command": "sudo apt update"}"#,
        &NoExpertRegistered,
    );

    assert_eq!(result.decision, ValidationDecision::Blocked);
    assert_eq!(result.tier, Tier::Fallback);
}

#[test]
fn safe_allow_else_block_approves_only_the_builtin_safelist_on_fallback() {
    let dispatcher = SpeedLayerDispatcher::new(
        1000,
        safelist_policy(),
        Duration::from_millis(50),
        FallbackPolicy::SafeAllowElseBlock,
    );

    let safe = dispatcher.validate("read_file", "{}", &NoExpertRegistered);
    assert_eq!(safe.decision, ValidationDecision::Approved);
    assert_eq!(safe.tier, Tier::Fallback);

    let unsafe_tool = dispatcher.validate("write_file", "{}", &NoExpertRegistered);
    assert_eq!(unsafe_tool.decision, ValidationDecision::Blocked);
}

#[test]
fn memory_cache_hit_is_fast_and_repeats_the_original_decision() {
    let dispatcher = SpeedLayerDispatcher::new(
        1000,
        safelist_policy(),
        Duration::from_secs(5),
        FallbackPolicy::AlwaysBlock,
    );

    let first = dispatcher.validate("Read", r#"{"path":"a"}"#, &NoExpertRegistered);
    assert_eq!(first.tier, Tier::Policy);

    let second = dispatcher.validate("Read", r#"{"path":"a"}"#, &NoExpertRegistered);
    assert_eq!(second.tier, Tier::Memory);
    assert_eq!(second.decision, first.decision);
    assert!(second.latency_ms <= 1);
}

#[test]
fn open_circuit_breaker_skips_a_tier_rather_than_failing_the_request() {
    let breaker = CircuitBreaker::new(0.1, 1, Duration::from_secs(60));
    for _ in 0..5 {
        breaker.record_failure();
    }
    assert!(!breaker.allow());
}
