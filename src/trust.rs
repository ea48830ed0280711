//! Agent trust snapshot.
//!
//! A derived, advisory signal computed from the audit trace. Never an
//! authorization source: it only tightens defaults for low-trust agents,
//! it never grants extra authority to high-trust ones (SPEC_FULL.md §4.11).

use crate::trace::TraceEvent;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum RiskProfile {
    Unknown,
    Low,
    Medium,
    High,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AgentTrustSnapshot {
    pub agent_id: String,
    pub reliability_score: f64,
    pub total_ops: usize,
    pub successful_ops: usize,
    pub failed_ops: usize,
    pub last_active: String,
    pub common_ops: Vec<String>,
    pub risk_profile: RiskProfile,
}

/// Resolve a trust snapshot for `agent_id` by scanning the recent audit
/// trace. Returns a zeroed, `Unknown`-risk snapshot if the trace is absent
/// or the agent has no recorded activity.
pub fn resolve_snapshot(trace_path: &Path, agent_id: &str) -> std::io::Result<AgentTrustSnapshot> {
    if !trace_path.exists() {
        return Ok(empty_snapshot(agent_id));
    }

    let content = std::fs::read_to_string(trace_path)?;
    let mut total = 0usize;
    let mut success = 0usize;
    let mut fail = 0usize;
    let mut last_ts = "never".to_string();
    let mut ops_count: HashMap<String, usize> = HashMap::new();

    for line in content.lines() {
        let Ok(event) = serde_json::from_str::<TraceEvent>(line) else {
            continue;
        };
        if event.agent_id != agent_id {
            continue;
        }
        total += 1;
        last_ts = event.ts.clone();
        *ops_count.entry(event.op.clone()).or_insert(0) += 1;

        if let Some(decision) = event.response.get("decision").and_then(|v| v.as_str()) {
            if decision == "APPROVE" {
                success += 1;
            } else if decision == "BLOCK" {
                fail += 1;
            }
        } else if let Some(ok) = event.response.get("success").and_then(|v| v.as_bool()) {
            if ok {
                success += 1;
            } else {
                fail += 1;
            }
        }
    }

    let reliability = if total > 0 {
        success as f64 / total as f64
    } else {
        0.0
    };

    let mut common_ops: Vec<_> = ops_count.into_iter().collect();
    common_ops.sort_by(|a, b| b.1.cmp(&a.1));
    let common_ops: Vec<String> = common_ops.into_iter().take(5).map(|(op, _)| op).collect();

    let risk_profile = if total < 5 {
        RiskProfile::Unknown
    } else if reliability > 0.9 {
        RiskProfile::Low
    } else if reliability > 0.7 {
        RiskProfile::Medium
    } else {
        RiskProfile::High
    };

    Ok(AgentTrustSnapshot {
        agent_id: agent_id.to_string(),
        reliability_score: reliability,
        total_ops: total,
        successful_ops: success,
        failed_ops: fail,
        last_active: last_ts,
        common_ops,
        risk_profile,
    })
}

fn empty_snapshot(agent_id: &str) -> AgentTrustSnapshot {
    AgentTrustSnapshot {
        agent_id: agent_id.to_string(),
        reliability_score: 0.0,
        total_ops: 0,
        successful_ops: 0,
        failed_ops: 0,
        last_active: "never".to_string(),
        common_ops: vec![],
        risk_profile: RiskProfile::Unknown,
    }
}

/// Effective rate-limit burst multiplier for a risk profile, relative to
/// the administrator-configured default burst size.
///
/// INVARIANT: this function only ever returns a value `<= 1.0`. A trust
/// snapshot can shrink an agent's burst allowance; it can never grow it
/// beyond the configured default.
pub fn burst_multiplier(risk_profile: &RiskProfile) -> f64 {
    match risk_profile {
        RiskProfile::Unknown | RiskProfile::High => 0.5,
        RiskProfile::Medium => 1.0,
        RiskProfile::Low => 1.0,
    }
}
