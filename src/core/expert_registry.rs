//! Expert registration, heartbeat liveness, and task delegation
//! (SPEC_FULL.md §4.5).
//!
//! Experts register (after authenticating), send periodic heartbeats, and
//! accept delegated validation tasks on a weighted least-load basis with
//! round-robin tiebreak. Escalation is one-shot: a timed-out delegation
//! does not retry against a second expert (see `DESIGN.md` for the
//! rationale).

use crate::core::speed_layer::{ExpertEscalator, ValidationDecision};
use crate::error::LighthouseError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ExpertEntry {
    pub agent_id: String,
    pub weight: u32,
    pub in_flight: u32,
    pub last_heartbeat: Instant,
}

struct PendingTask {
    agent_id: String,
    decision: Option<ValidationDecision>,
}

pub struct ExpertRegistry {
    heartbeat_ttl: Duration,
    experts: Mutex<HashMap<String, ExpertEntry>>,
    round_robin_cursor: AtomicU64,
    pending: Mutex<HashMap<String, PendingTask>>,
    completion: Condvar,
}

impl ExpertRegistry {
    pub fn new(heartbeat_ttl: Duration) -> Self {
        Self {
            heartbeat_ttl,
            experts: Mutex::new(HashMap::new()),
            round_robin_cursor: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            completion: Condvar::new(),
        }
    }

    pub fn register(&self, agent_id: &str, weight: u32) {
        self.experts.lock().expect("expert registry lock poisoned").insert(
            agent_id.to_string(),
            ExpertEntry {
                agent_id: agent_id.to_string(),
                weight: weight.max(1),
                in_flight: 0,
                last_heartbeat: Instant::now(),
            },
        );
    }

    pub fn heartbeat(&self, agent_id: &str) -> Result<(), LighthouseError> {
        let mut experts = self.experts.lock().expect("expert registry lock poisoned");
        let entry = experts
            .get_mut(agent_id)
            .ok_or_else(|| LighthouseError::NotFound(format!("expert {} not registered", agent_id)))?;
        entry.last_heartbeat = Instant::now();
        Ok(())
    }

    pub fn mark_offline(&self, agent_id: &str) {
        self.experts.lock().expect("expert registry lock poisoned").remove(agent_id);
    }

    /// Drops experts whose heartbeat is older than `heartbeat_ttl`.
    pub fn sweep_offline(&self) -> Vec<String> {
        let mut experts = self.experts.lock().expect("expert registry lock poisoned");
        let offline: Vec<String> = experts
            .values()
            .filter(|e| e.last_heartbeat.elapsed() > self.heartbeat_ttl)
            .map(|e| e.agent_id.clone())
            .collect();
        for agent_id in &offline {
            experts.remove(agent_id);
        }
        offline
    }

    /// Picks the expert with the lowest `in_flight / weight` ratio,
    /// breaking ties round-robin over the tied set. Returns `None` if no
    /// experts are registered.
    fn pick_expert(&self) -> Option<String> {
        let experts = self.experts.lock().expect("expert registry lock poisoned");
        if experts.is_empty() {
            return None;
        }

        let min_load = experts
            .values()
            .map(|e| e.in_flight as f64 / e.weight as f64)
            .fold(f64::INFINITY, f64::min);

        let mut tied: Vec<&String> = experts
            .values()
            .filter(|e| (e.in_flight as f64 / e.weight as f64 - min_load).abs() < f64::EPSILON)
            .map(|e| &e.agent_id)
            .collect();
        tied.sort();

        let cursor = self.round_robin_cursor.fetch_add(1, Ordering::SeqCst) as usize;
        tied.get(cursor % tied.len()).map(|s| s.to_string())
    }

    /// Picks the least-loaded expert, marks it busy, and registers
    /// `fingerprint` as a pending task — without waiting for `complete` to
    /// be called. Used by the non-blocking `delegate_task` RPC, where the
    /// caller gets a task id back immediately and the result surfaces later
    /// as an `EXPERT_COMPLETED` event.
    pub fn submit(&self, fingerprint: &str) -> Result<String, LighthouseError> {
        let agent_id = self
            .pick_expert()
            .ok_or_else(|| LighthouseError::Transient("no experts available".to_string()))?;

        {
            let mut experts = self.experts.lock().expect("expert registry lock poisoned");
            if let Some(entry) = experts.get_mut(&agent_id) {
                entry.in_flight += 1;
            }
        }
        self.pending.lock().expect("pending tasks lock poisoned").insert(
            fingerprint.to_string(),
            PendingTask {
                agent_id: agent_id.clone(),
                decision: None,
            },
        );
        Ok(agent_id)
    }

    /// Delegates `fingerprint` to the least-loaded expert and blocks up to
    /// `timeout` waiting for `complete` to be called for it. One attempt
    /// only: on timeout this returns `LighthouseError::Timeout` without
    /// trying a different expert.
    pub fn delegate(
        &self,
        fingerprint: &str,
        timeout: Duration,
    ) -> Result<ValidationDecision, LighthouseError> {
        let agent_id = self.submit(fingerprint)?;
        let result = self.wait_for_completion(fingerprint, timeout);
        self.pending.lock().expect("pending tasks lock poisoned").remove(fingerprint);

        // `complete()` already released the expert's load on success; a
        // timed-out task was never resolved, so the release happens here.
        if result.is_err() {
            let mut experts = self.experts.lock().expect("expert registry lock poisoned");
            if let Some(entry) = experts.get_mut(&agent_id) {
                entry.in_flight = entry.in_flight.saturating_sub(1);
            }
        }

        result
    }

    fn wait_for_completion(
        &self,
        fingerprint: &str,
        timeout: Duration,
    ) -> Result<ValidationDecision, LighthouseError> {
        let guard = self.pending.lock().expect("pending tasks lock poisoned");
        let (guard, wait_result) = self
            .completion
            .wait_timeout_while(guard, timeout, |pending| {
                pending
                    .get(fingerprint)
                    .map(|task| task.decision.is_none())
                    .unwrap_or(false)
            })
            .expect("pending tasks lock poisoned during wait");

        if wait_result.timed_out() {
            return Err(LighthouseError::Timeout(format!(
                "expert escalation for {} exceeded {:?}",
                fingerprint, timeout
            )));
        }

        guard
            .get(fingerprint)
            .and_then(|task| task.decision)
            .ok_or_else(|| LighthouseError::Transient("expert task vanished".to_string()))
    }

    /// Called by the expert (via RPC) to resolve a delegated task. Releases
    /// the expert's load immediately; `delegate`'s caller (if any is still
    /// waiting) picks up the decision from the pending-task map.
    pub fn complete(
        &self,
        fingerprint: &str,
        decision: ValidationDecision,
    ) -> Result<(), LighthouseError> {
        let mut pending = self.pending.lock().expect("pending tasks lock poisoned");
        let task = pending
            .get_mut(fingerprint)
            .ok_or_else(|| LighthouseError::NotFound(format!("no pending task for {}", fingerprint)))?;
        task.decision = Some(decision);
        let agent_id = task.agent_id.clone();
        drop(pending);

        {
            let mut experts = self.experts.lock().expect("expert registry lock poisoned");
            if let Some(entry) = experts.get_mut(&agent_id) {
                entry.in_flight = entry.in_flight.saturating_sub(1);
            }
        }
        self.completion.notify_all();
        Ok(())
    }

    pub fn registered_count(&self) -> usize {
        self.experts.lock().expect("expert registry lock poisoned").len()
    }
}

/// Wraps an `ExpertRegistry` so the speed-layer dispatcher can treat it as
/// an `ExpertEscalator` without the dispatcher module depending on the
/// registry's full API surface.
pub struct RegistryEscalator<'a>(pub &'a ExpertRegistry);

impl ExpertEscalator for RegistryEscalator<'_> {
    fn escalate(
        &self,
        fingerprint: &str,
        _tool_name: &str,
        _args: &str,
        timeout: Duration,
    ) -> Result<ValidationDecision, LighthouseError> {
        self.0.delegate(fingerprint, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_register_and_heartbeat() {
        let registry = ExpertRegistry::new(Duration::from_secs(30));
        registry.register("expert-1", 1);
        assert!(registry.heartbeat("expert-1").is_ok());
        assert_eq!(registry.registered_count(), 1);
    }

    #[test]
    fn test_heartbeat_unknown_expert_fails() {
        let registry = ExpertRegistry::new(Duration::from_secs(30));
        assert!(matches!(
            registry.heartbeat("ghost"),
            Err(LighthouseError::NotFound(_))
        ));
    }

    #[test]
    fn test_sweep_offline_removes_stale_experts() {
        let registry = ExpertRegistry::new(Duration::from_millis(10));
        registry.register("expert-1", 1);
        std::thread::sleep(Duration::from_millis(30));
        let offline = registry.sweep_offline();
        assert_eq!(offline, vec!["expert-1".to_string()]);
        assert_eq!(registry.registered_count(), 0);
    }

    #[test]
    fn test_delegate_times_out_without_completion() {
        let registry = ExpertRegistry::new(Duration::from_secs(30));
        registry.register("expert-1", 1);
        let result = registry.delegate("fp-1", Duration::from_millis(20));
        assert!(matches!(result, Err(LighthouseError::Timeout(_))));
    }

    #[test]
    fn test_delegate_with_no_experts_is_transient() {
        let registry = ExpertRegistry::new(Duration::from_secs(30));
        let result = registry.delegate("fp-1", Duration::from_millis(20));
        assert!(matches!(result, Err(LighthouseError::Transient(_))));
    }

    #[test]
    fn test_complete_resolves_waiting_delegate() {
        let registry = Arc::new(ExpertRegistry::new(Duration::from_secs(30)));
        registry.register("expert-1", 1);

        let registry_clone = Arc::clone(&registry);
        let handle = thread::spawn(move || registry_clone.delegate("fp-1", Duration::from_secs(5)));

        // Give the delegate call time to register the pending task.
        std::thread::sleep(Duration::from_millis(50));
        registry.complete("fp-1", ValidationDecision::Approved).unwrap();

        let result = handle.join().unwrap();
        assert_eq!(result.unwrap(), ValidationDecision::Approved);
    }

    #[test]
    fn test_submit_returns_immediately_without_waiting() {
        let registry = ExpertRegistry::new(Duration::from_secs(30));
        registry.register("expert-1", 1);
        let agent_id = registry.submit("task-1").unwrap();
        assert_eq!(agent_id, "expert-1");
    }

    #[test]
    fn test_submit_then_complete_releases_expert_load() {
        let registry = ExpertRegistry::new(Duration::from_secs(30));
        registry.register("expert-1", 1);
        registry.submit("task-1").unwrap();

        // expert-1 is now busy; a second submit still picks it (only
        // expert registered) but its load ratio would be nonzero until
        // complete() releases it.
        registry.complete("task-1", ValidationDecision::Approved).unwrap();
        let experts = registry.experts.lock().unwrap();
        assert_eq!(experts.get("expert-1").unwrap().in_flight, 0);
    }

    #[test]
    fn test_least_loaded_expert_picked_first() {
        let registry = ExpertRegistry::new(Duration::from_secs(30));
        registry.register("expert-a", 1);
        registry.register("expert-b", 10);
        // expert-b has far more weight, so it should be preferred while
        // both are at zero in_flight (lower load ratio).
        let picked = registry.pick_expert().unwrap();
        assert_eq!(picked, "expert-b");
    }
}
