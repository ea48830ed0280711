//! Elicitation lifecycle: push-based, bounded-latency agent-to-agent
//! requests (SPEC_FULL.md §4.6).
//!
//! Every elicitation carries a nonce; `expected_response_key =
//! H(elicitation_id || to_agent || nonce || broker_secret)` binds the
//! response to exactly one elicitation and one recipient, and the nonce
//! is burned on first use so a captured response cannot be replayed.
//!
//! A single-owner lock per elicitation, not a shared peer mailbox: every
//! lifecycle transition (create/respond/expire/cancel) is serialized
//! through the same `Mutex<Inner>`.

use crate::error::LighthouseError;
use crate::mac;
use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::cmp::Reverse;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ElicitationStatus {
    Pending,
    Delivered,
    Responded,
    Expired,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Elicitation {
    pub elicitation_id: String,
    pub from_agent: String,
    pub to_agent: String,
    pub schema: serde_json::Value,
    pub nonce: String,
    pub created_at_ms: u64,
    pub deadline_ms: u64,
    pub status: ElicitationStatus,
    pub response: Option<serde_json::Value>,
}

impl Elicitation {
    /// Derives this elicitation's per-response key: binds to exactly this
    /// elicitation and recipient, but not yet to any particular answer.
    pub fn expected_response_key(&self, broker_secret: &[u8]) -> String {
        let message = format!(
            "{}|{}|{}",
            self.elicitation_id, self.to_agent, self.nonce
        );
        mac::sign(broker_secret, message.as_bytes())
    }

    /// Computes the signature a responder must present for `payload`:
    /// `MAC(elicitation_id || responding_agent || nonce || payload,
    /// expected_response_key)`. Keying on the derived per-elicitation key
    /// rather than `broker_secret` directly means a leaked response
    /// signature cannot be replayed against a different elicitation, and
    /// including `payload` in the signed message means the signature binds
    /// to this specific answer rather than validating any payload the
    /// responder cares to send.
    pub fn response_signature(
        &self,
        broker_secret: &[u8],
        responding_agent: &str,
        payload: &serde_json::Value,
    ) -> String {
        let key = self.expected_response_key(broker_secret);
        let mut message = format!("{}|{}|{}|", self.elicitation_id, responding_agent, self.nonce).into_bytes();
        message.extend_from_slice(
            &serde_json::to_vec(payload).expect("json values are always serializable"),
        );
        mac::sign(key.as_bytes(), &message)
    }
}

/// Validates `payload` against `schema`. An empty or absent schema (`{}`
/// or `null`) imposes no constraint.
fn validate_against_schema(schema: &serde_json::Value, payload: &serde_json::Value) -> Result<(), LighthouseError> {
    if schema.is_null() || schema.as_object().map(|o| o.is_empty()).unwrap_or(false) {
        return Ok(());
    }
    let compiled = JSONSchema::compile(schema).map_err(|e| {
        LighthouseError::InvalidPayload(format!("elicitation schema is not a valid JSON Schema: {}", e))
    })?;
    compiled.validate(payload).map_err(|errors| {
        let detail = errors.map(|e| e.to_string()).collect::<Vec<_>>().join("; ");
        LighthouseError::InvalidPayload(format!("response payload does not satisfy schema: {}", detail))
    })
}

struct DeadlineEntry {
    deadline_ms: u64,
    elicitation_id: String,
}

impl PartialEq for DeadlineEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_ms == other.deadline_ms
    }
}
impl Eq for DeadlineEntry {}
impl PartialOrd for DeadlineEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for DeadlineEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline_ms.cmp(&other.deadline_ms)
    }
}

struct Inner {
    elicitations: HashMap<String, Elicitation>,
    used_nonces: HashSet<String>,
    deadlines: BinaryHeap<Reverse<DeadlineEntry>>,
}

/// Manages the full elicitation lifecycle under a single lock: creating,
/// responding to, expiring, and cancelling elicitations are all
/// serialized through `inner`.
pub struct ElicitationManager {
    broker_secret: Vec<u8>,
    max_timeout: Duration,
    inner: Mutex<Inner>,
    completion: Condvar,
}

impl ElicitationManager {
    pub fn new(broker_secret: Vec<u8>, max_timeout: Duration) -> Self {
        Self {
            broker_secret,
            max_timeout,
            inner: Mutex::new(Inner {
                elicitations: HashMap::new(),
                used_nonces: HashSet::new(),
                deadlines: BinaryHeap::new(),
            }),
            completion: Condvar::new(),
        }
    }

    pub fn create(
        &self,
        elicitation_id: String,
        from_agent: &str,
        to_agent: &str,
        schema: serde_json::Value,
        timeout: Duration,
    ) -> Result<Elicitation, LighthouseError> {
        if timeout > self.max_timeout {
            return Err(LighthouseError::InvalidPayload(format!(
                "requested timeout {:?} exceeds max {:?}",
                timeout, self.max_timeout
            )));
        }

        let nonce = crate::time::new_correlation_id();
        let created_at_ms = crate::time::now_epoch_ms();
        let deadline_ms = created_at_ms + timeout.as_millis() as u64;

        let elicitation = Elicitation {
            elicitation_id: elicitation_id.clone(),
            from_agent: from_agent.to_string(),
            to_agent: to_agent.to_string(),
            schema,
            nonce,
            created_at_ms,
            deadline_ms,
            status: ElicitationStatus::Pending,
            response: None,
        };

        let mut inner = self.inner.lock().expect("elicitation manager lock poisoned");
        inner.deadlines.push(Reverse(DeadlineEntry {
            deadline_ms,
            elicitation_id: elicitation_id.clone(),
        }));
        inner.elicitations.insert(elicitation_id, elicitation.clone());
        Ok(elicitation)
    }

    /// Marks a just-created elicitation DELIVERED. Delivery is synchronous
    /// in this broker (there is no separate transport hop), so this is
    /// called immediately after `create` succeeds; it is a no-op status
    /// transition for anything already past PENDING.
    pub fn mark_delivered(&self, elicitation_id: &str) -> Result<Elicitation, LighthouseError> {
        let mut inner = self.inner.lock().expect("elicitation manager lock poisoned");
        let entry = inner
            .elicitations
            .get_mut(elicitation_id)
            .ok_or_else(|| LighthouseError::NotFound(format!("no elicitation {}", elicitation_id)))?;
        if entry.status == ElicitationStatus::Pending {
            entry.status = ElicitationStatus::Delivered;
        }
        Ok(entry.clone())
    }

    /// Accepts a response: verifies `response_signature` binds
    /// `responding_agent` and `payload` to this elicitation's
    /// `expected_response_key`, rejects nonce reuse, and validates
    /// `payload` against the elicitation's declared schema.
    pub fn respond(
        &self,
        elicitation_id: &str,
        responding_agent: &str,
        payload: serde_json::Value,
        response_signature: &str,
    ) -> Result<(), LighthouseError> {
        let mut inner = self.inner.lock().expect("elicitation manager lock poisoned");

        let elicitation = inner
            .elicitations
            .get(elicitation_id)
            .ok_or_else(|| LighthouseError::NotFound(format!("no elicitation {}", elicitation_id)))?
            .clone();

        if !matches!(elicitation.status, ElicitationStatus::Pending | ElicitationStatus::Delivered) {
            return Err(LighthouseError::ConflictState(format!(
                "elicitation {} is {:?}, not pending or delivered",
                elicitation_id, elicitation.status
            )));
        }
        if elicitation.to_agent != responding_agent {
            return Err(LighthouseError::Unauthorized(format!(
                "{} is not the addressee of elicitation {}",
                responding_agent, elicitation_id
            )));
        }
        if crate::time::now_epoch_ms() > elicitation.deadline_ms {
            return Err(LighthouseError::Timeout(format!(
                "elicitation {} deadline has passed",
                elicitation_id
            )));
        }
        if inner.used_nonces.contains(&elicitation.nonce) {
            return Err(LighthouseError::ConflictState(
                "nonce already used, rejecting as a replay".to_string(),
            ));
        }

        let expected_signature =
            elicitation.response_signature(&self.broker_secret, responding_agent, &payload);
        if response_signature != expected_signature {
            return Err(LighthouseError::Unauthorized(
                "response_signature does not match the expected response binding".to_string(),
            ));
        }

        validate_against_schema(&elicitation.schema, &payload)?;

        inner.used_nonces.insert(elicitation.nonce.clone());
        let entry = inner
            .elicitations
            .get_mut(elicitation_id)
            .expect("checked above");
        entry.status = ElicitationStatus::Responded;
        entry.response = Some(payload);
        drop(inner);
        self.completion.notify_all();
        Ok(())
    }

    /// Blocks the calling thread until `elicitation_id` leaves PENDING/
    /// DELIVERED (responded, expired, or cancelled) or `timeout` elapses,
    /// whichever is first. Mirrors `ExpertRegistry::wait_for_completion`'s
    /// condvar-over-a-shared-lock shape.
    pub fn await_response(
        &self,
        elicitation_id: &str,
        timeout: Duration,
    ) -> Result<Elicitation, LighthouseError> {
        let guard = self.inner.lock().expect("elicitation manager lock poisoned");
        let (guard, wait_result) = self
            .completion
            .wait_timeout_while(guard, timeout, |inner| {
                inner
                    .elicitations
                    .get(elicitation_id)
                    .map(|e| matches!(e.status, ElicitationStatus::Pending | ElicitationStatus::Delivered))
                    .unwrap_or(false)
            })
            .expect("elicitation manager lock poisoned during wait");

        let elicitation = guard
            .elicitations
            .get(elicitation_id)
            .cloned()
            .ok_or_else(|| LighthouseError::NotFound(format!("no elicitation {}", elicitation_id)))?;
        drop(guard);

        let still_unresolved =
            matches!(elicitation.status, ElicitationStatus::Pending | ElicitationStatus::Delivered);
        if wait_result.timed_out() && still_unresolved {
            return Err(LighthouseError::Timeout(format!(
                "elicitation {} did not resolve within {:?}",
                elicitation_id, timeout
            )));
        }
        Ok(elicitation)
    }

    /// Non-blocking: every still-unresolved (PENDING or DELIVERED)
    /// elicitation addressed to `agent_id`, for polling-style clients that
    /// would rather not block a thread on `await_response`.
    pub fn pending_for(&self, agent_id: &str) -> Vec<Elicitation> {
        self.inner
            .lock()
            .expect("elicitation manager lock poisoned")
            .elicitations
            .values()
            .filter(|e| {
                e.to_agent == agent_id
                    && matches!(e.status, ElicitationStatus::Pending | ElicitationStatus::Delivered)
            })
            .cloned()
            .collect()
    }

    pub fn get(&self, elicitation_id: &str) -> Option<Elicitation> {
        self.inner
            .lock()
            .expect("elicitation manager lock poisoned")
            .elicitations
            .get(elicitation_id)
            .cloned()
    }

    pub fn cancel(&self, elicitation_id: &str) -> Result<(), LighthouseError> {
        let mut inner = self.inner.lock().expect("elicitation manager lock poisoned");
        let entry = inner
            .elicitations
            .get_mut(elicitation_id)
            .ok_or_else(|| LighthouseError::NotFound(format!("no elicitation {}", elicitation_id)))?;
        if !matches!(entry.status, ElicitationStatus::Pending | ElicitationStatus::Delivered) {
            return Err(LighthouseError::ConflictState(format!(
                "elicitation {} is {:?}, cannot cancel",
                elicitation_id, entry.status
            )));
        }
        entry.status = ElicitationStatus::Cancelled;
        drop(inner);
        self.completion.notify_all();
        Ok(())
    }

    /// Walks the deadline queue and marks any still-pending elicitation
    /// whose deadline has passed as `EXPIRED`. Returns the ids expired.
    pub fn sweep_expired(&self) -> Vec<String> {
        let now = crate::time::now_epoch_ms();
        let mut inner = self.inner.lock().expect("elicitation manager lock poisoned");
        let mut expired = Vec::new();

        while let Some(Reverse(entry)) = inner.deadlines.peek() {
            if entry.deadline_ms > now {
                break;
            }
            let Reverse(entry) = inner.deadlines.pop().unwrap();
            if let Some(elicitation) = inner.elicitations.get_mut(&entry.elicitation_id) {
                if matches!(elicitation.status, ElicitationStatus::Pending | ElicitationStatus::Delivered) {
                    elicitation.status = ElicitationStatus::Expired;
                    expired.push(entry.elicitation_id);
                }
            }
        }
        drop(inner);
        if !expired.is_empty() {
            self.completion.notify_all();
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ElicitationManager {
        ElicitationManager::new(b"broker-secret".to_vec(), Duration::from_secs(300))
    }

    #[test]
    fn test_create_rejects_timeout_over_max() {
        let manager = manager();
        let result = manager.create(
            "elic-1".to_string(),
            "agent-a",
            "agent-b",
            serde_json::json!({}),
            Duration::from_secs(400),
        );
        assert!(matches!(result, Err(LighthouseError::InvalidPayload(_))));
    }

    #[test]
    fn test_respond_with_correct_signature_succeeds() {
        let manager = manager();
        let elicitation = manager
            .create(
                "elic-1".to_string(),
                "agent-a",
                "agent-b",
                serde_json::json!({"type": "object"}),
                Duration::from_secs(30),
            )
            .unwrap();

        let payload = serde_json::json!({"answer": 42});
        let signature = elicitation.response_signature(b"broker-secret", "agent-b", &payload);
        let result = manager.respond("elic-1", "agent-b", payload, &signature);
        assert!(result.is_ok());

        let updated = manager.get("elic-1").unwrap();
        assert_eq!(updated.status, ElicitationStatus::Responded);
    }

    #[test]
    fn test_respond_with_wrong_signature_rejected() {
        let manager = manager();
        manager
            .create(
                "elic-1".to_string(),
                "agent-a",
                "agent-b",
                serde_json::json!({}),
                Duration::from_secs(30),
            )
            .unwrap();

        let result = manager.respond("elic-1", "agent-b", serde_json::json!({}), "bad-signature");
        assert!(matches!(result, Err(LighthouseError::Unauthorized(_))));
    }

    #[test]
    fn test_respond_from_wrong_agent_rejected() {
        let manager = manager();
        let elicitation = manager
            .create(
                "elic-1".to_string(),
                "agent-a",
                "agent-b",
                serde_json::json!({}),
                Duration::from_secs(30),
            )
            .unwrap();
        let signature = elicitation.response_signature(b"broker-secret", "agent-b", &serde_json::json!({}));

        let result = manager.respond("elic-1", "agent-c", serde_json::json!({}), &signature);
        assert!(matches!(result, Err(LighthouseError::Unauthorized(_))));
    }

    #[test]
    fn test_double_respond_rejected_as_conflict() {
        let manager = manager();
        let elicitation = manager
            .create(
                "elic-1".to_string(),
                "agent-a",
                "agent-b",
                serde_json::json!({}),
                Duration::from_secs(30),
            )
            .unwrap();
        let signature = elicitation.response_signature(b"broker-secret", "agent-b", &serde_json::json!({}));

        manager
            .respond("elic-1", "agent-b", serde_json::json!({}), &signature)
            .unwrap();
        let result = manager.respond("elic-1", "agent-b", serde_json::json!({}), &signature);
        assert!(matches!(result, Err(LighthouseError::ConflictState(_))));
    }

    #[test]
    fn test_sweep_expired_marks_past_deadline_elicitations() {
        let manager = manager();
        manager
            .create(
                "elic-1".to_string(),
                "agent-a",
                "agent-b",
                serde_json::json!({}),
                Duration::from_millis(10),
            )
            .unwrap();

        std::thread::sleep(Duration::from_millis(30));
        let expired = manager.sweep_expired();
        assert_eq!(expired, vec!["elic-1".to_string()]);
        assert_eq!(manager.get("elic-1").unwrap().status, ElicitationStatus::Expired);
    }

    #[test]
    fn test_pending_for_lists_only_that_agents_pending_elicitations() {
        let manager = manager();
        manager
            .create("elic-1".to_string(), "agent-a", "agent-b", serde_json::json!({}), Duration::from_secs(30))
            .unwrap();
        manager
            .create("elic-2".to_string(), "agent-a", "agent-c", serde_json::json!({}), Duration::from_secs(30))
            .unwrap();

        let pending_b = manager.pending_for("agent-b");
        assert_eq!(pending_b.len(), 1);
        assert_eq!(pending_b[0].elicitation_id, "elic-1");
    }

    #[test]
    fn test_await_response_returns_once_responded() {
        use std::sync::Arc;
        let manager = Arc::new(manager());
        let elicitation = manager
            .create("elic-1".to_string(), "agent-a", "agent-b", serde_json::json!({}), Duration::from_secs(30))
            .unwrap();
        let payload = serde_json::json!({"answer": 1});
        let signature = elicitation.response_signature(b"broker-secret", "agent-b", &payload);

        let manager_clone = Arc::clone(&manager);
        let handle = std::thread::spawn(move || {
            manager_clone.await_response("elic-1", Duration::from_secs(5))
        });

        std::thread::sleep(Duration::from_millis(30));
        manager
            .respond("elic-1", "agent-b", payload, &signature)
            .unwrap();

        let result = handle.join().unwrap().unwrap();
        assert_eq!(result.status, ElicitationStatus::Responded);
    }

    #[test]
    fn test_await_response_times_out_while_still_pending() {
        let manager = manager();
        manager
            .create("elic-1".to_string(), "agent-a", "agent-b", serde_json::json!({}), Duration::from_secs(30))
            .unwrap();
        let result = manager.await_response("elic-1", Duration::from_millis(20));
        assert!(matches!(result, Err(LighthouseError::Timeout(_))));
    }

    #[test]
    fn test_cancel_pending_elicitation() {
        let manager = manager();
        manager
            .create(
                "elic-1".to_string(),
                "agent-a",
                "agent-b",
                serde_json::json!({}),
                Duration::from_secs(30),
            )
            .unwrap();
        manager.cancel("elic-1").unwrap();
        assert_eq!(manager.get("elic-1").unwrap().status, ElicitationStatus::Cancelled);
    }

    #[test]
    fn test_mark_delivered_transitions_pending_to_delivered() {
        let manager = manager();
        manager
            .create("elic-1".to_string(), "agent-a", "agent-b", serde_json::json!({}), Duration::from_secs(30))
            .unwrap();
        let delivered = manager.mark_delivered("elic-1").unwrap();
        assert_eq!(delivered.status, ElicitationStatus::Delivered);
    }

    #[test]
    fn test_respond_accepted_from_delivered_state() {
        let manager = manager();
        let elicitation = manager
            .create("elic-1".to_string(), "agent-a", "agent-b", serde_json::json!({}), Duration::from_secs(30))
            .unwrap();
        manager.mark_delivered("elic-1").unwrap();

        let payload = serde_json::json!({"answer": true});
        let signature = elicitation.response_signature(b"broker-secret", "agent-b", &payload);
        let result = manager.respond("elic-1", "agent-b", payload, &signature);
        assert!(result.is_ok());
    }

    #[test]
    fn test_respond_with_payload_not_matching_schema_rejected() {
        let manager = manager();
        let elicitation = manager
            .create(
                "elic-1".to_string(),
                "agent-a",
                "agent-b",
                serde_json::json!({"type": "object", "required": ["answer"]}),
                Duration::from_secs(30),
            )
            .unwrap();

        let payload = serde_json::json!({"wrong_field": 1});
        let signature = elicitation.response_signature(b"broker-secret", "agent-b", &payload);
        let result = manager.respond("elic-1", "agent-b", payload, &signature);
        assert!(matches!(result, Err(LighthouseError::InvalidPayload(_))));
    }

    #[test]
    fn test_signature_does_not_validate_a_different_payload() {
        let manager = manager();
        let elicitation = manager
            .create("elic-1".to_string(), "agent-a", "agent-b", serde_json::json!({}), Duration::from_secs(30))
            .unwrap();

        let signature = elicitation.response_signature(
            b"broker-secret",
            "agent-b",
            &serde_json::json!({"answer": 1}),
        );
        // Same signature, different payload: must not validate.
        let result = manager.respond("elic-1", "agent-b", serde_json::json!({"answer": 2}), &signature);
        assert!(matches!(result, Err(LighthouseError::Unauthorized(_))));
    }
}
