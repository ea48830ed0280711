//! The broker: the single entry point every operation in SPEC_FULL.md §6
//! goes through.
//!
//! This is the thin waist: every subsystem is constructed once at
//! `Broker::open` and handed out by shared reference, so nothing downstream
//! constructs its own copy of authenticator/event-log/session state.

use crate::config::BrokerConfig;
use crate::core::authenticator::{AgentIdentity, CoordinatedAuthenticator, Permission, Role};
use crate::core::elicitation::{Elicitation, ElicitationManager};
use crate::core::event_log::{Event, EventDraft, EventFilter, EventKind, EventStore, RecoveryReport};
use crate::core::expert_registry::{ExpertRegistry, RegistryEscalator};
use crate::core::policy::PolicyEngine;
use crate::core::projection::ProjectionEngine;
use crate::core::session::{Session, SessionValidator, ValidationOutcome};
use crate::core::speed_layer::{SpeedLayerDispatcher, Tier, ValidationDecision, ValidationResult};
use crate::error::LighthouseError;
use crate::trace;
use std::path::Path;
use std::time::Duration;

/// Wires every subsystem together. `Broker::open` is the only place that
/// constructs them; every RPC handler in `core::rpc` takes a `&Broker`
/// and nothing else.
pub struct Broker {
    pub config: BrokerConfig,
    pub authenticator: CoordinatedAuthenticator,
    pub sessions: SessionValidator,
    pub events: EventStore,
    pub speed_layer: SpeedLayerDispatcher,
    pub experts: ExpertRegistry,
    pub elicitations: ElicitationManager,
}

impl Broker {
    pub fn open(config: BrokerConfig) -> Result<(Self, RecoveryReport), LighthouseError> {
        let (events, recovery) = EventStore::open(
            &config.events_dir(),
            &config.node_id,
            config.broker_secret.clone(),
            config.segment_size,
            config.subscription_buffer_size,
        )?;

        let policy = load_policy(&config)?;
        let speed_layer = SpeedLayerDispatcher::new(
            config.memory_cache_size,
            policy,
            Duration::from_secs(config.expert_timeout_seconds),
            config.fallback_policy.clone(),
        );

        let broker = Self {
            authenticator: CoordinatedAuthenticator::new(config.broker_secret.clone()),
            sessions: SessionValidator::new(
                config.broker_secret.clone(),
                Duration::from_secs(config.session_ttl_seconds),
            ),
            events,
            speed_layer,
            experts: ExpertRegistry::new(Duration::from_secs(60)),
            elicitations: ElicitationManager::new(
                config.broker_secret.clone(),
                Duration::from_secs(config.elicitation_max_timeout_seconds),
            ),
            config,
        };

        Ok((broker, recovery))
    }

    pub fn projection(&self) -> ProjectionEngine<'_> {
        ProjectionEngine::new(&self.events)
    }

    pub fn register_agent(&self, agent_id: &str, role: Role) -> String {
        self.record_trace("register_agent", agent_id, &serde_json::json!({"role": format!("{:?}", role)}));
        let token = self.authenticator.register(agent_id, role);
        let _ = self.events.append(EventDraft {
            kind: EventKind::AgentJoined,
            aggregate_id: agent_id.to_string(),
            payload: serde_json::json!({"role": format!("{:?}", role)}),
            correlation_id: None,
            causation_id: None,
        });
        token
    }

    pub fn authenticate(&self, agent_id: &str, token: &str) -> Result<AgentIdentity, LighthouseError> {
        self.authenticator.authenticate(agent_id, token)
    }

    /// Revokes `agent_id`'s registered identity; any subsequent
    /// authenticate call for it fails afterward.
    pub fn invalidate_agent(&self, identity: &AgentIdentity, agent_id: &str) -> Result<(), LighthouseError> {
        self.authenticator.require(identity, Permission::Admin)?;
        self.authenticator.invalidate(agent_id);
        self.events.append(EventDraft {
            kind: EventKind::AgentLeft,
            aggregate_id: agent_id.to_string(),
            payload: serde_json::json!({}),
            correlation_id: None,
            causation_id: None,
        })?;
        Ok(())
    }

    pub fn create_session(
        &self,
        identity: &AgentIdentity,
        client_ip: &str,
        user_agent: &str,
    ) -> Session {
        self.sessions.create_session(identity, client_ip, user_agent)
    }

    pub fn validate_session(
        &self,
        token: &str,
        client_ip: &str,
        user_agent: &str,
    ) -> Result<ValidationOutcome, LighthouseError> {
        let outcome = self.sessions.validate(token, client_ip, user_agent)?;
        if let ValidationOutcome::HijackSuspected { agent_id, reason } = &outcome {
            self.events.append(EventDraft {
                kind: EventKind::SessionHijackAttempt,
                aggregate_id: agent_id.clone(),
                payload: serde_json::json!({"reason": reason}),
                correlation_id: None,
                causation_id: None,
            })?;
        }
        Ok(outcome)
    }

    pub fn store_event(
        &self,
        identity: &AgentIdentity,
        draft: EventDraft,
    ) -> Result<(String, u64), LighthouseError> {
        self.authenticator.require(identity, Permission::EventsWrite)?;
        self.events.append(draft)
    }

    pub fn query_events(&self, identity: &AgentIdentity, filter: &EventFilter) -> Result<Vec<Event>, LighthouseError> {
        self.authenticator.require(identity, Permission::EventsQuery)?;
        Ok(self.events.query(filter))
    }

    /// Opens a live channel of future events matching `filter`. A full
    /// channel drops the subscriber rather than blocking the writer (see
    /// `EventStore::subscribe`).
    pub fn subscribe_events(
        &self,
        identity: &AgentIdentity,
        filter: EventFilter,
    ) -> Result<std::sync::mpsc::Receiver<Event>, LighthouseError> {
        self.authenticator.require(identity, Permission::EventsQuery)?;
        Ok(self.events.subscribe(filter))
    }

    /// Runs a tool invocation through the speed layer, recording the
    /// decision as a `COMMAND_APPROVED`/`COMMAND_BLOCKED`/`COMMAND_ESCALATED`
    /// event.
    pub fn validate_command(
        &self,
        identity: &AgentIdentity,
        tool_name: &str,
        args: &str,
    ) -> Result<ValidationResult, LighthouseError> {
        self.authenticator.require(identity, Permission::CommandExecute)?;

        let correlation_id = crate::time::new_correlation_id();
        self.events.append(EventDraft {
            kind: EventKind::CommandReceived,
            aggregate_id: identity.agent_id.clone(),
            payload: serde_json::json!({"tool_name": tool_name}),
            correlation_id: Some(correlation_id.clone()),
            causation_id: None,
        })?;

        let escalator = RegistryEscalator(&self.experts);
        let result = self.speed_layer.validate(tool_name, args, &escalator);

        if matches!(result.tier, Tier::Expert | Tier::Fallback) {
            self.events.append(EventDraft {
                kind: EventKind::CommandEscalated,
                aggregate_id: identity.agent_id.clone(),
                payload: serde_json::json!({
                    "tool_name": tool_name,
                    "tier": format!("{:?}", result.tier),
                }),
                correlation_id: Some(correlation_id.clone()),
                causation_id: None,
            })?;
        }

        let kind = match result.decision {
            ValidationDecision::Approved => EventKind::CommandApproved,
            ValidationDecision::Blocked => EventKind::CommandBlocked,
        };
        self.events.append(EventDraft {
            kind,
            aggregate_id: identity.agent_id.clone(),
            payload: serde_json::json!({
                "tool_name": tool_name,
                "tier": format!("{:?}", result.tier),
                "reason": result.reason,
                "latency_ms": result.latency_ms,
            }),
            correlation_id: Some(correlation_id),
            causation_id: None,
        })?;

        Ok(result)
    }

    pub fn register_expert(&self, identity: &AgentIdentity, weight: u32) -> Result<(), LighthouseError> {
        self.authenticator.require(identity, Permission::ExpertCoordinate)?;
        self.experts.register(&identity.agent_id, weight);
        self.events.append(EventDraft {
            kind: EventKind::ExpertRegistered,
            aggregate_id: identity.agent_id.clone(),
            payload: serde_json::json!({"weight": weight}),
            correlation_id: None,
            causation_id: None,
        })?;
        Ok(())
    }

    /// Explicit task delegation, distinct from `validate_command`'s
    /// implicit speed-layer escalation: returns `task_id` immediately
    /// without blocking. The requester learns the outcome by observing the
    /// `EXPERT_COMPLETED` event for `task_id`, via `query_events` or
    /// `subscribe_events`.
    pub fn delegate_task(
        &self,
        identity: &AgentIdentity,
        task: serde_json::Value,
        required_capabilities: Vec<String>,
        priority: u32,
    ) -> Result<String, LighthouseError> {
        self.authenticator.require(identity, Permission::ExpertCoordinate)?;
        let task_id = crate::time::new_correlation_id();
        let expert_agent_id = self.experts.submit(&task_id)?;
        self.events.append(EventDraft {
            kind: EventKind::ExpertDelegated,
            aggregate_id: task_id.clone(),
            payload: serde_json::json!({
                "requester": identity.agent_id,
                "expert": expert_agent_id,
                "task": task,
                "required_capabilities": required_capabilities,
                "priority": priority,
            }),
            correlation_id: Some(task_id.clone()),
            causation_id: None,
        })?;
        Ok(task_id)
    }

    pub fn complete_task(
        &self,
        identity: &AgentIdentity,
        fingerprint: &str,
        decision: ValidationDecision,
    ) -> Result<(), LighthouseError> {
        self.authenticator.require(identity, Permission::CommandValidate)?;
        self.experts.complete(fingerprint, decision)?;
        self.events.append(EventDraft {
            kind: EventKind::ExpertCompleted,
            aggregate_id: identity.agent_id.clone(),
            payload: serde_json::json!({"fingerprint": fingerprint}),
            correlation_id: None,
            causation_id: None,
        })?;
        Ok(())
    }

    pub fn create_elicitation(
        &self,
        identity: &AgentIdentity,
        elicitation_id: String,
        to_agent: &str,
        schema: serde_json::Value,
        timeout: Duration,
    ) -> Result<Elicitation, LighthouseError> {
        self.authenticator.require(identity, Permission::ExpertCoordinate)?;
        let elicitation = self
            .elicitations
            .create(elicitation_id, &identity.agent_id, to_agent, schema, timeout)?;
        self.events.append(EventDraft {
            kind: EventKind::ElicitationCreated,
            aggregate_id: elicitation.elicitation_id.clone(),
            payload: serde_json::json!({"from": identity.agent_id, "to": to_agent}),
            correlation_id: None,
            causation_id: None,
        })?;
        let delivered = self.elicitations.mark_delivered(&elicitation.elicitation_id)?;
        self.events.append(EventDraft {
            kind: EventKind::ElicitationDelivered,
            aggregate_id: delivered.elicitation_id.clone(),
            payload: serde_json::json!({"to": to_agent}),
            correlation_id: None,
            causation_id: None,
        })?;
        Ok(delivered)
    }

    pub fn respond_elicitation(
        &self,
        identity: &AgentIdentity,
        elicitation_id: &str,
        payload: serde_json::Value,
        response_signature: &str,
    ) -> Result<(), LighthouseError> {
        self.elicitations
            .respond(elicitation_id, &identity.agent_id, payload, response_signature)?;
        self.events.append(EventDraft {
            kind: EventKind::ElicitationResponded,
            aggregate_id: elicitation_id.to_string(),
            payload: serde_json::json!({"responder": identity.agent_id}),
            correlation_id: None,
            causation_id: None,
        })?;
        Ok(())
    }

    /// Blocks the caller until `elicitation_id` resolves (responded,
    /// expired, or cancelled) or `timeout` elapses.
    pub fn await_elicitation(
        &self,
        elicitation_id: &str,
        timeout: Duration,
    ) -> Result<Elicitation, LighthouseError> {
        self.elicitations.await_response(elicitation_id, timeout)
    }

    /// Non-blocking: every still-pending elicitation addressed to
    /// `identity`'s agent.
    pub fn check_elicitations(&self, identity: &AgentIdentity) -> Vec<Elicitation> {
        self.elicitations.pending_for(&identity.agent_id)
    }

    /// Periodic housekeeping: sweeps idle sessions, offline experts, and
    /// expired elicitations. Intended to be called from a dedicated
    /// background thread (see `main.rs`'s `serve` loop), not from a
    /// request-handling path.
    pub fn sweep(&self) {
        for session in self.sessions.sweep_expired() {
            let _ = self.events.append(EventDraft {
                kind: EventKind::SessionExpired,
                aggregate_id: session.agent_id,
                payload: serde_json::json!({}),
                correlation_id: None,
                causation_id: None,
            });
        }
        for agent_id in self.experts.sweep_offline() {
            let _ = self.events.append(EventDraft {
                kind: EventKind::ExpertOffline,
                aggregate_id: agent_id,
                payload: serde_json::json!({}),
                correlation_id: None,
                causation_id: None,
            });
        }
        for elicitation_id in self.elicitations.sweep_expired() {
            let _ = self.events.append(EventDraft {
                kind: EventKind::ElicitationExpired,
                aggregate_id: elicitation_id,
                payload: serde_json::json!({}),
                correlation_id: None,
                causation_id: None,
            });
        }
    }

    fn record_trace(&self, op: &str, agent_id: &str, request: &serde_json::Value) {
        let event = trace::TraceEvent {
            trace_id: crate::time::new_correlation_id(),
            ts: crate::time::now_iso_z(),
            agent_id: agent_id.to_string(),
            op: op.to_string(),
            request: request.clone(),
            response: serde_json::json!({}),
        };
        let _ = trace::append_trace(&self.config.trace_path(), event);
    }
}

fn load_policy(config: &BrokerConfig) -> Result<PolicyEngine, LighthouseError> {
    match &config.policy_rules_path {
        None => Ok(PolicyEngine::denylist_safelist_default()),
        Some(path) => load_policy_from_file(path),
    }
}

fn load_policy_from_file(path: &Path) -> Result<PolicyEngine, LighthouseError> {
    if !path.exists() {
        return Ok(PolicyEngine::denylist_safelist_default());
    }
    // Rule files are plain JSON arrays of {priority, tool_glob, decision, label}.
    let content = std::fs::read_to_string(path)?;
    let raw: Vec<serde_json::Value> = serde_json::from_str(&content)?;
    let mut rules = Vec::with_capacity(raw.len());
    for entry in raw {
        let priority = entry.get("priority").and_then(|v| v.as_u64()).unwrap_or(50) as u32;
        let tool_glob = entry
            .get("tool_glob")
            .and_then(|v| v.as_str())
            .unwrap_or("*")
            .to_string();
        let decision = match entry.get("decision").and_then(|v| v.as_str()) {
            Some("allow") => crate::core::policy::Decision::Allow,
            _ => crate::core::policy::Decision::Block,
        };
        let label = entry
            .get("label")
            .and_then(|v| v.as_str())
            .unwrap_or("unlabeled")
            .to_string();
        rules.push(crate::core::policy::Rule {
            priority,
            predicate: crate::core::policy::Predicate::ToolGlob(tool_glob),
            decision,
            label,
        });
    }
    Ok(PolicyEngine::new(rules))
}
