//! RPC request/response contracts for the operation set in SPEC_FULL.md §6.
//!
//! Request/response envelope shape mirrors the broker's other subsystems:
//! a tagged enum per direction, narrowed to Lighthouse's fixed operation
//! set rather than an open-ended command surface.

use crate::core::authenticator::Role;
use crate::core::broker::Broker;
use crate::core::event_log::{EventDraft, EventFilter, EventKind};
use crate::core::speed_layer::ValidationDecision;
use crate::error::LighthouseError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RpcRequest {
    Authenticate {
        agent_id: String,
        token: String,
    },
    CreateSession {
        agent_id: String,
        token: String,
        client_ip: String,
        user_agent: String,
    },
    ValidateSession {
        session_token: String,
        client_ip: String,
        user_agent: String,
    },
    StoreEvent {
        agent_id: String,
        token: String,
        kind: EventKind,
        aggregate_id: String,
        payload: serde_json::Value,
    },
    QueryEvents {
        agent_id: String,
        token: String,
        aggregate_id: Option<String>,
        kinds: Option<Vec<EventKind>>,
        limit: Option<usize>,
    },
    /// Establishes a live subscription; `handle` reports only that it
    /// opened, since the channel itself isn't representable in a single
    /// request/response round trip (wire transport is out of scope here).
    SubscribeEvents {
        agent_id: String,
        token: String,
        aggregate_id: Option<String>,
        kinds: Option<Vec<EventKind>>,
    },
    ValidateCommand {
        agent_id: String,
        token: String,
        tool_name: String,
        args: String,
    },
    RegisterExpert {
        agent_id: String,
        token: String,
        weight: u32,
    },
    DelegateTask {
        agent_id: String,
        token: String,
        task: serde_json::Value,
        required_capabilities: Vec<String>,
        priority: u32,
    },
    CompleteTask {
        agent_id: String,
        token: String,
        fingerprint: String,
        decision: ValidationDecision,
    },
    Elicit {
        agent_id: String,
        token: String,
        elicitation_id: String,
        to_agent: String,
        schema: serde_json::Value,
        timeout_seconds: u64,
    },
    RespondElicitation {
        agent_id: String,
        token: String,
        elicitation_id: String,
        payload: serde_json::Value,
        response_signature: String,
    },
    AwaitElicitation {
        agent_id: String,
        token: String,
        elicitation_id: String,
        timeout_seconds: u64,
    },
    CheckElicitations {
        agent_id: String,
        token: String,
    },
    InvalidateAgent {
        agent_id: String,
        token: String,
        target_agent_id: String,
    },
    Health,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RpcResponse {
    Ok { result: serde_json::Value },
    Error { kind: String, message: String },
}

impl RpcResponse {
    fn from_error(err: LighthouseError) -> Self {
        RpcResponse::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    fn ok(result: serde_json::Value) -> Self {
        RpcResponse::Ok { result }
    }
}

/// Dispatches one request against `broker`, authenticating the calling
/// agent first for every operation other than `Authenticate`/`Health`.
pub fn handle(broker: &Broker, request: RpcRequest) -> RpcResponse {
    match dispatch(broker, request) {
        Ok(value) => RpcResponse::ok(value),
        Err(err) => RpcResponse::from_error(err),
    }
}

fn dispatch(broker: &Broker, request: RpcRequest) -> Result<serde_json::Value, LighthouseError> {
    match request {
        RpcRequest::Authenticate { agent_id, token } => {
            let identity = broker.authenticate(&agent_id, &token)?;
            Ok(serde_json::json!({"agent_id": identity.agent_id, "role": identity.role}))
        }
        RpcRequest::CreateSession {
            agent_id,
            token,
            client_ip,
            user_agent,
        } => {
            let identity = broker.authenticate(&agent_id, &token)?;
            let session = broker.create_session(&identity, &client_ip, &user_agent);
            Ok(serde_json::json!({"session_token": session.token}))
        }
        RpcRequest::ValidateSession {
            session_token,
            client_ip,
            user_agent,
        } => {
            let outcome = broker.validate_session(&session_token, &client_ip, &user_agent)?;
            match outcome {
                crate::core::session::ValidationOutcome::Valid(session) => {
                    Ok(serde_json::json!({"valid": true, "agent_id": session.agent_id}))
                }
                crate::core::session::ValidationOutcome::HijackSuspected { agent_id, reason } => {
                    Err(LighthouseError::InvalidSession(format!(
                        "hijack suspected for {}: {}",
                        agent_id, reason
                    )))
                }
            }
        }
        RpcRequest::StoreEvent {
            agent_id,
            token,
            kind,
            aggregate_id,
            payload,
        } => {
            let identity = broker.authenticate(&agent_id, &token)?;
            let (id, sequence) = broker.store_event(
                &identity,
                EventDraft {
                    kind,
                    aggregate_id,
                    payload,
                    correlation_id: None,
                    causation_id: None,
                },
            )?;
            Ok(serde_json::json!({"event_id": id, "sequence": sequence}))
        }
        RpcRequest::QueryEvents {
            agent_id,
            token,
            aggregate_id,
            kinds,
            limit,
        } => {
            let identity = broker.authenticate(&agent_id, &token)?;
            let events = broker.query_events(
                &identity,
                &EventFilter {
                    aggregate_id,
                    kinds,
                    limit,
                    ..Default::default()
                },
            )?;
            Ok(serde_json::to_value(events)?)
        }
        RpcRequest::SubscribeEvents {
            agent_id,
            token,
            aggregate_id,
            kinds,
        } => {
            let identity = broker.authenticate(&agent_id, &token)?;
            let _receiver = broker.subscribe_events(
                &identity,
                EventFilter {
                    aggregate_id,
                    kinds,
                    ..Default::default()
                },
            )?;
            Ok(serde_json::json!({"subscribed": true}))
        }
        RpcRequest::ValidateCommand {
            agent_id,
            token,
            tool_name,
            args,
        } => {
            let identity = broker.authenticate(&agent_id, &token)?;
            let result = broker.validate_command(&identity, &tool_name, &args)?;
            Ok(serde_json::to_value(result)?)
        }
        RpcRequest::RegisterExpert { agent_id, token, weight } => {
            let identity = broker.authenticate(&agent_id, &token)?;
            broker.register_expert(&identity, weight)?;
            Ok(serde_json::json!({"registered": true}))
        }
        RpcRequest::DelegateTask {
            agent_id,
            token,
            task,
            required_capabilities,
            priority,
        } => {
            let identity = broker.authenticate(&agent_id, &token)?;
            let task_id = broker.delegate_task(&identity, task, required_capabilities, priority)?;
            Ok(serde_json::json!({"task_id": task_id}))
        }
        RpcRequest::CompleteTask {
            agent_id,
            token,
            fingerprint,
            decision,
        } => {
            let identity = broker.authenticate(&agent_id, &token)?;
            broker.complete_task(&identity, &fingerprint, decision)?;
            Ok(serde_json::json!({"completed": true}))
        }
        RpcRequest::Elicit {
            agent_id,
            token,
            elicitation_id,
            to_agent,
            schema,
            timeout_seconds,
        } => {
            let identity = broker.authenticate(&agent_id, &token)?;
            let elicitation = broker.create_elicitation(
                &identity,
                elicitation_id,
                &to_agent,
                schema,
                Duration::from_secs(timeout_seconds),
            )?;
            Ok(serde_json::json!({
                "elicitation_id": elicitation.elicitation_id,
                "nonce": elicitation.nonce,
                "deadline_ms": elicitation.deadline_ms,
            }))
        }
        RpcRequest::RespondElicitation {
            agent_id,
            token,
            elicitation_id,
            payload,
            response_signature,
        } => {
            let identity = broker.authenticate(&agent_id, &token)?;
            broker.respond_elicitation(&identity, &elicitation_id, payload, &response_signature)?;
            Ok(serde_json::json!({"responded": true}))
        }
        RpcRequest::AwaitElicitation {
            agent_id,
            token,
            elicitation_id,
            timeout_seconds,
        } => {
            let _identity = broker.authenticate(&agent_id, &token)?;
            let elicitation =
                broker.await_elicitation(&elicitation_id, Duration::from_secs(timeout_seconds))?;
            Ok(serde_json::to_value(elicitation)?)
        }
        RpcRequest::CheckElicitations { agent_id, token } => {
            let identity = broker.authenticate(&agent_id, &token)?;
            let pending = broker.check_elicitations(&identity);
            Ok(serde_json::to_value(pending)?)
        }
        RpcRequest::InvalidateAgent {
            agent_id,
            token,
            target_agent_id,
        } => {
            let identity = broker.authenticate(&agent_id, &token)?;
            broker.invalidate_agent(&identity, &target_agent_id)?;
            Ok(serde_json::json!({"invalidated": true}))
        }
        RpcRequest::Health => Ok(serde_json::json!({
            "status": "ok",
            "highest_sequence": broker.events.highest_sequence(),
            "active_sessions": broker.sessions.active_count(),
            "registered_experts": broker.experts.registered_count(),
        })),
    }
}

/// Used by `lighthouse init` to seed the first admin identity. Not an RPC
/// operation itself (no caller is authenticated yet at bootstrap time).
pub fn bootstrap_admin(broker: &Broker, agent_id: &str) -> String {
    broker.register_agent(agent_id, Role::Admin)
}
