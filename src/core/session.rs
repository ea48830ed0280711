//! Session validation and hijack detection (SPEC_FULL.md §4.3).
//!
//! A session binds an authenticated agent identity to the client_ip/
//! user_agent pair observed when the session was created. Any later call
//! presenting a different ip or user_agent for the same session fails
//! closed and is recorded as a `SESSION_HIJACK_ATTEMPT` event rather than
//! silently rebinding.

use crate::core::authenticator::AgentIdentity;
use crate::error::LighthouseError;
use crate::mac;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub agent_id: String,
    client_ip: String,
    user_agent: String,
    pub created_at_ms: u64,
    last_seen: Instant,
}

pub enum ValidationOutcome {
    Valid(Session),
    HijackSuspected { agent_id: String, reason: String },
}

pub struct SessionValidator {
    secret: Vec<u8>,
    idle_ttl: Duration,
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionValidator {
    pub fn new(secret: Vec<u8>, idle_ttl: Duration) -> Self {
        Self {
            secret,
            idle_ttl,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn create_session(
        &self,
        identity: &AgentIdentity,
        client_ip: &str,
        user_agent: &str,
    ) -> Session {
        let raw = format!("{}:{}:{}", identity.agent_id, client_ip, crate::time::now_epoch_ms());
        let token = mac::sign(&self.secret, raw.as_bytes());
        let session = Session {
            token: token.clone(),
            agent_id: identity.agent_id.clone(),
            client_ip: client_ip.to_string(),
            user_agent: user_agent.to_string(),
            created_at_ms: crate::time::now_epoch_ms(),
            last_seen: Instant::now(),
        };
        self.sessions
            .write()
            .expect("session validator lock poisoned")
            .insert(token.clone(), session.clone());
        session
    }

    /// Validates `token` against the presenting `client_ip`/`user_agent`.
    /// A mismatch against the binding captured at creation is reported as
    /// a suspected hijack rather than an ordinary invalid-session error,
    /// so the caller can emit `SESSION_HIJACK_ATTEMPT` distinctly.
    pub fn validate(
        &self,
        token: &str,
        client_ip: &str,
        user_agent: &str,
    ) -> Result<ValidationOutcome, LighthouseError> {
        let mut sessions = self.sessions.write().expect("session validator lock poisoned");
        let session = sessions
            .get_mut(token)
            .ok_or_else(|| LighthouseError::InvalidSession("no such session".to_string()))?;

        if session.last_seen.elapsed() > self.idle_ttl {
            let agent_id = session.agent_id.clone();
            sessions.remove(token);
            return Err(LighthouseError::InvalidSession(format!(
                "session for {} expired after idle timeout",
                agent_id
            )));
        }

        if session.client_ip != client_ip || session.user_agent != user_agent {
            return Ok(ValidationOutcome::HijackSuspected {
                agent_id: session.agent_id.clone(),
                reason: format!(
                    "binding mismatch: expected ip={} ua={}, got ip={} ua={}",
                    session.client_ip, session.user_agent, client_ip, user_agent
                ),
            });
        }

        session.last_seen = Instant::now();
        Ok(ValidationOutcome::Valid(session.clone()))
    }

    pub fn revoke(&self, token: &str) {
        self.sessions
            .write()
            .expect("session validator lock poisoned")
            .remove(token);
    }

    /// Removes sessions idle past `idle_ttl`. Intended to be called
    /// periodically by the broker's housekeeping loop.
    pub fn sweep_expired(&self) -> Vec<Session> {
        let mut sessions = self.sessions.write().expect("session validator lock poisoned");
        let expired: Vec<Session> = sessions
            .iter()
            .filter(|(_, s)| s.last_seen.elapsed() > self.idle_ttl)
            .map(|(_, s)| s.clone())
            .collect();
        for session in &expired {
            sessions.remove(&session.token);
        }
        expired
    }

    pub fn active_count(&self) -> usize {
        self.sessions.read().expect("session validator lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::authenticator::{CoordinatedAuthenticator, Role};

    fn identity() -> AgentIdentity {
        let auth = CoordinatedAuthenticator::new(b"secret".to_vec());
        let token = auth.register("agent-1", Role::BuilderAgent);
        auth.authenticate("agent-1", &token).unwrap()
    }

    #[test]
    fn test_create_and_validate_session() {
        let validator = SessionValidator::new(b"secret".to_vec(), Duration::from_secs(60));
        let identity = identity();
        let session = validator.create_session(&identity, "1.2.3.4", "test-agent/1.0");

        let outcome = validator
            .validate(&session.token, "1.2.3.4", "test-agent/1.0")
            .unwrap();
        assert!(matches!(outcome, ValidationOutcome::Valid(_)));
    }

    #[test]
    fn test_ip_mismatch_flags_hijack() {
        let validator = SessionValidator::new(b"secret".to_vec(), Duration::from_secs(60));
        let identity = identity();
        let session = validator.create_session(&identity, "1.2.3.4", "test-agent/1.0");

        let outcome = validator
            .validate(&session.token, "9.9.9.9", "test-agent/1.0")
            .unwrap();
        assert!(matches!(outcome, ValidationOutcome::HijackSuspected { .. }));
    }

    #[test]
    fn test_user_agent_mismatch_flags_hijack() {
        let validator = SessionValidator::new(b"secret".to_vec(), Duration::from_secs(60));
        let identity = identity();
        let session = validator.create_session(&identity, "1.2.3.4", "test-agent/1.0");

        let outcome = validator
            .validate(&session.token, "1.2.3.4", "different-agent/2.0")
            .unwrap();
        assert!(matches!(outcome, ValidationOutcome::HijackSuspected { .. }));
    }

    #[test]
    fn test_unknown_token_rejected() {
        let validator = SessionValidator::new(b"secret".to_vec(), Duration::from_secs(60));
        let result = validator.validate("not-a-real-token", "1.2.3.4", "test-agent/1.0");
        assert!(matches!(result, Err(LighthouseError::InvalidSession(_))));
    }

    #[test]
    fn test_idle_timeout_expires_session() {
        let validator = SessionValidator::new(b"secret".to_vec(), Duration::from_millis(10));
        let identity = identity();
        let session = validator.create_session(&identity, "1.2.3.4", "test-agent/1.0");

        std::thread::sleep(Duration::from_millis(30));
        let result = validator.validate(&session.token, "1.2.3.4", "test-agent/1.0");
        assert!(matches!(result, Err(LighthouseError::InvalidSession(_))));
    }

    #[test]
    fn test_revoke_removes_session() {
        let validator = SessionValidator::new(b"secret".to_vec(), Duration::from_secs(60));
        let identity = identity();
        let session = validator.create_session(&identity, "1.2.3.4", "test-agent/1.0");
        validator.revoke(&session.token);

        let result = validator.validate(&session.token, "1.2.3.4", "test-agent/1.0");
        assert!(matches!(result, Err(LighthouseError::InvalidSession(_))));
    }

    #[test]
    fn test_sweep_expired_clears_idle_sessions() {
        let validator = SessionValidator::new(b"secret".to_vec(), Duration::from_millis(10));
        let identity = identity();
        validator.create_session(&identity, "1.2.3.4", "test-agent/1.0");
        std::thread::sleep(Duration::from_millis(30));

        let expired = validator.sweep_expired();
        assert_eq!(expired.len(), 1);
        assert_eq!(validator.active_count(), 0);
    }
}
