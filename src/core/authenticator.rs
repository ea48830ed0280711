//! Coordinated authentication and the role→permission table
//! (SPEC_FULL.md §4.2).
//!
//! Agents are never auto-authenticated: every identity must be explicitly
//! registered (`register`) before `authenticate` will accept its token.
//! Passwords are hashed before storage and sessions carry a role rather than
//! a bare identity, so a compromised token exposes only what its role
//! permits.

use crate::error::LighthouseError;
use crate::mac;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Guest,
    BuilderAgent,
    ExpertAgent,
    SystemAgent,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    EventsRead,
    EventsWrite,
    EventsQuery,
    ExpertCoordinate,
    CommandExecute,
    CommandValidate,
    ShadowRead,
    ShadowWrite,
    Admin,
    FilesystemRead,
    FilesystemWrite,
}

fn permissions_for(role: Role) -> &'static [Permission] {
    use Permission::*;
    match role {
        Role::Guest => &[EventsRead],
        Role::BuilderAgent => &[
            EventsRead,
            EventsWrite,
            EventsQuery,
            ExpertCoordinate,
            CommandExecute,
            FilesystemRead,
            FilesystemWrite,
        ],
        Role::ExpertAgent => &[
            EventsRead,
            EventsQuery,
            ExpertCoordinate,
            CommandValidate,
            ShadowRead,
            ShadowWrite,
        ],
        Role::SystemAgent => &[
            EventsRead,
            EventsWrite,
            EventsQuery,
            ExpertCoordinate,
            CommandExecute,
            CommandValidate,
            ShadowRead,
            FilesystemRead,
            FilesystemWrite,
        ],
        Role::Admin => &[
            EventsRead,
            EventsWrite,
            EventsQuery,
            ExpertCoordinate,
            CommandExecute,
            CommandValidate,
            ShadowRead,
            ShadowWrite,
            Admin,
            FilesystemRead,
            FilesystemWrite,
        ],
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub role: Role,
    #[serde(skip_serializing)]
    token_hash: String,
    pub registered_at_ms: u64,
}

impl AgentIdentity {
    fn permissions(&self) -> &'static [Permission] {
        permissions_for(self.role)
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions().contains(&permission)
    }
}

/// Registers agent identities and authenticates bearer tokens against
/// them. Holds no session state of its own — that is `session::SessionValidator`'s
/// job; this subsystem answers only "who is this, and what can they do".
pub struct CoordinatedAuthenticator {
    secret: Vec<u8>,
    identities: RwLock<HashMap<String, AgentIdentity>>,
}

impl CoordinatedAuthenticator {
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            identities: RwLock::new(HashMap::new()),
        }
    }

    /// Registers `agent_id` under `role` and returns the bearer token the
    /// agent must present on every subsequent call. There is no implicit
    /// registration path; an unregistered agent_id always fails
    /// `authenticate`.
    pub fn register(&self, agent_id: &str, role: Role) -> String {
        let token = mac::sign(&self.secret, agent_id.as_bytes());
        let identity = AgentIdentity {
            agent_id: agent_id.to_string(),
            role,
            token_hash: mac::sign(&self.secret, token.as_bytes()),
            registered_at_ms: crate::time::now_epoch_ms(),
        };
        self.identities
            .write()
            .expect("authenticator lock poisoned")
            .insert(agent_id.to_string(), identity);
        token
    }

    /// Verifies `token` against the registered identity for `agent_id`.
    pub fn authenticate(&self, agent_id: &str, token: &str) -> Result<AgentIdentity, LighthouseError> {
        let identities = self.identities.read().expect("authenticator lock poisoned");
        let identity = identities
            .get(agent_id)
            .ok_or_else(|| LighthouseError::Unauthenticated(format!("unknown agent {}", agent_id)))?;

        let candidate_hash = mac::sign(&self.secret, token.as_bytes());
        if candidate_hash != identity.token_hash {
            return Err(LighthouseError::Unauthenticated(
                "token does not match registered identity".to_string(),
            ));
        }
        Ok(identity.clone())
    }

    pub fn lookup(&self, agent_id: &str) -> Option<AgentIdentity> {
        self.identities
            .read()
            .expect("authenticator lock poisoned")
            .get(agent_id)
            .cloned()
    }

    pub fn invalidate(&self, agent_id: &str) {
        self.identities
            .write()
            .expect("authenticator lock poisoned")
            .remove(agent_id);
    }

    /// Checks `identity` for `permission`, returning `Unauthorized` if
    /// absent rather than leaving the caller to inspect the role table
    /// directly.
    pub fn require(
        &self,
        identity: &AgentIdentity,
        permission: Permission,
    ) -> Result<(), LighthouseError> {
        if identity.has_permission(permission) {
            Ok(())
        } else {
            Err(LighthouseError::Unauthorized(format!(
                "{} lacks {:?}",
                identity.agent_id, permission
            )))
        }
    }
}
