//! Identity collaborator: the gateway hands credentials to an
//! [`Authenticator`] before any session contact. The returned user id is
//! trusted for the lifetime of the connection.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{UserId, AGENT_USER_ID};

/// Credentials presented in the join frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub secret: String,
}

/// An authenticated identity.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthedUser {
    pub user_id: UserId,
    pub name: String,
    pub is_agent: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthError {
    Rejected,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::Rejected => write!(f, "credentials rejected"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Verifies credentials. Implementations must not block; lookups happen on
/// the connection task.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, credentials: &Credentials) -> Result<AuthedUser, AuthError>;
}

#[derive(Clone)]
struct DirectoryEntry {
    secret: String,
    user_id: UserId,
    name: String,
    is_agent: bool,
}

/// Fixed email/secret directory for tests and demos. Production deployments
/// wire their own [`Authenticator`].
pub struct StaticDirectory {
    entries: HashMap<String, DirectoryEntry>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn with_user(mut self, email: &str, secret: &str, name: &str) -> Self {
        self.entries.insert(
            email.to_string(),
            DirectoryEntry {
                secret: secret.to_string(),
                user_id: Uuid::new_v4(),
                name: name.to_string(),
                is_agent: false,
            },
        );
        self
    }

    /// Register the AI collaborator under an agent token. It maps to the
    /// reserved agent id and joins through the same interfaces as everyone
    /// else.
    pub fn with_agent(mut self, email: &str, secret: &str, name: &str) -> Self {
        self.entries.insert(
            email.to_string(),
            DirectoryEntry {
                secret: secret.to_string(),
                user_id: AGENT_USER_ID,
                name: name.to_string(),
                is_agent: true,
            },
        );
        self
    }
}

impl Default for StaticDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl Authenticator for StaticDirectory {
    fn authenticate(&self, credentials: &Credentials) -> Result<AuthedUser, AuthError> {
        let entry = self
            .entries
            .get(&credentials.email)
            .filter(|e| e.secret == credentials.secret)
            .ok_or(AuthError::Rejected)?;
        Ok(AuthedUser {
            user_id: entry.user_id,
            name: entry.name.clone(),
            is_agent: entry.is_agent,
        })
    }
}
