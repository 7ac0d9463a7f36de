//! Identity and role checking
//!
//! Tokens are issued and verified by the gateway in front of this service.
//! By the time a request arrives here the caller is authenticated and its
//! identity travels in headers; this module only reads it and checks roles.

mod identity;

pub use identity::{Actor, ACTOR_ID_HEADER, ACTOR_ROLE_HEADER};

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// User roles for authorization
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Can view changes and the audit log
    Viewer,
    /// Can propose changes and perform technical review
    Developer,
    /// Can give manager approval
    Manager,
    /// Can approve any step
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Developer => "developer",
            Role::Manager => "manager",
            Role::Admin => "admin",
        }
    }

    pub fn can_propose(&self) -> bool {
        !matches!(self, Role::Viewer)
    }

    /// Registering scopes, environments and pipelines is an admin task
    pub fn can_administer(&self) -> bool {
        matches!(self, Role::Admin)
    }
}

impl Default for Role {
    fn default() -> Self {
        Role::Viewer
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "viewer" => Ok(Role::Viewer),
            "developer" => Ok(Role::Developer),
            "manager" => Ok(Role::Manager),
            "admin" => Ok(Role::Admin),
            other => Err(format!("Unknown role '{}'", other)),
        }
    }
}
