use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Server-assigned user identifier.
    UserId
);
string_id!(
    /// Tenant identifier; location and presence are scoped by it.
    CompanyId
);
string_id!(
    /// Conversation identifier.
    RoomId
);
string_id!(
    /// Durable, server-assigned message identifier.
    MessageId
);
string_id!(
    /// Server-assigned notification identifier.
    NotificationId
);

/// Locally-assigned identifier of an optimistic message.
///
/// Only the sender ever sees it; the hub strips it before fanning a
/// message out to other participants.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct TempId(pub Uuid);

impl TempId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TempId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TempId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tmp-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Roles and capabilities
// ---------------------------------------------------------------------------

/// Closed set of organizational roles.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Owner,
    Admin,
    #[serde(rename = "PM")]
    ProjectManager,
    Foreman,
    Worker,
    Client,
    Subcontractor,
}

impl Role {
    pub const ALL: [Role; 7] = [
        Role::Owner,
        Role::Admin,
        Role::ProjectManager,
        Role::Foreman,
        Role::Worker,
        Role::Client,
        Role::Subcontractor,
    ];

    /// Wire tag of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "OWNER",
            Role::Admin => "ADMIN",
            Role::ProjectManager => "PM",
            Role::Foreman => "FOREMAN",
            Role::Worker => "WORKER",
            Role::Client => "CLIENT",
            Role::Subcontractor => "SUBCONTRACTOR",
        }
    }

    /// Employees of the company that owns the installation.
    pub fn is_internal_staff(&self) -> bool {
        !self.is_external()
    }

    /// Clients and subcontractors.
    pub fn is_external(&self) -> bool {
        matches!(self, Role::Client | Role::Subcontractor)
    }

    /// Roles that see the CLIENT and SUB room tabs.
    pub fn has_elevated_visibility(&self) -> bool {
        matches!(self, Role::Owner | Role::Admin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ProtocolError::UnknownRole(s.to_string()))
    }
}

/// Set of capability tags granted by the authorization service.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct PermissionSet(BTreeSet<String>);

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, capability: &str) -> bool {
        self.0.contains(capability)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// What the push channel authenticates with at connect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    /// Bearer token issued at login.
    pub token: String,
    pub user_id: UserId,
    pub company_id: CompanyId,
}
