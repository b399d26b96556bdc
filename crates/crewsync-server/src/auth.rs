//! Bearer tokens accepted on the WebSocket upgrade.
//!
//! Tokens are issued by the backend and exported to a JSON file:
//!
//! ```json
//! [{"token": "...", "user_id": "u-1", "company_id": "acme"}]
//! ```

use std::path::Path;

use axum::http::HeaderMap;
use serde::Deserialize;
use subtle::ConstantTimeEq;

use crewsync_shared::{CompanyId, UserId};

use crate::error::ServerError;

/// Who a connection speaks for.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub company_id: CompanyId,
}

#[derive(Deserialize)]
struct TokenEntry {
    token: String,
    #[serde(flatten)]
    identity: Identity,
}

pub struct TokenRegistry {
    /// `None` runs the hub open: any bearer is accepted.
    entries: Option<Vec<(String, Identity)>>,
}

impl TokenRegistry {
    pub fn open() -> Self {
        Self { entries: None }
    }

    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, Identity)>,
    {
        Self {
            entries: Some(entries.into_iter().collect()),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ServerError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ServerError::TokenRegistry(format!("{}: {e}", path.display())))?;
        let entries: Vec<TokenEntry> = serde_json::from_str(&raw)
            .map_err(|e| ServerError::TokenRegistry(format!("{}: {e}", path.display())))?;
        Ok(Self::from_entries(
            entries.into_iter().map(|entry| (entry.token, entry.identity)),
        ))
    }

    pub fn is_open(&self) -> bool {
        self.entries.is_none()
    }

    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, |entries| entries.len())
    }

    /// Resolve a presented bearer.
    ///
    /// `Ok(None)` means the hub is open and the identity is whatever the
    /// client registers. Every entry is compared so the lookup time does
    /// not depend on which token matched.
    pub fn authorize(&self, bearer: &str) -> Result<Option<Identity>, ServerError> {
        if bearer.is_empty() {
            return Err(ServerError::Unauthorized);
        }
        let Some(entries) = &self.entries else {
            return Ok(None);
        };

        let presented = bearer.as_bytes();
        let mut found = None;
        for (token, identity) in entries {
            let token = token.as_bytes();
            if token.len() == presented.len() && token.ct_eq(presented).unwrap_u8() == 1 {
                found = Some(identity.clone());
            }
        }
        found.map(Some).ok_or(ServerError::Unauthorized)
    }
}

/// `Authorization: Bearer <token>`, or an empty string when absent.
pub fn bearer(headers: &HeaderMap) -> &str {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    auth.strip_prefix("Bearer ").unwrap_or(auth).trim()
}
