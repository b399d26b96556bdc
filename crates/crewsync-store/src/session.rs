use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crewsync_shared::{CompanyId, Credential, PermissionSet, Role, Session, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};

/// Last-known session together with the time it was last confirmed.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedSession {
    pub session: Session,
    pub refreshed_at: DateTime<Utc>,
}

impl Database {
    /// Overwrite the cached session. Called synchronously with every
    /// in-memory mutation so a reload never sees a diverged copy.
    pub fn save_session(&self, session: &Session) -> Result<()> {
        let permissions = serde_json::to_string(&session.permissions).map_err(|e| {
            StoreError::Corrupt {
                column: "permissions",
                reason: e.to_string(),
            }
        })?;

        self.conn().execute(
            "INSERT INTO session_cache
                 (slot, user_id, display_name, role, company_id, permissions, refreshed_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(slot) DO UPDATE SET
                 user_id = excluded.user_id,
                 display_name = excluded.display_name,
                 role = excluded.role,
                 company_id = excluded.company_id,
                 permissions = excluded.permissions,
                 refreshed_at = excluded.refreshed_at",
            params![
                session.user_id.as_str(),
                session.display_name,
                session.role.as_str(),
                session.company_id.as_str(),
                permissions,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn load_session(&self) -> Result<Option<CachedSession>> {
        let row = self
            .conn()
            .query_row(
                "SELECT user_id, display_name, role, company_id, permissions, refreshed_at
                 FROM session_cache WHERE slot = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((user_id, display_name, role, company_id, permissions, refreshed_at)) = row
        else {
            return Ok(None);
        };

        let role: Role = role.parse().map_err(|e: crewsync_shared::ProtocolError| {
            StoreError::Corrupt {
                column: "role",
                reason: e.to_string(),
            }
        })?;
        let permissions: PermissionSet =
            serde_json::from_str(&permissions).map_err(|e| StoreError::Corrupt {
                column: "permissions",
                reason: e.to_string(),
            })?;
        let refreshed_at = DateTime::parse_from_rfc3339(&refreshed_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| StoreError::Corrupt {
                column: "refreshed_at",
                reason: e.to_string(),
            })?;

        Ok(Some(CachedSession {
            session: Session {
                user_id: UserId::new(user_id),
                display_name,
                role,
                company_id: CompanyId::new(company_id),
                permissions,
            },
            refreshed_at,
        }))
    }

    pub fn save_credential(&self, credential: &Credential) -> Result<()> {
        self.conn().execute(
            "INSERT INTO credentials (slot, token, user_id, company_id, created_at)
             VALUES (1, ?1, ?2, ?3, ?4)
             ON CONFLICT(slot) DO UPDATE SET
                 token = excluded.token,
                 user_id = excluded.user_id,
                 company_id = excluded.company_id,
                 created_at = excluded.created_at",
            params![
                credential.token,
                credential.user_id.as_str(),
                credential.company_id.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn load_credential(&self) -> Result<Option<Credential>> {
        let credential = self
            .conn()
            .query_row(
                "SELECT token, user_id, company_id FROM credentials WHERE slot = 1",
                [],
                |row| {
                    Ok(Credential {
                        token: row.get(0)?,
                        user_id: UserId::new(row.get::<_, String>(1)?),
                        company_id: CompanyId::new(row.get::<_, String>(2)?),
                    })
                },
            )
            .optional()?;
        Ok(credential)
    }

    /// Forget everything (logout).
    pub fn clear_all(&self) -> Result<()> {
        self.conn()
            .execute_batch("DELETE FROM session_cache; DELETE FROM credentials;")?;
        tracing::debug!("session cache cleared");
        Ok(())
    }
}
