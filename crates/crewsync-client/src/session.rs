//! Single authoritative holder of the signed-in identity and permissions.
//!
//! Every mutation is written to the warm-start cache before the new value
//! is published, and every consumer reads permissions through
//! [`SessionStore::can`] or [`SessionStore::permissions`] at decision time.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crewsync_shared::{Credential, LoginResult, PermissionSet, Role, Session, SessionPatch};

use crate::context::ClientContext;
use crate::error::{Result, SyncError};
use crate::events::UiEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationOutcome {
    NoSession,
    /// The push named another role; nothing to do.
    RoleMismatch,
    RefreshScheduled,
}

pub struct SessionStore {
    ctx: Arc<ClientContext>,
    state: watch::Sender<Option<Session>>,
    write_lock: Mutex<()>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl SessionStore {
    pub fn new(ctx: Arc<ClientContext>) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            ctx,
            state,
            write_lock: Mutex::new(()),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Warm start from the cache, then try to refresh permissions.
    ///
    /// A failed refresh keeps the cached permission set: the session stays
    /// usable in a degraded state instead of blocking sign-in.
    pub async fn load(&self) -> Result<Option<Session>> {
        let Some(cached) = self.ctx.with_store(|db| db.load_session())? else {
            debug!("No cached session");
            return Ok(None);
        };

        info!(
            user = %cached.session.user_id,
            role = %cached.session.role,
            cached_at = %cached.refreshed_at,
            "Warm start from cached session"
        );
        self.publish(Some(cached.session));

        if let Err(e) = self.refresh_permissions().await {
            warn!(error = %e, "Keeping last-known permissions");
            self.ctx.events.emit(UiEvent::RefreshFailed {
                reason: e.to_string(),
            });
        }

        Ok(self.current())
    }

    /// Adopt an explicit login result. Returns the push credential.
    pub fn establish(&self, login: &LoginResult) -> Result<Credential> {
        let credential = Credential {
            token: login.token.clone(),
            user_id: login.session.user_id.clone(),
            company_id: login.session.company_id.clone(),
        };

        {
            let _write = self.write_guard();
            self.ctx.with_store(|db| {
                db.save_session(&login.session)?;
                db.save_credential(&credential)
            })?;
            self.publish(Some(login.session.clone()));
        }

        info!(user = %login.session.user_id, role = %login.session.role, "Session established");
        self.ctx
            .events
            .emit(UiEvent::PermissionsChanged(login.session.clone()));
        Ok(credential)
    }

    /// React to a role-wide permission change pushed by the hub.
    ///
    /// The refresh runs on its own task so message delivery is never held
    /// up by the authorization service. Failures are logged and wait for
    /// the next push or an explicit [`refresh_permissions`](Self::refresh_permissions).
    pub fn apply_invalidation(self: &Arc<Self>, role: Role) -> InvalidationOutcome {
        let Some(current) = self.current() else {
            return InvalidationOutcome::NoSession;
        };
        if current.role != role {
            debug!(pushed = %role, ours = %current.role, "Invalidation for another role");
            return InvalidationOutcome::RoleMismatch;
        }

        debug!(role = %role, "Permissions invalidated, refreshing");
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.refresh_permissions().await {
                warn!(error = %e, "Permission refresh failed");
                this.ctx.events.emit(UiEvent::RefreshFailed {
                    reason: e.to_string(),
                });
            }
        });
        InvalidationOutcome::RefreshScheduled
    }

    /// One bounded round-trip to the authorization service.
    ///
    /// Refreshes are serialized. A result that arrives after the session's
    /// user or role changed is discarded.
    pub async fn refresh_permissions(&self) -> Result<PermissionSet> {
        let _serial = self.refresh_lock.lock().await;
        let snapshot = self.require()?;

        let lookup = self.ctx.services.auth.current_permissions(snapshot.role);
        let permissions = match tokio::time::timeout(self.ctx.config.refresh_timeout, lookup).await
        {
            Ok(Ok(permissions)) => permissions,
            Ok(Err(e)) => return Err(SyncError::RefreshFailed(e.to_string())),
            Err(_) => {
                return Err(SyncError::RefreshFailed(format!(
                    "no answer within {:?}",
                    self.ctx.config.refresh_timeout
                )))
            }
        };

        let mut stale = false;
        let mut changed = false;
        let updated = self.commit(|session| {
            if session.user_id != snapshot.user_id || session.role != snapshot.role {
                stale = true;
                return false;
            }
            changed = session.permissions != permissions;
            session.permissions = permissions.clone();
            true
        })?;

        if stale {
            debug!("Discarding permission refresh for a replaced session");
            return Ok(self.permissions());
        }

        if let Some(session) = updated {
            if changed {
                info!(role = %session.role, count = session.permissions.len(), "Permissions updated");
                self.ctx.events.emit(UiEvent::PermissionsChanged(session));
            }
        }
        Ok(permissions)
    }

    /// Local, non-authoritative edit.
    pub fn update(&self, patch: SessionPatch) -> Result<Session> {
        self.commit(|session| {
            if let Some(name) = patch.display_name {
                session.display_name = name;
            }
            true
        })?
        .ok_or(SyncError::NoSession)
    }

    /// Destroy the session and its durable copy.
    pub fn logout(&self) -> Result<()> {
        let _write = self.write_guard();
        self.publish(None);
        self.ctx.with_store(|db| db.clear_all())?;
        info!("Session cleared");
        Ok(())
    }

    pub fn current(&self) -> Option<Session> {
        self.state.borrow().clone()
    }

    pub fn require(&self) -> Result<Session> {
        self.current().ok_or(SyncError::NoSession)
    }

    pub fn permissions(&self) -> PermissionSet {
        self.state
            .borrow()
            .as_ref()
            .map(|session| session.permissions.clone())
            .unwrap_or_default()
    }

    pub fn can(&self, capability: &str) -> bool {
        self.state
            .borrow()
            .as_ref()
            .map(|session| session.permissions.contains(capability))
            .unwrap_or(false)
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.state.subscribe()
    }

    fn write_guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, session: Option<Session>) {
        self.state.send_replace(session);
    }

    /// Apply `f` to a copy, persist it, then publish. `Ok(None)` when there
    /// is no session or `f` declined the change.
    fn commit<F>(&self, f: F) -> Result<Option<Session>>
    where
        F: FnOnce(&mut Session) -> bool,
    {
        let _write = self.write_guard();
        let Some(mut next) = self.current() else {
            return Ok(None);
        };
        if !f(&mut next) {
            return Ok(None);
        }
        self.ctx.with_store(|db| db.save_session(&next))?;
        self.publish(Some(next.clone()));
        Ok(Some(next))
    }
}
