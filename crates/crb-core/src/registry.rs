use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use tokio::sync::broadcast;

use crate::{
    domain::TenantId,
    events::SessionEvent,
    persistence::SessionRecord,
    session::{Session, SessionContext, SessionSnapshot},
    utils::jitter,
    Result,
};

/// Process-wide tenant -> session map.
///
/// The only place sessions are created or removed. Created at process start
/// and torn down with [`shutdown`](Self::shutdown).
pub struct SessionRegistry {
    ctx: Arc<SessionContext>,
    sessions: RwLock<HashMap<TenantId, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new(ctx: Arc<SessionContext>) -> Self {
        Self {
            ctx,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    pub fn get(&self, tenant: &TenantId) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tenant)
            .cloned()
    }

    /// Return the session for `tenant`, creating it without starting it.
    ///
    /// The flag is `true` when the session was created by this call.
    pub fn get_or_insert_idle(&self, tenant: &TenantId) -> (Arc<Session>, bool) {
        if let Some(existing) = self.get(tenant) {
            return (existing, false);
        }
        let mut map = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = map.get(tenant) {
            return (Arc::clone(existing), false);
        }
        let session = Session::new(tenant.clone(), Arc::clone(&self.ctx));
        map.insert(tenant.clone(), Arc::clone(&session));
        tracing::debug!(tenant = %tenant, "session created");
        (session, true)
    }

    /// Return the session for `tenant`. A newly created one gets its initial
    /// start scheduled after a random jitter; this call never waits for it.
    pub fn get_or_create(&self, tenant: &TenantId) -> Arc<Session> {
        let (session, created) = self.get_or_insert_idle(tenant);
        if created {
            session.schedule_initial_start(jitter(self.ctx.settings.start_jitter_max));
        }
        session
    }

    /// Detach and drop the session. Stored credentials are left alone.
    pub async fn remove(&self, tenant: &TenantId) -> Option<Arc<Session>> {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(tenant);
        if let Some(session) = &removed {
            session.detach().await;
            tracing::info!(tenant = %tenant, "session removed");
        }
        removed
    }

    /// Sessions present right now, ordered by tenant id.
    pub fn list(&self) -> SessionList {
        let mut sessions: Vec<Arc<Session>> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.tenant().cmp(b.tenant()));
        SessionList { sessions }
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.ctx.events.subscribe()
    }

    /// Rebuild sessions from persisted records marked connected.
    ///
    /// Records without stored credentials are skipped: there is nothing to
    /// resume from. Returns the number of sessions scheduled.
    pub async fn restore(&self) -> Result<usize> {
        let records = self.ctx.persistence.load_all().await?;
        let mut restored = 0;
        for record in records.iter().filter(|r| r.is_connected) {
            if self.restore_record(record).await {
                restored += 1;
            }
        }
        tracing::info!(restored, total = records.len(), "restored sessions");
        Ok(restored)
    }

    pub(crate) async fn restore_record(&self, record: &SessionRecord) -> bool {
        if self.get(&record.tenant_id).is_some() {
            return false;
        }
        self.restore_one(&record.tenant_id).await
    }

    /// Create and schedule a session for `tenant` if it has stored credentials.
    pub async fn restore_one(&self, tenant: &TenantId) -> bool {
        match self.ctx.credentials.exists(tenant).await {
            Ok(true) => {
                self.get_or_create(tenant);
                true
            }
            Ok(false) => false,
            Err(e) => {
                tracing::warn!(tenant = %tenant, "credential lookup failed: {e}");
                false
            }
        }
    }

    /// Detach every session without recording them as disconnected, so the
    /// next process start restores them.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, s)| s)
            .collect();
        for session in &sessions {
            session.detach().await;
        }
        tracing::info!(count = sessions.len(), "registry shut down");
    }
}

/// Finite snapshot of the registry's sessions.
///
/// Statuses are read lazily on iteration; iterating again yields fresh ones.
pub struct SessionList {
    sessions: Vec<Arc<Session>>,
}

impl SessionList {
    pub fn iter(&self) -> impl Iterator<Item = (TenantId, SessionSnapshot)> + '_ {
        self.sessions
            .iter()
            .map(|s| (s.tenant().clone(), s.status()))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
