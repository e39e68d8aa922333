//! Framework-agnostic operations consumed by the transport layer.

use std::{sync::Arc, time::Instant};

use serde::Serialize;

use crate::{
    domain::{DeliveryId, SessionStatus, TenantId},
    errors::Error,
    persistence::SessionRecord,
    registry::SessionRegistry,
    session::{AuthProgress, ChallengeKind, SessionSnapshot},
    utils::normalize_phone,
    Result,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub total_sessions: usize,
    pub connected_sessions: usize,
    pub connecting_sessions: usize,
    pub uptime_secs: u64,
}

pub struct Gateway {
    registry: Arc<SessionRegistry>,
    started_at: Instant,
    normalize_br: bool,
}

impl Gateway {
    pub fn new(registry: Arc<SessionRegistry>, normalize_br: bool) -> Self {
        Self {
            registry,
            started_at: Instant::now(),
            normalize_br,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Current snapshot. Unknown tenants read as disconnected and are not created.
    pub fn status(&self, tenant: &TenantId) -> SessionSnapshot {
        self.registry
            .get(tenant)
            .map(|s| s.status())
            .unwrap_or_else(|| SessionSnapshot::disconnected(tenant.clone()))
    }

    /// Force a fresh QR authentication and wait (bounded) for the code.
    ///
    /// A session that is already connected is left alone and reported as such.
    pub async fn request_qr(&self, tenant: &TenantId) -> Result<AuthProgress> {
        let (session, _) = self.registry.get_or_insert_idle(tenant);
        let snap = session.status();
        if snap.state == SessionStatus::Connected {
            return Ok(AuthProgress::Connected);
        }
        if let Some(qr) = snap.qr {
            return Ok(AuthProgress::Challenge(qr));
        }

        session.set_pairing_phone(None).await;
        session
            .kick(true)
            .await
            .ok_or_else(|| Error::NotConnected(tenant.to_string()))?;
        session
            .wait_for_challenge(ChallengeKind::Qr, self.challenge_wait())
            .await
    }

    /// Associate `phone` with the tenant, force a pairing-code challenge and
    /// wait (bounded) for the code.
    pub async fn request_pairing(&self, tenant: &TenantId, phone: &str) -> Result<AuthProgress> {
        let phone = normalize_phone(phone, false)?;
        let (session, _) = self.registry.get_or_insert_idle(tenant);
        let snap = session.status();
        if snap.state == SessionStatus::Connected {
            return Ok(AuthProgress::Connected);
        }
        if let (Some(code), Some(current)) = (&snap.pairing_code, &snap.phone) {
            if *current == phone {
                return Ok(AuthProgress::Challenge(code.clone()));
            }
        }

        session.set_pairing_phone(Some(phone)).await;
        session
            .kick(true)
            .await
            .ok_or_else(|| Error::NotConnected(tenant.to_string()))?;
        session
            .wait_for_challenge(ChallengeKind::Pairing, self.challenge_wait())
            .await
    }

    pub async fn send(&self, tenant: &TenantId, to: &str, text: &str) -> Result<DeliveryId> {
        if text.trim().is_empty() {
            return Err(Error::InvalidInput("message must not be empty".to_string()));
        }
        let to = normalize_phone(to, self.normalize_br)?;

        let Some(session) = self.registry.get(tenant) else {
            // Best-effort: bring the tenant back if it has credentials.
            let registry = Arc::clone(&self.registry);
            let t = tenant.clone();
            tokio::spawn(async move {
                registry.restore_one(&t).await;
            });
            return Err(Error::NotConnected(tenant.to_string()));
        };
        session.send_text(&to, text).await
    }

    /// Ensure a session exists and is starting. Returns without waiting.
    pub async fn connect(&self, tenant: &TenantId) {
        let (session, created) = self.registry.get_or_insert_idle(tenant);
        if created {
            tracing::info!(tenant = %tenant, "connect requested");
        }
        session.kick(false).await;
    }

    /// Cancel timers, close the connection, destroy credentials and drop the
    /// session from the registry.
    pub async fn disconnect(&self, tenant: &TenantId) -> Result<()> {
        match self.registry.remove(tenant).await {
            Some(session) => session.forget_credentials().await?,
            None => {
                let ctx = self.registry.context();
                let record = SessionRecord {
                    tenant_id: tenant.clone(),
                    session_data: "{}".to_string(),
                    is_connected: false,
                    connection_status: SessionStatus::Disconnected.coarse().to_string(),
                    last_activity: chrono::Utc::now(),
                    updated_at: chrono::Utc::now(),
                };
                ctx.persistence.submit(record);
                ctx.credentials.destroy(tenant).await?;
            }
        }
        tracing::info!(tenant = %tenant, "tenant disconnected");
        Ok(())
    }

    /// `disconnect` followed by a forced fresh start.
    pub async fn reconnect(&self, tenant: &TenantId) -> Result<()> {
        self.disconnect(tenant).await?;
        let (session, _) = self.registry.get_or_insert_idle(tenant);
        session.kick(true).await;
        Ok(())
    }

    pub fn list(&self) -> Vec<SessionSnapshot> {
        self.registry.list().iter().map(|(_, snap)| snap).collect()
    }

    pub fn health(&self) -> HealthReport {
        let mut report = HealthReport {
            total_sessions: 0,
            connected_sessions: 0,
            connecting_sessions: 0,
            uptime_secs: self.started_at.elapsed().as_secs(),
        };
        for (_, snap) in self.registry.list().iter() {
            report.total_sessions += 1;
            if snap.connected {
                report.connected_sessions += 1;
            } else if snap.state.is_establishing() {
                report.connecting_sessions += 1;
            }
        }
        report
    }

    fn challenge_wait(&self) -> std::time::Duration {
        self.registry.context().settings.challenge_wait
    }
}
