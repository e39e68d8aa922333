//! Process-wide health sweep.
//!
//! Reconciles persisted intent with live state: sessions the store says
//! should be connected but the registry lacks are recreated, and idle
//! disconnected sessions with credentials get a restoration attempt.

use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{registry::SessionRegistry, utils::jitter};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions recreated from persisted records.
    pub recreated: usize,
    /// Existing sessions given a restoration attempt.
    pub rescheduled: usize,
}

pub struct HealthMonitor {
    registry: Arc<SessionRegistry>,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(registry: Arc<SessionRegistry>, interval: Duration) -> Self {
        Self { registry, interval }
    }

    /// Sweep every `interval` until `shutdown` is cancelled.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.interval) => {}
                }
                let report = self.sweep().await;
                if report != SweepReport::default() {
                    tracing::info!(
                        recreated = report.recreated,
                        rescheduled = report.rescheduled,
                        "health sweep"
                    );
                }
            }
            tracing::debug!("health monitor stopped");
        })
    }

    /// One reconciliation pass. Errors are logged, never raised.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let max_jitter = self.registry.context().settings.start_jitter_max;

        match self.registry.context().persistence.load_connected().await {
            Ok(records) => {
                for record in &records {
                    if self.registry.restore_record(record).await {
                        report.recreated += 1;
                    }
                }
            }
            Err(e) => tracing::warn!("health sweep could not read session records: {e}"),
        }

        let sessions = self.registry.list();
        for (tenant, _) in sessions.iter() {
            let Some(session) = self.registry.get(&tenant) else {
                continue;
            };
            if session.schedule_restore(jitter(max_jitter)).await {
                tracing::debug!(tenant = %tenant, "scheduled restoration");
                report.rescheduled += 1;
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::SessionSettings,
        credentials::MemoryCredentialStore,
        domain::{Credentials, TenantId},
        network::{ConnectRequest, LinkHandle, NetworkConnector},
        persistence::{MemorySessionStore, SessionRecord, SessionStore},
        session::SessionContext,
        Error,
    };
    use async_trait::async_trait;
    use chrono::Utc;

    struct DownConnector;

    #[async_trait]
    impl NetworkConnector for DownConnector {
        async fn connect(&self, _req: ConnectRequest) -> crate::Result<LinkHandle> {
            Err(Error::Transient("down".to_string()))
        }
    }

    fn tenant(raw: &str) -> TenantId {
        TenantId::parse(raw).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_recreates_missing_sessions_and_ignores_present_ones() {
        let store = Arc::new(MemorySessionStore::new());
        let creds = Arc::new(MemoryCredentialStore::new());
        let now = Utc::now();
        store
            .upsert(&SessionRecord {
                tenant_id: tenant("9"),
                session_data: "{}".to_string(),
                is_connected: true,
                connection_status: "connected".to_string(),
                last_activity: now,
                updated_at: now,
            })
            .await
            .unwrap();
        creds.insert(tenant("9"), Credentials(b"sim:9".to_vec()));

        let ctx = SessionContext::new(
            SessionSettings::default(),
            Arc::new(DownConnector),
            creds.clone(),
            store,
        );
        let registry = Arc::new(SessionRegistry::new(ctx));
        let monitor = HealthMonitor::new(registry.clone(), Duration::from_secs(240));

        let first = monitor.sweep().await;
        assert_eq!(first.recreated, 1);
        assert!(registry.get(&tenant("9")).is_some());

        // Present now, and its initial start is still pending.
        let second = monitor.sweep().await;
        assert_eq!(second, SweepReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_reschedules_idle_sessions_with_credentials() {
        let creds = Arc::new(MemoryCredentialStore::new());
        let ctx = SessionContext::new(
            SessionSettings::default(),
            Arc::new(DownConnector),
            creds.clone(),
            Arc::new(MemorySessionStore::new()),
        );
        let registry = Arc::new(SessionRegistry::new(ctx));
        registry.get_or_insert_idle(&tenant("a"));
        registry.get_or_insert_idle(&tenant("b"));
        creds.insert(tenant("a"), Credentials(b"sim:a".to_vec()));

        let report = HealthMonitor::new(registry, Duration::from_secs(240))
            .sweep()
            .await;
        assert_eq!(report.recreated, 0);
        assert_eq!(report.rescheduled, 1);
    }
}
