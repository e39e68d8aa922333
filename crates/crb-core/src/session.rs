//! Per-tenant connection state machine.
//!
//! Each start attempt gets a generation number and a cancellation token. One
//! task per attempt consumes the link's event stream and advances the state;
//! anything tagged with a superseded generation is ignored.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    config::SessionSettings,
    credentials::CredentialStore,
    domain::{Credentials, DeliveryId, SessionStatus, TenantId},
    errors::Error,
    events::{SessionEvent, SessionEventKind, EVENT_CHANNEL_CAPACITY, REQUESTED_DISCONNECT},
    limiter::{ConnectionLimiter, LimiterPermit},
    network::{Challenge, CloseReason, ConnectRequest, LinkEvent, LinkHandle, NetworkConnector, NetworkLink},
    persistence::{Persistence, SessionRecord, SessionStore},
    reconnect::{FailureClass, ReconnectAction},
    timers::{TimerKind, TimerSet},
    Result,
};

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Shared collaborators of every session in the process.
pub struct SessionContext {
    pub settings: SessionSettings,
    pub connector: Arc<dyn NetworkConnector>,
    pub credentials: Arc<dyn CredentialStore>,
    pub persistence: Persistence,
    pub limiter: ConnectionLimiter,
    pub events: broadcast::Sender<SessionEvent>,
}

impl SessionContext {
    /// Spawns the persistence writer, so it must run inside a tokio runtime.
    pub fn new(
        settings: SessionSettings,
        connector: Arc<dyn NetworkConnector>,
        credentials: Arc<dyn CredentialStore>,
        store: Arc<dyn SessionStore>,
    ) -> Arc<Self> {
        let limiter = ConnectionLimiter::new(settings.connection_limit);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            settings,
            connector,
            credentials,
            persistence: Persistence::spawn(store),
            limiter,
            events,
        })
    }
}

/// Point-in-time view of a session. Reading it never touches the network.
#[derive(Clone, Debug, Serialize)]
pub struct SessionSnapshot {
    pub tenant: TenantId,
    pub state: SessionStatus,
    pub connected: bool,
    pub has_qr: bool,
    pub has_pairing_code: bool,
    #[serde(skip)]
    pub qr: Option<String>,
    #[serde(skip)]
    pub pairing_code: Option<String>,
    pub phone: Option<String>,
    pub account: Option<String>,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
    pub last_activity: DateTime<Utc>,
}

impl SessionSnapshot {
    /// What `status` reports for a tenant with no session.
    pub fn disconnected(tenant: TenantId) -> Self {
        Self {
            tenant,
            state: SessionStatus::Disconnected,
            connected: false,
            has_qr: false,
            has_pairing_code: false,
            qr: None,
            pairing_code: None,
            phone: None,
            account: None,
            reconnect_attempts: 0,
            last_error: None,
            last_activity: Utc::now(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChallengeKind {
    Qr,
    Pairing,
}

/// Outcome of waiting for an authentication artifact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthProgress {
    Challenge(String),
    /// The session connected before (or instead of) issuing a challenge.
    Connected,
}

struct Attempt {
    generation: u64,
    cancel: CancellationToken,
    /// Started without usable credentials, i.e. expects a challenge.
    fresh_auth: bool,
    pairing_phone: Option<String>,
}

struct Ticket {
    generation: u64,
    cancel: CancellationToken,
    pairing_phone: Option<String>,
}

enum Begin {
    New(Ticket),
    Existing(u64),
    Closed,
}

struct SessionInner {
    status: SessionStatus,
    link: Option<Arc<dyn NetworkLink>>,
    qr: Option<String>,
    pairing_code: Option<String>,
    phone: Option<String>,
    account: Option<String>,
    credential_digest: Option<String>,
    reconnect_attempts: u32,
    heartbeat_failures: u32,
    generation: u64,
    attempt: Option<Attempt>,
    last_error: Option<String>,
    last_activity: DateTime<Utc>,
    closed: bool,
}

impl SessionInner {
    fn new() -> Self {
        Self {
            status: SessionStatus::Disconnected,
            link: None,
            qr: None,
            pairing_code: None,
            phone: None,
            account: None,
            credential_digest: None,
            reconnect_attempts: 0,
            heartbeat_failures: 0,
            generation: 0,
            attempt: None,
            last_error: None,
            last_activity: Utc::now(),
            closed: false,
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        !self.closed
            && self.generation == generation
            && self
                .attempt
                .as_ref()
                .is_some_and(|a| a.generation == generation)
    }

    fn clear_artifacts(&mut self) {
        self.qr = None;
        self.pairing_code = None;
    }

    fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

/// One tenant's connection to the messaging network.
pub struct Session {
    tenant: TenantId,
    ctx: Arc<SessionContext>,
    inner: Mutex<SessionInner>,
    snapshot: watch::Sender<SessionSnapshot>,
    timers: TimerSet,
}

impl Session {
    pub fn new(tenant: TenantId, ctx: Arc<SessionContext>) -> Arc<Self> {
        let (snapshot, _) = watch::channel(SessionSnapshot::disconnected(tenant.clone()));
        Arc::new(Self {
            tenant,
            ctx,
            inner: Mutex::new(SessionInner::new()),
            snapshot,
            timers: TimerSet::new(),
        })
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn status(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn is_timer_pending(&self, kind: TimerKind) -> bool {
        self.timers.is_pending(kind)
    }

    // ============== Start ==============

    /// Start (or force a fresh authentication of) the connection and wait
    /// until the link is open. Idempotent while an attempt is in flight.
    pub async fn start(self: Arc<Self>, force_new: bool) {
        if let Begin::New(ticket) = self.begin(force_new).await {
            self.establish(ticket).await;
        }
    }

    fn start_boxed(self: Arc<Self>, force_new: bool) -> BoxFuture {
        Box::pin(self.start(force_new))
    }

    /// Like [`start`](Self::start) but returns once the attempt is registered.
    ///
    /// Returns the generation of the attempt now in charge, or `None` when the
    /// session has been detached.
    pub async fn kick(self: &Arc<Self>, force_new: bool) -> Option<u64> {
        match self.begin(force_new).await {
            Begin::New(ticket) => {
                let generation = ticket.generation;
                tokio::spawn(Arc::clone(self).establish(ticket));
                Some(generation)
            }
            Begin::Existing(generation) => Some(generation),
            Begin::Closed => None,
        }
    }

    async fn begin(&self, force_new: bool) -> Begin {
        let mut st = self.inner.lock().await;
        if st.closed {
            return Begin::Closed;
        }

        if let Some(att) = &st.attempt {
            if !force_new {
                return Begin::Existing(att.generation);
            }
            // Concurrent forced starts for the same challenge coalesce.
            if att.fresh_auth
                && att.pairing_phone == st.phone
                && st.status != SessionStatus::Connected
            {
                return Begin::Existing(att.generation);
            }
        }

        if let Some(att) = st.attempt.take() {
            att.cancel.cancel();
        }
        self.timers.cancel_all();
        st.link = None;
        st.clear_artifacts();
        st.heartbeat_failures = 0;
        if st.status == SessionStatus::Error {
            st.reconnect_attempts = 0;
        }

        let fresh_auth = if force_new {
            if let Err(e) = self.ctx.credentials.destroy(&self.tenant).await {
                tracing::warn!(tenant = %self.tenant, "failed to destroy credentials: {e}");
            }
            st.credential_digest = None;
            st.account = None;
            true
        } else {
            !self
                .ctx
                .credentials
                .exists(&self.tenant)
                .await
                .unwrap_or(false)
        };

        st.generation += 1;
        let ticket = Ticket {
            generation: st.generation,
            cancel: CancellationToken::new(),
            pairing_phone: st.phone.clone(),
        };
        st.attempt = Some(Attempt {
            generation: ticket.generation,
            cancel: ticket.cancel.clone(),
            fresh_auth,
            pairing_phone: ticket.pairing_phone.clone(),
        });
        // `connecting` is only entered once a limiter slot is held.
        let was_down = st.status == SessionStatus::Disconnected;
        st.status = SessionStatus::Disconnected;
        st.touch();
        tracing::info!(
            tenant = %self.tenant,
            generation = ticket.generation,
            force_new,
            "starting session"
        );
        if was_down {
            self.snapshot.send_replace(self.snapshot_of(&st));
        } else {
            self.commit(&st, None);
        }
        Begin::New(ticket)
    }

    async fn establish(self: Arc<Self>, ticket: Ticket) {
        let generation = ticket.generation;
        let settings = &self.ctx.settings;

        let permit = tokio::select! {
            biased;
            _ = ticket.cancel.cancelled() => return,
            res = self.ctx.limiter.acquire_timeout(settings.limiter_timeout) => match res {
                Ok(permit) => permit,
                Err(e) => {
                    self.fail(generation, CloseReason::Stream(e.to_string())).await;
                    return;
                }
            },
        };

        {
            let mut st = self.inner.lock().await;
            if !st.is_current(generation) || ticket.cancel.is_cancelled() {
                return;
            }
            st.status = SessionStatus::Connecting;
            st.touch();
            self.commit(&st, None);
        }

        // From here on the permit is released only after the state has left
        // `connecting`, so at most K sessions ever report it.
        let credentials = match self.ctx.credentials.load(&self.tenant).await {
            Ok(creds) => creds,
            Err(e) => {
                self.fail(generation, CloseReason::Stream(format!("credential load failed: {e}")))
                    .await;
                return;
            }
        };

        let req = ConnectRequest {
            tenant: self.tenant.clone(),
            credentials,
            pairing_phone: ticket.pairing_phone.clone(),
        };
        let connect = timeout(settings.connect_timeout, self.ctx.connector.connect(req));
        let handle = tokio::select! {
            biased;
            _ = ticket.cancel.cancelled() => return,
            res = connect => match res {
                Ok(Ok(handle)) => handle,
                Ok(Err(e)) => {
                    self.fail(generation, CloseReason::Stream(e.to_string())).await;
                    return;
                }
                Err(_) => {
                    self.fail(generation, CloseReason::Stream("connect timed out".to_string()))
                        .await;
                    return;
                }
            },
        };

        {
            let mut st = self.inner.lock().await;
            if !st.is_current(generation) || ticket.cancel.is_cancelled() {
                drop(st);
                handle.link.close().await;
                return;
            }
            st.link = Some(Arc::clone(&handle.link));
        }

        tokio::spawn(self.drive(generation, ticket.cancel, handle, permit));
    }

    async fn drive(
        self: Arc<Self>,
        generation: u64,
        cancel: CancellationToken,
        handle: LinkHandle,
        permit: LimiterPermit,
    ) {
        let LinkHandle { link, mut events } = handle;
        let mut permit = Some(permit);
        let handshake_deadline = Instant::now() + self.ctx.settings.connect_timeout;

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    link.close().await;
                    return;
                }
                ev = events.recv() => ev,
                _ = sleep_until(handshake_deadline), if permit.is_some() => {
                    link.close().await;
                    self.fail(generation, CloseReason::Stream("handshake timed out".to_string()))
                        .await;
                    return;
                }
            };

            // The limiter only bounds the handshake itself.
            let handshake_over = !matches!(event, Some(LinkEvent::CredentialsUpdated(_)));

            match event {
                Some(LinkEvent::Challenge(challenge)) => self.on_challenge(generation, challenge).await,
                Some(LinkEvent::CredentialsUpdated(creds)) => {
                    self.on_credentials(generation, creds).await
                }
                Some(LinkEvent::Connected { account }) => {
                    self.on_connected(generation, account).await
                }
                Some(LinkEvent::Closed(reason)) => {
                    link.close().await;
                    self.fail(generation, reason).await;
                    return;
                }
                None => {
                    link.close().await;
                    self.fail(generation, CloseReason::Stream("event stream ended".to_string()))
                        .await;
                    return;
                }
            }

            if handshake_over {
                permit.take();
            }
        }
    }

    // ============== Link events ==============

    async fn on_challenge(&self, generation: u64, challenge: Challenge) {
        let mut st = self.inner.lock().await;
        if !st.is_current(generation) {
            return;
        }
        st.clear_artifacts();
        let kind = match challenge {
            Challenge::Qr(qr) => {
                st.qr = Some(qr);
                st.status = SessionStatus::QrPending;
                SessionEventKind::QrReady
            }
            Challenge::PairingCode(code) => {
                st.pairing_code = Some(code.clone());
                st.status = SessionStatus::PairingPending;
                SessionEventKind::PairingReady { code }
            }
        };
        st.touch();
        tracing::info!(tenant = %self.tenant, status = %st.status, "authentication challenge issued");
        self.commit(&st, Some(kind));
    }

    async fn on_credentials(&self, generation: u64, creds: Credentials) {
        let mut st = self.inner.lock().await;
        if !st.is_current(generation) {
            return;
        }
        if let Err(e) = self.ctx.credentials.save(&self.tenant, &creds).await {
            tracing::warn!(tenant = %self.tenant, "failed to save credentials: {e}");
            return;
        }
        st.credential_digest = Some(creds.digest());
        st.touch();
        tracing::debug!(tenant = %self.tenant, digest = ?st.credential_digest, "credentials updated");
        self.commit(&st, None);
    }

    async fn on_connected(self: &Arc<Self>, generation: u64, account: Option<String>) {
        let mut st = self.inner.lock().await;
        if !st.is_current(generation) {
            return;
        }
        st.status = SessionStatus::Connected;
        st.clear_artifacts();
        st.reconnect_attempts = 0;
        st.heartbeat_failures = 0;
        st.last_error = None;
        if account.is_some() {
            st.account = account.clone();
        }
        if let Some(att) = st.attempt.as_mut() {
            att.fresh_auth = false;
        }
        st.touch();
        tracing::info!(tenant = %self.tenant, account = ?st.account, "session connected");
        self.commit(&st, Some(SessionEventKind::Connected { account }));
        drop(st);

        self.start_heartbeat(generation);
    }

    // ============== Failure handling ==============

    /// Classify a close and apply the reconnection policy.
    async fn fail(self: &Arc<Self>, generation: u64, reason: CloseReason) {
        let mut st = self.inner.lock().await;
        if !st.is_current(generation) {
            return;
        }
        if let Some(att) = st.attempt.take() {
            att.cancel.cancel();
        }
        self.timers.cancel(TimerKind::Heartbeat);
        st.link = None;
        st.clear_artifacts();
        st.heartbeat_failures = 0;
        st.last_error = Some(reason.to_string());
        st.touch();

        let class = FailureClass::classify(&reason);
        tracing::warn!(tenant = %self.tenant, class = %class, "link closed: {reason}");

        if class.destroys_credentials() {
            if let Err(e) = self.ctx.credentials.destroy(&self.tenant).await {
                tracing::warn!(tenant = %self.tenant, "failed to destroy credentials: {e}");
            }
            st.credential_digest = None;
            st.account = None;
        }

        let policy = &self.ctx.settings.reconnect;
        let action = policy.decide(class, st.reconnect_attempts, policy.jitter());
        let event = match action {
            ReconnectAction::Stop => {
                st.status = SessionStatus::Disconnected;
                SessionEventKind::Disconnected {
                    reason: reason.to_string(),
                }
            }
            ReconnectAction::GiveUp => {
                st.status = SessionStatus::Error;
                tracing::error!(
                    tenant = %self.tenant,
                    attempts = st.reconnect_attempts,
                    "giving up on reconnecting"
                );
                SessionEventKind::Failed {
                    reason: format!(
                        "gave up after {} attempts: {reason}",
                        st.reconnect_attempts
                    ),
                }
            }
            ReconnectAction::Restart { delay, force_new } => {
                st.status = SessionStatus::Disconnected;
                st.reconnect_attempts += 1;
                self.schedule_start(TimerKind::Reconnect, delay, force_new);
                SessionEventKind::Disconnected {
                    reason: reason.to_string(),
                }
            }
        };
        self.commit(&st, Some(event));
    }

    // ============== Heartbeat ==============

    fn start_heartbeat(self: &Arc<Self>, generation: u64) {
        let this = Arc::clone(self);
        let period = self.ctx.settings.heartbeat_interval;
        self.timers
            .spawn_periodic(TimerKind::Heartbeat, period, move || {
                let this = Arc::clone(&this);
                async move { this.heartbeat_tick(generation).await }
            });
    }

    /// One liveness probe. Returns whether the heartbeat should keep running.
    async fn heartbeat_tick(self: &Arc<Self>, generation: u64) -> bool {
        let link = {
            let st = self.inner.lock().await;
            if !st.is_current(generation) || st.status != SessionStatus::Connected {
                return false;
            }
            match &st.link {
                Some(link) => Arc::clone(link),
                None => return false,
            }
        };

        let healthy = matches!(
            timeout(self.ctx.settings.connect_timeout, link.probe()).await,
            Ok(Ok(()))
        );

        let mut st = self.inner.lock().await;
        if !st.is_current(generation) {
            return false;
        }
        if healthy {
            st.heartbeat_failures = 0;
            return true;
        }

        st.heartbeat_failures += 1;
        let failures = st.heartbeat_failures;
        tracing::debug!(tenant = %self.tenant, failures, "heartbeat probe failed");
        if failures < self.ctx.settings.heartbeat_max_failures {
            return true;
        }
        drop(st);

        self.fail(
            generation,
            CloseReason::Stream(format!("{failures} consecutive heartbeat failures")),
        )
        .await;
        false
    }

    // ============== Scheduling ==============

    fn schedule_start(self: &Arc<Self>, kind: TimerKind, delay: Duration, force_new: bool) -> bool {
        tracing::debug!(tenant = %self.tenant, ?kind, ?delay, force_new, "scheduling start");
        let task = Arc::clone(self).start_boxed(force_new);
        self.timers.schedule_once(kind, delay, task)
    }

    /// Schedule a jittered initial start, unless one is already underway.
    pub fn schedule_initial_start(self: &Arc<Self>, delay: Duration) -> bool {
        if self.timers.is_pending(TimerKind::Start) || self.timers.is_pending(TimerKind::Reconnect) {
            return false;
        }
        self.schedule_start(TimerKind::Start, delay, false)
    }

    /// Schedule a restoration attempt if the session is idle in `disconnected`
    /// with stored credentials and nothing else pending.
    pub async fn schedule_restore(self: &Arc<Self>, delay: Duration) -> bool {
        {
            let st = self.inner.lock().await;
            if st.closed || st.status != SessionStatus::Disconnected || st.attempt.is_some() {
                return false;
            }
        }
        if self.timers.is_pending(TimerKind::Start) || self.timers.is_pending(TimerKind::Reconnect) {
            return false;
        }
        match self.ctx.credentials.exists(&self.tenant).await {
            Ok(true) => self.schedule_start(TimerKind::Start, delay, false),
            Ok(false) => false,
            Err(e) => {
                tracing::warn!(tenant = %self.tenant, "credential lookup failed: {e}");
                false
            }
        }
    }

    // ============== Operations ==============

    /// Associate (or clear) the phone number used for pairing-code challenges.
    pub async fn set_pairing_phone(&self, phone: Option<String>) {
        self.inner.lock().await.phone = phone;
    }

    /// Send over the live link.
    ///
    /// Without a live link this fails with `NotConnected` and schedules a
    /// best-effort restore. Losing the link mid-send fails with `SendFailed`
    /// and hands the session to the reconnection policy.
    pub async fn send_text(self: &Arc<Self>, to: &str, text: &str) -> Result<DeliveryId> {
        let live = {
            let st = self.inner.lock().await;
            match (&st.link, st.status) {
                (Some(link), SessionStatus::Connected) => Some((Arc::clone(link), st.generation)),
                _ => None,
            }
        };
        let Some((link, generation)) = live else {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.schedule_restore(Duration::ZERO).await;
            });
            return Err(Error::NotConnected(self.tenant.to_string()));
        };

        match link.send_text(to, text).await {
            Ok(id) => {
                let mut st = self.inner.lock().await;
                if st.is_current(generation) {
                    st.touch();
                    self.snapshot.send_replace(self.snapshot_of(&st));
                }
                tracing::info!(tenant = %self.tenant, id = %id, "message sent");
                Ok(id)
            }
            Err(Error::Transient(msg)) => {
                let this = Arc::clone(self);
                let reason = CloseReason::Stream(format!("send failed: {msg}"));
                tokio::spawn(async move { this.fail(generation, reason).await });
                Err(Error::SendFailed(msg))
            }
            Err(e) => Err(e),
        }
    }

    /// Wait until the requested artifact is available or the session connects.
    pub async fn wait_for_challenge(&self, kind: ChallengeKind, wait: Duration) -> Result<AuthProgress> {
        let mut rx = self.snapshot.subscribe();
        let watch_loop = async {
            loop {
                {
                    let snap = rx.borrow_and_update();
                    if snap.state == SessionStatus::Connected {
                        return Ok(AuthProgress::Connected);
                    }
                    let artifact = match kind {
                        ChallengeKind::Qr => snap.qr.clone(),
                        ChallengeKind::Pairing => snap.pairing_code.clone(),
                    };
                    if let Some(artifact) = artifact {
                        return Ok(AuthProgress::Challenge(artifact));
                    }
                    if snap.state == SessionStatus::Error {
                        return Err(Error::Transient(
                            snap.last_error
                                .clone()
                                .unwrap_or_else(|| "session failed".to_string()),
                        ));
                    }
                }
                if rx.changed().await.is_err() {
                    return Err(Error::NotConnected(self.tenant.to_string()));
                }
            }
        };
        timeout(wait, watch_loop)
            .await
            .map_err(|_| Error::ChallengeTimeout)?
    }

    /// Stop everything this session owns without touching stored state.
    ///
    /// Timers are closed for good, so nothing scheduled before this call can
    /// restart the session afterwards.
    pub async fn detach(&self) {
        self.timers.close();
        let mut st = self.inner.lock().await;
        st.closed = true;
        if let Some(att) = st.attempt.take() {
            att.cancel.cancel();
        }
        let link = st.link.take();
        st.clear_artifacts();
        st.status = SessionStatus::Disconnected;
        self.snapshot.send_replace(self.snapshot_of(&st));
        drop(st);

        if let Some(link) = link {
            link.close().await;
        }
        tracing::debug!(tenant = %self.tenant, "session detached");
    }

    /// Destroy stored credentials and record the tenant as disconnected.
    ///
    /// The disconnected record is written even when the destroy fails, so the
    /// health sweep never brings the tenant back.
    pub async fn forget_credentials(&self) -> Result<()> {
        let mut st = self.inner.lock().await;
        let destroyed = self.ctx.credentials.destroy(&self.tenant).await;
        if destroyed.is_ok() {
            st.credential_digest = None;
        }
        st.account = None;
        st.phone = None;
        st.status = SessionStatus::Disconnected;
        st.touch();
        self.commit(
            &st,
            Some(SessionEventKind::Disconnected {
                reason: REQUESTED_DISCONNECT.to_string(),
            }),
        );
        destroyed
    }

    // ============== Publishing ==============

    fn commit(&self, st: &SessionInner, event: Option<SessionEventKind>) {
        self.snapshot.send_replace(self.snapshot_of(st));
        self.ctx.persistence.submit(self.record_of(st));
        if let Some(kind) = event {
            // No subscribers is fine.
            let _ = self
                .ctx
                .events
                .send(SessionEvent::now(self.tenant.clone(), kind));
        }
    }

    fn snapshot_of(&self, st: &SessionInner) -> SessionSnapshot {
        SessionSnapshot {
            tenant: self.tenant.clone(),
            state: st.status,
            connected: st.status == SessionStatus::Connected && st.link.is_some(),
            has_qr: st.qr.is_some(),
            has_pairing_code: st.pairing_code.is_some(),
            qr: st.qr.clone(),
            pairing_code: st.pairing_code.clone(),
            phone: st.phone.clone(),
            account: st.account.clone(),
            reconnect_attempts: st.reconnect_attempts,
            last_error: st.last_error.clone(),
            last_activity: st.last_activity,
        }
    }

    fn record_of(&self, st: &SessionInner) -> SessionRecord {
        let session_data = serde_json::json!({
            "credential_digest": st.credential_digest,
            "phone": st.phone,
            "account": st.account,
        });
        SessionRecord {
            tenant_id: self.tenant.clone(),
            session_data: session_data.to_string(),
            is_connected: st.status == SessionStatus::Connected,
            connection_status: st.status.coarse().to_string(),
            last_activity: st.last_activity,
            updated_at: Utc::now(),
        }
    }
}
