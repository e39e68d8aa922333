//! In-process messaging network implementing [`NetworkConnector`].
//!
//! Credentials it issues are `sim:`-prefixed byte strings. A connect with such
//! credentials goes straight to `Connected`; anything else gets a challenge
//! (pairing code when a phone is given, QR otherwise) that completes when the
//! test or operator calls [`SimNetwork::scan`]. Every link can be killed,
//! silenced or closed with a status code to exercise the recovery paths.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    time::Duration,
};

use async_trait::async_trait;
use crb_core::{
    domain::{Credentials, DeliveryId, TenantId},
    network::{
        Challenge, CloseReason, ConnectRequest, LinkEvent, LinkHandle, NetworkConnector,
        NetworkLink,
    },
    Error, Result,
};
use tokio::sync::mpsc;

const CREDENTIAL_PREFIX: &[u8] = b"sim:";
const EVENT_BUFFER: usize = 32;

#[derive(Clone, Debug)]
pub struct SimConfig {
    /// Time a connect call spends "handshaking" before the first event.
    pub handshake_delay: Duration,
    /// Complete every challenge automatically after this delay.
    pub auto_pair_after: Option<Duration>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            handshake_delay: Duration::from_millis(20),
            auto_pair_after: None,
        }
    }
}

/// A message accepted by the simulated network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentMessage {
    pub tenant: TenantId,
    pub to: String,
    pub text: String,
    pub id: DeliveryId,
}

#[derive(Default)]
struct SimState {
    links: HashMap<TenantId, Vec<Arc<SimLink>>>,
    revoked: HashSet<TenantId>,
    scripted_closes: HashMap<TenantId, VecDeque<u16>>,
    probe_failing: HashSet<TenantId>,
    connect_calls: HashMap<TenantId, usize>,
    sent: Vec<SentMessage>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<SimState>,
    in_handshake: AtomicUsize,
    max_in_handshake: AtomicUsize,
    next_message: AtomicU64,
    next_challenge: AtomicU64,
    next_credential: AtomicU64,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Counts a connect call as in-handshake for as long as it lives.
struct HandshakeGuard<'a>(&'a Shared);

impl<'a> HandshakeGuard<'a> {
    fn enter(shared: &'a Shared) -> Self {
        let now = shared.in_handshake.fetch_add(1, Ordering::SeqCst) + 1;
        shared.max_in_handshake.fetch_max(now, Ordering::SeqCst);
        Self(shared)
    }
}

impl Drop for HandshakeGuard<'_> {
    fn drop(&mut self) {
        self.0.in_handshake.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone, Default)]
pub struct SimNetwork {
    cfg: SimConfig,
    shared: Arc<Shared>,
}

impl SimNetwork {
    pub fn new(cfg: SimConfig) -> Self {
        Self {
            cfg,
            shared: Arc::new(Shared::default()),
        }
    }

    /// Credentials the network accepts without a challenge.
    pub fn issue_credentials(&self, tenant: &TenantId) -> Credentials {
        let n = self.shared.next_credential.fetch_add(1, Ordering::SeqCst);
        let mut bytes = CREDENTIAL_PREFIX.to_vec();
        bytes.extend_from_slice(format!("{tenant}:{n}").as_bytes());
        Credentials(bytes)
    }

    // ============== Controls ==============

    /// Complete the pending challenge on `tenant`'s current link.
    pub fn scan(&self, tenant: &TenantId) -> bool {
        let Some(link) = self.current_link(tenant) else {
            return false;
        };
        if !link.awaiting_scan.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.shared.state().revoked.remove(tenant);
        let creds = self.issue_credentials(tenant);
        link.emit(LinkEvent::CredentialsUpdated(creds));
        link.emit(LinkEvent::Connected {
            account: Some(account_for(tenant)),
        });
        tracing::debug!(tenant = %tenant, "sim: challenge completed");
        true
    }

    /// Drop the current link with a stream error.
    pub fn kill(&self, tenant: &TenantId) -> bool {
        self.close_current(tenant, CloseReason::Stream("connection reset by peer".to_string()))
    }

    /// Drop the current link without telling anyone. Only probes notice.
    pub fn drop_silently(&self, tenant: &TenantId) -> bool {
        match self.current_link(tenant) {
            Some(link) => {
                link.alive.store(false, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Close the current link with a raw network status code.
    pub fn close_with(&self, tenant: &TenantId, code: u16) -> bool {
        self.close_current(tenant, CloseReason::from_status_code(code))
    }

    /// Invalidate `tenant`'s credentials on the network side and log it out.
    pub fn revoke(&self, tenant: &TenantId) {
        self.shared.state().revoked.insert(tenant.clone());
        self.close_current(tenant, CloseReason::LoggedOut);
    }

    /// Make the next connect for `tenant` close immediately with `code`.
    pub fn fail_next_connect(&self, tenant: &TenantId, code: u16) {
        self.shared
            .state()
            .scripted_closes
            .entry(tenant.clone())
            .or_default()
            .push_back(code);
    }

    pub fn set_probe_failing(&self, tenant: &TenantId, failing: bool) {
        let mut st = self.shared.state();
        if failing {
            st.probe_failing.insert(tenant.clone());
        } else {
            st.probe_failing.remove(tenant);
        }
    }

    // ============== Observation ==============

    pub fn connect_calls(&self, tenant: &TenantId) -> usize {
        self.shared
            .state()
            .connect_calls
            .get(tenant)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_connect_calls(&self) -> usize {
        self.shared.state().connect_calls.values().sum()
    }

    /// Links for `tenant` that nobody has closed yet.
    pub fn open_links(&self, tenant: &TenantId) -> usize {
        self.shared
            .state()
            .links
            .get(tenant)
            .map(|links| links.iter().filter(|l| !l.closed.load(Ordering::SeqCst)).count())
            .unwrap_or(0)
    }

    /// Highest number of connect calls ever handshaking at the same time.
    pub fn max_in_handshake(&self) -> usize {
        self.shared.max_in_handshake.load(Ordering::SeqCst)
    }

    pub fn sent_messages(&self) -> Vec<SentMessage> {
        self.shared.state().sent.clone()
    }

    fn current_link(&self, tenant: &TenantId) -> Option<Arc<SimLink>> {
        self.shared
            .state()
            .links
            .get(tenant)
            .and_then(|links| links.iter().rev().find(|l| l.is_up()).cloned())
    }

    fn close_current(&self, tenant: &TenantId, reason: CloseReason) -> bool {
        let Some(link) = self.current_link(tenant) else {
            return false;
        };
        link.alive.store(false, Ordering::SeqCst);
        link.awaiting_scan.store(false, Ordering::SeqCst);
        tracing::debug!(tenant = %tenant, %reason, "sim: closing link");
        link.emit(LinkEvent::Closed(reason));
        true
    }
}

fn account_for(tenant: &TenantId) -> String {
    format!("sim-{tenant}")
}

#[async_trait]
impl NetworkConnector for SimNetwork {
    async fn connect(&self, req: ConnectRequest) -> Result<LinkHandle> {
        let guard = HandshakeGuard::enter(&self.shared);
        *self
            .shared
            .state()
            .connect_calls
            .entry(req.tenant.clone())
            .or_default() += 1;

        tokio::time::sleep(self.cfg.handshake_delay).await;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let link = Arc::new(SimLink {
            tenant: req.tenant.clone(),
            shared: Arc::downgrade(&self.shared),
            alive: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            awaiting_scan: AtomicBool::new(false),
            events: tx,
        });

        let (scripted, revoked) = {
            let mut st = self.shared.state();
            st.links
                .entry(req.tenant.clone())
                .or_default()
                .push(Arc::clone(&link));
            let scripted = st
                .scripted_closes
                .get_mut(&req.tenant)
                .and_then(VecDeque::pop_front);
            (scripted, st.revoked.contains(&req.tenant))
        };

        let valid_creds = req
            .credentials
            .as_ref()
            .is_some_and(|c| c.as_bytes().starts_with(CREDENTIAL_PREFIX));

        if let Some(code) = scripted {
            link.alive.store(false, Ordering::SeqCst);
            link.emit(LinkEvent::Closed(CloseReason::from_status_code(code)));
        } else if valid_creds && revoked {
            link.alive.store(false, Ordering::SeqCst);
            link.emit(LinkEvent::Closed(CloseReason::LoggedOut));
        } else if valid_creds {
            link.emit(LinkEvent::Connected {
                account: Some(account_for(&req.tenant)),
            });
        } else {
            let seq = self.shared.next_challenge.fetch_add(1, Ordering::SeqCst);
            let challenge = match &req.pairing_phone {
                Some(phone) => {
                    let tail = phone.len().saturating_sub(4);
                    Challenge::PairingCode(format!("{:04}-{}", seq % 10_000, &phone[tail..]))
                }
                None => Challenge::Qr(format!("sim-qr:{}:{seq}", req.tenant)),
            };
            link.awaiting_scan.store(true, Ordering::SeqCst);
            link.emit(LinkEvent::Challenge(challenge));

            if let Some(after) = self.cfg.auto_pair_after {
                let net = self.clone();
                let tenant = req.tenant.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    net.scan(&tenant);
                });
            }
        }
        drop(guard);

        tracing::debug!(tenant = %req.tenant, "sim: link opened");
        Ok(LinkHandle { link, events: rx })
    }
}

pub struct SimLink {
    tenant: TenantId,
    shared: Weak<Shared>,
    alive: AtomicBool,
    closed: AtomicBool,
    awaiting_scan: AtomicBool,
    events: mpsc::Sender<LinkEvent>,
}

impl SimLink {
    fn is_up(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    fn emit(&self, event: LinkEvent) {
        if let Err(e) = self.events.try_send(event) {
            tracing::debug!(tenant = %self.tenant, "sim: dropped link event: {e}");
        }
    }
}

#[async_trait]
impl NetworkLink for SimLink {
    async fn send_text(&self, to: &str, text: &str) -> Result<DeliveryId> {
        if !self.is_up() {
            return Err(Error::Transient("link is down".to_string()));
        }
        let shared = self
            .shared
            .upgrade()
            .ok_or_else(|| Error::Transient("network is gone".to_string()))?;
        let n = shared.next_message.fetch_add(1, Ordering::SeqCst) + 1;
        let id = DeliveryId(format!("SIM{n:08}"));
        shared.state().sent.push(SentMessage {
            tenant: self.tenant.clone(),
            to: to.to_string(),
            text: text.to_string(),
            id: id.clone(),
        });
        Ok(id)
    }

    async fn probe(&self) -> Result<()> {
        let failing = self
            .shared
            .upgrade()
            .is_some_and(|s| s.state().probe_failing.contains(&self.tenant));
        if self.is_up() && !failing {
            Ok(())
        } else {
            Err(Error::Transient("probe failed".to_string()))
        }
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(raw: &str) -> TenantId {
        TenantId::parse(raw).unwrap()
    }

    fn request(net: &SimNetwork, t: &TenantId, with_creds: bool) -> ConnectRequest {
        ConnectRequest {
            tenant: t.clone(),
            credentials: with_creds.then(|| net.issue_credentials(t)),
            pairing_phone: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn valid_credentials_connect_directly() {
        let net = SimNetwork::default();
        let t = tenant("7");
        let mut handle = net.connect(request(&net, &t, true)).await.unwrap();
        assert!(matches!(
            handle.events.recv().await,
            Some(LinkEvent::Connected { .. })
        ));
        assert_eq!(net.connect_calls(&t), 1);
        assert_eq!(net.open_links(&t), 1);

        let id = handle.link.send_text("5511999999999", "hi").await.unwrap();
        assert_eq!(id, DeliveryId("SIM00000001".to_string()));
        handle.link.close().await;
        handle.link.close().await;
        assert_eq!(net.open_links(&t), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_credentials_get_a_challenge_until_scanned() {
        let net = SimNetwork::default();
        let t = tenant("42");
        let mut handle = net.connect(request(&net, &t, false)).await.unwrap();
        match handle.events.recv().await {
            Some(LinkEvent::Challenge(Challenge::Qr(qr))) => assert!(qr.starts_with("sim-qr:42")),
            other => panic!("unexpected event: {other:?}"),
        }

        assert!(net.scan(&t));
        assert!(!net.scan(&t));
        assert!(matches!(
            handle.events.recv().await,
            Some(LinkEvent::CredentialsUpdated(_))
        ));
        assert!(matches!(
            handle.events.recv().await,
            Some(LinkEvent::Connected { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn pairing_phone_yields_pairing_code() {
        let net = SimNetwork::default();
        let t = tenant("p");
        let mut req = request(&net, &t, false);
        req.pairing_phone = Some("5511999991234".to_string());
        let mut handle = net.connect(req).await.unwrap();
        match handle.events.recv().await {
            Some(LinkEvent::Challenge(Challenge::PairingCode(code))) => {
                assert!(code.ends_with("-1234"))
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn kill_and_scripted_closes_report_reasons() {
        let net = SimNetwork::default();
        let t = tenant("k");
        let mut handle = net.connect(request(&net, &t, true)).await.unwrap();
        handle.events.recv().await;
        assert!(net.kill(&t));
        assert!(matches!(
            handle.events.recv().await,
            Some(LinkEvent::Closed(CloseReason::Stream(_)))
        ));
        assert!(handle.link.send_text("5511999999999", "x").await.is_err());

        net.fail_next_connect(&t, 440);
        let mut handle = net.connect(request(&net, &t, true)).await.unwrap();
        assert!(matches!(
            handle.events.recv().await,
            Some(LinkEvent::Closed(CloseReason::Replaced))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn probes_follow_link_health() {
        let net = SimNetwork::default();
        let t = tenant("h");
        let handle = net.connect(request(&net, &t, true)).await.unwrap();
        assert!(handle.link.probe().await.is_ok());
        net.set_probe_failing(&t, true);
        assert!(handle.link.probe().await.is_err());
        net.set_probe_failing(&t, false);
        assert!(net.drop_silently(&t));
        assert!(handle.link.probe().await.is_err());
    }
}
