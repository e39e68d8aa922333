//! End-to-end behavior of the gateway against the simulated network.
//!
//! Time is paused: sleeps advance the tokio clock instantly, so minutes of
//! backoff and heartbeat intervals run in milliseconds.

use std::{sync::Arc, time::Duration};

use crb_core::{
    config::SessionSettings,
    credentials::{CredentialStore, MemoryCredentialStore},
    domain::{SessionStatus, TenantId},
    events::SessionEventKind,
    gateway::Gateway,
    health::HealthMonitor,
    persistence::{MemorySessionStore, SessionRecord, SessionStore},
    reconnect::ReconnectPolicy,
    registry::SessionRegistry,
    session::{AuthProgress, SessionContext},
    timers::TimerKind,
    Error,
};
use crb_sim::{SimConfig, SimNetwork};
use tokio::time::{sleep, Instant};

struct World {
    net: SimNetwork,
    creds: Arc<MemoryCredentialStore>,
    store: Arc<MemorySessionStore>,
    registry: Arc<SessionRegistry>,
    gateway: Gateway,
}

fn settings() -> SessionSettings {
    SessionSettings {
        connection_limit: 2,
        start_jitter_max: Duration::from_millis(200),
        heartbeat_interval: Duration::from_secs(5),
        heartbeat_max_failures: 3,
        health_sweep_interval: Duration::from_secs(240),
        challenge_wait: Duration::from_secs(10),
        reconnect: ReconnectPolicy {
            base: Duration::from_millis(200),
            ceiling: Duration::from_secs(5),
            max_attempts: 5,
            challenge_retry: Duration::from_secs(1),
            server_restart: Duration::from_secs(2),
            conflict_backoff: Duration::from_secs(30),
        },
        ..SessionSettings::default()
    }
}

fn world_with(cfg: SimConfig, settings: SessionSettings, store: Arc<MemorySessionStore>) -> World {
    let net = SimNetwork::new(cfg);
    let creds = Arc::new(MemoryCredentialStore::new());
    let ctx = SessionContext::new(
        settings,
        Arc::new(net.clone()),
        creds.clone(),
        store.clone(),
    );
    let registry = Arc::new(SessionRegistry::new(ctx));
    let gateway = Gateway::new(registry.clone(), false);
    World {
        net,
        creds,
        store,
        registry,
        gateway,
    }
}

fn world() -> World {
    world_with(
        SimConfig::default(),
        settings(),
        Arc::new(MemorySessionStore::new()),
    )
}

fn tenant(raw: &str) -> TenantId {
    TenantId::parse(raw).unwrap()
}

async fn wait_for(w: &World, t: &TenantId, state: SessionStatus, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if w.gateway.status(t).state == state {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    w.gateway.status(t).state == state
}

/// Seed credentials and bring the tenant to `connected`.
async fn connected(w: &World, raw: &str) -> TenantId {
    let t = tenant(raw);
    w.creds.insert(t.clone(), w.net.issue_credentials(&t));
    w.gateway.connect(&t).await;
    assert!(wait_for(w, &t, SessionStatus::Connected, Duration::from_secs(2)).await);
    t
}

// ============== Authentication ==============

#[tokio::test(start_paused = true)]
async fn request_qr_for_new_tenant_returns_artifact() {
    let w = world();
    let t = tenant("42");

    let progress = w.gateway.request_qr(&t).await.unwrap();
    match progress {
        AuthProgress::Challenge(qr) => assert!(qr.starts_with("sim-qr:42")),
        other => panic!("expected a QR code, got {other:?}"),
    }
    let snap = w.gateway.status(&t);
    assert_eq!(snap.state, SessionStatus::QrPending);
    assert!(snap.has_qr);
    assert!(!snap.has_pairing_code);

    // A second request reuses the pending code instead of restarting.
    let again = w.gateway.request_qr(&t).await.unwrap();
    assert!(matches!(again, AuthProgress::Challenge(_)));
    assert_eq!(w.net.connect_calls(&t), 1);

    assert!(w.net.scan(&t));
    assert!(wait_for(&w, &t, SessionStatus::Connected, Duration::from_secs(1)).await);
    assert!(w.creds.contains(&t));
    assert!(!w.gateway.status(&t).has_qr);
}

#[tokio::test(start_paused = true)]
async fn request_pairing_returns_code_and_auto_pairs() {
    let w = world_with(
        SimConfig {
            auto_pair_after: Some(Duration::from_secs(3)),
            ..SimConfig::default()
        },
        settings(),
        Arc::new(MemorySessionStore::new()),
    );
    let t = tenant("pair");

    let progress = w
        .gateway
        .request_pairing(&t, "+55 (11) 99999-1234")
        .await
        .unwrap();
    match progress {
        AuthProgress::Challenge(code) => assert!(code.ends_with("-1234")),
        other => panic!("expected a pairing code, got {other:?}"),
    }
    let snap = w.gateway.status(&t);
    assert_eq!(snap.state, SessionStatus::PairingPending);
    assert_eq!(snap.phone.as_deref(), Some("5511999991234"));

    assert!(wait_for(&w, &t, SessionStatus::Connected, Duration::from_secs(5)).await);
}

#[tokio::test(start_paused = true)]
async fn switching_challenge_kind_never_exposes_both_artifacts() {
    let w = world();
    let t = tenant("switch");

    w.gateway.request_qr(&t).await.unwrap();
    let snap = w.gateway.status(&t);
    assert!(snap.has_qr && !snap.has_pairing_code);

    let mut events = w.registry.subscribe();
    w.gateway.request_pairing(&t, "5511988887777").await.unwrap();
    let snap = w.gateway.status(&t);
    assert!(!snap.has_qr && snap.has_pairing_code);
    assert!(matches!(
        events.recv().await.unwrap().kind,
        SessionEventKind::PairingReady { .. }
    ));

    w.gateway.request_qr(&t).await.unwrap();
    let snap = w.gateway.status(&t);
    assert!(snap.has_qr && !snap.has_pairing_code);
    assert_eq!(w.net.connect_calls(&t), 3);
}

#[tokio::test(start_paused = true)]
async fn request_qr_on_connected_tenant_keeps_the_session() {
    let w = world();
    let t = connected(&w, "busy").await;

    assert_eq!(w.gateway.request_qr(&t).await.unwrap(), AuthProgress::Connected);
    assert_eq!(w.net.connect_calls(&t), 1);
    assert!(w.creds.contains(&t));
}

#[tokio::test(start_paused = true)]
async fn unanswered_challenge_retries_then_gives_up() {
    let w = world();
    let t = tenant("ignored");
    w.gateway.request_qr(&t).await.unwrap();

    // Each QR expires (408); the retry budget is finite.
    for _ in 0..6 {
        assert!(wait_for(&w, &t, SessionStatus::QrPending, Duration::from_secs(5)).await);
        assert!(w.net.close_with(&t, 408));
        sleep(Duration::from_millis(50)).await;
    }
    assert!(wait_for(&w, &t, SessionStatus::Error, Duration::from_secs(5)).await);
    let calls = w.net.connect_calls(&t);
    sleep(Duration::from_secs(600)).await;
    assert_eq!(w.net.connect_calls(&t), calls);
}

// ============== Idempotency and limits ==============

#[tokio::test(start_paused = true)]
async fn concurrent_starts_on_connected_tenant_are_noops() {
    let w = world();
    let t = connected(&w, "7").await;

    let session = w.registry.get(&t).unwrap();
    let mut joins = Vec::new();
    for _ in 0..16 {
        joins.push(tokio::spawn(Arc::clone(&session).start(false)));
    }
    for j in joins {
        j.await.unwrap();
    }
    for _ in 0..4 {
        w.gateway.connect(&t).await;
    }
    sleep(Duration::from_secs(1)).await;

    assert_eq!(w.net.connect_calls(&t), 1);
    assert_eq!(w.net.open_links(&t), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_forced_qr_requests_start_one_attempt() {
    let w = world();
    let t = tenant("race");

    let gw = Arc::new(w.gateway);
    let mut joins = Vec::new();
    for _ in 0..8 {
        let gw = Arc::clone(&gw);
        let t = t.clone();
        joins.push(tokio::spawn(async move { gw.request_qr(&t).await }));
    }
    for j in joins {
        assert!(matches!(
            j.await.unwrap().unwrap(),
            AuthProgress::Challenge(_)
        ));
    }
    assert_eq!(w.net.connect_calls(&t), 1);
    assert_eq!(w.net.open_links(&t), 1);
}

#[tokio::test(start_paused = true)]
async fn limiter_bounds_simultaneous_handshakes() {
    for k in 1..=3 {
        let w = world_with(
            SimConfig {
                handshake_delay: Duration::from_millis(100),
                ..SimConfig::default()
            },
            SessionSettings {
                connection_limit: k,
                ..settings()
            },
            Arc::new(MemorySessionStore::new()),
        );

        let tenants: Vec<TenantId> = (0..12).map(|i| tenant(&format!("burst{i}"))).collect();
        for t in &tenants {
            w.creds.insert(t.clone(), w.net.issue_credentials(t));
        }
        for t in &tenants {
            w.gateway.connect(t).await;
        }
        for t in &tenants {
            assert!(wait_for(&w, t, SessionStatus::Connected, Duration::from_secs(10)).await);
        }

        assert!(w.net.max_in_handshake() <= k, "K={k}");
        assert_eq!(w.registry.context().limiter.in_use(), 0);
        assert_eq!(w.gateway.health().connected_sessions, tenants.len());
    }
}

#[tokio::test(start_paused = true)]
async fn queued_tenants_do_not_report_connecting() {
    let k = 2;
    let w = world_with(
        SimConfig {
            handshake_delay: Duration::from_millis(500),
            ..SimConfig::default()
        },
        SessionSettings {
            connection_limit: k,
            ..settings()
        },
        Arc::new(MemorySessionStore::new()),
    );

    let tenants: Vec<TenantId> = (0..12).map(|i| tenant(&format!("queued{i}"))).collect();
    for t in &tenants {
        w.creds.insert(t.clone(), w.net.issue_credentials(t));
    }
    for t in &tenants {
        w.gateway.connect(t).await;
    }

    let deadline = Instant::now() + Duration::from_secs(6);
    let mut peak = 0;
    while Instant::now() < deadline {
        let connecting = tenants
            .iter()
            .filter(|t| w.gateway.status(t).state == SessionStatus::Connecting)
            .count();
        assert!(connecting <= k, "{connecting} tenants report connecting with K={k}");
        assert!(w.gateway.health().connecting_sessions <= k);
        peak = peak.max(connecting);
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(peak, k);

    for t in &tenants {
        assert_eq!(w.gateway.status(t).state, SessionStatus::Connected);
    }
}

// ============== Recovery ==============

#[tokio::test(start_paused = true)]
async fn killed_connection_recovers_without_intervention() {
    let w = world();
    let t = connected(&w, "7").await;

    let id = w.gateway.send(&t, "5511999999999", "hello").await.unwrap();
    assert!(id.0.starts_with("SIM"));
    assert_eq!(w.net.sent_messages().len(), 1);

    let mut events = w.registry.subscribe();
    assert!(w.net.kill(&t));

    let mut saw_disconnect = false;
    let deadline = Instant::now() + settings().health_sweep_interval;
    while Instant::now() < deadline {
        let ev = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .unwrap()
            .unwrap();
        match ev.kind {
            SessionEventKind::Disconnected { .. } => saw_disconnect = true,
            SessionEventKind::Connected { .. } if saw_disconnect => break,
            _ => {}
        }
    }
    assert!(saw_disconnect);
    assert_eq!(w.gateway.status(&t).state, SessionStatus::Connected);
    assert_eq!(w.gateway.status(&t).reconnect_attempts, 0);
    assert!(w.creds.contains(&t));
}

#[tokio::test(start_paused = true)]
async fn send_after_silent_drop_fails_and_reconnects() {
    let w = world();
    let t = connected(&w, "drop").await;

    assert!(w.net.drop_silently(&t));
    let err = w.gateway.send(&t, "5511999999999", "lost").await.unwrap_err();
    assert!(matches!(err, Error::SendFailed(_)));

    assert!(wait_for(&w, &t, SessionStatus::Connected, Duration::from_secs(5)).await);
    assert_eq!(w.net.connect_calls(&t), 2);
    assert!(w.gateway.send(&t, "5511999999999", "back").await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn heartbeat_detects_dead_link() {
    let w = world();
    let t = connected(&w, "hb").await;

    w.net.set_probe_failing(&t, true);
    // Two failed probes are tolerated.
    sleep(Duration::from_millis(10_500)).await;
    assert_eq!(w.gateway.status(&t).state, SessionStatus::Connected);

    w.net.set_probe_failing(&t, false);
    w.net.drop_silently(&t);
    assert!(wait_for(&w, &t, SessionStatus::Disconnected, Duration::from_secs(20)).await);
    assert!(wait_for(&w, &t, SessionStatus::Connected, Duration::from_secs(5)).await);
    assert_eq!(w.net.connect_calls(&t), 2);
}

#[tokio::test(start_paused = true)]
async fn transient_backoff_grows_and_resets_after_connect() {
    let w = world();
    let t = connected(&w, "flaky").await;
    for _ in 0..3 {
        w.net.fail_next_connect(&t, 503);
    }
    let session = w.registry.get(&t).unwrap();

    w.net.kill(&t);
    sleep(Duration::from_millis(1)).await;
    let mut attempts_seen = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(30);
    while Instant::now() < deadline {
        let snap = w.gateway.status(&t);
        if snap.state == SessionStatus::Connected {
            break;
        }
        if attempts_seen.last() != Some(&snap.reconnect_attempts) {
            attempts_seen.push(snap.reconnect_attempts);
        }
        sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(w.gateway.status(&t).state, SessionStatus::Connected);
    assert_eq!(w.gateway.status(&t).reconnect_attempts, 0);
    assert!(attempts_seen.windows(2).all(|p| p[0] <= p[1]));
    assert_eq!(attempts_seen.last(), Some(&4));
    assert!(!session.is_timer_pending(TimerKind::Reconnect));
}

#[tokio::test(start_paused = true)]
async fn logout_destroys_credentials_and_stays_down() {
    let w = world();
    let t = connected(&w, "gone").await;

    w.net.revoke(&t);
    assert!(wait_for(&w, &t, SessionStatus::Disconnected, Duration::from_secs(1)).await);
    assert!(!w.creds.contains(&t));

    sleep(Duration::from_secs(600)).await;
    assert_eq!(w.net.connect_calls(&t), 1);
    assert_eq!(w.gateway.status(&t).state, SessionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn conflict_waits_for_long_backoff() {
    let w = world();
    let t = connected(&w, "dup").await;

    w.net.close_with(&t, 440);
    sleep(Duration::from_secs(20)).await;
    assert_eq!(w.net.connect_calls(&t), 1);
    assert!(w.creds.contains(&t));

    assert!(wait_for(&w, &t, SessionStatus::Connected, Duration::from_secs(15)).await);
    assert_eq!(w.net.connect_calls(&t), 2);
}

// ============== Disconnect ==============

#[tokio::test(start_paused = true)]
async fn disconnect_removes_tenant_and_credentials() {
    let w = world();
    let t = connected(&w, "7").await;

    w.gateway.disconnect(&t).await.unwrap();
    assert_eq!(w.gateway.status(&t).state, SessionStatus::Disconnected);
    assert!(w.gateway.list().iter().all(|s| s.tenant != t));
    assert!(!w.creds.exists(&t).await.unwrap());
    assert_eq!(w.net.open_links(&t), 0);

    let row = {
        let ctx = w.registry.context();
        ctx.persistence.load_all().await.unwrap();
        w.store.get(&t).unwrap()
    };
    assert!(!row.is_connected);
}

#[tokio::test(start_paused = true)]
async fn no_timer_fires_after_disconnect() {
    let w = world();
    let t = connected(&w, "quiet").await;

    // Server termination schedules a reconnect.
    w.net.close_with(&t, 515);
    sleep(Duration::from_millis(50)).await;
    let session = w.registry.get(&t).unwrap();
    assert!(session.is_timer_pending(TimerKind::Reconnect));

    w.gateway.disconnect(&t).await.unwrap();
    assert!(!session.is_timer_pending(TimerKind::Reconnect));
    assert!(!session.is_timer_pending(TimerKind::Heartbeat));

    let calls = w.net.total_connect_calls();
    sleep(Duration::from_secs(3600)).await;
    assert_eq!(w.net.total_connect_calls(), calls);
    assert!(w.registry.get(&t).is_none());
}

#[tokio::test(start_paused = true)]
async fn reconnect_forces_fresh_authentication() {
    let w = world();
    let t = connected(&w, "again").await;

    w.gateway.reconnect(&t).await.unwrap();
    assert!(wait_for(&w, &t, SessionStatus::QrPending, Duration::from_secs(1)).await);
    assert!(!w.creds.contains(&t));
    assert_eq!(w.net.connect_calls(&t), 2);
    assert_eq!(w.net.open_links(&t), 1);
}

// ============== Restore and sweep ==============

#[tokio::test(start_paused = true)]
async fn restart_restores_persisted_connected_tenant() {
    let store = Arc::new(MemorySessionStore::new());
    let now = chrono::Utc::now();
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

    let w = world_with(SimConfig::default(), settings(), store);
    let t = tenant("9");
    w.creds.insert(t.clone(), w.net.issue_credentials(&t));

    assert_eq!(w.registry.restore().await.unwrap(), 1);
    assert!(wait_for(&w, &t, SessionStatus::Connected, Duration::from_secs(3)).await);
}

#[tokio::test(start_paused = true)]
async fn health_sweep_recreates_missing_sessions() {
    let w = world();
    let t = connected(&w, "sweep").await;

    // Simulate a partial restart: session gone from memory, record still says connected.
    w.registry.remove(&t).await;
    assert!(w.registry.get(&t).is_none());

    let monitor = HealthMonitor::new(w.registry.clone(), settings().health_sweep_interval);
    let report = monitor.sweep().await;
    assert_eq!(report.recreated, 1);
    assert!(wait_for(&w, &t, SessionStatus::Connected, Duration::from_secs(3)).await);
}

#[tokio::test(start_paused = true)]
async fn send_to_unknown_tenant_is_not_connected_but_restores() {
    let w = world();
    let t = tenant("cold");
    w.creds.insert(t.clone(), w.net.issue_credentials(&t));

    let err = w.gateway.send(&t, "5511999999999", "hi").await.unwrap_err();
    assert!(matches!(err, Error::NotConnected(_)));
    assert!(wait_for(&w, &t, SessionStatus::Connected, Duration::from_secs(3)).await);
}

#[tokio::test(start_paused = true)]
async fn gateway_validates_input() {
    let w = world();
    let t = tenant("v");
    assert!(matches!(
        w.gateway.send(&t, "12", "hi").await,
        Err(Error::InvalidInput(_))
    ));
    assert!(matches!(
        w.gateway.send(&t, "5511999999999", "   ").await,
        Err(Error::InvalidInput(_))
    ));
    assert!(matches!(
        w.gateway.request_pairing(&t, "abc").await,
        Err(Error::InvalidInput(_))
    ));
    // Unknown tenants are reported, never created.
    assert_eq!(w.gateway.status(&t).state, SessionStatus::Disconnected);
    assert!(w.registry.is_empty());
}
