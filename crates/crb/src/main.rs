use std::{net::SocketAddr, sync::Arc};

use tokio_util::sync::CancellationToken;

use crb_core::{
    config::Config,
    credentials::FsCredentialStore,
    gateway::Gateway,
    health::HealthMonitor,
    persistence::SqliteSessionStore,
    registry::SessionRegistry,
    session::SessionContext,
};
use crb_sim::SimNetwork;
use crb_telegram::TelegramNotifier;

#[tokio::main]
async fn main() -> Result<(), crb_core::Error> {
    crb_core::logging::init("crb")?;

    let cfg = Config::load()?;

    let store = Arc::new(SqliteSessionStore::open(&cfg.database_url)?);
    let credentials = Arc::new(FsCredentialStore::new(&cfg.credentials_dir));
    let connector = Arc::new(SimNetwork::default());
    tracing::info!("using the simulated messaging network");
    let ctx = SessionContext::new(cfg.session.clone(), connector, credentials, store);
    let registry = Arc::new(SessionRegistry::new(ctx));

    match registry.restore().await {
        Ok(n) => tracing::info!(restored = n, "restored sessions from previous run"),
        Err(e) => tracing::warn!("session restore failed: {e}"),
    }

    let shutdown = CancellationToken::new();
    let sweeper = HealthMonitor::new(registry.clone(), cfg.session.health_sweep_interval)
        .spawn(shutdown.clone());

    if let Some(token) = &cfg.telegram_bot_token {
        let notifier = TelegramNotifier::from_token(token.clone());
        tokio::spawn(notifier.run(registry.subscribe(), shutdown.clone()));
    }

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
            }
            shutdown.cancel();
        });
    }

    let gateway = Arc::new(Gateway::new(registry.clone(), cfg.normalize_br_numbers));
    let addr = SocketAddr::new(cfg.bind_addr, cfg.port);
    let served = crb_http::serve(addr, gateway, shutdown.clone()).await;

    shutdown.cancel();
    let _ = sweeper.await;
    registry.shutdown().await;

    served.map_err(|e| crb_core::Error::External(format!("http server failed: {e:#}")))
}
