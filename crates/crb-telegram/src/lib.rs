//! Telegram adapter (teloxide).
//!
//! Forwards session lifecycle events to the tenant's own chat. Tenant ids that
//! are not numeric chat ids are skipped.

use teloxide::{prelude::*, types::ChatId};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crb_core::{
    errors::Error,
    events::{SessionEvent, SessionEventKind, REQUESTED_DISCONNECT},
    Result,
};

#[derive(Clone)]
pub struct TelegramNotifier {
    bot: Bot,
}

impl TelegramNotifier {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    pub fn from_token(token: impl Into<String>) -> Self {
        Self::new(Bot::new(token))
    }

    /// Consume events until `shutdown` is cancelled or the channel closes.
    pub async fn run(self, mut events: broadcast::Receiver<SessionEvent>, shutdown: CancellationToken) {
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                ev = events.recv() => ev,
            };
            match event {
                Ok(ev) => self.notify(&ev).await,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "notifier fell behind; events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
        tracing::debug!("telegram notifier stopped");
    }

    async fn notify(&self, ev: &SessionEvent) {
        let Some(chat_id) = ev.tenant.as_chat_id() else {
            tracing::debug!(tenant = %ev.tenant, "tenant is not a chat id; skipping notification");
            return;
        };
        let Some(text) = render(ev) else {
            return;
        };
        if let Err(e) = self
            .with_retry(|| self.bot.send_message(ChatId(chat_id), text.clone()))
            .await
        {
            tracing::warn!(tenant = %ev.tenant, "notification failed: {e}");
        }
    }

    fn map_err(e: teloxide::RequestError) -> Error {
        Error::External(format!("telegram error: {e}"))
    }

    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, teloxide::RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(teloxide::RequestError::RetryAfter(d)) if attempts < MAX_RETRIES => {
                    attempts += 1;
                    sleep(d).await;
                }
                Err(other) => return Err(Self::map_err(other)),
            }
        }
    }
}

/// Chat text for an event, or `None` when the user does not need to hear about it.
pub fn render(ev: &SessionEvent) -> Option<String> {
    match &ev.kind {
        SessionEventKind::Connected { account } => Some(match account {
            Some(account) => format!("✅ Messaging connected as {account}."),
            None => "✅ Messaging connected.".to_string(),
        }),
        SessionEventKind::QrReady => {
            Some("📷 A QR code is ready. Scan it from the linked-devices screen.".to_string())
        }
        SessionEventKind::PairingReady { code } => Some(format!(
            "🔑 Pairing code: {code}\nEnter it on your phone to link this number."
        )),
        // The user asked for it; no need to echo it back.
        SessionEventKind::Disconnected { reason } if reason == REQUESTED_DISCONNECT => None,
        SessionEventKind::Disconnected { reason } => {
            Some(format!("⚠️ Messaging disconnected ({reason}). Reconnecting if possible."))
        }
        SessionEventKind::Failed { reason } => Some(format!(
            "❌ Messaging stopped reconnecting: {reason}\nReconnect from the dashboard to try again."
        )),
    }
}
