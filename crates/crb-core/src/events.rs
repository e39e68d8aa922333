use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::TenantId;

/// Capacity of the session event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// `Disconnected` reason used when the tenant itself asked to disconnect.
pub const REQUESTED_DISCONNECT: &str = "disconnected on request";

/// Notification published on every user-visible lifecycle transition.
#[derive(Clone, Debug, Serialize)]
pub struct SessionEvent {
    pub tenant: TenantId,
    pub kind: SessionEventKind,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEventKind {
    Connected { account: Option<String> },
    /// A QR code is ready to be fetched.
    QrReady,
    PairingReady { code: String },
    Disconnected { reason: String },
    /// Retry budget exhausted.
    Failed { reason: String },
}

impl SessionEvent {
    pub fn now(tenant: TenantId, kind: SessionEventKind) -> Self {
        Self {
            tenant,
            kind,
            at: Utc::now(),
        }
    }
}
