//! Port for the external messaging network.
//!
//! The wire protocol is not implemented here. A connector opens one link per
//! tenant and reports its lifecycle as a stream of typed [`LinkEvent`]s that a
//! single task per session consumes.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    domain::{Credentials, DeliveryId, TenantId},
    Result,
};

/// Everything a connector needs to open (or resume) a tenant's link.
#[derive(Clone, Debug)]
pub struct ConnectRequest {
    pub tenant: TenantId,
    /// Stored credential material; `None` triggers an authentication challenge.
    pub credentials: Option<Credentials>,
    /// When set, the challenge is a phone-number pairing code instead of a QR code.
    pub pairing_phone: Option<String>,
}

/// One-time authentication artifact issued by the network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Challenge {
    Qr(String),
    PairingCode(String),
}

/// Why the network closed (or refused) a link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    LoggedOut,
    /// Session signature no longer valid on the network side.
    BadSession,
    AuthRejected,
    ChallengeTimeout,
    ServerTerminated,
    /// Another connection for the same account took over.
    Replaced,
    Stream(String),
    /// Status code with no dedicated mapping.
    Code(u16),
}

impl CloseReason {
    /// Map the network's numeric disconnect codes.
    pub fn from_status_code(code: u16) -> Self {
        match code {
            401 => Self::LoggedOut,
            403 => Self::AuthRejected,
            408 => Self::ChallengeTimeout,
            428 | 515 => Self::ServerTerminated,
            440 => Self::Replaced,
            500 => Self::BadSession,
            other => Self::Code(other),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoggedOut => f.write_str("logged out"),
            Self::BadSession => f.write_str("bad session"),
            Self::AuthRejected => f.write_str("authentication rejected"),
            Self::ChallengeTimeout => f.write_str("authentication challenge timed out"),
            Self::ServerTerminated => f.write_str("terminated by server"),
            Self::Replaced => f.write_str("replaced by another session"),
            Self::Stream(msg) => write!(f, "stream error: {msg}"),
            Self::Code(code) => write!(f, "closed with status {code}"),
        }
    }
}

/// Lifecycle events of one link, in the order the network produced them.
#[derive(Clone, Debug)]
pub enum LinkEvent {
    Challenge(Challenge),
    CredentialsUpdated(Credentials),
    Connected { account: Option<String> },
    Closed(CloseReason),
}

/// A live (or establishing) link to the network.
#[async_trait]
pub trait NetworkLink: Send + Sync {
    /// Send a text message. Connection loss must surface as `Error::Transient`.
    async fn send_text(&self, to: &str, text: &str) -> Result<DeliveryId>;

    /// Lightweight liveness check.
    async fn probe(&self) -> Result<()>;

    /// Close the link. Idempotent.
    async fn close(&self);
}

/// An opened link plus its event stream.
pub struct LinkHandle {
    pub link: Arc<dyn NetworkLink>,
    pub events: mpsc::Receiver<LinkEvent>,
}

/// Hexagonal port for the messaging network.
#[async_trait]
pub trait NetworkConnector: Send + Sync {
    async fn connect(&self, req: ConnectRequest) -> Result<LinkHandle>;
}
