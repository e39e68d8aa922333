use std::{fmt, str::FromStr, sync::OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{errors::Error, utils::sha256_hex_prefix, Result};

static TENANT_ID_RE: OnceLock<Regex> = OnceLock::new();

fn tenant_id_re() -> &'static Regex {
    TENANT_ID_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("valid regex"))
}

/// Tenant id: one end-user's isolated messaging identity.
///
/// Doubles as a directory name in the credential store, so the alphabet is
/// restricted to `[A-Za-z0-9_-]` and the length to 64.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if !tenant_id_re().is_match(raw) {
            return Err(Error::InvalidInput(format!(
                "tenant id must be 1-64 characters of [A-Za-z0-9_-], got {raw:?}"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Chat id on the front end, when the tenant id is numeric.
    pub fn as_chat_id(&self) -> Option<i64> {
        self.0.parse().ok()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TenantId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TenantId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

/// Identifier the network assigns to an accepted outbound message.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryId(pub String);

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque authentication material that lets a tenant reconnect without a new challenge.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials(pub Vec<u8>);

impl Credentials {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Short stable fingerprint, safe to log and persist.
    pub fn digest(&self) -> String {
        sha256_hex_prefix(&self.0, 16)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credentials({})", self.digest())
    }
}

/// Session lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    QrPending,
    PairingPending,
    Connected,
    Error,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::QrPending => "qr_pending",
            Self::PairingPending => "pairing_pending",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }

    /// Coarse status stored in `connection_status`.
    ///
    /// Both challenge states collapse into `connecting`.
    pub fn coarse(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting | Self::QrPending | Self::PairingPending => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }

    /// True while an authentication or connection handshake is underway.
    pub fn is_establishing(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::QrPending | Self::PairingPending
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_id_validation() {
        assert!(TenantId::parse("42").is_ok());
        assert!(TenantId::parse("tenant_a-1").is_ok());
        assert_eq!(TenantId::parse("  7 ").unwrap().as_str(), "7");
        assert!(TenantId::parse("").is_err());
        assert!(TenantId::parse("../etc").is_err());
        assert!(TenantId::parse("a b").is_err());
        assert!(TenantId::parse(&"x".repeat(65)).is_err());
    }

    #[test]
    fn tenant_id_deserialize_rejects_invalid() {
        let ok: TenantId = serde_json::from_str("\"9\"").unwrap();
        assert_eq!(ok.as_chat_id(), Some(9));
        assert!(serde_json::from_str::<TenantId>("\"a/b\"").is_err());
    }

    #[test]
    fn challenge_states_are_coarse_connecting() {
        assert_eq!(SessionStatus::QrPending.coarse(), "connecting");
        assert_eq!(SessionStatus::PairingPending.coarse(), "connecting");
        assert_eq!(SessionStatus::Connected.coarse(), "connected");
        assert_eq!(
            serde_json::to_string(&SessionStatus::PairingPending).unwrap(),
            "\"pairing_pending\""
        );
    }

    #[test]
    fn credentials_debug_hides_material() {
        let creds = Credentials(b"secret-material".to_vec());
        let dbg = format!("{creds:?}");
        assert!(!dbg.contains("secret"));
        assert_eq!(creds.digest().len(), 16);
    }
}
