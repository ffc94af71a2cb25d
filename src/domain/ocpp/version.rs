//! OCPP protocol version
//!
//! Versions the gateway can negotiate during the WebSocket handshake. Only
//! 1.6 has a protocol handler; the 2.x variants exist so negotiation can
//! recognise them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Supported OCPP protocol versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OcppVersion {
    /// OCPP 1.6 (JSON / OCPP-J)
    #[serde(rename = "ocpp1.6")]
    V16,
    /// OCPP 2.0
    #[serde(rename = "ocpp2.0")]
    V20,
    /// OCPP 2.0.1
    #[serde(rename = "ocpp2.0.1")]
    V201,
}

impl OcppVersion {
    /// WebSocket subprotocol identifier (`Sec-WebSocket-Protocol`).
    pub fn subprotocol(&self) -> &'static str {
        match self {
            Self::V16 => "ocpp1.6",
            Self::V20 => "ocpp2.0",
            Self::V201 => "ocpp2.0.1",
        }
    }

    /// Parse an OCPP version from a WebSocket subprotocol string.
    pub fn from_subprotocol(s: &str) -> Option<Self> {
        match s.trim() {
            "ocpp1.6" => Some(Self::V16),
            "ocpp2.0" => Some(Self::V20),
            "ocpp2.0.1" => Some(Self::V201),
            _ => None,
        }
    }

    /// All known versions, newest first.
    pub const ALL: &'static [OcppVersion] = &[Self::V201, Self::V20, Self::V16];

    /// Ordering key, higher is newer.
    pub fn rank(&self) -> u8 {
        match self {
            Self::V16 => 1,
            Self::V20 => 2,
            Self::V201 => 3,
        }
    }

    pub fn version_string(&self) -> &'static str {
        match self {
            Self::V16 => "1.6",
            Self::V20 => "2.0",
            Self::V201 => "2.0.1",
        }
    }
}

impl fmt::Display for OcppVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OCPP {}", self.version_string())
    }
}

impl FromStr for OcppVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_subprotocol(s)
            .or_else(|| match s.trim() {
                "1.6" => Some(Self::V16),
                "2.0" => Some(Self::V20),
                "2.0.1" => Some(Self::V201),
                _ => None,
            })
            .ok_or_else(|| format!("unknown OCPP version '{}'", s))
    }
}
