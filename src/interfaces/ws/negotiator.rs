//! OCPP protocol version negotiation
//!
//! During the WebSocket handshake the charge point advertises which OCPP
//! sub-protocols it supports via the `Sec-WebSocket-Protocol` header.
//! The negotiator picks the best mutually-supported version.

use crate::domain::OcppVersion;

/// Negotiates the OCPP version during the WebSocket handshake.
///
/// Only versions that have a registered protocol handler are offered. If
/// the charge point offers none of them (or no header at all) the
/// configured default is used.
#[derive(Debug, Clone)]
pub struct ProtocolNegotiator {
    /// Versions with a handler, highest first.
    supported_versions: Vec<OcppVersion>,
    default_version: OcppVersion,
}

impl ProtocolNegotiator {
    pub fn new(mut supported_versions: Vec<OcppVersion>, default_version: OcppVersion) -> Self {
        supported_versions.sort_by_key(|v| std::cmp::Reverse(v.rank()));
        supported_versions.dedup();
        Self {
            supported_versions,
            default_version,
        }
    }

    /// Best mutually-supported version, or `None` if nothing matches.
    pub fn negotiate(&self, requested_protocols: &str) -> Option<OcppVersion> {
        let requested: Vec<&str> = requested_protocols.split(',').map(|s| s.trim()).collect();

        self.supported_versions
            .iter()
            .copied()
            .find(|version| requested.iter().any(|p| *p == version.subprotocol()))
    }

    /// Negotiated version and whether it was actually offered by the peer.
    /// Only an offered version is echoed back in the handshake response.
    pub fn select(&self, requested_protocols: Option<&str>) -> (OcppVersion, bool) {
        match requested_protocols.and_then(|p| self.negotiate(p)) {
            Some(version) => (version, true),
            None => (self.default_version, false),
        }
    }

    pub fn default_version(&self) -> OcppVersion {
        self.default_version
    }

    pub fn supported_versions(&self) -> &[OcppVersion] {
        &self.supported_versions
    }

    pub fn supported_subprotocols(&self) -> Vec<&'static str> {
        self.supported_versions
            .iter()
            .map(|v| v.subprotocol())
            .collect()
    }
}
