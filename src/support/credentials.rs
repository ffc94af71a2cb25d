//! Charge point credentials
//!
//! OCPP 1.6 security profile 1: the charge point sends
//! `Authorization: Basic base64(<charge_point_id>:<password>)` on the
//! WebSocket upgrade. Configured passwords are stored as SHA-256 hex digests.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};

/// Hash a password for storage using SHA-256
pub fn hash_password(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// Verify a password against a stored hex digest
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    hash_password(password).eq_ignore_ascii_case(stored_hash.trim())
}

/// Decoded `Authorization: Basic` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

/// Parse an `Authorization` header value of the form `Basic <base64>`.
pub fn parse_basic_auth(header: &str) -> Option<BasicCredentials> {
    let (scheme, encoded) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    // Passwords may contain ':', usernames may not.
    let (username, password) = decoded.split_once(':')?;
    Some(BasicCredentials {
        username: username.to_string(),
        password: password.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_hex() {
        let hash = hash_password("secret");
        assert_eq!(hash.len(), 64);
        assert!(verify_password("secret", &hash));
        assert!(verify_password("secret", &hash.to_uppercase()));
        assert!(!verify_password("Secret", &hash));
    }

    #[test]
    fn parses_basic_header() {
        let header = format!("Basic {}", STANDARD.encode("CP001:pa:ss"));
        let creds = parse_basic_auth(&header).unwrap();
        assert_eq!(creds.username, "CP001");
        assert_eq!(creds.password, "pa:ss");
    }

    #[test]
    fn rejects_other_schemes_and_garbage() {
        assert!(parse_basic_auth("Bearer abc").is_none());
        assert!(parse_basic_auth("Basic !!!").is_none());
        assert!(parse_basic_auth(&format!("Basic {}", STANDARD.encode("nocolon"))).is_none());
    }
}
