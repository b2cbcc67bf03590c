//! Request gating helpers: API key checks, client identity and id validation.

use std::net::IpAddr;

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, SessionError};

/// A secure string that automatically clears its contents when dropped.
#[derive(Clone, ZeroizeOnDrop)]
pub struct SecureString(String);

impl std::fmt::Debug for SecureString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecureString(***)")
    }
}

impl SecureString {
    /// Create a new secure string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Get the string value. Use carefully and avoid storing the result.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Convert to a regular string. The SecureString will be zeroized.
    pub fn into_string(mut self) -> String {
        let value = std::mem::take(&mut self.0);
        self.0.zeroize();
        value
    }
}

impl From<String> for SecureString {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SecureString {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Optional shared-secret check applied to every request.
///
/// With no key configured the gate is open. Keys are compared through their SHA-256
/// digests so the comparison time does not depend on where the inputs first differ.
#[derive(Debug, Clone, Default)]
pub struct ApiKeyGate {
    expected_digest: Option<[u8; 32]>,
}

impl ApiKeyGate {
    /// Builds a gate from the configured key. An empty key disables the check.
    pub fn new(expected: Option<&SecureString>) -> Self {
        let expected_digest = expected
            .map(SecureString::expose)
            .filter(|key| !key.is_empty())
            .map(|key| Sha256::digest(key.as_bytes()).into());
        Self { expected_digest }
    }

    /// Gate that admits every request.
    pub fn open() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.expected_digest.is_some()
    }

    /// Verifies the key presented by a client.
    pub fn verify(&self, presented: Option<&str>) -> Result<()> {
        let Some(expected) = self.expected_digest else {
            return Ok(());
        };
        let Some(presented) = presented else {
            return Err(SessionError::Unauthorized {
                message: "missing API key".to_string(),
            });
        };

        let digest: [u8; 32] = Sha256::digest(presented.as_bytes()).into();
        if bool::from(expected[..].ct_eq(&digest[..])) {
            Ok(())
        } else {
            Err(SessionError::Unauthorized {
                message: "invalid API key".to_string(),
            })
        }
    }
}

/// Derives the rate-limit bucket key for a request.
///
/// The first hop of `X-Forwarded-For` is used when it parses as an IP address,
/// otherwise the transport peer address. The result is only ever used for bucket
/// keying, never for authorization.
pub fn client_identity(forwarded_for: Option<&str>, peer: Option<IpAddr>) -> String {
    let first_hop = forwarded_for
        .and_then(|chain| chain.split(',').next())
        .map(str::trim)
        .and_then(|hop| hop.parse::<IpAddr>().ok());

    match first_hop.or(peer) {
        Some(addr) => addr.to_string(),
        None => "unknown".to_string(),
    }
}

static DATASET_ID_REGEX: Lazy<Regex> = Lazy::new(|| {
    // This regex is compile-time constant and known to be valid
    #[allow(clippy::expect_used)]
    Regex::new(r"^[0-9a-f]{16}$").expect("Hard-coded regex pattern should be valid")
});

/// Rejects dataset ids that could never have been issued by the registry.
pub fn validate_dataset_id(dataset_id: &str) -> Result<()> {
    if DATASET_ID_REGEX.is_match(dataset_id) {
        Ok(())
    } else {
        Err(SessionError::invalid_input(format!(
            "malformed dataset id '{}'",
            crate::logging::truncate_field(dataset_id, 32)
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secure_string_debug_hides_value() {
        let secret = SecureString::new("hunter2");
        assert_eq!(format!("{secret:?}"), "SecureString(***)");
        assert_eq!(secret.expose(), "hunter2");
        assert_eq!(secret.into_string(), "hunter2");
    }

    #[test]
    fn test_api_key_gate_disabled_without_key() {
        let gate = ApiKeyGate::new(None);
        assert!(!gate.is_enabled());
        assert!(gate.verify(None).is_ok());

        let empty = SecureString::new("");
        assert!(!ApiKeyGate::new(Some(&empty)).is_enabled());
    }

    #[test]
    fn test_api_key_gate_checks_key() {
        let key = SecureString::new("s3cret");
        let gate = ApiKeyGate::new(Some(&key));

        assert!(gate.verify(Some("s3cret")).is_ok());
        assert!(matches!(
            gate.verify(Some("wrong")),
            Err(SessionError::Unauthorized { .. })
        ));
        assert!(matches!(
            gate.verify(None),
            Err(SessionError::Unauthorized { .. })
        ));
    }

    #[test]
    fn test_api_key_gate_rejects_near_misses() {
        let key = SecureString::new("s3cret-key");
        let gate = ApiKeyGate::new(Some(&key));

        for presented in ["s3cret-kez", "s3cret-ke", "s3cret-key ", "", "S3CRET-KEY"] {
            assert!(
                gate.verify(Some(presented)).is_err(),
                "accepted {presented:?}"
            );
        }
        assert!(gate.verify(Some("s3cret-key")).is_ok());
    }

    #[test]
    fn test_client_identity_prefers_first_forwarded_hop() {
        let peer: IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(
            client_identity(Some("192.168.1.1, 10.0.0.1"), Some(peer)),
            "192.168.1.1"
        );
        assert_eq!(client_identity(Some("192.168.1.1"), None), "192.168.1.1");
    }

    #[test]
    fn test_client_identity_falls_back_to_peer() {
        let peer: IpAddr = "10.1.2.3".parse().unwrap();
        assert_eq!(client_identity(Some("not-an-ip, 1.1.1.1"), Some(peer)), "10.1.2.3");
        assert_eq!(client_identity(None, Some(peer)), "10.1.2.3");
        assert_eq!(client_identity(Some(""), None), "unknown");
    }

    #[test]
    fn test_validate_dataset_id() {
        assert!(validate_dataset_id("0123456789abcdef").is_ok());
        assert!(validate_dataset_id("0123456789ABCDEF").is_err());
        assert!(validate_dataset_id("../../etc/passwd").is_err());
        assert!(validate_dataset_id("").is_err());
    }
}
