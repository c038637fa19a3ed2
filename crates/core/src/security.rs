//! Security parameters
//!
//! Carries everything the TLS engine binding needs: allowed protocol
//! versions, ALPN, server identities, and the application callbacks invoked
//! during verification. An empty `allowed_protocols` list disables TLS
//! entirely. The actual TLS engine lives in `tapestry-transport`; no TLS
//! library types appear here.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// TLS protocol versions a connection may negotiate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProtocol {
    Tls12,
    Tls13,
}

/// Verdict returned by a trust-verification callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustVerdict {
    Accept,
    Reject,
    /// Accept despite verification findings, listing the accepted reasons
    AcceptWithConditions(Vec<String>),
}

impl TrustVerdict {
    /// True for `Accept` and `AcceptWithConditions`
    pub fn is_accepted(&self) -> bool {
        !matches!(self, TrustVerdict::Reject)
    }
}

/// Peer-certificate evidence handed to the trust-verification callback
#[derive(Debug, Clone)]
pub struct TrustContext {
    /// Peer certificate chain, leaf first (DER)
    pub chain: Vec<Vec<u8>>,
    /// Server name presented for verification
    pub server_name: String,
    /// Negotiated protocol version (e.g., "TLSv1.3")
    pub protocol_version: String,
    /// Negotiated cipher suite name
    pub cipher_suite: String,
    /// Stapled OCSP response, when present
    pub ocsp: Option<Vec<u8>>,
    /// Signed certificate timestamps, when present
    pub sct: Option<Vec<u8>>,
}

/// Client-identity request handed to the identity-challenge callback
#[derive(Debug, Clone)]
pub struct IdentityChallenge {
    pub auth_type: String,
    /// Issuer names the server will accept (DER)
    pub acceptable_issuers: Vec<Vec<u8>>,
    pub server_name: String,
    /// Labels of identities the application registered
    pub available_identities: Vec<String>,
}

/// Identity returned from an identity-challenge callback
#[derive(Clone)]
pub struct IdentityResponse {
    /// Certificate (DER)
    pub certificate: Vec<u8>,
    /// Private key (DER)
    pub private_key: Vec<u8>,
    pub password: Option<String>,
}

/// Trust-verification callback
///
/// Invoked synchronously on the verification thread.
pub type TrustVerificationCallback = Arc<dyn Fn(&TrustContext) -> TrustVerdict + Send + Sync>;

/// Identity-challenge callback; `None` declines the challenge
pub type IdentityChallengeCallback =
    Arc<dyn Fn(&IdentityChallenge) -> Option<IdentityResponse> + Send + Sync>;

/// Security parameters of a preconnection
#[derive(Clone, Default)]
pub struct SecurityParameters {
    /// Protocol versions the connection may negotiate; empty means no TLS
    pub allowed_protocols: Vec<SecurityProtocol>,
    /// ALPN protocol identifiers, most preferred first
    pub alpn: Vec<String>,
    /// Server certificate chain, leaf first (DER)
    pub server_certificates: Vec<Vec<u8>>,
    /// Server private keys (DER)
    pub server_private_keys: Vec<Vec<u8>>,
    pub private_key_password: Option<String>,
    pub trust_verification: Option<TrustVerificationCallback>,
    pub identity_challenge: Option<IdentityChallengeCallback>,
}

impl SecurityParameters {
    /// TLS 1.2/1.3 with no pinned identities and default verification
    pub fn new() -> Self {
        Self {
            allowed_protocols: vec![SecurityProtocol::Tls13, SecurityProtocol::Tls12],
            ..Self::default()
        }
    }

    /// No TLS at all
    pub fn disabled() -> Self {
        Self::default()
    }

    /// True when TLS is enabled
    pub fn is_enabled(&self) -> bool {
        !self.allowed_protocols.is_empty()
    }

    /// Add an ALPN protocol identifier
    pub fn with_alpn(mut self, protocol: impl Into<String>) -> Self {
        self.alpn.push(protocol.into());
        self
    }

    /// Supply a server identity (certificate + private key, DER)
    pub fn with_server_identity(mut self, certificate: Vec<u8>, private_key: Vec<u8>) -> Self {
        self.server_certificates.push(certificate);
        self.server_private_keys.push(private_key);
        self
    }

    /// Install a trust-verification callback
    pub fn with_trust_verification<F>(mut self, callback: F) -> Self
    where
        F: Fn(&TrustContext) -> TrustVerdict + Send + Sync + 'static,
    {
        self.trust_verification = Some(Arc::new(callback));
        self
    }

    /// Install an identity-challenge callback
    pub fn with_identity_challenge<F>(mut self, callback: F) -> Self
    where
        F: Fn(&IdentityChallenge) -> Option<IdentityResponse> + Send + Sync + 'static,
    {
        self.identity_challenge = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for SecurityParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityParameters")
            .field("allowed_protocols", &self.allowed_protocols)
            .field("alpn", &self.alpn)
            .field("server_certificates", &self.server_certificates.len())
            .field("server_private_keys", &self.server_private_keys.len())
            .field("trust_verification", &self.trust_verification.is_some())
            .field("identity_challenge", &self.identity_challenge.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_means_no_tls() {
        assert!(!SecurityParameters::disabled().is_enabled());
        assert!(SecurityParameters::new().is_enabled());
    }

    #[test]
    fn test_verdict_acceptance() {
        assert!(TrustVerdict::Accept.is_accepted());
        assert!(TrustVerdict::AcceptWithConditions(vec!["expired".to_string()]).is_accepted());
        assert!(!TrustVerdict::Reject.is_accepted());
    }

    #[test]
    fn test_trust_callback_invocation() {
        let params = SecurityParameters::new().with_trust_verification(|ctx| {
            if ctx.server_name == "trusted.example" {
                TrustVerdict::Accept
            } else {
                TrustVerdict::Reject
            }
        });

        let callback = params.trust_verification.as_ref().unwrap();
        let ctx = TrustContext {
            chain: vec![],
            server_name: "trusted.example".to_string(),
            protocol_version: "TLSv1.3".to_string(),
            cipher_suite: "TLS13_AES_128_GCM_SHA256".to_string(),
            ocsp: None,
            sct: None,
        };
        assert_eq!(callback(&ctx), TrustVerdict::Accept);

        let ctx = TrustContext {
            server_name: "other.example".to_string(),
            ..ctx
        };
        assert_eq!(callback(&ctx), TrustVerdict::Reject);
    }

    #[test]
    fn test_debug_omits_callback_bodies() {
        let params = SecurityParameters::new().with_trust_verification(|_| TrustVerdict::Accept);
        let rendered = format!("{:?}", params);
        assert!(rendered.contains("trust_verification: true"));
    }
}
