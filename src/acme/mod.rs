//! Boundary to the ACME protocol exchange.
//!
//! The certificate manager only needs "give me a certificate for this host" plus a way to publish
//! HTTP-01 key authorizations while the CA validates. [`AccountClient`] is that seam;
//! [`client::AcmeAccountClient`] implements it on top of `instant-acme`.

use crate::error::IssueResult;
use async_trait::async_trait;

pub mod client;

pub use client::AcmeAccountClient;

pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Certificate material as returned by the CA, both PEM encoded.
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub certificate_chain_pem: String,
    pub private_key_pem: String,
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("certificate_chain_pem", &self.certificate_chain_pem)
            .field("private_key_pem", &"<redacted>")
            .finish()
    }
}

/// Publishes HTTP-01 responses while a CA validates a domain.
#[async_trait]
pub trait ChallengeResponder: Send + Sync {
    async fn present(
        &self,
        domain: &str,
        token: &str,
        key_authorization: &str,
    ) -> anyhow::Result<()>;

    async fn cleanup(&self, domain: &str, token: &str) -> anyhow::Result<()>;
}

#[async_trait]
pub trait AccountClient: Send + Sync {
    /// Runs a complete order for `domain`. Any HTTP-01 challenge is satisfied through
    /// `responder`, which must be able to answer on the plain listener before this returns.
    async fn issue(
        &self,
        domain: &str,
        responder: &dyn ChallengeResponder,
    ) -> IssueResult<IssuedCertificate>;
}
