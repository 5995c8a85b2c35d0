use crate::cert::crypto_provider;
use crate::manager::Manager;
use anyhow::Context;
use rustls::crypto::CryptoProvider;
use rustls::crypto::aws_lc_rs::cipher_suite;
use rustls::server::{Acceptor, ResolvesServerCert};
use rustls::{ServerConfig, SupportedCipherSuite, SupportedProtocolVersion};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::LazyConfigAcceptor;
use tokio_rustls::server::TlsStream;
use tracing::debug;

/// AEAD-only suites. TLS 1.2 suites only matter when the minimum version is lowered.
pub const DEFAULT_CIPHER_SUITES: &[SupportedCipherSuite] = &[
    cipher_suite::TLS13_AES_256_GCM_SHA384,
    cipher_suite::TLS13_AES_128_GCM_SHA256,
    cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
    cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum TlsVersion {
    #[serde(rename = "1.2")]
    Tls12,
    #[default]
    #[serde(rename = "1.3")]
    Tls13,
}

static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

impl TlsVersion {
    fn enabled_versions(self) -> &'static [&'static SupportedProtocolVersion] {
        match self {
            TlsVersion::Tls12 => rustls::ALL_VERSIONS,
            TlsVersion::Tls13 => TLS13_ONLY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub min_version: TlsVersion,
    pub cipher_suites: Vec<SupportedCipherSuite>,
    pub alpn_protocols: Vec<Vec<u8>>,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            min_version: TlsVersion::Tls13,
            cipher_suites: DEFAULT_CIPHER_SUITES.to_vec(),
            alpn_protocols: vec![b"h2".to_vec(), b"http/1.1".to_vec()],
        }
    }
}

/// Last word on the rustls config, applied after [`TlsSettings`].
pub type TlsCustomizer = Arc<dyn Fn(&mut ServerConfig) + Send + Sync>;

impl TlsSettings {
    pub fn build_server_config(
        &self,
        resolver: Arc<dyn ResolvesServerCert>,
    ) -> anyhow::Result<ServerConfig> {
        if self.cipher_suites.is_empty() {
            anyhow::bail!("TLS cipher suite allow-list is empty");
        }
        let provider = CryptoProvider {
            cipher_suites: self.cipher_suites.clone(),
            ..crypto_provider()
        };
        let mut config = ServerConfig::builder_with_provider(Arc::new(provider))
            .with_protocol_versions(self.min_version.enabled_versions())
            .context("No configured cipher suite is usable with the enabled TLS versions")?
            .with_no_client_auth()
            .with_cert_resolver(resolver);
        config.alpn_protocols = self.alpn_protocols.clone();
        Ok(config)
    }
}

/// Reads the ClientHello first so the manager can load or issue a certificate without blocking
/// a rustls callback, then finishes the handshake against the manager's in-memory table.
#[derive(Clone)]
pub struct TlsAcceptor {
    manager: Arc<Manager>,
    config: Arc<ServerConfig>,
    handshake_timeout: Duration,
}

impl TlsAcceptor {
    pub fn new(manager: Arc<Manager>, config: Arc<ServerConfig>, handshake_timeout: Duration) -> Self {
        Self {
            manager,
            config,
            handshake_timeout,
        }
    }

    pub async fn accept(&self, stream: TcpStream) -> anyhow::Result<TlsStream<TcpStream>> {
        let start = tokio::time::timeout(
            self.handshake_timeout,
            LazyConfigAcceptor::new(Acceptor::default(), stream),
        )
        .await
        .context("Timed out waiting for ClientHello")?
        .context("Reading ClientHello failed")?;

        let server_name = start.client_hello().server_name().map(str::to_string);
        if let Err(err) = self.manager.get_certificate(server_name.as_deref()).await {
            debug!("No certificate for {server_name:?}: {err:#}");
        }

        let stream = tokio::time::timeout(
            self.handshake_timeout,
            start.into_stream(self.config.clone()),
        )
        .await
        .context("TLS handshake timed out")?
        .context("TLS handshake failed")?;
        Ok(stream)
    }
}
