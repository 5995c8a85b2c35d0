#![allow(dead_code)]

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use easyhttps::acme::{AccountClient, ChallengeResponder, IssuedCertificate};
use easyhttps::cert::ParsedCertificate;
use easyhttps::error::{IssueError, IssueResult};
use easyhttps::{Body, Config, Error, Manager, MemoryCache, Server};
use http::{Request, Response};
use http_body_util::Full;
use hyper::body::Incoming;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, KeyUsagePurpose,
    SerialNumber,
};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DOMAIN: &str = "example.test";
pub const HELLO: &str = "hello over tls";

/// Knobs for the next issuance of [`FakeCa`].
#[derive(Debug, Clone)]
pub struct FakeCaSettings {
    /// How long before "now" issued certificates became valid
    pub valid_since: time::Duration,
    /// How long after "now" issued certificates stay valid
    pub valid_for: time::Duration,
    /// Simulated time the CA takes to finish an order
    pub delay: Duration,
    pub fail: bool,
    /// Plain listener to fetch HTTP-01 responses from, like a real CA would
    pub validate_via: Option<SocketAddr>,
}

impl Default for FakeCaSettings {
    fn default() -> Self {
        Self {
            valid_since: time::Duration::hours(1),
            valid_for: time::Duration::days(90),
            delay: Duration::ZERO,
            fail: false,
            validate_via: None,
        }
    }
}

/// An in-process CA signing leaf certificates with a throwaway root.
pub struct FakeCa {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    calls: AtomicUsize,
    settings: Mutex<FakeCaSettings>,
}

impl FakeCa {
    pub fn new() -> anyhow::Result<Arc<Self>> {
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let mut name = DistinguishedName::new();
        name.push(DnType::CommonName, "easyhttps test root");
        params.distinguished_name = name;
        let ca_key = KeyPair::generate()?;
        let ca_cert = params.self_signed(&ca_key)?;
        Ok(Arc::new(Self {
            ca_cert,
            ca_key,
            calls: AtomicUsize::new(0),
            settings: Mutex::new(FakeCaSettings::default()),
        }))
    }

    /// Number of orders started so far, successful or not.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn update(&self, change: impl FnOnce(&mut FakeCaSettings)) {
        change(&mut self.settings.lock().unwrap());
    }

    fn settings(&self) -> FakeCaSettings {
        self.settings.lock().unwrap().clone()
    }

    pub fn root_pem(&self) -> String {
        self.ca_cert.pem()
    }

    fn sign(&self, domain: &str, serial: u64, settings: &FakeCaSettings) -> anyhow::Result<IssuedCertificate> {
        let mut params = CertificateParams::new(vec![domain.to_string()])?;
        let now = OffsetDateTime::now_utc();
        params.not_before = now - settings.valid_since;
        params.not_after = now + settings.valid_for;
        params.serial_number = Some(SerialNumber::from(serial));
        let key = KeyPair::generate()?;
        let leaf = params.signed_by(&key, &self.ca_cert, &self.ca_key)?;
        Ok(IssuedCertificate {
            certificate_chain_pem: format!("{}{}", leaf.pem(), self.ca_cert.pem()),
            private_key_pem: key.serialize_pem(),
        })
    }

    async fn validate(
        &self,
        addr: SocketAddr,
        domain: &str,
        serial: u64,
        responder: &dyn ChallengeResponder,
    ) -> IssueResult<()> {
        let token = format!("token-{serial}");
        let key_authorization = format!("{token}.fake-thumbprint");
        responder
            .present(domain, &token, &key_authorization)
            .await
            .map_err(IssueError::ClientFailure)?;
        let fetched = fetch_challenge(addr, domain, &token).await;
        responder
            .cleanup(domain, &token)
            .await
            .map_err(IssueError::ClientFailure)?;
        match fetched {
            Ok(body) if body == key_authorization => Ok(()),
            Ok(body) => Err(IssueError::AuthFailure(anyhow!(
                "challenge rejected: expected {key_authorization}, got {body}"
            ))),
            Err(err) => Err(IssueError::AuthFailure(err)),
        }
    }
}

async fn fetch_challenge(addr: SocketAddr, domain: &str, token: &str) -> anyhow::Result<String> {
    let response = reqwest::Client::new()
        .get(format!("http://{addr}/.well-known/acme-challenge/{token}"))
        .header(http::header::HOST, domain)
        .send()
        .await
        .context("Fetching challenge response failed")?
        .error_for_status()?;
    Ok(response.text().await?)
}

#[async_trait]
impl AccountClient for FakeCa {
    async fn issue(
        &self,
        domain: &str,
        responder: &dyn ChallengeResponder,
    ) -> IssueResult<IssuedCertificate> {
        let serial = self.calls.fetch_add(1, Ordering::SeqCst) as u64 + 1;
        let settings = self.settings();
        debug!("Fake CA order #{serial} for {domain}");
        if let Some(addr) = settings.validate_via {
            self.validate(addr, domain, serial, responder).await?;
        }
        tokio::time::sleep(settings.delay).await;
        if settings.fail {
            return Err(IssueError::CAFailure(anyhow!("order rejected by test CA")));
        }
        self.sign(domain, serial, &settings)
            .map_err(IssueError::ClientFailure)
    }
}

/// Configuration pointing at `ca`, with everything bound to loopback and kept in memory.
pub fn test_config(ca: &Arc<FakeCa>) -> Config {
    Config::default()
        .with_domains([DOMAIN])
        .with_https_addr(loopback())
        .with_acme_client(ca.clone())
        .with_cache(Arc::new(MemoryCache::new()))
        .with_shutdown_grace(Duration::from_secs(1))
        .with_renewal_interval(Duration::from_secs(3600))
}

pub fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

pub async fn hello(_request: Request<Incoming>) -> Response<Body> {
    Response::new(Full::from(HELLO))
}

/// A server running on its own task.
pub struct TestServer {
    pub http_addr: SocketAddr,
    pub https_addr: SocketAddr,
    pub manager: Arc<Manager>,
    pub shutdown: CancellationToken,
    task: JoinHandle<Result<(), Error>>,
}

impl TestServer {
    pub async fn start(config: Config) -> anyhow::Result<Self> {
        let server = Server::bind(loopback(), hello, config).await?;
        let (http_addr, https_addr) = server.local_addrs();
        let manager = server.manager().clone();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.serve(shutdown.clone()));
        Ok(Self {
            http_addr,
            https_addr,
            manager,
            shutdown,
            task,
        })
    }

    /// Requests shutdown and waits for `serve` to return.
    pub async fn stop(self) -> Result<(), Error> {
        self.shutdown.cancel();
        self.join().await
    }

    pub async fn join(self) -> Result<(), Error> {
        match tokio::time::timeout(Duration::from_secs(10), self.task).await {
            Ok(joined) => joined.unwrap_or_else(|err| panic!("Server task panicked: {err}")),
            Err(_) => panic!("Server did not stop in time"),
        }
    }
}

/// Performs a TLS handshake for `domain` and returns the leaf certificate the server presented.
pub async fn handshake(ca: &FakeCa, addr: SocketAddr, domain: &str) -> anyhow::Result<ParsedCertificate> {
    let (leaf, _) = handshake_with_alpn(ca, addr, domain, Vec::new()).await?;
    Ok(leaf)
}

/// Like [`handshake`], offering `alpn` and also returning the negotiated protocol.
pub async fn handshake_with_alpn(
    ca: &FakeCa,
    addr: SocketAddr,
    domain: &str,
    alpn: Vec<Vec<u8>>,
) -> anyhow::Result<(ParsedCertificate, Option<Vec<u8>>)> {
    let mut roots = RootCertStore::empty();
    roots.add(ca.ca_cert.der().clone())?;
    let mut config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_root_certificates(roots)
    .with_no_client_auth();
    config.alpn_protocols = alpn;
    let connector = TlsConnector::from(Arc::new(config));
    let tcp = TcpStream::connect(addr).await?;
    let stream = connector
        .connect(ServerName::try_from(domain.to_string())?, tcp)
        .await
        .context("TLS handshake failed")?;
    let session = stream.get_ref().1;
    let leaf = session
        .peer_certificates()
        .and_then(|chain| chain.first())
        .context("Server presented no certificate")?;
    let negotiated = session.alpn_protocol().map(<[u8]>::to_vec);
    Ok((ParsedCertificate::try_from(leaf.as_ref())?, negotiated))
}

/// HTTPS client trusting `ca` that resolves `domain` to `addr`.
pub fn https_client(ca: &FakeCa, domain: &str, addr: SocketAddr) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .use_rustls_tls()
        .add_root_certificate(reqwest::Certificate::from_pem(ca.root_pem().as_bytes())?)
        .resolve(domain, addr)
        .redirect(reqwest::redirect::Policy::none())
        .build()?)
}

/// Plain HTTP client that never follows redirects.
pub fn http_client() -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()?)
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) -> anyhow::Result<()> {
    for _ in 0..200 {
        if condition() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    Err(anyhow!("Condition not reached in time"))
}
