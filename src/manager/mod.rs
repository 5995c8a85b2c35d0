//! Certificate lifecycle per host name.

use crate::acme::AccountClient;
use crate::cache::{Cache, CacheError, CacheKey};
use crate::cert::ManagedCertificate;
use crate::error::{CertError, IssueError};
use crate::policy::{HostPolicy, canonical_server_name};
use crate::time::humanize_duration;
use parking_lot::{Mutex, RwLock};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

pub mod challenge;
pub mod flight;
pub mod renew;

use challenge::{ChallengeStore, token_from_path};
use flight::{Flight, FlightAborted, SingleFlight};
use renew::RenewalBackoff;

type Issuance = Result<Arc<ManagedCertificate>, CertError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateState {
    Unrequested,
    Pending,
    Valid,
    Renewing,
    Expired,
}

pub struct ManagerConfig {
    pub cache: Arc<dyn Cache>,
    pub host_policy: Arc<dyn HostPolicy>,
    pub client: Arc<dyn AccountClient>,
    pub renew_before: Duration,
    pub issuance_timeout: Duration,
}

pub struct Manager {
    cache: Arc<dyn Cache>,
    host_policy: Arc<dyn HostPolicy>,
    client: Arc<dyn AccountClient>,
    renew_before: Duration,
    issuance_timeout: Duration,
    certificates: RwLock<HashMap<String, Arc<ManagedCertificate>>>,
    challenges: Arc<ChallengeStore>,
    flights: SingleFlight<String, Issuance>,
    renewal_backoff: Mutex<HashMap<String, RenewalBackoff>>,
}

impl Debug for Manager {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("cache", &self.cache)
            .field("renew_before", &self.renew_before)
            .field("certificates", &self.certificates.read().len())
            .field("in_flight", &self.flights.len())
            .finish_non_exhaustive()
    }
}

impl Manager {
    pub fn new(config: ManagerConfig) -> Arc<Self> {
        Arc::new(Self {
            challenges: Arc::new(ChallengeStore::new(config.cache.clone())),
            cache: config.cache,
            host_policy: config.host_policy,
            client: config.client,
            renew_before: config.renew_before,
            issuance_timeout: config.issuance_timeout,
            certificates: RwLock::new(HashMap::new()),
            flights: SingleFlight::new(),
            renewal_backoff: Mutex::new(HashMap::new()),
        })
    }

    /// Selects the certificate for a handshake, issuing one if needed. Concurrent calls for the
    /// same host share one attempt and its outcome.
    pub async fn get_certificate(
        self: &Arc<Self>,
        server_name: Option<&str>,
    ) -> Result<Arc<ManagedCertificate>, CertError> {
        let host = canonical_server_name(server_name.ok_or(CertError::MissingServerName)?)?;
        self.host_policy
            .check(&host)
            .map_err(|err| CertError::PolicyRejection {
                host: host.clone(),
                reason: err.0,
            })?;

        let now = OffsetDateTime::now_utc();
        if let Some(cert) = self.certificate(&host) {
            if cert.is_valid_at(now) {
                if self.needs_renewal(&cert, now) {
                    // The flight runs on its own task, the current certificate is served meanwhile
                    let _ = self.start_renewal(&host);
                }
                return Ok(cert);
            }
        }

        let flight = self.flights.join(host.clone(), self.clone().obtain(host.clone()));
        flight.await.unwrap_or_else(|aborted| Err(aborted_issuance(host, aborted)))
    }

    pub fn state(&self, host: &str) -> CertificateState {
        let Ok(host) = canonical_server_name(host) else {
            return CertificateState::Unrequested;
        };
        let in_flight = self.flights.is_in_flight(&host);
        match self.certificate(&host) {
            None if in_flight => CertificateState::Pending,
            None => CertificateState::Unrequested,
            Some(cert) if !cert.is_valid_at(OffsetDateTime::now_utc()) => {
                if in_flight {
                    CertificateState::Pending
                } else {
                    CertificateState::Expired
                }
            }
            Some(_) if in_flight => CertificateState::Renewing,
            Some(_) => CertificateState::Valid,
        }
    }

    pub fn certificate(&self, host: &str) -> Option<Arc<ManagedCertificate>> {
        self.certificates.read().get(host).cloned()
    }

    pub fn certificates(&self) -> Vec<Arc<ManagedCertificate>> {
        self.certificates.read().values().cloned().collect()
    }

    pub fn challenges(&self) -> &ChallengeStore {
        &self.challenges
    }

    pub async fn http_challenge_response(&self, path: &str) -> Option<String> {
        let token = token_from_path(path)?;
        let response = self.challenges.response(token).await;
        if response.is_none() {
            debug!("No pending challenge for token {token}");
        }
        response
    }

    fn needs_renewal(&self, cert: &ManagedCertificate, now: OffsetDateTime) -> bool {
        renew::needs_renewal(cert.validity(), self.renew_before, now)
    }

    pub(crate) fn start_renewal(self: &Arc<Self>, host: &str) -> Option<Flight<Issuance>> {
        let host = host.to_string();
        if self.flights.is_in_flight(&host) {
            return None;
        }
        if let Some(backoff) = self.renewal_backoff.lock().get(&host) {
            if !backoff.allows_attempt(Instant::now()) {
                debug!(
                    "Renewal for {host} is backing off after {} failure(s)",
                    backoff.failures()
                );
                return None;
            }
        }
        info!("Certificate for {host} is due for renewal");
        Some(self.flights.join(host.clone(), self.clone().obtain(host)))
    }

    async fn obtain(self: Arc<Self>, host: String) -> Issuance {
        let now = OffsetDateTime::now_utc();
        let current = self.certificate(&host);
        if let Some(cert) = &current {
            // Another flight may have finished between the caller's check and now
            if cert.is_valid_at(now) && !self.needs_renewal(cert, now) {
                return Ok(cert.clone());
            }
        }

        if let Some(cert) = self.load_from_cache(&host, now, current.as_deref()).await? {
            let cert = Arc::new(cert);
            self.install(cert.clone());
            return Ok(cert);
        }

        let renewing = current.as_ref().is_some_and(|cert| cert.is_valid_at(now));
        info!("Obtaining certificate for {host}");
        let result = self.issue(&host).await;
        self.challenges.purge_domain(&host).await;

        match result {
            Ok(cert) => {
                let cert = Arc::new(cert);
                if let Err(err) = self
                    .cache
                    .put(&CacheKey::certificate(host.as_str()), cert.bundle())
                    .await
                {
                    warn!("Persisting certificate for {host} failed, serving it from memory only: {err:#}");
                }
                self.install(cert.clone());
                self.renewal_backoff.lock().remove(&host);
                Ok(cert)
            }
            Err(err) => {
                let source = Arc::new(err);
                if renewing {
                    let mut backoff = self.renewal_backoff.lock();
                    let next = RenewalBackoff::after_failure(backoff.get(&host).copied(), Instant::now());
                    backoff.insert(host.clone(), next);
                    warn!(
                        "Renewing certificate for {host} failed ({} attempt(s)), still serving the current certificate: {source}",
                        next.failures()
                    );
                } else {
                    warn!("Obtaining certificate for {host} failed ({}): {source}", source.kind());
                }
                Err(CertError::Issuance { host, source })
            }
        }
    }

    // A miss, a transient read error or an unusable entry all mean "issue a new one"
    async fn load_from_cache(
        &self,
        host: &str,
        now: OffsetDateTime,
        current: Option<&ManagedCertificate>,
    ) -> Result<Option<ManagedCertificate>, CertError> {
        let bundle = match self.cache.get(&CacheKey::certificate(host)).await {
            Ok(bundle) => bundle,
            Err(CacheError::NotFound) => return Ok(None),
            Err(err) if err.is_transient() => {
                warn!("Reading cached certificate for {host} failed, issuing a new one: {err:#}");
                return Ok(None);
            }
            Err(err) => {
                return Err(CertError::Cache {
                    host: host.to_string(),
                    source: Arc::new(err),
                });
            }
        };
        let cert = match ManagedCertificate::from_bundle(host, bundle) {
            Ok(cert) => cert,
            Err(err) => {
                warn!("Ignoring unusable cached certificate for {host}: {err:#}");
                return Ok(None);
            }
        };
        if !cert.is_valid_at(now) {
            debug!("Cached certificate for {host} is not valid at this time");
            return Ok(None);
        }
        if let Some(current) = current {
            // Renewing: only a certificate someone else already renewed is of any use
            if cert.validity().not_after <= current.validity().not_after
                || self.needs_renewal(&cert, now)
            {
                return Ok(None);
            }
        }
        debug!("Loaded certificate for {host} from cache");
        Ok(Some(cert))
    }

    async fn issue(&self, host: &str) -> Result<ManagedCertificate, IssueError> {
        let issued = tokio::time::timeout(
            self.issuance_timeout,
            self.client.issue(host, self.challenges.as_ref()),
        )
        .await
        .map_err(|_| IssueError::TimedOut(self.issuance_timeout))??;
        ManagedCertificate::from_issued(host, &issued)
            .map_err(|err| IssueError::CAFailure(err.context("CA returned an unusable certificate")))
    }

    fn install(&self, cert: Arc<ManagedCertificate>) {
        let host = cert.host().to_string();
        let remaining = cert.validity().remaining_at(OffsetDateTime::now_utc());
        let expires_in = humanize_duration(remaining);
        self.certificates.write().insert(host.clone(), cert);
        info!("Installed certificate for {host}, expires in {expires_in}");
    }
}

fn aborted_issuance(host: String, aborted: FlightAborted) -> CertError {
    CertError::Issuance {
        host,
        source: Arc::new(IssueError::ClientFailure(aborted.into())),
    }
}

impl ResolvesServerCert for Manager {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let host = canonical_server_name(client_hello.server_name()?).ok()?;
        self.certificate(&host)
            .filter(|cert| cert.is_valid_at(OffsetDateTime::now_utc()))
            .map(|cert| cert.certified_key())
    }
}
