use crate::acme::{AccountClient, ChallengeResponder, IssuedCertificate, LETS_ENCRYPT_PRODUCTION};
use crate::cache::{Cache, CacheError, CacheKey};
use crate::error::{IssueContext, IssueError, IssueResult};
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

const POLL_ATTEMPTS: u32 = 10;
const POLL_BASE_DELAY: Duration = Duration::from_secs(1);
const POLL_MAX_DELAY: Duration = Duration::from_secs(30);

/// Issues certificates from an ACME directory using HTTP-01 validation.
///
/// The account is resolved once per process: externally supplied credentials win, then the
/// credentials persisted in the cache, and only if neither exists a new account is registered
/// and its credentials are written back to the cache.
pub struct AcmeAccountClient {
    directory_url: String,
    contact: Vec<String>,
    cache: Arc<dyn Cache>,
    supplied_credentials: Option<String>,
    account: OnceCell<Account>,
}

impl std::fmt::Debug for AcmeAccountClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeAccountClient")
            .field("directory_url", &self.directory_url)
            .field("contact", &self.contact)
            .finish_non_exhaustive()
    }
}

impl AcmeAccountClient {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self {
            directory_url: LETS_ENCRYPT_PRODUCTION.to_string(),
            contact: Vec::new(),
            cache,
            supplied_credentials: None,
            account: OnceCell::new(),
        }
    }

    #[must_use]
    pub fn with_directory_url(mut self, directory_url: impl Into<String>) -> Self {
        self.directory_url = directory_url.into();
        self
    }

    #[must_use]
    pub fn with_email(mut self, email: Option<&str>) -> Self {
        self.contact = email
            .filter(|email| !email.is_empty())
            .map(|email| format!("mailto:{email}"))
            .into_iter()
            .collect();
        self
    }

    /// Uses an existing account, given as `instant-acme` credentials JSON, instead of the cache.
    #[must_use]
    pub fn with_account_credentials(mut self, credentials_json: impl Into<String>) -> Self {
        self.supplied_credentials = Some(credentials_json.into());
        self
    }

    async fn account(&self) -> IssueResult<&Account> {
        self.account.get_or_try_init(|| self.load_account()).await
    }

    async fn load_account(&self) -> IssueResult<Account> {
        if let Some(credentials) = &self.supplied_credentials {
            let credentials: AccountCredentials = serde_json::from_str(credentials)
                .context("Parsing supplied ACME account credentials failed")
                .client_failure()?;
            debug!("Using supplied ACME account");
            return Ok(Account::from_credentials(credentials).await?);
        }

        match self.cache.get(&CacheKey::Account).await {
            Ok(stored) => {
                let credentials: AccountCredentials = serde_json::from_slice(&stored)
                    .context("Cached ACME account credentials are corrupt")
                    .client_failure()?;
                debug!("Loaded ACME account from cache");
                return Ok(Account::from_credentials(credentials).await?);
            }
            Err(CacheError::NotFound) => {}
            Err(err) => {
                return anyhow::Error::new(err)
                    .context("Reading ACME account from cache failed")
                    .client_failure();
            }
        }

        let directory_url = &self.directory_url;
        info!("Registering new ACME account at {directory_url}");
        let contact = self.contact.iter().map(String::as_str).collect::<Vec<_>>();
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contact,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            directory_url,
            None,
        )
        .await?;
        let serialized = serde_json::to_vec(&credentials)
            .context("Serializing ACME account credentials failed")
            .client_failure()?;
        self.cache
            .put(&CacheKey::Account, &serialized)
            .await
            .context("Persisting ACME account credentials failed")
            .client_failure()?;
        Ok(account)
    }

    async fn authorize(
        &self,
        domain: &str,
        order: &mut Order,
        responder: &dyn ChallengeResponder,
        presented: &mut Vec<String>,
    ) -> IssueResult<()> {
        let authorizations = order.authorizations().await?;
        let mut ready_urls = Vec::with_capacity(authorizations.len());
        for authorization in &authorizations {
            match &authorization.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                status => {
                    return anyhow!("Authorization for {domain} is {status:?}")
                        .authentication_failure();
                }
            }
            let challenge = authorization
                .challenges
                .iter()
                .find(|challenge| challenge.r#type == ChallengeType::Http01)
                .ok_or_else(|| anyhow!("CA offered no http-01 challenge for {domain}"))
                .authentication_failure()?;
            let key_authorization = order.key_authorization(challenge);
            responder
                .present(domain, &challenge.token, key_authorization.as_str())
                .await
                .context("Publishing HTTP-01 challenge response failed")
                .client_failure()?;
            presented.push(challenge.token.clone());
            ready_urls.push(challenge.url.clone());
        }

        for url in &ready_urls {
            order.set_challenge_ready(url).await?;
        }
        wait_for_order(order, domain, |status| {
            matches!(status, OrderStatus::Ready | OrderStatus::Valid)
        })
        .await
    }

    async fn finalize(&self, domain: &str, order: &mut Order) -> IssueResult<IssuedCertificate> {
        let key = rcgen::KeyPair::generate()
            .context("Generating certificate key failed")
            .client_failure()?;
        let mut params = rcgen::CertificateParams::new(vec![domain.to_string()])
            .context("Building CSR failed")
            .client_failure()?;
        params.distinguished_name = rcgen::DistinguishedName::new();
        let csr = params
            .serialize_request(&key)
            .context("Signing CSR failed")
            .client_failure()?;

        if order.state().status == OrderStatus::Ready {
            order.finalize(csr.der()).await?;
        }
        let mut delay = POLL_BASE_DELAY;
        for _ in 0..POLL_ATTEMPTS {
            if let Some(chain) = order.certificate().await? {
                return Ok(IssuedCertificate {
                    certificate_chain_pem: chain,
                    private_key_pem: key.serialize_pem(),
                });
            }
            if order.state().status == OrderStatus::Invalid {
                return anyhow!("Order for {domain} became invalid during finalization")
                    .ca_failure();
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(POLL_MAX_DELAY);
        }
        Err(IssueError::TimedOut(total_poll_time()))
    }
}

fn total_poll_time() -> Duration {
    (0..POLL_ATTEMPTS)
        .map(|attempt| (POLL_BASE_DELAY * 2u32.pow(attempt)).min(POLL_MAX_DELAY))
        .sum()
}

async fn wait_for_order<F>(order: &mut Order, domain: &str, done: F) -> IssueResult<()>
where
    F: Fn(OrderStatus) -> bool,
{
    let mut delay = POLL_BASE_DELAY;
    for attempt in 1..=POLL_ATTEMPTS {
        let status = order.refresh().await?.status;
        if done(status) {
            debug!("Order for {domain} is {status:?} after {attempt} attempt(s)");
            return Ok(());
        }
        if status == OrderStatus::Invalid {
            return anyhow!("Order for {domain} is invalid, the CA rejected the authorization")
                .authentication_failure();
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(POLL_MAX_DELAY);
    }
    Err(IssueError::TimedOut(total_poll_time()))
}

#[async_trait]
impl AccountClient for AcmeAccountClient {
    async fn issue(
        &self,
        domain: &str,
        responder: &dyn ChallengeResponder,
    ) -> IssueResult<IssuedCertificate> {
        let account = self.account().await?;
        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;
        info!("Created ACME order for {domain}");

        if order.state().status != OrderStatus::Ready {
            let mut presented = Vec::new();
            let result = self
                .authorize(domain, &mut order, responder, &mut presented)
                .await;
            for token in presented {
                if let Err(err) = responder.cleanup(domain, &token).await {
                    warn!("Removing HTTP-01 challenge response for {domain} failed: {err:#}");
                }
            }
            result?;
        }

        let issued = self.finalize(domain, &mut order).await?;
        info!("Certificate for {domain} issued");
        Ok(issued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;

    #[test]
    fn test_contact_from_email() {
        let client = AcmeAccountClient::new(Arc::new(MemoryCache::new()))
            .with_email(Some("admin@example.com"));
        assert_eq!(client.contact, vec!["mailto:admin@example.com".to_string()]);

        let client = AcmeAccountClient::new(Arc::new(MemoryCache::new())).with_email(Some(""));
        assert!(client.contact.is_empty());
    }

    #[test]
    fn test_poll_budget_is_bounded() {
        assert!(total_poll_time() <= POLL_MAX_DELAY * POLL_ATTEMPTS);
        assert!(total_poll_time() >= POLL_BASE_DELAY * POLL_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_corrupt_cached_account_is_reported() {
        let cache = Arc::new(MemoryCache::new());
        cache.put(&CacheKey::Account, b"not json").await.unwrap();
        let client = AcmeAccountClient::new(cache).with_directory_url("http://127.0.0.1:9/dir");

        let Err(err) = client.account().await else {
            panic!("corrupt credentials were accepted");
        };

        assert!(matches!(err, IssueError::ClientFailure(_)));
    }

    #[tokio::test]
    async fn test_supplied_credentials_take_precedence() {
        let cache = Arc::new(MemoryCache::new());
        let client = AcmeAccountClient::new(cache.clone())
            .with_directory_url("http://127.0.0.1:9/dir")
            .with_account_credentials("{\"id\": 42}");

        let Err(err) = client.account().await else {
            panic!("malformed credentials were accepted");
        };

        assert!(matches!(err, IssueError::ClientFailure(_)));
        assert!(err.to_string().contains("supplied"));
        // Nothing was registered or written back
        assert!(cache.is_empty());
    }
}
