//! Server configuration.
//!
//! [`Config`] is a plain struct with one builder setter per field; every field has a default
//! (see [`default`]). The binary additionally reads an optional TOML file, see [`toml`].

use crate::acme::{AccountClient, AcmeAccountClient, LETS_ENCRYPT_PRODUCTION};
use crate::cache::{Cache, DirCache};
use crate::manager::{Manager, ManagerConfig};
use crate::policy::{HostPolicy, HostWhitelist};
use crate::server::Handler;
use crate::tls::{TlsCustomizer, TlsSettings};
use anyhow::Context;
use rustls::ServerConfig;
use rustls::server::ResolvesServerCert;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub mod default;
pub mod toml;

pub use self::toml::FileConfig;
use default::*;

#[derive(Clone)]
pub struct Config {
    /// Hosts certificates may be requested for. Used by the default host policy; empty means
    /// no host is eligible.
    pub domains: Vec<String>,
    pub email: Option<String>,
    pub tls_settings: Option<TlsSettings>,
    /// Runs on the finished rustls config and may override anything in it.
    pub tls_customizer: Option<TlsCustomizer>,
    /// Handler for non-challenge requests on the plain listener when redirects are off.
    /// Defaults to the main handler.
    pub http_handler: Option<Arc<dyn Handler>>,
    pub https_addr: SocketAddr,
    pub redirect_http: bool,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub acme_client: Option<Arc<dyn AccountClient>>,
    /// Defaults to a [`DirCache`] in `./certcache`.
    pub cache: Option<Arc<dyn Cache>>,
    /// Defaults to a [`HostWhitelist`] of `domains`.
    pub host_policy: Option<Arc<dyn HostPolicy>>,
    pub directory_url: String,
    pub renew_before: Duration,
    pub issuance_timeout: Duration,
    pub shutdown_grace: Duration,
    pub renewal_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            domains: Vec::new(),
            email: None,
            tls_settings: None,
            tls_customizer: None,
            http_handler: None,
            https_addr: DEFAULT_HTTPS_ADDR,
            redirect_http: true,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            acme_client: None,
            cache: None,
            host_policy: None,
            directory_url: LETS_ENCRYPT_PRODUCTION.to_string(),
            renew_before: DEFAULT_RENEW_BEFORE,
            issuance_timeout: DEFAULT_ISSUANCE_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            renewal_interval: DEFAULT_RENEWAL_INTERVAL,
        }
    }
}

impl Debug for Config {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("domains", &self.domains)
            .field("email", &self.email)
            .field("tls_settings", &self.tls_settings)
            .field("https_addr", &self.https_addr)
            .field("redirect_http", &self.redirect_http)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("cache", &self.cache)
            .field("directory_url", &self.directory_url)
            .field("renew_before", &self.renew_before)
            .field("issuance_timeout", &self.issuance_timeout)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish_non_exhaustive()
    }
}

impl Config {
    #[must_use]
    pub fn with_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.domains = domains.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    #[must_use]
    pub fn with_tls_settings(mut self, settings: TlsSettings) -> Self {
        self.tls_settings = Some(settings);
        self
    }

    #[must_use]
    pub fn with_tls_customizer<F>(mut self, customizer: F) -> Self
    where
        F: Fn(&mut ServerConfig) + Send + Sync + 'static,
    {
        self.tls_customizer = Some(Arc::new(customizer));
        self
    }

    #[must_use]
    pub fn with_http_handler<H: Handler>(mut self, handler: H) -> Self {
        self.http_handler = Some(Arc::new(handler));
        self
    }

    #[must_use]
    pub fn with_https_addr(mut self, addr: SocketAddr) -> Self {
        self.https_addr = addr;
        self
    }

    #[must_use]
    pub fn with_redirect_http(mut self, redirect: bool) -> Self {
        self.redirect_http = redirect;
        self
    }

    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_acme_client(mut self, client: Arc<dyn AccountClient>) -> Self {
        self.acme_client = Some(client);
        self
    }

    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn with_host_policy(mut self, policy: Arc<dyn HostPolicy>) -> Self {
        self.host_policy = Some(policy);
        self
    }

    #[must_use]
    pub fn with_directory_url(mut self, url: impl Into<String>) -> Self {
        self.directory_url = url.into();
        self
    }

    #[must_use]
    pub fn with_renew_before(mut self, renew_before: Duration) -> Self {
        self.renew_before = renew_before;
        self
    }

    #[must_use]
    pub fn with_issuance_timeout(mut self, timeout: Duration) -> Self {
        self.issuance_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    #[must_use]
    pub fn with_renewal_interval(mut self, interval: Duration) -> Self {
        self.renewal_interval = interval;
        self
    }

    pub fn effective_tls_settings(&self) -> TlsSettings {
        self.tls_settings.clone().unwrap_or_default()
    }

    pub fn tls_server_config(
        &self,
        resolver: Arc<dyn ResolvesServerCert>,
    ) -> anyhow::Result<ServerConfig> {
        let mut config = self.effective_tls_settings().build_server_config(resolver)?;
        if let Some(customizer) = &self.tls_customizer {
            customizer(&mut config);
        }
        Ok(config)
    }

    pub fn build_manager(&self) -> anyhow::Result<Arc<Manager>> {
        if self.issuance_timeout.is_zero() {
            anyhow::bail!("issuance timeout must not be zero");
        }
        let cache = self
            .cache
            .clone()
            .unwrap_or_else(|| Arc::new(DirCache::new(DEFAULT_CACHE_DIR)));
        let host_policy: Arc<dyn HostPolicy> = match &self.host_policy {
            Some(policy) => policy.clone(),
            None => Arc::new(HostWhitelist::new(&self.domains).context("Invalid domain list")?),
        };
        let client = match &self.acme_client {
            Some(client) => client.clone(),
            None => {
                url::Url::parse(&self.directory_url)
                    .map_err(|err| anyhow::anyhow!("invalid ACME directory URL: {err}"))?;
                Arc::new(
                    AcmeAccountClient::new(cache.clone())
                        .with_directory_url(&self.directory_url)
                        .with_email(self.email.as_deref()),
                )
            }
        };
        Ok(Manager::new(ManagerConfig {
            cache,
            host_policy,
            client,
            renew_before: self.renew_before,
            issuance_timeout: self.issuance_timeout,
        }))
    }
}
