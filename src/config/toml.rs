use crate::acme::LETS_ENCRYPT_STAGING;
use crate::cache::DirCache;
use crate::config::Config;
use crate::time::ParsedDuration;
use crate::tls::TlsVersion;
use anyhow::Context;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use toml_edit::DocumentMut;

/// Settings the binary reads from its configuration file. Everything is optional, command line
/// flags override whatever is set here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub domains: Vec<String>,
    pub email: Option<String>,
    pub http_addr: Option<SocketAddr>,
    pub https_addr: Option<SocketAddr>,
    pub redirect_http: Option<bool>,
    pub read_timeout: Option<ParsedDuration>,
    pub write_timeout: Option<ParsedDuration>,
    pub cache_dir: Option<PathBuf>,
    pub directory_url: Option<String>,
    pub staging: Option<bool>,
    pub renew_before: Option<ParsedDuration>,
    pub issuance_timeout: Option<ParsedDuration>,
    pub shutdown_grace: Option<ParsedDuration>,
    pub renewal_interval: Option<ParsedDuration>,
    pub min_tls_version: Option<TlsVersion>,
}

impl FileConfig {
    pub fn load<P: AsRef<Path>>(file: P) -> anyhow::Result<Self> {
        let file = file.as_ref();
        let document = std::fs::read_to_string(file)
            .with_context(|| format!("Reading {} failed", file.display()))?;
        Self::parse(&document).with_context(|| format!("Parsing {} failed", file.display()))
    }

    pub fn parse(document: &str) -> anyhow::Result<Self> {
        let document = DocumentMut::from_str(document)?;
        Ok(toml_edit::de::from_document(document)?)
    }

    /// Overlays the file's settings onto `config`.
    pub fn apply(self, mut config: Config) -> Config {
        if !self.domains.is_empty() {
            config.domains = self.domains;
        }
        if let Some(email) = self.email {
            config.email = Some(email);
        }
        if let Some(addr) = self.https_addr {
            config.https_addr = addr;
        }
        if let Some(redirect) = self.redirect_http {
            config.redirect_http = redirect;
        }
        if let Some(timeout) = self.read_timeout {
            config.read_timeout = *timeout;
        }
        if let Some(timeout) = self.write_timeout {
            config.write_timeout = *timeout;
        }
        if let Some(dir) = self.cache_dir {
            config.cache = Some(Arc::new(DirCache::new(dir)));
        }
        if self.staging == Some(true) {
            config.directory_url = LETS_ENCRYPT_STAGING.to_string();
        }
        if let Some(url) = self.directory_url {
            config.directory_url = url;
        }
        if let Some(renew_before) = self.renew_before {
            config.renew_before = *renew_before;
        }
        if let Some(timeout) = self.issuance_timeout {
            config.issuance_timeout = *timeout;
        }
        if let Some(grace) = self.shutdown_grace {
            config.shutdown_grace = *grace;
        }
        if let Some(interval) = self.renewal_interval {
            config.renewal_interval = *interval;
        }
        if let Some(min_version) = self.min_tls_version {
            let mut settings = config.tls_settings.take().unwrap_or_default();
            settings.min_version = min_version;
            config.tls_settings = Some(settings);
        }
        config
    }
}
