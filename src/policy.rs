use crate::error::CertError;
use std::collections::BTreeSet;
use std::net::IpAddr;

const MAX_NAME_LENGTH: usize = 253;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct PolicyError(pub String);

/// Decides whether the manager may request a certificate for a host.
///
/// Called with the canonical name (see [`canonical_server_name`]) before the cache or the CA
/// are contacted. Whether a name is a plausible DNS name is up to the policy.
pub trait HostPolicy: Send + Sync {
    fn check(&self, host: &str) -> Result<(), PolicyError>;
}

impl<F> HostPolicy for F
where
    F: Fn(&str) -> Result<(), PolicyError> + Send + Sync,
{
    fn check(&self, host: &str) -> Result<(), PolicyError> {
        self(host)
    }
}

/// Exact-match allow-list. An empty list permits nothing.
#[derive(Debug, Clone, Default)]
pub struct HostWhitelist {
    hosts: BTreeSet<String>,
}

impl HostWhitelist {
    pub fn new<I, S>(hosts: I) -> Result<Self, PolicyError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let hosts = hosts
            .into_iter()
            .map(|host| {
                let host = host.as_ref();
                let canonical = canonical_name(host);
                check_dns_name(&canonical)
                    .map(|()| canonical)
                    .map_err(|reason| PolicyError(format!("invalid domain {host:?}: {reason}")))
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { hosts })
    }
}

impl HostPolicy for HostWhitelist {
    fn check(&self, host: &str) -> Result<(), PolicyError> {
        if self.hosts.is_empty() {
            return Err(PolicyError("no domains are configured".to_string()));
        }
        if self.hosts.contains(host) {
            Ok(())
        } else {
            Err(PolicyError(format!("{host} is not in the allowed host list")))
        }
    }
}

fn canonical_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// Canonical form of a TLS server name: ASCII lowercase without the trailing root dot.
///
/// Only names that cannot be a server name at all are refused here. Everything else, single
/// labels and IP literals included, is left to the [`HostPolicy`].
pub fn canonical_server_name(name: &str) -> Result<String, CertError> {
    let canonical = canonical_name(name);
    if canonical.is_empty() {
        return Err(CertError::MissingServerName);
    }
    if !canonical.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(CertError::InvalidServerName {
            name: name.to_string(),
            reason: "name contains whitespace, control or non-ASCII characters",
        });
    }
    Ok(canonical)
}

fn check_dns_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("name is empty");
    }
    if name.parse::<IpAddr>().is_ok() {
        return Err("IP addresses are not supported");
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err("name is too long");
    }
    if !name.contains('.') {
        return Err("name must contain at least two labels");
    }
    for label in name.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err("empty or oversized label");
        }
        if !label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err("name contains invalid characters");
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err("label starts or ends with a hyphen");
        }
    }
    Ok(())
}
