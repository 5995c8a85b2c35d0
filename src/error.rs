use crate::cache::CacheError;
use std::fmt::{Display, Formatter};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0:#}")]
    Configuration(anyhow::Error),
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error("connections were still open after the {0:?} shutdown grace period")]
    ShutdownTimeout(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Http,
    Https,
}

impl Display for ListenerKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerKind::Http => f.write_str("HTTP"),
            ListenerKind::Https => f.write_str("HTTPS"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("binding {listener} listener to {addr} failed")]
    Bind {
        listener: ListenerKind,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("{listener} listener failed to accept connections")]
    Accept {
        listener: ListenerKind,
        #[source]
        source: io::Error,
    },
    /// The listener was stopped on purpose. Never reported as a failure.
    #[error("{listener} listener closed")]
    Closed { listener: ListenerKind },
}

impl ListenerError {
    pub fn is_closed(&self) -> bool {
        matches!(self, ListenerError::Closed { .. })
    }

    pub fn listener(&self) -> ListenerKind {
        match self {
            ListenerError::Bind { listener, .. }
            | ListenerError::Accept { listener, .. }
            | ListenerError::Closed { listener } => *listener,
        }
    }
}

/// Cloneable so every waiter of a shared issuance gets the same outcome.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CertError {
    #[error("client did not indicate a server name")]
    MissingServerName,
    #[error("invalid server name {name:?}: {reason}")]
    InvalidServerName { name: String, reason: &'static str },
    #[error("host {host} is not permitted: {reason}")]
    PolicyRejection { host: String, reason: String },
    #[error("obtaining a certificate for {host} failed")]
    Issuance {
        host: String,
        #[source]
        source: Arc<IssueError>,
    },
    #[error("reading the cached certificate for {host} failed")]
    Cache {
        host: String,
        #[source]
        source: Arc<CacheError>,
    },
}

pub type IssueResult<T> = Result<T, IssueError>;

#[derive(Debug, thiserror::Error)]
pub enum IssueError {
    #[error("{0:?}")]
    ClientFailure(anyhow::Error),
    #[error("{0:?}")]
    CAFailure(anyhow::Error),
    #[error("{0:?}")]
    AuthFailure(anyhow::Error),
    #[error("issuance did not complete within {0:?}")]
    TimedOut(Duration),
}

impl IssueError {
    pub fn kind(&self) -> &'static str {
        match self {
            IssueError::ClientFailure(_) => "client failure",
            IssueError::CAFailure(_) => "CA failure",
            IssueError::AuthFailure(_) => "authorization failure",
            IssueError::TimedOut(_) => "timeout",
        }
    }
}

impl From<anyhow::Error> for IssueError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<instant_acme::Error>() {
            Some(instant_acme::Error::Api(_)) => IssueError::CAFailure(err),
            _ => IssueError::ClientFailure(err),
        }
    }
}

impl From<instant_acme::Error> for IssueError {
    fn from(err: instant_acme::Error) -> Self {
        anyhow::Error::from(err).into()
    }
}

pub trait IssueContext<T>: Sized {
    fn tag(self, kind: fn(anyhow::Error) -> IssueError) -> IssueResult<T>;

    fn client_failure(self) -> IssueResult<T> {
        self.tag(IssueError::ClientFailure)
    }

    fn ca_failure(self) -> IssueResult<T> {
        self.tag(IssueError::CAFailure)
    }

    fn authentication_failure(self) -> IssueResult<T> {
        self.tag(IssueError::AuthFailure)
    }
}

impl<T> IssueContext<T> for anyhow::Error {
    fn tag(self, kind: fn(anyhow::Error) -> IssueError) -> IssueResult<T> {
        Err(kind(self))
    }
}

impl<T> IssueContext<T> for anyhow::Result<T> {
    fn tag(self, kind: fn(anyhow::Error) -> IssueError) -> IssueResult<T> {
        self.map_err(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_closed_listener_is_benign() {
        let closed = ListenerError::Closed {
            listener: ListenerKind::Https,
        };
        assert!(closed.is_closed());
        let accept = ListenerError::Accept {
            listener: ListenerKind::Http,
            source: io::Error::from(io::ErrorKind::Other),
        };
        assert!(!accept.is_closed());
        assert_eq!(accept.listener(), ListenerKind::Http);
    }

    #[test]
    fn test_issue_context() {
        let result: anyhow::Result<()> = Err(anyhow!("challenge rejected"));
        let err = result.authentication_failure().unwrap_err();
        assert!(matches!(err, IssueError::AuthFailure(_)));
        assert!(err.to_string().contains("challenge rejected"));
    }

    #[test]
    fn test_untyped_errors_are_client_failures() {
        let err = IssueError::from(anyhow!("connection reset"));
        assert!(matches!(err, IssueError::ClientFailure(_)));
    }
}
