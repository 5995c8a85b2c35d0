use async_trait::async_trait;
use std::fmt::{Debug, Display, Formatter};
use std::io;

pub mod dir;
pub mod memory;

pub use dir::DirCache;
pub use memory::MemoryCache;

const ACCOUNT_KEY: &str = "acme_account+key";
const HTTP_TOKEN_SUFFIX: &str = "+http-01";

/// Persistent storage for certificates, account credentials and pending challenge tokens.
///
/// Implementations must be safe to use from many issuance flows at once. A `get` for a key that
/// was never written (or was deleted) must return [`CacheError::NotFound`], never a generic error.
#[async_trait]
pub trait Cache: Send + Sync + Debug {
    async fn get(&self, key: &CacheKey) -> Result<Vec<u8>, CacheError>;

    async fn put(&self, key: &CacheKey, data: &[u8]) -> Result<(), CacheError>;

    async fn delete(&self, key: &CacheKey) -> Result<(), CacheError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Account,
    Certificate(String),
    HttpToken(String),
    Raw(String),
}

impl CacheKey {
    pub fn certificate(host: impl Into<String>) -> Self {
        Self::Certificate(host.into())
    }

    pub fn http_token(token: impl Into<String>) -> Self {
        Self::HttpToken(token.into())
    }

    pub fn name(&self) -> String {
        match self {
            CacheKey::Account => ACCOUNT_KEY.to_string(),
            CacheKey::Certificate(host) => host.clone(),
            CacheKey::HttpToken(token) => format!("{token}{HTTP_TOKEN_SUFFIX}"),
            CacheKey::Raw(raw) => raw.clone(),
        }
    }

    pub fn validated_name(&self) -> Result<String, CacheError> {
        let name = self.name();
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains("..")
            || name.contains(['/', '\\', '\0'])
        {
            return Err(CacheError::InvalidKey(name));
        }
        Ok(name)
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache entry not found")]
    NotFound,
    #[error("invalid cache key {0:?}")]
    InvalidKey(String),
    #[error("cache I/O failed")]
    Io(#[from] io::Error),
}

impl CacheError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound)
    }

    /// Permission problems and bad keys will not fix themselves.
    pub fn is_transient(&self) -> bool {
        match self {
            CacheError::NotFound => true,
            CacheError::InvalidKey(_) => false,
            CacheError::Io(err) => !matches!(
                err.kind(),
                io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem
            ),
        }
    }
}

pub(crate) fn tolerate_missing(result: Result<(), CacheError>) -> Result<(), CacheError> {
    match result {
        Err(CacheError::NotFound) => Ok(()),
        other => other,
    }
}
