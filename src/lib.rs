pub mod acme;
pub mod cache;
pub mod cert;
pub mod config;
pub mod error;
pub mod manager;
pub mod policy;
pub mod server;
pub mod time;
pub mod tls;

pub use cache::{Cache, CacheError, CacheKey, DirCache, MemoryCache};
pub use config::Config;
pub use error::{CertError, Error, IssueError};
pub use manager::{CertificateState, Manager};
pub use policy::{HostPolicy, HostWhitelist};
pub use server::{Body, Handler, Server, listen_and_serve};
pub use tls::{TlsSettings, TlsVersion};

pub const CRATE_NAME: &str = env!("CARGO_PKG_NAME");
