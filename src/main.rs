use anyhow::Context;
use clap::Parser;
use easyhttps::acme::LETS_ENCRYPT_STAGING;
use easyhttps::config::FileConfig;
use easyhttps::config::default::DEFAULT_HTTP_ADDR;
use easyhttps::server::http::Body;
use easyhttps::time::ParsedDuration;
use easyhttps::{CRATE_NAME, Config, DirCache, listen_and_serve};
use http::{Request, Response};
use http_body_util::Full;
use hyper::body::Incoming;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const ENV_FILTER_NAME: &str = "EASYHTTPS_LOG";

/// Serve HTTPS with certificates obtained automatically via ACME (HTTP-01).
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct CommandLineArguments {
    /// Domain to obtain certificates for (repeatable)
    #[arg(short, long = "domain", env = "EASYHTTPS_DOMAINS", value_delimiter = ',')]
    domains: Vec<String>,
    /// Contact e-mail for the ACME account
    #[arg(short, long, env = "EASYHTTPS_EMAIL")]
    email: Option<String>,
    /// Address of the plain HTTP listener (challenges and redirects)
    #[arg(long, env = "EASYHTTPS_HTTP_ADDR")]
    http_addr: Option<SocketAddr>,
    /// Address of the HTTPS listener
    #[arg(long, env = "EASYHTTPS_HTTPS_ADDR")]
    https_addr: Option<SocketAddr>,
    /// Directory for certificates and the account key
    #[arg(long, env = "EASYHTTPS_CACHE_DIR")]
    cache_dir: Option<PathBuf>,
    /// Use the Let's Encrypt staging environment
    #[arg(long, action)]
    staging: bool,
    /// Custom ACME directory URL
    #[arg(long, env = "EASYHTTPS_DIRECTORY_URL")]
    directory_url: Option<String>,
    /// Do not redirect plain HTTP requests to HTTPS
    #[arg(long, action)]
    no_redirect: bool,
    /// How long open connections may take to finish on shutdown (e.g. "5s")
    #[arg(long)]
    grace: Option<ParsedDuration>,
    /// Optional TOML configuration file; command line flags take precedence
    #[arg(short, long, env = "EASYHTTPS_CONFIG")]
    config: Option<PathBuf>,
    /// Shorthand option to enable debug logging (logging can be fine-tuned via `EASYHTTPS_LOG` environment variable)
    #[arg(long, short, action)]
    verbose: bool,
}

impl CommandLineArguments {
    fn into_config(self) -> anyhow::Result<(SocketAddr, Config)> {
        let file = match &self.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        let http_addr = self
            .http_addr
            .or(file.http_addr)
            .unwrap_or(DEFAULT_HTTP_ADDR);
        let mut config = file.apply(Config::default());
        if !self.domains.is_empty() {
            config.domains = self.domains;
        }
        if let Some(email) = self.email {
            config.email = Some(email);
        }
        if let Some(addr) = self.https_addr {
            config.https_addr = addr;
        }
        if let Some(dir) = self.cache_dir {
            config.cache = Some(Arc::new(DirCache::new(dir)));
        }
        if self.staging {
            config.directory_url = LETS_ENCRYPT_STAGING.to_string();
        }
        if let Some(url) = self.directory_url {
            config.directory_url = url;
        }
        if self.no_redirect {
            config.redirect_http = false;
        }
        if let Some(grace) = self.grace {
            config.shutdown_grace = *grace;
        }
        Ok((http_addr, config))
    }
}

async fn hello(request: Request<Incoming>) -> Response<Body> {
    let host = request
        .headers()
        .get(http::header::HOST)
        .and_then(|host| host.to_str().ok())
        .unwrap_or("unknown host")
        .to_string();
    let mut response = Response::new(Full::from(format!("Hello from {CRATE_NAME} on {host}\n")));
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Cancels the returned token on Ctrl-C or SIGTERM.
fn shutdown_on_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let signalled = token.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut terminate =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(terminate) => terminate,
                    Err(err) => {
                        warn!("Cannot listen for SIGTERM: {err}");
                        let _ = ctrl_c.await;
                        signalled.cancel();
                        return;
                    }
                };
            tokio::select! {
                _ = ctrl_c => {}
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        info!("Received shutdown signal");
        signalled.cancel();
    });
    token
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CommandLineArguments::parse();
    let filter = EnvFilter::try_from_env(ENV_FILTER_NAME).unwrap_or_else(|_| {
        EnvFilter::try_from_env("RUST_LOG").unwrap_or_else(|_| {
            EnvFilter::new(if cli.verbose {
                "easyhttps=debug,info"
            } else {
                "info"
            })
        })
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let (http_addr, config) = cli.into_config().context("Loading configuration failed")?;
    if config.domains.is_empty() {
        warn!("No domains configured, every TLS handshake will be rejected");
    }
    listen_and_serve(http_addr, hello, config, shutdown_on_signal()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("easyhttps.toml");
        std::fs::write(
            &path,
            "domains = [\"file.example\"]\nhttp_addr = \"127.0.0.1:8080\"\nredirect_http = true\n",
        )?;
        let cli = CommandLineArguments::try_parse_from([
            "easyhttps",
            "--config",
            path.to_str().unwrap(),
            "--domain",
            "a.example,b.example",
            "--no-redirect",
            "--grace",
            "2s",
        ])?;

        let (http_addr, config) = cli.into_config()?;

        assert_eq!(http_addr.port(), 8080);
        assert_eq!(config.domains, vec!["a.example", "b.example"]);
        assert!(!config.redirect_http);
        assert_eq!(config.shutdown_grace, std::time::Duration::from_secs(2));
        Ok(())
    }
}
