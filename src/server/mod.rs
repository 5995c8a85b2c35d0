//! The plain and TLS listeners and their shared lifecycle.

use crate::config::Config;
use crate::error::{Error, ListenerError, ListenerKind};
use crate::manager::Manager;
use crate::tls::TlsAcceptor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub mod http;
mod listener;

pub use self::http::{Body, Handler};
use self::http::PlainRoutes;
use listener::{Accept, Connections, Service, accept_loop};

pub struct Server {
    http_listener: Box<dyn Accept>,
    https_listener: Box<dyn Accept>,
    http_addr: SocketAddr,
    https_addr: SocketAddr,
    manager: Arc<Manager>,
    acceptor: TlsAcceptor,
    plain_routes: Arc<PlainRoutes>,
    handler: Arc<dyn Handler>,
    read_timeout: Duration,
    write_timeout: Duration,
    shutdown_grace: Duration,
    renewal_interval: Duration,
}

async fn bind(kind: ListenerKind, addr: SocketAddr) -> Result<(TcpListener, SocketAddr), ListenerError> {
    let bind_error = |source| ListenerError::Bind {
        listener: kind,
        addr,
        source,
    };
    let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
    let local_addr = listener.local_addr().map_err(bind_error)?;
    Ok((listener, local_addr))
}

impl Server {
    pub async fn bind<H: Handler>(
        http_addr: SocketAddr,
        handler: H,
        config: Config,
    ) -> Result<Self, Error> {
        let manager = config.build_manager().map_err(Error::Configuration)?;
        let tls_config = config
            .tls_server_config(manager.clone())
            .map_err(Error::Configuration)?;

        let (http_listener, http_addr) = bind(ListenerKind::Http, http_addr).await?;
        let (https_listener, https_addr) = bind(ListenerKind::Https, config.https_addr).await?;

        let handler: Arc<dyn Handler> = Arc::new(handler);
        let plain_routes = Arc::new(PlainRoutes {
            manager: manager.clone(),
            redirect_port: config.redirect_http.then_some(https_addr.port()),
            fallback: config.http_handler.clone().unwrap_or_else(|| handler.clone()),
        });
        let acceptor = TlsAcceptor::new(manager.clone(), Arc::new(tls_config), config.read_timeout);

        Ok(Self {
            http_listener: Box::new(http_listener),
            https_listener: Box::new(https_listener),
            http_addr,
            https_addr,
            manager,
            acceptor,
            plain_routes,
            handler,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            shutdown_grace: config.shutdown_grace,
            renewal_interval: config.renewal_interval,
        })
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn https_addr(&self) -> SocketAddr {
        self.https_addr
    }

    pub fn local_addrs(&self) -> (SocketAddr, SocketAddr) {
        (self.http_addr, self.https_addr)
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    /// Serves until `shutdown` is cancelled or a listener fails, then gives open connections the
    /// shutdown grace period. A listener failure takes precedence over [`Error::ShutdownTimeout`].
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), Error> {
        let stop = shutdown.child_token();
        let connections = Connections::new(self.read_timeout, self.write_timeout);
        let renewal = tokio::spawn(
            self.manager
                .clone()
                .run_renewal(self.renewal_interval, stop.clone()),
        );

        info!(
            "Listening for HTTP on {} and HTTPS on {}",
            self.http_addr, self.https_addr
        );
        let http = spawn_listener(
            ListenerKind::Http,
            self.http_listener,
            stop.clone(),
            connections.clone(),
            None,
            Service::Plain(self.plain_routes),
        );
        let https = spawn_listener(
            ListenerKind::Https,
            self.https_listener,
            stop.clone(),
            connections.clone(),
            Some(self.acceptor),
            Service::Secure(self.handler),
        );
        let (http_result, https_result) = tokio::join!(http, https);
        let failure = [
            (ListenerKind::Http, http_result),
            (ListenerKind::Https, https_result),
        ]
        .into_iter()
        .map(|(listener, joined)| {
            joined.unwrap_or_else(|err| {
                Err(ListenerError::Accept {
                    listener,
                    source: std::io::Error::other(err),
                })
            })
        })
        .filter_map(Result::err)
        .find(|err| !err.is_closed());

        info!("Shutting down, waiting up to {:?} for open connections", self.shutdown_grace);
        let drained = connections.drain(self.shutdown_grace).await;
        stop.cancel();
        let _ = renewal.await;

        match failure {
            Some(err) => Err(err.into()),
            None if !drained => Err(Error::ShutdownTimeout(self.shutdown_grace)),
            None => {
                info!("Shutdown complete");
                Ok(())
            }
        }
    }
}

fn spawn_listener(
    kind: ListenerKind,
    listener: Box<dyn Accept>,
    stop: CancellationToken,
    connections: Connections,
    tls: Option<TlsAcceptor>,
    service: Service,
) -> JoinHandle<Result<(), ListenerError>> {
    tokio::spawn(async move {
        let result = accept_loop(kind, listener, stop.clone(), connections, tls, service).await;
        if let Err(err) = &result {
            if !err.is_closed() {
                error!("{kind} listener failed, stopping the server: {err}");
                stop.cancel();
            }
        }
        result
    })
}

/// Binds both listeners and serves until `shutdown` is cancelled.
pub async fn listen_and_serve<H: Handler>(
    http_addr: SocketAddr,
    handler: H,
    config: Config,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    Server::bind(http_addr, handler, config)
        .await?
        .serve(shutdown)
        .await
}
