use crate::error::{ListenerError, ListenerKind};
use crate::server::http::{Body, Handler, PlainRoutes};
use crate::tls::TlsAcceptor;
use async_trait::async_trait;
use http::{Request, Response};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
#[error("response was not ready within {0:?}")]
struct WriteTimeout(Duration);

#[derive(Clone)]
pub(crate) enum Service {
    Plain(Arc<PlainRoutes>),
    Secure(Arc<dyn Handler>),
}

impl Service {
    async fn call(&self, request: Request<Incoming>) -> Response<Body> {
        match self {
            Service::Plain(routes) => routes.handle(request).await,
            Service::Secure(handler) => handler.handle(request).await,
        }
    }
}

/// Live connections of both listeners. `graceful` asks them to finish their in-flight
/// request, `force` drops whatever is still open.
#[derive(Clone)]
pub(crate) struct Connections {
    pub tracker: TaskTracker,
    pub graceful: CancellationToken,
    pub force: CancellationToken,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl Connections {
    pub fn new(read_timeout: Duration, write_timeout: Duration) -> Self {
        Self {
            tracker: TaskTracker::new(),
            graceful: CancellationToken::new(),
            force: CancellationToken::new(),
            read_timeout,
            write_timeout,
        }
    }

    pub async fn drain(&self, grace: Duration) -> bool {
        self.graceful.cancel();
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_ok() {
            return true;
        }
        warn!(
            "{} connection(s) still open after {grace:?}, closing them",
            self.tracker.len()
        );
        self.force.cancel();
        self.tracker.wait().await;
        false
    }
}

#[async_trait]
pub(crate) trait Accept: Send {
    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)>;
}

#[async_trait]
impl Accept for TcpListener {
    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(&*self).await
    }
}

// Errors of a single pending connection or a temporary resource shortage
fn is_transient_accept_error(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) {
        return true;
    }
    // EMFILE, ENFILE, ENOBUFS, ENOMEM: wait for resources to be freed
    matches!(err.raw_os_error(), Some(23 | 24 | 105 | 12))
}

pub(crate) async fn accept_loop(
    kind: ListenerKind,
    mut listener: Box<dyn Accept>,
    stop: CancellationToken,
    connections: Connections,
    tls: Option<TlsAcceptor>,
    service: Service,
) -> Result<(), ListenerError> {
    let mut backoff = ACCEPT_BACKOFF_MIN;
    loop {
        let (stream, remote_addr) = tokio::select! {
            biased;
            () = stop.cancelled() => {
                debug!("{kind} listener stopped accepting connections");
                return Err(ListenerError::Closed { listener: kind });
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => {
                    backoff = ACCEPT_BACKOFF_MIN;
                    accepted
                }
                Err(err) if is_transient_accept_error(&err) => {
                    warn!("{kind} listener: accepting connection failed, retrying in {backoff:?}: {err}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                    continue;
                }
                Err(source) => {
                    error!("{kind} listener failed: {source}");
                    return Err(ListenerError::Accept { listener: kind, source });
                }
            }
        };

        let connections_for_task = connections.clone();
        let tls = tls.clone();
        let service = service.clone();
        connections.tracker.spawn(async move {
            handle_connection(stream, remote_addr, tls, service, connections_for_task).await;
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    service: Service,
    connections: Connections,
) {
    let Some(acceptor) = tls else {
        serve_connection(stream, remote_addr, service, &connections).await;
        return;
    };
    let handshake = tokio::select! {
        handshake = acceptor.accept(stream) => handshake,
        // Connections that are still handshaking have no request to finish
        () = connections.graceful.cancelled() => return,
    };
    match handshake {
        Ok(stream) => serve_connection(stream, remote_addr, service, &connections).await,
        Err(err) => debug!("TLS handshake with {remote_addr} failed: {err:#}"),
    }
}

async fn serve_connection<I>(io: I, remote_addr: SocketAddr, service: Service, connections: &Connections)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let write_timeout = connections.write_timeout;
    let service = service_fn(move |request| {
        let service = service.clone();
        async move {
            tokio::time::timeout(write_timeout, service.call(request))
                .await
                .map_err(|_| WriteTimeout(write_timeout))
        }
    });

    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(connections.read_timeout);
    builder.http2().timer(TokioTimer::new());
    let connection = builder.serve_connection(TokioIo::new(io), service);
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        () = connections.graceful.cancelled() => {
            connection.as_mut().graceful_shutdown();
            tokio::select! {
                result = connection.as_mut() => result,
                () = connections.force.cancelled() => {
                    debug!("Closing connection from {remote_addr} after the grace period");
                    return;
                }
            }
        }
    };
    if let Err(err) = result {
        debug!("Connection from {remote_addr} ended with an error: {err}");
    }
}
