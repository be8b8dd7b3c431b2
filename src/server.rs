//! HTTP/1 and HTTP/2 on one TLS-terminated stream
//!
//! [`DualProtocolServer`] owns an HTTP/1 server whose accept loop runs
//! against a [`PipeListener`], and an HTTP/2 server that serves connections
//! directly. A terminated connection is dispatched by its negotiated ALPN
//! value:
//!
//! - `h2` / `h2c`: served in place by the HTTP/2 server
//! - none, `http/1.0`, `http/1.1`: injected into the pipe, where the HTTP/1
//!   accept loop picks it up
//! - anything else: closed, [`GatewayError::UnsupportedProtocol`]
//!
//! Closing the server closes the pipe (ending the HTTP/1 accept loop) and
//! every listener registered through [`DualProtocolServer::serve`].

use std::collections::HashMap;
use std::convert::Infallible;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use http::{Request, Response};
use hyper::body::Incoming;
use hyper::server::conn::{http1, http2};
use hyper::service::Service;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};
use crate::listener::{CloseListener, Listener};
use crate::mux::{ResponseBody, ServeMux};
use crate::pipe::PipeListener;

/// First delay after a failed accept; doubled on each consecutive failure.
const LISTENER_RETRY_BASE_DELAY: Duration = Duration::from_millis(5);
const LISTENER_RETRY_MAX_DELAY: Duration = Duration::from_secs(1);

/// A stream whose TLS handshake is complete.
pub trait AlpnStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// The ALPN protocol agreed during the handshake, if any.
    fn negotiated_protocol(&self) -> Option<&[u8]>;
}

impl<IO> AlpnStream for tokio_rustls::server::TlsStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn negotiated_protocol(&self) -> Option<&[u8]> {
        self.get_ref().1.alpn_protocol()
    }
}

impl AlpnStream for Box<dyn AlpnStream> {
    fn negotiated_protocol(&self) -> Option<&[u8]> {
        (**self).negotiated_protocol()
    }
}

pub type TerminatedStream = Box<dyn AlpnStream>;

/// Which server a negotiated ALPN value goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolRoute {
    Http2,
    Http1,
    Unsupported,
}

impl ProtocolRoute {
    pub fn for_alpn(alpn: Option<&[u8]>) -> Self {
        // https://www.iana.org/assignments/tls-extensiontype-values/tls-extensiontype-values.xhtml#alpn-protocol-ids
        match alpn {
            Some(b"h2") | Some(b"h2c") => ProtocolRoute::Http2,
            None | Some(b"") | Some(b"http/1.0") | Some(b"http/1.1") => ProtocolRoute::Http1,
            Some(_) => ProtocolRoute::Unsupported,
        }
    }
}

#[derive(Default)]
struct ListenerRegistry {
    closed: bool,
    next_id: u64,
    listeners: HashMap<u64, Arc<dyn CloseListener>>,
}

/// Hands every request to the shared [`ServeMux`].
#[derive(Clone)]
struct MuxService {
    mux: Arc<ServeMux>,
}

impl Service<Request<Incoming>> for MuxService {
    type Response = Response<ResponseBody>;
    type Error = Infallible;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Infallible>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let mux = self.mux.clone();
        Box::pin(async move { Ok(mux.dispatch(req).await) })
    }
}

/// HTTP/1 + HTTP/2 server fed with already-terminated connections.
pub struct DualProtocolServer {
    mux: Arc<ServeMux>,
    h1: http1::Builder,
    h2: http2::Builder<TokioExecutor>,
    pipe: Arc<PipeListener<TerminatedStream>>,
    registry: Mutex<ListenerRegistry>,
}

impl DualProtocolServer {
    /// Create the server and start the HTTP/1 accept loop on its pipe.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(mux: ServeMux) -> Arc<Self> {
        let mut h1 = http1::Builder::new();
        h1.timer(TokioTimer::new());
        let mut h2 = http2::Builder::new(TokioExecutor::new());
        h2.timer(TokioTimer::new());

        let pipe = Arc::new(PipeListener::new());
        let mut registry = ListenerRegistry::default();
        registry.listeners.insert(registry.next_id, pipe.clone() as Arc<dyn CloseListener>);
        registry.next_id += 1;

        let server = Arc::new(Self {
            mux: Arc::new(mux),
            h1,
            h2,
            pipe,
            registry: Mutex::new(registry),
        });

        let accept_loop = server.clone();
        tokio::spawn(async move { accept_loop.serve_http1().await });

        server
    }

    /// The hyper service both protocol servers run.
    fn service(&self) -> MuxService {
        MuxService {
            mux: self.mux.clone(),
        }
    }

    /// HTTP/1 accept loop over the pipe. Ends when the pipe closes.
    async fn serve_http1(self: Arc<Self>) {
        // PipeListener::accept only ever fails once the pipe is closed.
        while let Ok(conn) = self.pipe.accept().await {
            let connection = self.h1.serve_connection(TokioIo::new(conn), self.service());
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    debug!("HTTP/1 connection error: {}", e);
                }
            });
        }
        debug!("HTTP/1 accept loop stopped");
    }

    async fn serve_http2(&self, conn: TerminatedStream) {
        if let Err(e) = self.h2.serve_connection(TokioIo::new(conn), self.service()).await {
            debug!("HTTP/2 connection error: {}", e);
        }
    }

    /// Serve one connection whose TLS handshake has completed.
    ///
    /// HTTP/2 connections are served to completion before this returns;
    /// HTTP/1 connections return as soon as the HTTP/1 server took them.
    pub async fn serve_terminated_connection(&self, mut conn: TerminatedStream) -> Result<()> {
        let alpn = conn.negotiated_protocol().map(<[u8]>::to_vec);
        match ProtocolRoute::for_alpn(alpn.as_deref()) {
            ProtocolRoute::Http2 => {
                self.serve_http2(conn).await;
                Ok(())
            }
            ProtocolRoute::Http1 => self.pipe.submit(conn).await.map_err(Into::into),
            ProtocolRoute::Unsupported => {
                let _ = conn.shutdown().await;
                Err(GatewayError::UnsupportedProtocol(
                    String::from_utf8_lossy(alpn.as_deref().unwrap_or_default()).into_owned(),
                ))
            }
        }
    }

    /// Track a listener so [`close`](Self::close) shuts it down.
    ///
    /// Returns a handle for [`unregister`](Self::unregister), or
    /// [`GatewayError::ServerClosed`] once the server is closed.
    pub fn register(&self, listener: Arc<dyn CloseListener>) -> Result<u64> {
        let mut registry = self.registry.lock();
        if registry.closed {
            return Err(GatewayError::ServerClosed);
        }
        let id = registry.next_id;
        registry.next_id += 1;
        registry.listeners.insert(id, listener);
        Ok(id)
    }

    pub fn unregister(&self, id: u64) {
        self.registry.lock().listeners.remove(&id);
    }

    pub fn is_closed(&self) -> bool {
        self.registry.lock().closed
    }

    /// Accept connections from `listener` until the server is closed.
    ///
    /// Accept errors are retried with a doubling back-off; each connection
    /// is dispatched on its own task.
    pub async fn serve<L>(self: &Arc<Self>, listener: Arc<L>) -> Result<()>
    where
        L: Listener,
        L::Conn: AlpnStream,
    {
        let id = self.register(listener.clone())?;
        let mut delay = Duration::ZERO;
        loop {
            let conn = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    if self.is_closed() {
                        break;
                    }
                    delay = next_retry_delay(delay);
                    warn!("accept error: {}; retrying in {:?}", e, delay);
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };
            delay = Duration::ZERO;

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve_terminated_connection(Box::new(conn)).await {
                    warn!("failed to serve connection: {}", e);
                }
            });
        }
        self.unregister(id);
        Ok(())
    }

    /// Close the pipe and every registered listener, each exactly once.
    ///
    /// Later calls are no-ops. Returns the first close error; all listeners
    /// are closed regardless of earlier failures.
    pub fn close(&self) -> io::Result<()> {
        let mut registry = self.registry.lock();
        if !registry.closed {
            info!("closing HTTP server");
        }
        registry.closed = true;

        let mut result = Ok(());
        for (_, listener) in registry.listeners.drain() {
            if let Err(e) = listener.close() {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}

fn next_retry_delay(delay: Duration) -> Duration {
    if delay.is_zero() {
        LISTENER_RETRY_BASE_DELAY
    } else {
        (delay * 2).min(LISTENER_RETRY_MAX_DELAY)
    }
}
