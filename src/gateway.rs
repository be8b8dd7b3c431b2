//! ECH-terminating gateway
//!
//! Each accepted connection goes through ECH negotiation first, then one of:
//! 1. ECH accepted: tunnel to the revealed server name
//! 2. ECH not accepted, SNI is the public name: terminate TLS and serve
//!    HTTP through the [`DualProtocolServer`]
//! 3. Anything else: drop the connection

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::ech::{EchAcceptor, EchKeys};
use crate::error::{GatewayError, Result};
use crate::server::DualProtocolServer;
use crate::tunnel;
use crate::GatewayConfig;

/// Where a negotiated connection goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingDecision {
    Tunnel(String),
    Terminate,
    Reject,
}

impl RoutingDecision {
    pub fn decide(ech_accepted: bool, server_name: Option<&str>, public_name: &str) -> Self {
        match (ech_accepted, server_name) {
            (true, Some(name)) => RoutingDecision::Tunnel(name.to_string()),
            (false, Some(name)) if name.eq_ignore_ascii_case(public_name) => {
                RoutingDecision::Terminate
            }
            _ => RoutingDecision::Reject,
        }
    }
}

/// Per-connection state shared by every connection task.
#[derive(Clone)]
struct ConnectionRouter {
    public_name: Arc<str>,
    ech_acceptor: EchAcceptor,
    tls_acceptor: TlsAcceptor,
    server: Arc<DualProtocolServer>,
    negotiation_timeout: Duration,
    upstream_port: u16,
    dial_timeout: Duration,
}

impl ConnectionRouter {
    async fn handle(self, stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        let negotiated = tokio::time::timeout(
            self.negotiation_timeout,
            self.ech_acceptor.accept(stream),
        )
        .await
        .map_err(|_| GatewayError::Timeout("ECH negotiation"))??;

        let decision = RoutingDecision::decide(
            negotiated.ech_accepted(),
            negotiated.server_name(),
            &self.public_name,
        );

        match decision {
            RoutingDecision::Tunnel(host) => {
                info!(
                    "Tunneling {} to {}:{}",
                    peer_addr, host, self.upstream_port
                );
                let upstream = tunnel::dial(&host, self.upstream_port, self.dial_timeout).await?;
                match tunnel::relay(negotiated, upstream).await {
                    Ok((sent, received)) => debug!(
                        "Tunnel closed: {}:{} (sent: {}, received: {})",
                        host, self.upstream_port, sent, received
                    ),
                    Err(e) => debug!("Tunnel error: {}:{} - {}", host, self.upstream_port, e),
                }
                Ok(())
            }
            RoutingDecision::Terminate => {
                let tls = self.tls_acceptor.accept(negotiated).await?;
                debug!("TLS terminated for {}", peer_addr);
                self.server.serve_terminated_connection(Box::new(tls)).await
            }
            RoutingDecision::Reject => {
                debug!(
                    "Rejecting {}: server name {:?} is not {}",
                    peer_addr,
                    negotiated.server_name(),
                    self.public_name
                );
                Ok(())
            }
        }
    }
}

/// Accept loop of the gateway.
pub struct EchGateway {
    bind_addr: String,
    router: ConnectionRouter,
    local_addr: Arc<RwLock<Option<SocketAddr>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl EchGateway {
    pub fn new(
        config: &GatewayConfig,
        keys: Arc<EchKeys>,
        tls_config: Arc<ServerConfig>,
        server: Arc<DualProtocolServer>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let router = ConnectionRouter {
            public_name: Arc::from(config.public_name.as_str()),
            ech_acceptor: EchAcceptor::new(keys),
            tls_acceptor: TlsAcceptor::from(tls_config),
            server,
            negotiation_timeout: config.negotiation_timeout(),
            upstream_port: config.upstream_port,
            dial_timeout: config.dial_timeout(),
        };

        Self {
            bind_addr: config.bind_address(),
            router,
            local_addr: Arc::new(RwLock::new(None)),
            shutdown_tx,
        }
    }

    /// Get the local address the gateway is bound to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    /// Get the local port
    pub fn port(&self) -> Option<u16> {
        self.local_addr().map(|a| a.port())
    }

    /// Bind and accept connections until [`stop`](Self::stop).
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.write() = Some(local_addr);

        info!("Accepting connections on {}", local_addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!("New connection from {}", peer_addr);
                            let router = self.router.clone();
                            tokio::spawn(async move {
                                if let Err(e) = router.handle(stream, peer_addr).await {
                                    warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutting down gateway");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Stop the accept loop
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
