//! Listener capabilities and the TLS-terminating TCP listener

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error};

/// Anything the dual-protocol server can shut down.
pub trait CloseListener: Send + Sync {
    fn close(&self) -> io::Result<()>;
}

/// A source of connections with its own accept loop.
pub trait Listener: CloseListener + 'static {
    type Conn: Send + 'static;

    fn accept(&self) -> impl Future<Output = io::Result<Self::Conn>> + Send;
}

/// Resolves once the flag behind `rx` turns true (or its sender is gone).
pub(crate) async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

/// Upper bound for one client's TLS handshake on a [`TlsListener`].
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Queue depth between the handshake tasks and `accept`.
const READY_QUEUE: usize = 64;

/// TCP listener that hands out connections only after their TLS handshake.
///
/// Handshakes run in their own tasks so one slow client never stalls the
/// accept loop.
pub struct TlsListener {
    ready: Mutex<mpsc::Receiver<TlsStream<TcpStream>>>,
    acceptor_task: JoinHandle<()>,
    local_addr: SocketAddr,
    closed: watch::Sender<bool>,
}

impl TlsListener {
    pub async fn bind(addr: impl ToSocketAddrs, acceptor: TlsAcceptor) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(READY_QUEUE);

        let acceptor_task = tokio::spawn(async move {
            loop {
                let (stream, peer_addr) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("TLS listener accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                        Ok(Ok(tls)) => {
                            let _ = tx.send(tls).await;
                        }
                        Ok(Err(e)) => debug!("TLS handshake with {} failed: {}", peer_addr, e),
                        Err(_) => debug!("TLS handshake with {} timed out", peer_addr),
                    }
                });
            }
        });

        Ok(Self {
            ready: Mutex::new(rx),
            acceptor_task,
            local_addr,
            closed: watch::channel(false).0,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

fn listener_closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "listener closed")
}

impl CloseListener for TlsListener {
    fn close(&self) -> io::Result<()> {
        if !self.closed.send_replace(true) {
            // Dropping the task drops the socket and the queue's sender.
            self.acceptor_task.abort();
        }
        Ok(())
    }
}

impl Listener for TlsListener {
    type Conn = TlsStream<TcpStream>;

    async fn accept(&self) -> io::Result<Self::Conn> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(listener_closed());
        }
        let mut ready = self.ready.lock().await;
        tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => Err(listener_closed()),
            conn = ready.recv() => conn.ok_or_else(listener_closed),
        }
    }
}

impl Drop for TlsListener {
    fn drop(&mut self) {
        self.acceptor_task.abort();
    }
}
