//! Tunnel forwarding for ECH-accepted connections

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{GatewayError, Result};

/// Connect to the tunnel destination.
pub async fn dial(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| GatewayError::Timeout("upstream dial"))??;
    stream.set_nodelay(true)?;
    debug!("Dialed upstream {}:{}", host, port);
    Ok(stream)
}

/// Copy until `reader` is exhausted, then close `writer`.
async fn pipe<R, W>(mut reader: R, mut writer: W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy(&mut reader, &mut writer).await;
    let _ = writer.shutdown().await;
    copied
}

/// Relay bytes both ways until both directions are done.
///
/// Each direction half-closes its destination when its source ends.
/// Returns the byte counts (client to upstream, upstream to client).
pub async fn relay<C, U>(client: C, upstream: U) -> std::io::Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    tokio::try_join!(
        pipe(client_read, upstream_write),
        pipe(upstream_read, client_write)
    )
}
