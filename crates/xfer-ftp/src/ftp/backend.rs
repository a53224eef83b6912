//! Socket layer under the FTP driver.
//!
//! - [`Stream`] plain TCP or TLS-wrapped TCP behind one `AsyncRead`/`AsyncWrite`
//! - [`connect_tcp`] outbound connect with timeout and the generic proxy handshake
//! - [`copy_limited`] rate-limited copy loop used by the data channel

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use xfer_core::error::{EngineError, EngineResult};
use xfer_core::proxy::{self, ProxyConfig};
use xfer_core::rate_limit::{Direction, RateLimiter};

/// Plain or TLS-wrapped TCP stream.
pub enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Stream {
    pub fn is_tls(&self) -> bool {
        matches!(self, Stream::Tls(_))
    }

    pub fn tcp(&self) -> &TcpStream {
        match self {
            Stream::Plain(s) => s,
            Stream::Tls(s) => s.get_ref().0,
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stream::Plain(_) => f.write_str("Stream::Plain"),
            Stream::Tls(_) => f.write_str("Stream::Tls"),
        }
    }
}

impl AsyncRead for Stream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Connect to `host:port`, through `proxy` when one is configured.
pub async fn connect_tcp(
    host: &str,
    port: u16,
    proxy: &ProxyConfig,
    timeout: Option<Duration>,
) -> EngineResult<TcpStream> {
    let (connect_host, connect_port) = if proxy.is_enabled() {
        (proxy.host.as_str(), proxy.port)
    } else {
        (host, port)
    };
    let addr = if connect_host.contains(':') {
        format!("[{}]:{}", connect_host, connect_port)
    } else {
        format!("{}:{}", connect_host, connect_port)
    };
    let connect = TcpStream::connect(&addr);
    let mut tcp = match timeout {
        Some(dur) => tokio::time::timeout(dur, connect)
            .await
            .map_err(|_| EngineError::timeout(format!("Connection to {} timed out", addr)))?,
        None => connect.await,
    }
    .map_err(|e| EngineError::connection_failed(format!("Could not connect to {}: {}", addr, e)))?;
    tcp.set_nodelay(true).ok();

    if proxy.is_enabled() {
        proxy::handshake(&mut tcp, proxy, host, port).await?;
    }
    Ok(tcp)
}

/// Which side of a copy failed.
#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    #[error("read failed: {0}")]
    Source(io::Error),
    #[error("write failed: {0}")]
    Sink(io::Error),
}

/// Copy `reader` into `writer` until EOF, asking `limiter` for quota before
/// every read. `progress` sees the size of each chunk written.
pub async fn copy_limited<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    limiter: &RateLimiter,
    direction: Direction,
    buffer_size: usize,
    mut progress: F,
) -> Result<u64, CopyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(usize),
{
    let mut buf = vec![0u8; buffer_size.max(1024)];
    let mut total = 0u64;
    loop {
        let allowed = limiter.acquire(direction, buf.len()).await.max(1);
        let n = reader
            .read(&mut buf[..allowed])
            .await
            .map_err(CopyError::Source)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await.map_err(CopyError::Sink)?;
        total += n as u64;
        progress(n);
    }
    writer.flush().await.map_err(CopyError::Sink)?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copy_reports_every_chunk() {
        let data = vec![7u8; 10_000];
        let mut reader = &data[..];
        let mut out = Vec::new();
        let mut seen = 0usize;
        let total = copy_limited(
            &mut reader,
            &mut out,
            &RateLimiter::unlimited(),
            Direction::Inbound,
            4096,
            |n| seen += n,
        )
        .await
        .unwrap();
        assert_eq!(total, 10_000);
        assert_eq!(seen, 10_000);
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn connect_failure_is_categorised() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = connect_tcp("127.0.0.1", port, &ProxyConfig::default(), Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(err.kind, xfer_core::error::ErrorKind::ConnectionFailed);
    }
}
