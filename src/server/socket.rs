//! Socket abstraction over plain TCP and TLS

use std::io;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use super::{
    KEEPALIVE_IDLE_SECS, KEEPALIVE_INTERVAL_SECS, KEEPALIVE_PROBES, WRITE_HIGH_WATER,
};

trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// Byte-oriented duplex channel over an accepted connection.
///
/// Unifies plain TCP and TLS streams and adds a write buffer: writes
/// accumulate until the pending byte count crosses the high-water mark,
/// at which point the writing task blocks until the buffer has drained.
pub struct Socket {
    stream: Box<dyn Stream>,
    write_buf: Vec<u8>,
}

impl Socket {
    /// Adopt an accepted TCP stream, tuning keep-alive and performing the
    /// server-side TLS handshake when an acceptor is configured.
    pub(crate) async fn adopt(stream: TcpStream, tls: Option<&TlsAcceptor>) -> io::Result<Self> {
        configure_keepalive(
            &stream,
            Duration::from_secs(KEEPALIVE_IDLE_SECS),
            Duration::from_secs(KEEPALIVE_INTERVAL_SECS),
            KEEPALIVE_PROBES,
        );

        let stream: Box<dyn Stream> = match tls {
            Some(acceptor) => {
                debug!("starting TLS handshake");
                Box::new(acceptor.accept(stream).await?)
            }
            None => Box::new(stream),
        };

        Ok(Self {
            stream,
            write_buf: Vec::new(),
        })
    }

    #[cfg(test)]
    pub(crate) fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            stream: Box::new(stream),
            write_buf: Vec::new(),
        }
    }

    /// Read available bytes into `buf`; 0 means the peer closed.
    pub(crate) async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf).await
    }

    /// Queue bytes for writing. Blocks until drained once more than the
    /// high-water mark is pending.
    pub(crate) async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.write_buf.extend_from_slice(data);
        if self.write_buf.len() > WRITE_HIGH_WATER {
            self.flush().await?;
        }
        Ok(())
    }

    /// Number of queued bytes not yet handed to the OS
    #[must_use]
    pub(crate) fn bytes_pending_write(&self) -> usize {
        self.write_buf.len()
    }

    /// Write out all queued bytes and flush the stream.
    pub(crate) async fn flush(&mut self) -> io::Result<()> {
        if !self.write_buf.is_empty() {
            let buf = std::mem::take(&mut self.write_buf);
            self.stream.write_all(&buf).await?;
        }
        self.stream.flush().await
    }

    /// Flush pending bytes, send FIN and close the socket.
    pub(crate) async fn shutdown_write_and_close(mut self) -> io::Result<()> {
        self.flush().await?;
        self.stream.shutdown().await
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("bytes_pending_write", &self.write_buf.len())
            .finish()
    }
}

/// Apply TCP keep-alive parameters to an accepted socket.
///
/// Failures are logged and ignored; a connection without keep-alive probes
/// still works, it just detects dead peers later.
pub fn configure_keepalive(
    stream: &TcpStream,
    idle: Duration,
    interval: Duration,
    probes: u32,
) {
    #[allow(unused_mut)]
    let mut keepalive = TcpKeepalive::new().with_time(idle);
    #[cfg(not(any(target_os = "openbsd", target_os = "redox", target_os = "solaris")))]
    {
        keepalive = keepalive.with_interval(interval);
    }
    #[cfg(not(any(
        target_os = "openbsd",
        target_os = "redox",
        target_os = "solaris",
        target_os = "windows"
    )))]
    {
        keepalive = keepalive.with_retries(probes);
    }
    #[cfg(any(target_os = "openbsd", target_os = "redox", target_os = "solaris"))]
    let _ = interval;
    #[cfg(any(
        target_os = "openbsd",
        target_os = "redox",
        target_os = "solaris",
        target_os = "windows"
    ))]
    let _ = probes;

    let sock = SockRef::from(stream);
    if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
        warn!("failed to set TCP keep-alive: {e}");
    }
}
