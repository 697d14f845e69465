//! TCP listener feeding accepted sockets to the handler pool

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::http::HeadersChecker;
use crate::Result;

use super::handler::RequestHandler;
use super::pool::ConnectionHandlerPool;

/// Accepts connections and lends each one to an idle connection handler.
///
/// When the pool is exhausted the connection is answered with a 503 and
/// closed immediately.
pub struct Listener {
    listener: TcpListener,
    pool: Arc<ConnectionHandlerPool>,
    headers_checker: Mutex<Arc<HeadersChecker>>,
    shutdown_tx: broadcast::Sender<()>,
}

/// Handle for stopping a running [`Listener`]
#[derive(Clone, Debug)]
pub struct ShutdownHandle(broadcast::Sender<()>);

impl ShutdownHandle {
    /// Stop the listener and shut its pool down
    pub fn shutdown(&self) {
        let _ = self.0.send(());
    }
}

impl Listener {
    /// Bind the configured endpoint and start the handler pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the address cannot
    /// be bound or the TLS material cannot be loaded.
    pub async fn bind(config: Config, request_handler: Arc<dyn RequestHandler>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let host = if config.host.is_empty() {
            "0.0.0.0"
        } else {
            config.host.as_str()
        };
        let listener = TcpListener::bind((host, config.port)).await?;
        let pool = ConnectionHandlerPool::new(Arc::clone(&config), request_handler)?;
        let (shutdown_tx, _) = broadcast::channel(1);

        info!("Listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            pool,
            headers_checker: Mutex::new(Arc::new(HeadersChecker::new())),
            shutdown_tx,
        })
    }

    /// Address the listener is bound to
    ///
    /// # Errors
    ///
    /// Returns error if the socket is gone
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Install the headers-checking chain handed to handlers on accept
    pub fn set_headers_checker(&self, checker: HeadersChecker) {
        *self
            .headers_checker
            .lock()
            .expect("headers checker lock poisoned") = Arc::new(checker);
    }

    /// Handle for stopping the listener from elsewhere
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown_tx.clone())
    }

    /// The connection pool backing this listener
    #[must_use]
    pub fn pool(&self) -> &ConnectionHandlerPool {
        &self.pool
    }

    /// Accept connections until shut down, then stop the pool.
    ///
    /// # Errors
    ///
    /// Never returns an error from individual accepts; those are logged and
    /// retried.
    pub async fn run(self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => self.dispatch(stream, peer_addr),
                        Err(e) => error!("Accept error: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Listener shutting down");
                    break;
                }
            }
        }

        self.pool.shutdown().await;
        Ok(())
    }

    fn dispatch(&self, stream: TcpStream, peer_addr: SocketAddr) {
        match self.pool.acquire() {
            Some(handler) => {
                debug!("Accepted connection from {}", peer_addr);
                let checker = Arc::clone(
                    &self
                        .headers_checker
                        .lock()
                        .expect("headers checker lock poisoned"),
                );
                handler.set_headers_checker(checker);
                if let Err(e) = handler.adopt(stream) {
                    error!("Cannot hand connection to handler: {}", e);
                    handler.set_busy(false);
                }
            }
            None => {
                warn!("Too many incoming connections, rejecting {}", peer_addr);
                tokio::spawn(reject(stream));
            }
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.listener.local_addr().ok())
            .finish()
    }
}

/// Answer a connection the pool cannot take, then close it.
async fn reject(mut stream: TcpStream) {
    let reply: &[u8] =
        b"HTTP/1.1 503 too many connections\r\nConnection: close\r\n\r\nToo many connections\r\n";
    if stream.write_all(reply).await.is_ok() {
        let _ = stream.flush().await;
    }
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::handler::DefaultHandler;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_bind_and_shutdown() {
        let mut config = Config::for_port(0);
        config.min_connections = 1;
        config.max_connections = 2;

        let listener = Listener::bind(config, Arc::new(DefaultHandler)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let shutdown = listener.shutdown_handle();
        let task = tokio::spawn(listener.run());

        shutdown.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reject_writes_canonical_503() {
        let server = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (stream, _) = server.accept().await.unwrap();

        reject(stream).await;

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(
            reply,
            b"HTTP/1.1 503 too many connections\r\nConnection: close\r\n\r\nToo many connections\r\n"
        );
    }
}
