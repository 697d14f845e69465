//! Pool of reusable connection handlers with bounded concurrency

use std::fs::File;
use std::io::{self, BufReader};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

use crate::config::{Config, TlsConfig};
use crate::http::HeadersChecker;
use crate::{Result, WharfError};

use super::connection::ConnectionHandler;
use super::handler::RequestHandler;
use super::SHUTDOWN_TIMEOUT_MS;

/// Fixed-capacity pool of connection handlers.
///
/// The listener borrows an idle handler per accepted socket. Handlers are
/// created lazily: `min_connections` at startup, more on demand up to
/// `max_connections`. A periodic sweep destroys idle handlers in excess of
/// the minimum once they have been idle for a full cleanup interval.
pub struct ConnectionHandlerPool {
    config: Arc<Config>,
    request_handler: Arc<dyn RequestHandler>,
    tls: Option<TlsAcceptor>,
    handlers: Mutex<Vec<Arc<ConnectionHandler>>>,
    next_id: AtomicUsize,
    shutting_down: AtomicBool,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionHandlerPool {
    /// Create a pool, pre-starting `min_connections` handlers.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS configuration cannot be loaded.
    pub fn new(
        config: Arc<Config>,
        request_handler: Arc<dyn RequestHandler>,
    ) -> Result<Arc<Self>> {
        let tls = match &config.tls {
            Some(tls_config) => Some(build_tls_acceptor(tls_config)?),
            None => None,
        };

        let pool = Arc::new(Self {
            config,
            request_handler,
            tls,
            handlers: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
            sweep: Mutex::new(None),
        });

        {
            let mut handlers = pool.lock_handlers();
            for _ in 0..pool.config.min_connections {
                let handler = pool.spawn_handler();
                handlers.push(handler);
            }
        }

        let sweep = tokio::spawn({
            let pool = Arc::clone(&pool);
            let interval = Duration::from_millis(pool.config.cleanup_interval);
            async move {
                loop {
                    tokio::time::sleep(interval).await;
                    if pool.shutting_down.load(Ordering::SeqCst) {
                        break;
                    }
                    pool.cleanup(interval);
                }
            }
        });
        *pool.sweep.lock().expect("sweep slot lock poisoned") = Some(sweep);

        debug!(
            "connection pool started with {} of max {} handlers",
            pool.config.min_connections, pool.config.max_connections
        );
        Ok(pool)
    }

    fn lock_handlers(&self) -> std::sync::MutexGuard<'_, Vec<Arc<ConnectionHandler>>> {
        self.handlers.lock().expect("pool handlers lock poisoned")
    }

    fn spawn_handler(&self) -> Arc<ConnectionHandler> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        ConnectionHandler::spawn(
            id,
            Arc::clone(&self.config),
            Arc::clone(&self.request_handler),
            self.tls.clone(),
        )
    }

    /// Lend out an idle handler, marked busy.
    ///
    /// Returns `None` when all handlers are busy and the pool is at
    /// capacity; the caller must reject the connection.
    #[must_use]
    pub fn acquire(&self) -> Option<Arc<ConnectionHandler>> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return None;
        }

        let mut handlers = self.lock_handlers();

        for handler in handlers.iter() {
            if !handler.is_busy() {
                handler.set_busy(true);
                return Some(Arc::clone(handler));
            }
        }

        if handlers.len() < self.config.max_connections {
            let handler = self.spawn_handler();
            handler.set_busy(true);
            handlers.push(Arc::clone(&handler));
            return Some(handler);
        }

        None
    }

    /// Install the headers-checking chain on every pooled handler
    pub fn set_headers_checker(&self, checker: &Arc<HeadersChecker>) {
        for handler in self.lock_handlers().iter() {
            handler.set_headers_checker(Arc::clone(checker));
        }
    }

    /// Number of handlers currently pooled
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.lock_handlers().len()
    }

    /// Number of handlers currently lent out
    #[must_use]
    pub fn busy_count(&self) -> usize {
        self.lock_handlers()
            .iter()
            .filter(|h| h.is_busy())
            .count()
    }

    /// Destroy idle handlers in excess of the minimum that have been idle
    /// for at least `interval`.
    fn cleanup(&self, interval: Duration) {
        let min = self.config.min_connections;
        let mut kept_idle = 0;
        let mut removed = 0;

        self.lock_handlers().retain(|handler| {
            if handler.is_busy() {
                return true;
            }
            kept_idle += 1;
            if kept_idle <= min || handler.idle_since().elapsed() < interval {
                return true;
            }
            handler.shutdown();
            removed += 1;
            false
        });

        if removed > 0 {
            debug!("connection pool cleanup removed {removed} idle handlers");
        }
    }

    /// Stop lending handlers, shut each one down and wait for their tasks.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        if let Some(sweep) = self.sweep.lock().expect("sweep slot lock poisoned").take() {
            sweep.abort();
        }

        let handlers: Vec<_> = self.lock_handlers().drain(..).collect();
        for handler in &handlers {
            handler.shutdown();
        }
        for handler in handlers {
            if let Some(task) = handler.take_task() {
                let _ = timeout(Duration::from_millis(SHUTDOWN_TIMEOUT_MS), task).await;
            }
        }

        info!("connection pool shut down");
    }
}

impl std::fmt::Debug for ConnectionHandlerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandlerPool")
            .field("handlers", &self.handler_count())
            .field("max_connections", &self.config.max_connections)
            .finish()
    }
}

/// Build a TLS acceptor from PEM certificate and key files
fn build_tls_acceptor(tls: &TlsConfig) -> Result<TlsAcceptor> {
    let mut cert_reader = BufReader::new(File::open(&tls.cert_file)?);
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| WharfError::TlsError(format!("cannot read certificates: {e}")))?;

    let mut key_reader = BufReader::new(File::open(&tls.key_file)?);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| WharfError::TlsError(format!("cannot read private key: {e}")))?
        .ok_or_else(|| WharfError::TlsError("no private key found in key file".to_string()))?;

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| WharfError::TlsError(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::handler::DefaultHandler;

    fn test_config(min: usize, max: usize) -> Arc<Config> {
        let mut config = Config::for_port(0);
        config.min_connections = min;
        config.max_connections = max;
        Arc::new(config)
    }

    #[tokio::test]
    async fn test_pool_prestarts_min_handlers() {
        let pool =
            ConnectionHandlerPool::new(test_config(2, 4), Arc::new(DefaultHandler)).unwrap();
        assert_eq!(pool.handler_count(), 2);
        assert_eq!(pool.busy_count(), 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_pool_grows_to_capacity_then_rejects() {
        let pool =
            ConnectionHandlerPool::new(test_config(1, 2), Arc::new(DefaultHandler)).unwrap();

        let first = pool.acquire().unwrap();
        let second = pool.acquire().unwrap();
        assert_eq!(pool.handler_count(), 2);
        assert_eq!(pool.busy_count(), 2);

        assert!(pool.acquire().is_none());

        first.set_busy(false);
        let third = pool.acquire().unwrap();
        assert!(third.is_busy());

        second.set_busy(false);
        third.set_busy(false);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_pool_rejects_while_shutting_down() {
        let pool =
            ConnectionHandlerPool::new(test_config(1, 2), Arc::new(DefaultHandler)).unwrap();
        pool.shutdown().await;
        assert!(pool.acquire().is_none());
    }

    #[tokio::test]
    async fn test_cleanup_reaps_stale_idle_handlers() {
        let pool =
            ConnectionHandlerPool::new(test_config(1, 4), Arc::new(DefaultHandler)).unwrap();

        // Grow to three handlers, then release them all.
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let c = pool.acquire().unwrap();
        for handler in [&a, &b, &c] {
            handler.set_busy(false);
        }
        assert_eq!(pool.handler_count(), 3);

        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.cleanup(Duration::from_millis(10));
        assert_eq!(pool.handler_count(), 1);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_cleanup_keeps_recently_used_handlers() {
        let pool =
            ConnectionHandlerPool::new(test_config(1, 4), Arc::new(DefaultHandler)).unwrap();

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        a.set_busy(false);
        b.set_busy(false);

        // Both were released just now; a long staleness bound keeps them.
        pool.cleanup(Duration::from_secs(60));
        assert_eq!(pool.handler_count(), 2);

        pool.shutdown().await;
    }
}
