//! Connection handler: the per-connection state machine
//!
//! Each handler owns a long-lived task. Adopting a socket moves it onto
//! that task, which then serializes every read and write while requests
//! flow through parse → dispatch → respond cycles. Handlers running on
//! other tasks reach the socket only through message passing.

use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::http::{HeadersChecker, HttpError, ParseStatus, RequestParser, Response};
use crate::{Result, WharfError};

use super::handler::{CancellerSlot, Completion, RequestHandler, ServiceParams};
use super::socket::Socket;
use super::SHUTDOWN_TIMEOUT_MS;

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// No socket adopted
    Idle,
    /// Reading and parsing request bytes
    Reading,
    /// A request handler is working on the current request
    AwaitingHandler,
    /// Finalizing the response
    Writing,
    /// Flushing pending bytes before close
    Draining,
    /// Terminal; no further I/O
    Closed,
}

/// Write job marshalled onto the connection's task
pub(crate) struct SocketJob {
    pub(crate) request_id: u64,
    pub(crate) bytes: Vec<u8>,
    pub(crate) flush: bool,
    pub(crate) done: oneshot::Sender<io::Result<()>>,
}

/// Handle through which a [`Response`] reaches its connection's socket.
///
/// Submitting enqueues the bytes onto the owning task and blocks the caller
/// until they have been written (or the write failed), so socket access
/// stays serialized no matter where the handler runs. A gate left over from
/// an earlier request on the same connection is refused.
#[derive(Clone, Debug)]
pub struct SocketGate {
    request_id: u64,
    tx: mpsc::Sender<SocketJob>,
}

impl SocketGate {
    pub(crate) async fn submit(&self, bytes: Vec<u8>, flush: bool) -> io::Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(SocketJob {
                request_id: self.request_id,
                bytes,
                flush,
                done: done_tx,
            })
            .await
            .map_err(|_| closed_error())?;
        done_rx.await.map_err(|_| closed_error())?
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "connection closed")
}

#[cfg(test)]
pub(crate) fn test_gate() -> (SocketGate, mpsc::Receiver<SocketJob>) {
    let (tx, rx) = mpsc::channel(8);
    (SocketGate { request_id: 1, tx }, rx)
}

impl std::fmt::Debug for SocketJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketJob")
            .field("request_id", &self.request_id)
            .field("bytes", &self.bytes.len())
            .field("flush", &self.flush)
            .finish()
    }
}

/// Connection handler owning one socket at a time.
///
/// Handlers are pooled: after a connection closes the handler returns to
/// idle and can adopt the next accepted socket.
pub struct ConnectionHandler {
    id: usize,
    config: Arc<Config>,
    request_handler: Arc<dyn RequestHandler>,
    tls: Option<TlsAcceptor>,
    busy: AtomicBool,
    state: Mutex<ConnState>,
    last_release: Mutex<Instant>,
    headers_checker: Mutex<Arc<HeadersChecker>>,
    adopt_tx: mpsc::Sender<TcpStream>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionHandler {
    /// Create a handler and start its task
    pub(crate) fn spawn(
        id: usize,
        config: Arc<Config>,
        request_handler: Arc<dyn RequestHandler>,
        tls: Option<TlsAcceptor>,
    ) -> Arc<Self> {
        let (adopt_tx, adopt_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handler = Arc::new(Self {
            id,
            config,
            request_handler,
            tls,
            busy: AtomicBool::new(false),
            state: Mutex::new(ConnState::Idle),
            last_release: Mutex::new(Instant::now()),
            headers_checker: Mutex::new(Arc::new(HeadersChecker::new())),
            adopt_tx,
            shutdown_tx,
            task: Mutex::new(None),
        });

        let task = tokio::spawn({
            let handler = Arc::clone(&handler);
            async move { handler.run(adopt_rx, shutdown_rx).await }
        });
        *handler.task.lock().expect("task slot lock poisoned") = Some(task);

        debug!("connection handler {id}: started");
        handler
    }

    /// Whether this handler currently owns a connection
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Mark the handler as lent out (pool coordination)
    pub(crate) fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ConnState {
        *self.state.lock().expect("state lock poisoned")
    }

    fn set_state(&self, state: ConnState) {
        let mut current = self.state.lock().expect("state lock poisoned");
        if *current != state {
            debug!("connection handler {}: {:?} -> {:?}", self.id, *current, state);
            *current = state;
        }
    }

    /// Instant at which the handler last released a connection
    pub(crate) fn idle_since(&self) -> Instant {
        *self
            .last_release
            .lock()
            .expect("last_release lock poisoned")
    }

    /// Install the headers-checking chain used for requests parsed from
    /// the next adopted connection onwards
    pub fn set_headers_checker(&self, checker: Arc<HeadersChecker>) {
        *self
            .headers_checker
            .lock()
            .expect("headers checker lock poisoned") = checker;
    }

    /// Hand an accepted socket to this handler's task.
    ///
    /// # Errors
    ///
    /// Returns an error if the handler already has a connection queued.
    pub(crate) fn adopt(&self, stream: TcpStream) -> Result<()> {
        self.adopt_tx
            .try_send(stream)
            .map_err(|_| WharfError::Other(format!("connection handler {} is busy", self.id)))
    }

    /// Ask the handler's task to stop once the current connection finishes
    pub(crate) fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Take the handler's task handle, for joining during pool shutdown
    pub(crate) fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task.lock().expect("task slot lock poisoned").take()
    }

    async fn run(
        self: Arc<Self>,
        mut adopt_rx: mpsc::Receiver<TcpStream>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                stream = adopt_rx.recv() => match stream {
                    Some(stream) => {
                        self.handle_connection(stream, &mut shutdown_rx).await;
                        self.set_state(ConnState::Idle);
                        *self
                            .last_release
                            .lock()
                            .expect("last_release lock poisoned") = Instant::now();
                        self.busy.store(false, Ordering::SeqCst);
                        // A shutdown observed mid-connection was consumed by
                        // the connection loop; re-check the flag itself.
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = shutdown_rx.changed() => break,
            }
        }
        debug!("connection handler {}: stopped", self.id);
    }

    /// Drive one connection from adoption to close.
    async fn handle_connection(
        &self,
        stream: TcpStream,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let mut socket = match Socket::adopt(stream, self.tls.as_ref()).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("connection handler {}: cannot initialize socket: {e}", self.id);
                return;
            }
        };

        let read_timeout = Duration::from_millis(self.config.read_timeout);
        let (job_tx, mut job_rx) = mpsc::channel::<SocketJob>(8);
        let mut pending: Vec<u8> = Vec::new();
        let mut chunk = vec![0u8; 8192];
        let mut request_id: u64 = 0;

        loop {
            // ---- Reading ----
            self.set_state(ConnState::Reading);
            let checker = Arc::clone(
                &self
                    .headers_checker
                    .lock()
                    .expect("headers checker lock poisoned"),
            );
            let mut parser = RequestParser::new(
                self.config.max_request_size,
                self.config.max_multipart_size,
                checker,
            );
            let mut deadline = Instant::now() + read_timeout;

            loop {
                if !pending.is_empty() {
                    let before = parser.status();
                    let consumed = parser.feed(&pending);
                    pending.drain(..consumed);
                    if parser.status() == ParseStatus::WaitForBody
                        && before != ParseStatus::WaitForBody
                    {
                        // A body upload is in progress; give it a fresh
                        // timeout window so large uploads survive.
                        deadline = Instant::now() + read_timeout;
                    }
                }

                match parser.status() {
                    ParseStatus::Complete | ParseStatus::Abort | ParseStatus::WrongHeaders => {
                        break;
                    }
                    _ => {}
                }

                tokio::select! {
                    read = socket.read(&mut chunk) => match read {
                        Ok(0) => {
                            debug!("connection handler {}: peer disconnected", self.id);
                            self.set_state(ConnState::Closed);
                            return;
                        }
                        Ok(n) => {
                            pending.extend_from_slice(&chunk[..n]);
                            deadline = Instant::now() + read_timeout;
                        }
                        Err(e) => {
                            debug!("connection handler {}: read error: {e}", self.id);
                            self.set_state(ConnState::Closed);
                            return;
                        }
                    },
                    () = sleep_until(deadline) => {
                        debug!("connection handler {}: read timeout occurred", self.id);
                        // No 408 body; some clients cannot handle one.
                        self.drain_and_close(socket).await;
                        return;
                    }
                    _ = shutdown.changed() => {
                        debug!("connection handler {}: shutdown requested", self.id);
                        self.drain_and_close(socket).await;
                        return;
                    }
                }
            }

            match parser.status() {
                ParseStatus::WrongHeaders => {
                    let error = parser
                        .http_error()
                        .cloned()
                        .unwrap_or_else(|| HttpError::new(400, "bad request"));
                    let reply = format!(
                        "HTTP/1.1 {}\r\nConnection: close\r\n\r\n{}\r\n",
                        error.status_code, error.text
                    );
                    let _ = socket.write(reply.as_bytes()).await;
                    self.drain_and_close(socket).await;
                    return;
                }
                ParseStatus::Abort => {
                    let _ = socket
                        .write(
                            b"HTTP/1.1 413 entity too large\r\nConnection: close\r\n\r\n\
                              413 Entity too large\r\n",
                        )
                        .await;
                    self.drain_and_close(socket).await;
                    return;
                }
                _ => {}
            }

            // ---- Dispatch ----
            let request = Arc::new(parser.take_request());
            debug!(
                "connection handler {}: received request {} {}",
                self.id,
                request.method(),
                request.path()
            );

            let mut close_connection = request.headers().value_is("connection", "close")
                || request.version().eq_ignore_ascii_case("HTTP/1.0");

            request_id += 1;
            let gate = SocketGate {
                request_id,
                tx: job_tx.clone(),
            };
            let response = Response::new(gate);
            if close_connection {
                // The handler sees the decision, and the response writer
                // keeps chunked framing off an HTTP/1.0 wire.
                response.set_header("Connection", "close");
            }

            let canceller = CancellerSlot::new();
            let (completion_tx, mut completion_rx) = mpsc::channel::<Completion>(1);
            let params = ServiceParams::new(
                request_id,
                Arc::clone(&request),
                response.clone(),
                close_connection,
                canceller.clone(),
                completion_tx,
            );

            self.set_state(ConnState::AwaitingHandler);
            let dispatched =
                catch_unwind(AssertUnwindSafe(|| self.request_handler.service(params)));
            if dispatched.is_err() {
                error!(
                    "connection handler {}: request handler panicked during dispatch",
                    self.id
                );
            }

            // ---- AwaitingHandler ----
            let mut handler_deadline: Option<Instant> = None;
            let completion = loop {
                tokio::select! {
                    Some(job) = job_rx.recv() => {
                        if !self.execute_job(&mut socket, job, request_id).await {
                            canceller.cancel();
                            self.set_state(ConnState::Closed);
                            return;
                        }
                    }
                    completion = completion_rx.recv() => match completion {
                        Some(c) if c.request_id == request_id => break Some(c),
                        Some(c) => debug!(
                            "connection handler {}: discarding completion for stale request {}",
                            self.id, c.request_id
                        ),
                        None => break None,
                    },
                    read = socket.read(&mut chunk) => match read {
                        Ok(0) => {
                            debug!(
                                "connection handler {}: peer disconnected, request {} in flight",
                                self.id, request_id
                            );
                            canceller.cancel();
                            self.set_state(ConnState::Closed);
                            return;
                        }
                        Ok(n) => pending.extend_from_slice(&chunk[..n]),
                        Err(e) => {
                            debug!("connection handler {}: read error: {e}", self.id);
                            canceller.cancel();
                            self.set_state(ConnState::Closed);
                            return;
                        }
                    },
                    _ = shutdown.changed(), if handler_deadline.is_none() => {
                        debug!("connection handler {}: shutdown requested", self.id);
                        canceller.cancel();
                        close_connection = true;
                        handler_deadline =
                            Some(Instant::now() + Duration::from_millis(SHUTDOWN_TIMEOUT_MS));
                    }
                    () = sleep_until(handler_deadline.unwrap_or_else(Instant::now)),
                        if handler_deadline.is_some() =>
                    {
                        warn!(
                            "connection handler {}: handler did not complete after cancellation",
                            self.id
                        );
                        break None;
                    }
                }
            };

            // ---- Writing ----
            self.set_state(ConnState::Writing);
            let Some(completion) = completion else {
                // The handler dropped its side without completing (failure or
                // panic in its own task). Flush whatever framing is owed on
                // our copy of the response, then close.
                error!(
                    "connection handler {}: request handler failed to complete request {}",
                    self.id, request_id
                );
                if !response.has_sent_last_part() {
                    let (bytes, _) = response.encode_write(b"", true);
                    let _ = socket.write(&bytes).await;
                }
                self.drain_and_close(socket).await;
                return;
            };

            if !completion.response.has_sent_last_part() {
                let (bytes, _) = completion.response.encode_write(b"", true);
                if socket.write(&bytes).await.is_err() {
                    self.set_state(ConnState::Closed);
                    return;
                }
            }
            if let Some(finalizer) = completion.finalizer {
                finalizer();
            }
            if (completion.needs_flush || socket.bytes_pending_write() > 0)
                && socket.flush().await.is_err()
            {
                self.set_state(ConnState::Closed);
                return;
            }
            debug!(
                "connection handler {}: finished request {}",
                self.id, request_id
            );

            close_connection = close_connection || completion.close_connection;
            if !close_connection {
                // The handler may have added Connection: close meanwhile, or
                // produced a response only a close can terminate.
                close_connection = completion.response.requires_close();
            }

            if close_connection {
                self.drain_and_close(socket).await;
                return;
            }
            // Keep-alive: loop around. Pipelined bytes already sitting in
            // `pending` are parsed before the socket is polled again.
        }
    }

    /// Write a marshalled job to the socket. Returns false if the socket
    /// failed and the connection must be abandoned.
    async fn execute_job(&self, socket: &mut Socket, job: SocketJob, current: u64) -> bool {
        if job.request_id != current {
            debug!(
                "connection handler {}: refusing write for stale request {}",
                self.id, job.request_id
            );
            let _ = job.done.send(Err(closed_error()));
            return true;
        }

        let mut result = socket.write(&job.bytes).await;
        if result.is_ok() && job.flush {
            result = socket.flush().await;
        }
        let ok = result.is_ok();
        if let Err(e) = &result {
            debug!("connection handler {}: socket write failed: {e}", self.id);
        }
        let _ = job.done.send(result);
        ok
    }

    /// Flush pending bytes, send FIN and close, bounded by the shutdown
    /// timeout.
    async fn drain_and_close(&self, socket: Socket) {
        self.set_state(ConnState::Draining);
        match timeout(
            Duration::from_millis(SHUTDOWN_TIMEOUT_MS),
            socket.shutdown_write_and_close(),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("connection handler {}: close error: {e}", self.id),
            Err(_) => debug!("connection handler {}: drain timed out", self.id),
        }
        self.set_state(ConnState::Closed);
    }
}

impl std::fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("id", &self.id)
            .field("busy", &self.is_busy())
            .field("state", &self.state())
            .finish()
    }
}
