//! Request handler contract and completion plumbing

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::debug;

use crate::http::{Request, Response};

/// Cancellation capability registered by a request handler.
///
/// Invoked by the connection when the peer disconnects or the server shuts
/// down while the handler is still working. Handlers are expected to observe
/// cancellation cooperatively and complete promptly afterwards.
pub trait Cancel: Send + Sync {
    /// Request the in-flight work to stop
    fn cancel(&self);
}

/// Slot holding the cancellation capability of the in-flight request.
///
/// Written by the handler task and read by the disconnect event, hence the
/// mutex. Taking the value out guarantees `cancel` runs at most once.
#[derive(Clone, Default)]
pub struct CancellerSlot {
    inner: Arc<Mutex<Option<Arc<dyn Cancel>>>>,
}

impl CancellerSlot {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn set(&self, canceller: Arc<dyn Cancel>) {
        *self.inner.lock().expect("canceller slot lock poisoned") = Some(canceller);
    }

    /// Invoke and discard the registered canceller, if any
    pub(crate) fn cancel(&self) {
        let canceller = self
            .inner
            .lock()
            .expect("canceller slot lock poisoned")
            .take();
        if let Some(canceller) = canceller {
            debug!("cancelling in-flight request handler");
            canceller.cancel();
        }
    }
}

impl std::fmt::Debug for CancellerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellerSlot").finish()
    }
}

/// Completion event sent back to the connection when a handler is done
pub struct Completion {
    pub(crate) request_id: u64,
    pub(crate) response: Response,
    pub(crate) close_connection: bool,
    pub(crate) finalizer: Option<Box<dyn FnOnce() + Send>>,
    pub(crate) needs_flush: bool,
}

/// Everything a request handler receives for one request
pub struct ServiceParams {
    /// Identifier of this request on its connection; completions carrying a
    /// stale ID are discarded
    pub request_id: u64,
    /// The parsed, immutable request
    pub request: Arc<Request>,
    /// Response handle; writes are serialized onto the connection's task
    pub response: Response,
    /// Whether the connection already decided to close after this response
    pub close_connection: bool,
    canceller: CancellerSlot,
    completion_tx: mpsc::Sender<Completion>,
}

impl ServiceParams {
    pub(crate) fn new(
        request_id: u64,
        request: Arc<Request>,
        response: Response,
        close_connection: bool,
        canceller: CancellerSlot,
        completion_tx: mpsc::Sender<Completion>,
    ) -> Self {
        Self {
            request_id,
            request,
            response,
            close_connection,
            canceller,
            completion_tx,
        }
    }

    /// Register a cancellation capability for this request.
    ///
    /// The connection invokes it when the peer disconnects before the
    /// handler completes.
    pub fn register_canceller(&self, canceller: Arc<dyn Cancel>) {
        self.canceller.set(canceller);
    }

    /// Report completion to the connection.
    ///
    /// Must be called exactly once when the handler has finished with the
    /// response; the connection finalizes the framing and decides between
    /// keep-alive and close. Late completions after a disconnect are
    /// silently dropped.
    pub async fn finish(self) {
        self.finish_with(None).await;
    }

    /// Report completion and run `finalizer` on the connection's task after
    /// the response framing has been finalized.
    pub async fn finish_with(self, finalizer: Option<Box<dyn FnOnce() + Send>>) {
        let completion = Completion {
            request_id: self.request_id,
            response: self.response.clone(),
            close_connection: self.close_connection,
            finalizer,
            needs_flush: !self.response.has_sent_last_part(),
        };
        if self.completion_tx.send(completion).await.is_err() {
            debug!(
                "request {} completed after its connection closed",
                self.request_id
            );
        }
    }
}

impl std::fmt::Debug for ServiceParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceParams")
            .field("request_id", &self.request_id)
            .field("close_connection", &self.close_connection)
            .finish()
    }
}

/// Application-provided request handler.
///
/// `service` is invoked on the connection's task and must not block: do the
/// work wherever convenient (usually a spawned task), write the response
/// through `params.response`, then call `params.finish()`. One handler
/// instance serves all connections concurrently.
pub trait RequestHandler: Send + Sync + 'static {
    /// Generate a response for an incoming request
    fn service(&self, params: ServiceParams);
}

/// Fallback handler answering every request with `501 not implemented`
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHandler;

impl RequestHandler for DefaultHandler {
    fn service(&self, params: ServiceParams) {
        tokio::spawn(async move {
            params.response.set_status(501, "not implemented");
            if let Err(e) = params.response.write(b"501 not implemented", true).await {
                debug!("failed to write 501 response: {e}");
            }
            params.finish().await;
        });
    }
}
