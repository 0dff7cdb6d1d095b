//! The request engine contract and the event surface engines report through.
//!
//! # Design
//! An engine is callback-based: `request` starts the exchange and returns
//! immediately; the engine later calls `done` exactly once with the final
//! response (after following redirects) or a transport error. While running,
//! it may report progress through the `EventEmitter`, which fans events out to
//! every listener attached to the call's `OutcomeFuture`.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::broadcast;

use crate::error::TransportError;
use crate::http::{EngineRequest, RequestMeta, Response};

/// Completion callback handed to an engine.
pub type EngineCallback = Box<dyn FnOnce(Result<Response, TransportError>) + Send>;

/// Lower-level, callback-style HTTP engine.
pub trait RequestEngine: Send + Sync + 'static {
    /// Start `request`; call `done` exactly once when it finishes.
    fn request(&self, request: EngineRequest, events: EventEmitter, done: EngineCallback);
}

impl<E: RequestEngine + ?Sized> RequestEngine for Arc<E> {
    fn request(&self, request: EngineRequest, events: EventEmitter, done: EngineCallback) {
        (**self).request(request, events, done)
    }
}

/// Event emitted while a call is in flight.
#[derive(Debug, Clone)]
pub enum RequestEvent {
    /// The request is about to be handed to the engine.
    Request(Arc<RequestMeta>),
    /// Status line and headers of the final response arrived.
    Response {
        status_code: u16,
        headers: Arc<Vec<(String, String)>>,
    },
    /// A chunk of the response body.
    Data(Bytes),
    /// The exchange finished with a response.
    Complete(Arc<Response>),
    /// The exchange failed without a response.
    Error(Arc<TransportError>),
}

/// Sending half of a call's event channel.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<RequestEvent>,
}

impl EventEmitter {
    pub(crate) fn new(tx: broadcast::Sender<RequestEvent>) -> Self {
        Self { tx }
    }

    /// Emitter nobody listens to.
    pub fn detached() -> Self {
        Self::new(broadcast::channel(1).0)
    }

    pub fn emit(&self, event: RequestEvent) {
        // No listeners is fine.
        let _ = self.tx.send(event);
    }

    pub fn response(&self, status_code: u16, headers: &[(String, String)]) {
        self.emit(RequestEvent::Response {
            status_code,
            headers: Arc::new(headers.to_vec()),
        });
    }

    pub fn data(&self, chunk: Bytes) {
        self.emit(RequestEvent::Data(chunk));
    }

    pub fn has_listeners(&self) -> bool {
        self.tx.receiver_count() > 0
    }
}

/// Engine backed by a synchronous closure. Handy for tests and for embedding
/// an existing client.
pub struct FnEngine<F> {
    handler: F,
}

pub fn from_fn<F>(handler: F) -> FnEngine<F>
where
    F: Fn(&EngineRequest) -> Result<Response, TransportError> + Send + Sync + 'static,
{
    FnEngine { handler }
}

impl<F> RequestEngine for FnEngine<F>
where
    F: Fn(&EngineRequest) -> Result<Response, TransportError> + Send + Sync + 'static,
{
    fn request(&self, request: EngineRequest, events: EventEmitter, done: EngineCallback) {
        let outcome = (self.handler)(&request);
        if let Ok(response) = &outcome {
            events.response(response.status_code, &response.headers);
            let chunk = response.body.to_bytes();
            if !chunk.is_empty() {
                events.data(chunk);
            }
        }
        done(outcome);
    }
}

impl<F> std::fmt::Debug for FnEngine<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FnEngine(..)")
    }
}
