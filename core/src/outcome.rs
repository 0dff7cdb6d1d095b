//! The handle returned by every dispatch.
//!
//! `OutcomeFuture` is a `Promise<Fulfillment>` plus the call's event channel:
//! promise-style consumers chain or await it, event-style consumers subscribe
//! to `RequestEvent`s or read the body as a stream of chunks.

use std::future::IntoFuture;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{self, Stream};
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

use crate::engine::RequestEvent;
use crate::error::{RejectionKind, RequestError};
use crate::guard::GuardState;
use crate::http::Response;
use crate::promise::Promise;
use crate::types::Fulfillment;

/// Promise-like, event-emitting handle for one dispatched request.
#[derive(Clone, Debug)]
pub struct OutcomeFuture {
    id: Uuid,
    promise: Promise<Fulfillment>,
    events: broadcast::Sender<RequestEvent>,
}

impl OutcomeFuture {
    pub(crate) fn new(
        id: Uuid,
        promise: Promise<Fulfillment>,
        events: broadcast::Sender<RequestEvent>,
    ) -> Self {
        Self {
            id,
            promise,
            events,
        }
    }

    /// Id shared with `Response::request.id` and the tracing span.
    pub fn request_id(&self) -> Uuid {
        self.id
    }

    /// The bare promise. Holding it is not handling it: a rejection that is
    /// never handled through it is still reported.
    pub fn promise(&self) -> Promise<Fulfillment> {
        self.promise.then(|value| value)
    }

    pub fn then<U, F>(&self, on_fulfilled: F) -> Promise<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(Fulfillment) -> U + Send + 'static,
    {
        self.promise.then(on_fulfilled)
    }

    pub fn then_or<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Promise<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(Fulfillment) -> U + Send + 'static,
        R: FnOnce(RequestError) -> U + Send + 'static,
    {
        self.promise.then_or(on_fulfilled, on_rejected)
    }

    pub fn and_then<U, F>(&self, on_fulfilled: F) -> Promise<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(Fulfillment) -> Result<U, RequestError> + Send + 'static,
    {
        self.promise.and_then(on_fulfilled)
    }

    pub fn catch<F>(&self, on_rejected: F) -> Promise<Fulfillment>
    where
        F: FnOnce(RequestError) -> Fulfillment + Send + 'static,
    {
        self.promise.catch(on_rejected)
    }

    pub fn catch_if<P, F>(&self, predicate: P, on_rejected: F) -> Promise<Fulfillment>
    where
        P: FnOnce(&RequestError) -> bool + Send + 'static,
        F: FnOnce(RequestError) -> Fulfillment + Send + 'static,
    {
        self.promise.catch_if(predicate, on_rejected)
    }

    pub fn catch_kind<F>(&self, kind: RejectionKind, on_rejected: F) -> Promise<Fulfillment>
    where
        F: FnOnce(RequestError) -> Fulfillment + Send + 'static,
    {
        self.promise.catch_kind(kind, on_rejected)
    }

    pub fn finally<F>(&self, handler: F) -> Promise<Fulfillment>
    where
        F: FnOnce() + Send + 'static,
    {
        self.promise.finally(handler)
    }

    pub fn peek(&self) -> Option<Result<Fulfillment, RequestError>> {
        self.promise.peek()
    }

    pub fn is_settled(&self) -> bool {
        self.promise.is_settled()
    }

    pub fn guard_state(&self) -> GuardState {
        self.promise.guard_state()
    }

    /// Give up this handle and wait for the guard's final verdict. See
    /// `Promise::diagnosed`.
    pub async fn diagnosed(self) -> GuardState {
        self.promise.diagnosed().await
    }

    /// Listen to this call's events. Only events emitted after subscribing
    /// are seen, so subscribe right after dispatching.
    pub fn subscribe(&self) -> broadcast::Receiver<RequestEvent> {
        self.events.subscribe()
    }

    /// Run `listener` with the final response when the exchange completes.
    /// Never runs if the exchange fails without a response.
    pub fn on_complete<F>(&self, listener: F)
    where
        F: FnOnce(Arc<Response>) + Send + 'static,
    {
        let mut events = self.subscribe();
        self.promise.runtime().spawn(async move {
            loop {
                match events.recv().await {
                    Ok(RequestEvent::Complete(response)) => {
                        listener(response);
                        return;
                    }
                    Ok(RequestEvent::Error(_)) | Err(RecvError::Closed) => return,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                }
            }
        });
    }

    /// The response body as a stream of chunks, ending when the exchange does.
    pub fn data_stream(&self) -> impl Stream<Item = Bytes> + Send + 'static {
        stream::unfold(self.subscribe(), |mut events| async move {
            loop {
                match events.recv().await {
                    Ok(RequestEvent::Data(chunk)) => return Some((chunk, events)),
                    Ok(RequestEvent::Complete(_) | RequestEvent::Error(_)) => return None,
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "body stream lagged, chunks dropped");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
    }
}

impl IntoFuture for OutcomeFuture {
    type Output = Result<Fulfillment, RequestError>;
    type IntoFuture = BoxFuture<'static, Result<Fulfillment, RequestError>>;

    fn into_future(self) -> Self::IntoFuture {
        self.promise.into_future()
    }
}
