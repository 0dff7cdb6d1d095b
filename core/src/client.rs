//! Dual-interface request dispatcher.
//!
//! # Design
//! `Dispatcher` holds only shared, read-only parts: the engine, the defaults
//! chain, the diagnostics sink and its config. Each call normalizes a fresh
//! options record, spawns one task that drives the engine to completion, and
//! returns an `OutcomeFuture` right away. Inside that task the order is fixed:
//! engine outcome, events, caller callback, classification, transform,
//! settlement. The callback therefore always runs before any promise handler
//! sees the outcome.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot};
use tracing::Instrument;
use uuid::Uuid;

use crate::classify::{classify, Classification};
use crate::defaults::DefaultsChain;
use crate::engine::{EventEmitter, RequestEngine, RequestEvent};
use crate::error::{panic_message, OptionsError, RequestError, TransportError, TransportErrorKind};
use crate::guard::{Diagnostics, RejectionGuard, TracingDiagnostics};
use crate::http::{Body, EngineRequest, Response};
use crate::options::{normalize, Callback, EffectiveOptions, Normalized, RequestOptions};
use crate::outcome::OutcomeFuture;
use crate::promise::Promise;
use crate::transform;
use crate::types::Fulfillment;

/// Tunables of a dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Scheduler ticks the settling task waits before an abandoned rejection
    /// may be reported.
    pub rejection_window: u32,
    /// Buffered events per call before slow listeners start lagging.
    pub event_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            rejection_window: 1,
            event_capacity: 64,
        }
    }
}

pub struct DispatcherBuilder {
    engine: Arc<dyn RequestEngine>,
    defaults: DefaultsChain,
    diagnostics: Arc<dyn Diagnostics>,
    config: DispatcherConfig,
    runtime: Option<Handle>,
}

impl DispatcherBuilder {
    pub fn defaults(mut self, layer: impl Into<RequestOptions>) -> Self {
        self.defaults = self.defaults.extend(layer.into());
        self
    }

    pub fn diagnostics(mut self, diagnostics: Arc<dyn Diagnostics>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn rejection_window(mut self, ticks: u32) -> Self {
        self.config.rejection_window = ticks;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity.max(1);
        self
    }

    /// Runtime that drives every call, even calls made outside of it.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Without an explicit runtime, the one `build` runs in is used, if any.
    pub fn build(self) -> Dispatcher {
        Dispatcher {
            engine: self.engine,
            defaults: self.defaults,
            diagnostics: self.diagnostics,
            config: self.config,
            runtime: self.runtime.or_else(|| Handle::try_current().ok()),
        }
    }
}

/// Issues requests through a `RequestEngine` and returns `OutcomeFuture`s.
///
/// Cloning is cheap; clones and derived dispatchers share nothing mutable.
#[derive(Clone)]
pub struct Dispatcher {
    engine: Arc<dyn RequestEngine>,
    defaults: DefaultsChain,
    diagnostics: Arc<dyn Diagnostics>,
    config: DispatcherConfig,
    runtime: Option<Handle>,
}

impl Dispatcher {
    pub fn new(engine: impl RequestEngine) -> Self {
        Self::builder(engine).build()
    }

    pub fn builder(engine: impl RequestEngine) -> DispatcherBuilder {
        DispatcherBuilder {
            engine: Arc::new(engine),
            defaults: DefaultsChain::new(),
            diagnostics: Arc::new(TracingDiagnostics),
            config: DispatcherConfig::default(),
            runtime: None,
        }
    }

    /// A dispatcher whose calls see `layer` on top of this one's defaults.
    pub fn defaults(&self, layer: impl Into<RequestOptions>) -> Dispatcher {
        Dispatcher {
            engine: Arc::clone(&self.engine),
            defaults: self.defaults.extend(layer.into()),
            diagnostics: Arc::clone(&self.diagnostics),
            config: self.config.clone(),
            runtime: self.runtime.clone(),
        }
    }

    pub fn defaults_chain(&self) -> &DefaultsChain {
        &self.defaults
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Issue one request on the dispatcher's runtime, or the ambient one.
    ///
    /// Returns `Err` only for input that cannot be issued at all, or when
    /// there is no runtime to drive it; every other failure is delivered
    /// through the returned future (and the callback).
    pub fn request(&self, options: impl Into<RequestOptions>) -> Result<OutcomeFuture, OptionsError> {
        let Normalized { options, callback } = normalize(&self.defaults, options.into())?;
        let runtime = match &self.runtime {
            Some(runtime) => runtime.clone(),
            None => Handle::try_current().map_err(|_| OptionsError::NoRuntime)?,
        };
        Ok(self.dispatch(&runtime, options, callback))
    }

    /// Issue one request and also report its raw outcome to `callback`.
    pub fn request_with_callback<F>(
        &self,
        options: impl Into<RequestOptions>,
        callback: F,
    ) -> Result<OutcomeFuture, OptionsError>
    where
        F: Fn(Option<&TransportError>, Option<&Response>, Option<&Body>) + Send + Sync + 'static,
    {
        let mut options = options.into();
        options.callback = Some(Callback::new(callback));
        self.request(options)
    }

    fn verb(&self, method: &str, options: impl Into<RequestOptions>) -> Result<OutcomeFuture, OptionsError> {
        self.request(options.into().method(method))
    }

    pub fn get(&self, options: impl Into<RequestOptions>) -> Result<OutcomeFuture, OptionsError> {
        self.verb("GET", options)
    }

    pub fn head(&self, options: impl Into<RequestOptions>) -> Result<OutcomeFuture, OptionsError> {
        self.verb("HEAD", options)
    }

    pub fn post(&self, options: impl Into<RequestOptions>) -> Result<OutcomeFuture, OptionsError> {
        self.verb("POST", options)
    }

    pub fn put(&self, options: impl Into<RequestOptions>) -> Result<OutcomeFuture, OptionsError> {
        self.verb("PUT", options)
    }

    pub fn patch(&self, options: impl Into<RequestOptions>) -> Result<OutcomeFuture, OptionsError> {
        self.verb("PATCH", options)
    }

    pub fn delete(&self, options: impl Into<RequestOptions>) -> Result<OutcomeFuture, OptionsError> {
        self.verb("DELETE", options)
    }

    fn dispatch(
        &self,
        runtime: &Handle,
        options: EffectiveOptions,
        callback: Option<Callback>,
    ) -> OutcomeFuture {
        let id = Uuid::new_v4();
        let (events, _) = broadcast::channel(self.config.event_capacity.max(1));
        let guard = RejectionGuard::new(
            Arc::clone(&self.diagnostics),
            self.config.rejection_window,
            callback.is_some(),
        );
        let span = tracing::debug_span!("request", %id, method = %options.method, uri = %options.uri);
        let exchange = Exchange {
            id,
            options: Arc::new(options),
            callback,
            engine: Arc::clone(&self.engine),
            diagnostics: Arc::clone(&self.diagnostics),
            events: EventEmitter::new(events.clone()),
        };
        let promise = Promise::spawn(runtime, exchange.run().instrument(span), guard);
        OutcomeFuture::new(id, promise, events)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("defaults", &self.defaults)
            .field("config", &self.config)
            .finish()
    }
}

/// Everything one in-flight call owns.
struct Exchange {
    id: Uuid,
    options: Arc<EffectiveOptions>,
    callback: Option<Callback>,
    engine: Arc<dyn RequestEngine>,
    diagnostics: Arc<dyn Diagnostics>,
    events: EventEmitter,
}

impl Exchange {
    async fn run(self) -> Result<Fulfillment, RequestError> {
        let outcome = if self.options.uri.is_empty() {
            Err(TransportError::missing_uri())
        } else {
            let request = self.options.to_engine_request(self.id);
            self.events.emit(RequestEvent::Request(Arc::new(request.meta())));
            tracing::debug!("dispatching");
            call_engine(self.engine.as_ref(), request, self.events.clone())
                .await
                .map(Arc::new)
        };

        match &outcome {
            Ok(response) => {
                tracing::debug!(status = response.status_code, "response received");
                self.events.emit(RequestEvent::Complete(Arc::clone(response)));
            }
            Err(err) => {
                tracing::debug!(error = %err, "transport failure");
                self.events.emit(RequestEvent::Error(Arc::new(err.clone())));
            }
        }

        if let Some(callback) = &self.callback {
            invoke_callback(callback, &outcome, self.diagnostics.as_ref());
        }

        settle(outcome, self.options).await
    }
}

async fn call_engine(
    engine: &dyn RequestEngine,
    request: EngineRequest,
    events: EventEmitter,
) -> Result<Response, TransportError> {
    let (tx, rx) = oneshot::channel();
    engine.request(
        request,
        events,
        Box::new(move |outcome| {
            let _ = tx.send(outcome);
        }),
    );
    rx.await.unwrap_or_else(|_| {
        Err(TransportError::new(
            TransportErrorKind::Aborted,
            "request engine dropped its callback",
        ))
    })
}

/// Run the caller callback; a panic inside it is reported, not propagated.
fn invoke_callback(
    callback: &Callback,
    outcome: &Result<Arc<Response>, TransportError>,
    diagnostics: &dyn Diagnostics,
) {
    let call = AssertUnwindSafe(|| match outcome {
        Ok(response) => callback.call(None, Some(response), Some(&response.body)),
        Err(err) => callback.call(Some(err), None, None),
    });
    if let Err(payload) = panic::catch_unwind(call) {
        diagnostics.unhandled_error(&panic_message(payload.as_ref()));
    }
}

async fn settle(
    outcome: Result<Arc<Response>, TransportError>,
    options: Arc<EffectiveOptions>,
) -> Result<Fulfillment, RequestError> {
    let response = match outcome {
        Ok(response) => response,
        Err(cause) => return Err(RequestError::transport(cause, options)),
    };
    match classify(response.status_code, options.simple) {
        Classification::Rejected { .. } => Err(RequestError::status_failure(response, options)),
        Classification::Accepted => match transform::apply(&options, Arc::clone(&response)).await {
            Ok(value) => Ok(value),
            Err(cause) => Err(RequestError::transform(cause, options, response)),
        },
    }
}
