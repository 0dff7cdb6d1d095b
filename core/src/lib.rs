//! Dual-interface HTTP request dispatcher.
//!
//! # Overview
//! A `Dispatcher` turns loosely specified request options into one call on a
//! lower-level, callback-style `RequestEngine`, and hands back an
//! `OutcomeFuture` that can be awaited, chained like a promise, or listened to
//! for request events. A plain callback can be supplied alongside; it sees the
//! raw outcome before any promise handler does.
//!
//! # Design
//! - Option handling is pure: `options::normalize` folds the defaults chain
//!   and the call's own options into an `EffectiveOptions` record.
//! - `classify` decides success vs. status-code failure, `transform` shapes
//!   accepted responses, `guard` reports rejections nobody handled.
//! - The engine owns the network. `UreqEngine` is the bundled one; tests use
//!   `engine::from_fn` for deterministic, in-process responses.
//! - Every dispatcher is immutable; `Dispatcher::defaults` builds a new one.

pub mod classify;
pub mod client;
pub mod defaults;
pub mod engine;
pub mod error;
pub mod guard;
pub mod http;
pub mod options;
pub mod outcome;
pub mod promise;
pub mod transform;
pub mod types;
pub mod ureq_engine;

#[cfg(test)]
mod test_support;

pub use classify::{classify, is_success, Classification};
pub use client::{Dispatcher, DispatcherBuilder, DispatcherConfig};
pub use defaults::DefaultsChain;
pub use engine::{from_fn, EngineCallback, EventEmitter, FnEngine, RequestEngine, RequestEvent};
pub use error::{OptionsError, RejectionKind, RequestError, TransportError, TransportErrorKind};
pub use guard::{Diagnostic, Diagnostics, GuardState, RecordingDiagnostics, TracingDiagnostics};
pub use http::{Body, BodyStream, BodyWriter, EngineRequest, RequestBody, RequestMeta, Response};
pub use options::{normalize, Callback, EffectiveOptions, Flag, RequestOptions};
pub use outcome::OutcomeFuture;
pub use promise::Promise;
pub use transform::Transform;
pub use types::Fulfillment;
pub use ureq_engine::UreqEngine;
