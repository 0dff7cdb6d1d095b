//! Optional mapping of a successful response into the fulfillment value.
//!
//! # Design
//! A transform is either synchronous or returns a future. Both shapes run
//! under `catch_unwind`, so a panicking transform turns into a rejection just
//! like one that returns `Err`. Transform failures are never retried.

use std::error::Error;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};

use crate::classify::is_success;
use crate::error::{panic_message, Panicked, TransformFailure};
use crate::http::{Body, Response};
use crate::options::EffectiveOptions;
use crate::types::Fulfillment;

pub type SyncTransformFn =
    dyn Fn(&Body, &Response, bool) -> Result<Fulfillment, TransformFailure> + Send + Sync;

pub type AsyncTransformFn = dyn Fn(Body, Arc<Response>, bool) -> BoxFuture<'static, Result<Fulfillment, TransformFailure>>
    + Send
    + Sync;

/// Maps `(body, response, resolve_with_full_response)` to the fulfillment.
#[derive(Clone)]
pub enum Transform {
    Sync(Arc<SyncTransformFn>),
    Async(Arc<AsyncTransformFn>),
}

fn into_failure<E>(err: E) -> TransformFailure
where
    E: Into<Box<dyn Error + Send + Sync>>,
{
    let boxed: Box<dyn Error + Send + Sync> = err.into();
    Arc::from(boxed)
}

fn panicked(payload: Box<dyn std::any::Any + Send>) -> TransformFailure {
    Arc::new(Panicked(panic_message(payload.as_ref())))
}

impl Transform {
    /// Infallible synchronous transform.
    pub fn map<F>(f: F) -> Self
    where
        F: Fn(&Body, &Response) -> Fulfillment + Send + Sync + 'static,
    {
        Transform::Sync(Arc::new(move |body: &Body, response: &Response, _: bool| {
            Ok::<_, TransformFailure>(f(body, response))
        }))
    }

    /// Fallible synchronous transform; an `Err` rejects the call.
    pub fn sync<F, E>(f: F) -> Self
    where
        F: Fn(&Body, &Response, bool) -> Result<Fulfillment, E> + Send + Sync + 'static,
        E: Into<Box<dyn Error + Send + Sync>> + 'static,
    {
        Transform::Sync(Arc::new(move |body: &Body, response: &Response, full: bool| {
            f(body, response, full).map_err(into_failure)
        }))
    }

    /// Transform returning a future; its outcome is the call's outcome.
    pub fn future<F, Fut, E>(f: F) -> Self
    where
        F: Fn(Body, Arc<Response>, bool) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Fulfillment, E>> + Send + 'static,
        E: Into<Box<dyn Error + Send + Sync>> + 'static,
    {
        Transform::Async(Arc::new(move |body: Body, response: Arc<Response>, full: bool| {
            f(body, response, full)
                .map(|outcome| outcome.map_err(into_failure))
                .boxed()
        }))
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transform::Sync(_) => f.write_str("Transform::Sync(..)"),
            Transform::Async(_) => f.write_str("Transform::Async(..)"),
        }
    }
}

impl PartialEq for Transform {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Transform::Sync(a), Transform::Sync(b)) => Arc::ptr_eq(a, b),
            (Transform::Async(a), Transform::Async(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Fulfillment of an accepted response when no transform applies.
pub fn passthrough(options: &EffectiveOptions, response: Arc<Response>) -> Fulfillment {
    if options.resolve_with_full_response {
        Fulfillment::Response(response)
    } else {
        Fulfillment::Body(response.body.clone())
    }
}

/// Run the transform pipeline on an accepted response.
pub async fn apply(
    options: &EffectiveOptions,
    response: Arc<Response>,
) -> Result<Fulfillment, TransformFailure> {
    let skip_non_2xx = options.transform_2xx_only && !is_success(response.status_code);
    let transform = match &options.transform {
        Some(transform) if !skip_non_2xx => transform,
        _ => return Ok(passthrough(options, response)),
    };
    let full = options.resolve_with_full_response;

    match transform {
        Transform::Sync(f) => {
            panic::catch_unwind(AssertUnwindSafe(|| f(&response.body, &*response, full)))
                .unwrap_or_else(|payload| Err(panicked(payload)))
        }
        Transform::Async(f) => {
            let pending = panic::catch_unwind(AssertUnwindSafe(|| {
                f(response.body.clone(), Arc::clone(&response), full)
            }));
            match pending {
                Ok(pending) => AssertUnwindSafe(pending)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| Err(panicked(payload))),
                Err(payload) => Err(panicked(payload)),
            }
        }
    }
}
