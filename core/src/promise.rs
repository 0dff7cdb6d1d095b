//! Eager, multi-observer settlement handle.
//!
//! # Design
//! A `Promise` is driven by its own tokio task, so it settles whether or not
//! anyone polls it. The outcome is published once through a `watch` channel;
//! every clone and every chained handler reads the same settled value.
//! Chaining marks this promise's guard handled and gives the derived promise
//! a fresh guard, so an unhandled rejection is reported at the end of the
//! chain and nowhere else. Each live handle keeps its guard open; dropping the
//! last one lets an unobserved rejection be reported.
//!
//! Tasks are spawned on the runtime handle the promise was created with, so
//! chaining works from threads outside that runtime.

use std::future::{Future, IntoFuture};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::error::{panic_message, RejectionKind, RequestError};
use crate::guard::{GuardState, RejectionGuard};

type Settlement<T> = Option<Result<T, RequestError>>;

/// Handle to a value that settles exactly once.
pub struct Promise<T> {
    state: watch::Receiver<Settlement<T>>,
    guard: Arc<RejectionGuard>,
    runtime: Handle,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        self.guard.acquire();
        Self {
            state: self.state.clone(),
            guard: Arc::clone(&self.guard),
            runtime: self.runtime.clone(),
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        self.guard.release();
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("settled", &self.state.borrow().is_some())
            .field("guard", &self.guard)
            .finish()
    }
}

impl<T> Promise<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Drive `future` on `runtime` and publish its outcome.
    pub(crate) fn spawn<F>(runtime: &Handle, future: F, guard: Arc<RejectionGuard>) -> Self
    where
        F: Future<Output = Result<T, RequestError>> + Send + 'static,
    {
        let (tx, rx) = watch::channel(None);
        let watcher = Arc::clone(&guard);
        guard.acquire();
        runtime.spawn(async move {
            let outcome = AssertUnwindSafe(future)
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    Err(RequestError::aborted(format!(
                        "handler panicked: {}",
                        panic_message(payload.as_ref())
                    )))
                });
            let rejection = outcome.as_ref().err().cloned();
            tx.send_replace(Some(outcome));
            match rejection {
                Some(reason) => watcher.rejected(reason).await,
                None => watcher.fulfilled(),
            }
        });
        Self {
            state: rx,
            guard,
            runtime: runtime.clone(),
        }
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    async fn wait(mut state: watch::Receiver<Settlement<T>>) -> Result<T, RequestError> {
        let settled = match state.wait_for(Option::is_some).await {
            Ok(settled) => (*settled).clone(),
            Err(_) => None,
        };
        settled.unwrap_or_else(|| Err(RequestError::aborted("promise dropped before settling")))
    }

    /// Settled outcome, marking this promise handled.
    fn observe(&self) -> impl Future<Output = Result<T, RequestError>> + Send + 'static {
        self.guard.mark_handled();
        Self::wait(self.state.clone())
    }

    fn derive<U, F>(&self, future: F) -> Promise<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Future<Output = Result<U, RequestError>> + Send + 'static,
    {
        Promise::spawn(&self.runtime, future, self.guard.derive())
    }

    /// Map the fulfillment; a rejection passes through to the new promise.
    pub fn then<U, F>(&self, on_fulfilled: F) -> Promise<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let parent = self.observe();
        self.derive(async move { parent.await.map(on_fulfilled) })
    }

    /// Handle both outcomes.
    pub fn then_or<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Promise<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
        R: FnOnce(RequestError) -> U + Send + 'static,
    {
        let parent = self.observe();
        self.derive(async move {
            Ok(match parent.await {
                Ok(value) => on_fulfilled(value),
                Err(err) => on_rejected(err),
            })
        })
    }

    /// Map the fulfillment with a handler that may itself reject.
    pub fn and_then<U, F>(&self, on_fulfilled: F) -> Promise<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Result<U, RequestError> + Send + 'static,
    {
        let parent = self.observe();
        self.derive(async move { parent.await.and_then(on_fulfilled) })
    }

    /// Recover from any rejection.
    pub fn catch<F>(&self, on_rejected: F) -> Promise<T>
    where
        F: FnOnce(RequestError) -> T + Send + 'static,
    {
        self.catch_if(|_| true, on_rejected)
    }

    /// Recover from rejections matching `predicate`; others pass through.
    pub fn catch_if<P, F>(&self, predicate: P, on_rejected: F) -> Promise<T>
    where
        P: FnOnce(&RequestError) -> bool + Send + 'static,
        F: FnOnce(RequestError) -> T + Send + 'static,
    {
        let parent = self.observe();
        self.derive(async move {
            match parent.await {
                Err(err) => {
                    if predicate(&err) {
                        Ok(on_rejected(err))
                    } else {
                        Err(err)
                    }
                }
                fulfilled => fulfilled,
            }
        })
    }

    /// Recover from rejections of one kind.
    pub fn catch_kind<F>(&self, kind: RejectionKind, on_rejected: F) -> Promise<T>
    where
        F: FnOnce(RequestError) -> T + Send + 'static,
    {
        self.catch_if(move |err| err.kind() == kind, on_rejected)
    }

    /// Run `handler` after settlement; the outcome passes through unchanged.
    pub fn finally<F>(&self, handler: F) -> Promise<T>
    where
        F: FnOnce() + Send + 'static,
    {
        let parent = self.observe();
        self.derive(async move {
            let outcome = parent.await;
            handler();
            outcome
        })
    }

    /// Settled outcome without marking the promise handled.
    pub fn peek(&self) -> Option<Result<T, RequestError>> {
        self.state.borrow().clone()
    }

    pub fn is_settled(&self) -> bool {
        self.state.borrow().is_some()
    }

    pub fn guard_state(&self) -> GuardState {
        self.guard.state()
    }

    /// Give up this handle and wait for the guard's final verdict. Does not
    /// count as a handler. An unobserved rejection is only reported once no
    /// other clone of this promise is alive.
    pub async fn diagnosed(self) -> GuardState {
        let guard = Arc::clone(&self.guard);
        drop(self);
        guard.verdict().await
    }
}

impl<T> IntoFuture for Promise<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Output = Result<T, RequestError>;
    type IntoFuture = BoxFuture<'static, Result<T, RequestError>>;

    fn into_future(self) -> Self::IntoFuture {
        self.observe().boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::RecordingDiagnostics;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn guard(recorder: &Arc<RecordingDiagnostics>) -> Arc<RejectionGuard> {
        RejectionGuard::new(recorder.clone(), 1, false)
    }

    fn resolved(recorder: &Arc<RecordingDiagnostics>, value: u32) -> Promise<u32> {
        Promise::spawn(&Handle::current(), async move { Ok(value) }, guard(recorder))
    }

    fn rejected(recorder: &Arc<RecordingDiagnostics>) -> Promise<u32> {
        Promise::spawn(
            &Handle::current(),
            async { Err(RequestError::aborted("nope")) },
            guard(recorder),
        )
    }

    #[tokio::test]
    async fn await_yields_the_value() {
        let recorder = RecordingDiagnostics::new();
        assert_eq!(resolved(&recorder, 7).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn every_attachment_observes_the_value() {
        let recorder = RecordingDiagnostics::new();
        let promise = resolved(&recorder, 2);
        let doubled = promise.then(|v| v * 2);
        let tripled = promise.then(|v| v * 3);
        assert_eq!(doubled.await.unwrap(), 4);
        assert_eq!(tripled.await.unwrap(), 6);
        assert_eq!(promise.clone().await.unwrap(), 2);
        assert_eq!(promise.then(|v| v + 1).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn then_passes_rejection_through() {
        let recorder = RecordingDiagnostics::new();
        let err = rejected(&recorder).then(|v| v + 1).await.unwrap_err();
        assert_eq!(err.kind(), RejectionKind::Aborted);
    }

    #[tokio::test]
    async fn then_or_handles_both() {
        let recorder = RecordingDiagnostics::new();
        let ok = resolved(&recorder, 1).then_or(|v| v.to_string(), |e| e.name().to_string());
        let err = rejected(&recorder).then_or(|v| v.to_string(), |e| e.name().to_string());
        assert_eq!(ok.await.unwrap(), "1");
        assert_eq!(err.await.unwrap(), "AbortError");
    }

    #[tokio::test]
    async fn and_then_can_reject() {
        let recorder = RecordingDiagnostics::new();
        let chained = resolved(&recorder, 1).and_then(|_| Err::<u32, _>(RequestError::aborted("later")));
        assert_eq!(chained.await.unwrap_err().message(), "later");
    }

    #[tokio::test]
    async fn catch_kind_filters() {
        let recorder = RecordingDiagnostics::new();
        let caught = rejected(&recorder).catch_kind(RejectionKind::Aborted, |_| 0);
        assert_eq!(caught.await.unwrap(), 0);

        let missed = rejected(&recorder).catch_kind(RejectionKind::StatusCode, |_| 0);
        assert!(missed.await.is_err());
    }

    #[tokio::test]
    async fn finally_runs_and_passes_through() {
        let recorder = RecordingDiagnostics::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let outcome = rejected(&recorder)
            .finally(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        assert!(outcome.is_err());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_handler_rejects_the_derived_promise() {
        let recorder = RecordingDiagnostics::new();
        let err = resolved(&recorder, 1)
            .then(|_| -> u32 { panic!("handler blew up") })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), RejectionKind::Aborted);
        assert!(err.message().contains("handler blew up"));
    }

    #[tokio::test]
    async fn unobserved_rejection_is_reported() {
        let recorder = RecordingDiagnostics::new();
        let promise = rejected(&recorder);
        assert_eq!(promise.diagnosed().await, GuardState::RejectedUnhandled);
        assert_eq!(recorder.unhandled_rejections(), 1);
    }

    #[tokio::test]
    async fn chained_without_rejection_handler_reports_at_the_end() {
        let recorder = RecordingDiagnostics::new();
        let promise = rejected(&recorder);
        let chained = promise.then(|v| v + 1);

        assert_eq!(promise.diagnosed().await, GuardState::RejectedHandled);
        assert_eq!(chained.diagnosed().await, GuardState::RejectedUnhandled);
        assert_eq!(recorder.unhandled_rejections(), 1);
    }

    #[tokio::test]
    async fn catch_silences_the_chain() {
        let recorder = RecordingDiagnostics::new();
        let caught = rejected(&recorder).catch(|_| 0);
        assert_eq!(caught.diagnosed().await, GuardState::Fulfilled);
        assert!(recorder.events().is_empty());
    }

    #[tokio::test]
    async fn peek_does_not_count_as_handler() {
        let recorder = RecordingDiagnostics::new();
        let promise = rejected(&recorder);
        while !promise.is_settled() {
            tokio::task::yield_now().await;
        }
        assert!(matches!(promise.peek(), Some(Err(_))));
        assert_eq!(promise.diagnosed().await, GuardState::RejectedUnhandled);
        assert_eq!(recorder.unhandled_rejections(), 1);
    }

    #[tokio::test]
    async fn held_handle_defers_the_report() {
        let recorder = RecordingDiagnostics::new();
        let promise = rejected(&recorder);
        while !promise.is_settled() {
            tokio::task::yield_now().await;
        }
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        assert_eq!(promise.guard_state(), GuardState::RejectedUnobserved);
        assert!(recorder.events().is_empty());

        let caught = promise.catch(|_| 0);
        assert_eq!(caught.await.unwrap(), 0);
        assert_eq!(promise.diagnosed().await, GuardState::RejectedHandled);
        assert!(recorder.events().is_empty());
    }

    #[tokio::test]
    async fn dropping_every_clone_reports_once() {
        let recorder = RecordingDiagnostics::new();
        let promise = rejected(&recorder);
        let clone = promise.clone();
        drop(promise);
        assert_eq!(clone.diagnosed().await, GuardState::RejectedUnhandled);
        assert_eq!(recorder.unhandled_rejections(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_caller_on_another_worker_still_handles_in_time() {
        let recorder = RecordingDiagnostics::new();
        let promise = rejected(&recorder);
        std::thread::sleep(std::time::Duration::from_millis(20));
        let caught = promise.catch(|_| 0);
        assert_eq!(caught.await.unwrap(), 0);
        assert_eq!(promise.diagnosed().await, GuardState::RejectedHandled);
        assert_eq!(recorder.unhandled_rejections(), 0);
    }

    #[test]
    fn chaining_outside_the_runtime_uses_its_handle() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let recorder = RecordingDiagnostics::new();
        let promise = Promise::spawn(rt.handle(), async { Ok::<u32, RequestError>(20) }, guard(&recorder));
        let doubled = promise.then(|v| v * 2);
        assert_eq!(rt.block_on(doubled.into_future()).unwrap(), 40);
    }
}
