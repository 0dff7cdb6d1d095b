//! Unhandled-rejection bookkeeping for settled promises.
//!
//! # Design
//! Every `Promise` owns a `RejectionGuard`. Attaching any handler (chaining,
//! awaiting) marks the guard handled. A rejection counts as unhandled only
//! once nothing can handle it anymore: the rejection window (a few scheduler
//! ticks of the settling task) has passed *and* every `Promise` handle on the
//! guard has been dropped. Until then a handler may still be attached, however
//! long the caller takes to get there, so the verdict does not depend on which
//! worker thread runs what. `Diagnostics::unhandled_rejection` fires exactly
//! once. A guard created for a call that carries a callback starts out
//! handled: the callback is the consumer of the rejection.
//!
//! The state lives in a `watch` channel so tests can wait for the verdict
//! instead of sleeping. Flag updates and state transitions happen under the
//! channel's lock.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::watch;

use crate::error::RequestError;

/// Sink for non-fatal diagnostics.
pub trait Diagnostics: Send + Sync + 'static {
    /// A rejection was never observed by any handler.
    fn unhandled_rejection(&self, error: &RequestError);

    /// A caller callback panicked.
    fn unhandled_error(&self, message: &str);
}

/// Reports through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDiagnostics;

impl Diagnostics for TracingDiagnostics {
    fn unhandled_rejection(&self, error: &RequestError) {
        tracing::warn!(name = error.name(), %error, "unhandled rejection");
    }

    fn unhandled_error(&self, message: &str) {
        tracing::error!(panic = message, "callback panicked");
    }
}

/// Diagnostic recorded by `RecordingDiagnostics`.
#[derive(Debug, Clone)]
pub enum Diagnostic {
    UnhandledRejection(RequestError),
    UnhandledError(String),
}

/// Keeps every diagnostic in memory.
#[derive(Debug, Default)]
pub struct RecordingDiagnostics {
    events: Mutex<Vec<Diagnostic>>,
}

impl RecordingDiagnostics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Diagnostic> {
        self.lock().clone()
    }

    pub fn unhandled_rejections(&self) -> usize {
        self.count(|d| matches!(d, Diagnostic::UnhandledRejection(_)))
    }

    pub fn unhandled_errors(&self) -> usize {
        self.count(|d| matches!(d, Diagnostic::UnhandledError(_)))
    }

    fn count(&self, pred: impl Fn(&Diagnostic) -> bool) -> usize {
        self.lock().iter().filter(|d| pred(d)).count()
    }

    fn push(&self, diagnostic: Diagnostic) {
        self.lock().push(diagnostic);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Diagnostic>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Diagnostics for RecordingDiagnostics {
    fn unhandled_rejection(&self, error: &RequestError) {
        self.push(Diagnostic::UnhandledRejection(error.clone()));
    }

    fn unhandled_error(&self, message: &str) {
        self.push(Diagnostic::UnhandledError(message.to_string()));
    }
}

/// Lifecycle of one promise as seen by the guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Pending,
    Fulfilled,
    /// Rejected, no handler yet, and one could still be attached.
    RejectedUnobserved,
    /// Rejected and reported.
    RejectedUnhandled,
    /// Rejected with a handler (or callback) attached.
    RejectedHandled,
}

impl GuardState {
    /// No later transition is possible.
    pub fn is_final(self) -> bool {
        !matches!(self, GuardState::Pending | GuardState::RejectedUnobserved)
    }
}

/// Per-promise rejection guard.
pub struct RejectionGuard {
    state: watch::Sender<GuardState>,
    handled: AtomicBool,
    /// Live `Promise` handles that could still attach a handler.
    handles: AtomicUsize,
    window_elapsed: AtomicBool,
    reason: OnceLock<RequestError>,
    window: u32,
    diagnostics: Arc<dyn Diagnostics>,
}

impl RejectionGuard {
    pub(crate) fn new(diagnostics: Arc<dyn Diagnostics>, window: u32, handled: bool) -> Arc<Self> {
        Arc::new(Self {
            state: watch::channel(GuardState::Pending).0,
            handled: AtomicBool::new(handled),
            handles: AtomicUsize::new(0),
            window_elapsed: AtomicBool::new(false),
            reason: OnceLock::new(),
            window,
            diagnostics,
        })
    }

    /// Fresh, unhandled guard sharing this guard's sink and window.
    pub(crate) fn derive(&self) -> Arc<Self> {
        Self::new(Arc::clone(&self.diagnostics), self.window, false)
    }

    pub fn state(&self) -> GuardState {
        *self.state.borrow()
    }

    /// A `Promise` handle on this guard was created.
    pub(crate) fn acquire(&self) {
        self.handles.fetch_add(1, Ordering::SeqCst);
    }

    /// A `Promise` handle on this guard was dropped.
    pub(crate) fn release(&self) {
        if self.handles.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.report_if_abandoned();
        }
    }

    pub(crate) fn mark_handled(&self) {
        self.state.send_if_modified(|state| {
            self.handled.store(true, Ordering::SeqCst);
            if *state == GuardState::RejectedUnobserved {
                *state = GuardState::RejectedHandled;
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn fulfilled(&self) {
        self.state.send_replace(GuardState::Fulfilled);
    }

    pub(crate) async fn rejected(&self, reason: RequestError) {
        let _ = self.reason.set(reason);
        self.state.send_modify(|state| {
            *state = if self.handled.load(Ordering::SeqCst) {
                GuardState::RejectedHandled
            } else {
                GuardState::RejectedUnobserved
            };
        });

        for _ in 0..self.window {
            tokio::task::yield_now().await;
        }

        self.window_elapsed.store(true, Ordering::SeqCst);
        self.report_if_abandoned();
    }

    /// Report once if the rejection is unobserved, the window has passed and
    /// no handle is left. Called by both sides; whichever comes last reports.
    fn report_if_abandoned(&self) {
        let report = self.state.send_if_modified(|state| {
            let abandoned = self.window_elapsed.load(Ordering::SeqCst)
                && self.handles.load(Ordering::SeqCst) == 0;
            if *state == GuardState::RejectedUnobserved && abandoned {
                *state = GuardState::RejectedUnhandled;
                true
            } else {
                false
            }
        });
        if report {
            if let Some(reason) = self.reason.get() {
                self.diagnostics.unhandled_rejection(reason);
            }
        }
    }

    /// Wait until the guard reached a final state.
    pub(crate) async fn verdict(&self) -> GuardState {
        let mut state = self.state.subscribe();
        let verdict = match state.wait_for(|state| state.is_final()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        verdict
    }
}

impl std::fmt::Debug for RejectionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RejectionGuard")
            .field("state", &self.state())
            .field("handles", &self.handles.load(Ordering::SeqCst))
            .field("window", &self.window)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason() -> RequestError {
        RequestError::aborted("test")
    }

    #[tokio::test]
    async fn abandoned_rejection_is_reported_once() {
        let recorder = RecordingDiagnostics::new();
        let guard = RejectionGuard::new(recorder.clone(), 1, false);

        guard.rejected(reason()).await;

        assert_eq!(guard.state(), GuardState::RejectedUnhandled);
        assert_eq!(recorder.unhandled_rejections(), 1);
    }

    #[tokio::test]
    async fn handled_before_settlement_is_silent() {
        let recorder = RecordingDiagnostics::new();
        let guard = RejectionGuard::new(recorder.clone(), 1, false);

        guard.mark_handled();
        guard.rejected(reason()).await;

        assert_eq!(guard.state(), GuardState::RejectedHandled);
        assert!(recorder.events().is_empty());
    }

    #[tokio::test]
    async fn callback_guard_starts_handled() {
        let recorder = RecordingDiagnostics::new();
        let guard = RejectionGuard::new(recorder.clone(), 1, true);

        guard.rejected(reason()).await;

        assert_eq!(guard.state(), GuardState::RejectedHandled);
        assert_eq!(recorder.unhandled_rejections(), 0);
    }

    #[tokio::test]
    async fn live_handle_keeps_the_rejection_open() {
        let recorder = RecordingDiagnostics::new();
        let guard = RejectionGuard::new(recorder.clone(), 0, false);

        guard.acquire();
        guard.rejected(reason()).await;
        assert_eq!(guard.state(), GuardState::RejectedUnobserved);
        assert!(recorder.events().is_empty());

        guard.mark_handled();
        guard.release();
        assert_eq!(guard.state(), GuardState::RejectedHandled);
        assert!(recorder.events().is_empty());
    }

    #[tokio::test]
    async fn last_release_reports() {
        let recorder = RecordingDiagnostics::new();
        let guard = RejectionGuard::new(recorder.clone(), 0, false);

        guard.acquire();
        guard.acquire();
        guard.rejected(reason()).await;
        guard.release();
        assert_eq!(guard.state(), GuardState::RejectedUnobserved);

        guard.release();
        assert_eq!(guard.verdict().await, GuardState::RejectedUnhandled);
        assert_eq!(recorder.unhandled_rejections(), 1);
    }

    #[tokio::test]
    async fn release_inside_the_window_reports_when_it_closes() {
        let recorder = RecordingDiagnostics::new();
        let guard = RejectionGuard::new(recorder.clone(), 3, false);

        guard.acquire();
        let watcher = Arc::clone(&guard);
        let settle = tokio::spawn(async move { watcher.rejected(reason()).await });
        while guard.state() == GuardState::Pending {
            tokio::task::yield_now().await;
        }
        guard.release();
        settle.await.unwrap();

        assert_eq!(guard.state(), GuardState::RejectedUnhandled);
        assert_eq!(recorder.unhandled_rejections(), 1);
    }

    #[tokio::test]
    async fn fulfilled_is_final() {
        let recorder = RecordingDiagnostics::new();
        let guard = RejectionGuard::new(recorder.clone(), 1, false);

        guard.fulfilled();

        assert_eq!(guard.verdict().await, GuardState::Fulfilled);
        assert!(recorder.events().is_empty());
    }

    #[test]
    fn derived_guard_is_unhandled_and_pending() {
        let guard = RejectionGuard::new(Arc::new(TracingDiagnostics), 1, true);
        let child = guard.derive();
        assert_eq!(child.state(), GuardState::Pending);
        assert!(!child.handled.load(Ordering::SeqCst));
        assert_eq!(child.handles.load(Ordering::SeqCst), 0);
    }
}
