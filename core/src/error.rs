//! Error types for the dispatcher.
//!
//! # Design
//! Three layers of failure are kept apart:
//! - `OptionsError` is returned synchronously by `Dispatcher::request` when the
//!   call cannot even be issued. It never reaches a future.
//! - `TransportError` is what a `RequestEngine` reports when no response was
//!   obtained.
//! - `RequestError` is the rejection reason carried by a settled future. It
//!   wraps the transport error, a rejected status code, or a failed transform,
//!   together with the effective options used for the call.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::http::{Body, Response};
use crate::options::EffectiveOptions;

/// Errors raised while turning caller options into an issuable request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptionsError {
    #[error("options.uri is a required argument")]
    MissingUri,

    #[error("options.uri must be a path when using options.baseUrl, got {0:?}")]
    AbsoluteUriWithBaseUrl(String),

    #[error("method {0:?} is not a valid HTTP token")]
    InvalidMethod(String),

    #[error("options must be a string or an object, got {0}")]
    InvalidShape(&'static str),

    #[error("options.{field} must be {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },

    /// Neither a runtime set on the dispatcher nor an ambient one.
    #[error("no tokio runtime to drive the request; call from within a runtime or set one on the dispatcher")]
    NoRuntime,
}

/// Broad category of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    ConnectionRefused,
    HostNotFound,
    Timeout,
    InvalidUri,
    TooManyRedirects,
    UnsupportedMethod,
    Io,
    /// The engine dropped its completion callback without answering.
    Aborted,
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransportErrorKind::ConnectionRefused => "connection refused",
            TransportErrorKind::HostNotFound => "host not found",
            TransportErrorKind::Timeout => "timed out",
            TransportErrorKind::InvalidUri => "invalid uri",
            TransportErrorKind::TooManyRedirects => "too many redirects",
            TransportErrorKind::UnsupportedMethod => "unsupported method",
            TransportErrorKind::Io => "i/o error",
            TransportErrorKind::Aborted => "aborted",
            TransportErrorKind::Other => "transport error",
        };
        f.write_str(label)
    }
}

/// Failure to obtain any response from the request engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub(crate) fn missing_uri() -> Self {
        Self::new(
            TransportErrorKind::InvalidUri,
            OptionsError::MissingUri.to_string(),
        )
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::ConnectionRefused => TransportErrorKind::ConnectionRefused,
            std::io::ErrorKind::TimedOut => TransportErrorKind::Timeout,
            _ => TransportErrorKind::Io,
        };
        Self::new(kind, err.to_string())
    }
}

/// Error type a transform may fail with.
pub type TransformFailure = Arc<dyn std::error::Error + Send + Sync>;

/// User code panicked while the dispatcher was running it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("panicked: {0}")]
pub struct Panicked(pub String);

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Which kind of rejection a `RequestError` is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    Transport,
    StatusCode,
    Transform,
    Aborted,
}

/// Reason a dispatched request's future was rejected.
#[derive(Debug, Clone)]
pub enum RequestError {
    /// No response was obtained.
    Transport {
        cause: Arc<TransportError>,
        options: Arc<EffectiveOptions>,
    },

    /// A response was obtained but its status is outside 2xx under `simple`.
    StatusCode {
        status_code: u16,
        /// The response body.
        error: Body,
        options: Arc<EffectiveOptions>,
        response: Arc<Response>,
    },

    /// The transform returned an error, panicked, or its future failed.
    Transform {
        cause: TransformFailure,
        options: Arc<EffectiveOptions>,
        response: Arc<Response>,
    },

    /// A chained handler panicked, or the settlement was dropped.
    Aborted { message: String },
}

impl RequestError {
    pub(crate) fn transport(cause: TransportError, options: Arc<EffectiveOptions>) -> Self {
        RequestError::Transport {
            cause: Arc::new(cause),
            options,
        }
    }

    pub(crate) fn status_failure(response: Arc<Response>, options: Arc<EffectiveOptions>) -> Self {
        RequestError::StatusCode {
            status_code: response.status_code,
            error: response.body.clone(),
            options,
            response,
        }
    }

    pub(crate) fn transform(
        cause: TransformFailure,
        options: Arc<EffectiveOptions>,
        response: Arc<Response>,
    ) -> Self {
        RequestError::Transform {
            cause,
            options,
            response,
        }
    }

    pub(crate) fn aborted(message: impl Into<String>) -> Self {
        RequestError::Aborted {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> RejectionKind {
        match self {
            RequestError::Transport { .. } => RejectionKind::Transport,
            RequestError::StatusCode { .. } => RejectionKind::StatusCode,
            RequestError::Transform { .. } => RejectionKind::Transform,
            RequestError::Aborted { .. } => RejectionKind::Aborted,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RequestError::Transport { .. } => "RequestError",
            RequestError::StatusCode { .. } => "StatusCodeError",
            RequestError::Transform { .. } => "TransformError",
            RequestError::Aborted { .. } => "AbortError",
        }
    }

    pub fn message(&self) -> String {
        match self {
            RequestError::Transport { cause, .. } => cause.to_string(),
            RequestError::StatusCode {
                status_code, error, ..
            } => format!("{status_code} - {}", error.to_json_string()),
            RequestError::Transform { cause, .. } => cause.to_string(),
            RequestError::Aborted { message } => message.clone(),
        }
    }

    /// Numeric status of a status-code failure.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            RequestError::StatusCode { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }

    /// Response body of a status-code failure.
    pub fn error(&self) -> Option<&Body> {
        match self {
            RequestError::StatusCode { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn response(&self) -> Option<&Arc<Response>> {
        match self {
            RequestError::StatusCode { response, .. } | RequestError::Transform { response, .. } => {
                Some(response)
            }
            _ => None,
        }
    }

    /// Effective options of the call. Never contains the callback.
    pub fn options(&self) -> Option<&EffectiveOptions> {
        match self {
            RequestError::Transport { options, .. }
            | RequestError::StatusCode { options, .. }
            | RequestError::Transform { options, .. } => Some(options),
            RequestError::Aborted { .. } => None,
        }
    }

    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            RequestError::Transport { cause, .. } => Some(cause),
            _ => None,
        }
    }

    pub fn cause(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RequestError::Transport { cause, .. } => Some(cause.as_ref()),
            RequestError::Transform { cause, .. } => Some(cause.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name(), self.message())
    }
}

impl std::error::Error for RequestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause()
    }
}
