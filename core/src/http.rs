//! HTTP exchange types shared between the dispatcher and request engines.
//!
//! # Design
//! Requests and responses are plain owned data. The dispatcher builds an
//! `EngineRequest` from the effective options, hands it to a `RequestEngine`,
//! and receives a `Response` back. Engines never see dispatcher state.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::channel::mpsc;
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::{Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

/// Writable half of a streamed request body. Dropping it ends the body.
pub type BodyWriter = mpsc::Sender<Bytes>;

/// Request body produced chunk by chunk while the request is in flight.
///
/// Clones share the same stream, which can be sent once; a second send finds
/// it consumed.
#[derive(Clone)]
pub struct BodyStream(Arc<Mutex<Option<BoxStream<'static, Bytes>>>>);

impl BodyStream {
    pub fn new<S>(chunks: S) -> Self
    where
        S: Stream<Item = Bytes> + Send + 'static,
    {
        Self(Arc::new(Mutex::new(Some(chunks.boxed()))))
    }

    /// Take the chunks out, leaving the stream consumed.
    pub fn take(&self) -> Option<BoxStream<'static, Bytes>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take()
    }

    pub fn is_consumed(&self) -> bool {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).is_none()
    }
}

impl fmt::Debug for BodyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyStream")
            .field("consumed", &self.is_consumed())
            .finish()
    }
}

impl PartialEq for BodyStream {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Serialize for BodyStream {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("<stream>")
    }
}

/// Body of a request, as configured by the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RequestBody {
    Text(String),
    Json(Value),
    Bytes(Vec<u8>),
    /// Sent as-is, chunk by chunk; never JSON-encoded.
    Stream(BodyStream),
}

impl RequestBody {
    pub fn stream<S>(chunks: S) -> Self
    where
        S: Stream<Item = Bytes> + Send + 'static,
    {
        RequestBody::Stream(BodyStream::new(chunks))
    }

    /// A streamed body fed through the returned writer. `capacity` bounds the
    /// chunks buffered ahead of the engine.
    pub fn channel(capacity: usize) -> (BodyWriter, Self) {
        let (writer, chunks) = mpsc::channel(capacity);
        (writer, Self::stream(chunks))
    }

    /// Encode for the wire. JSON mode serializes text bodies as JSON strings.
    /// A stream has no buffered encoding; engines send it chunk by chunk.
    pub fn encode(&self, json: bool) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            RequestBody::Text(text) if json => serde_json::to_vec(text),
            RequestBody::Text(text) => Ok(text.as_bytes().to_vec()),
            RequestBody::Json(value) => serde_json::to_vec(value),
            RequestBody::Bytes(bytes) => Ok(bytes.clone()),
            RequestBody::Stream(_) => Err(<serde_json::Error as serde::ser::Error>::custom(
                "a streamed body cannot be encoded up front",
            )),
        }
    }
}

impl From<&str> for RequestBody {
    fn from(text: &str) -> Self {
        RequestBody::Text(text.to_string())
    }
}

impl From<String> for RequestBody {
    fn from(text: String) -> Self {
        RequestBody::Text(text)
    }
}

impl From<Value> for RequestBody {
    fn from(value: Value) -> Self {
        RequestBody::Json(value)
    }
}

/// Decoded response body.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(untagged)]
pub enum Body {
    #[default]
    Empty,
    Text(String),
    Json(Value),
    /// Payload that is not UTF-8, kept byte for byte.
    Bytes(Bytes),
}

impl Body {
    /// Decode raw bytes. In JSON mode the body is parsed, falling back to text
    /// when it is not valid JSON; anything that is not UTF-8 stays raw.
    pub fn decode(raw: &[u8], json: bool) -> Self {
        if raw.is_empty() {
            return Body::Empty;
        }
        if json {
            if let Ok(value) = serde_json::from_slice(raw) {
                return Body::Json(value);
            }
        }
        match std::str::from_utf8(raw) {
            Ok(text) => Body::Text(text.to_string()),
            Err(_) => Body::Bytes(Bytes::copy_from_slice(raw)),
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Body::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Wire form of the body: text and raw bytes as they arrived, JSON
    /// re-serialized.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Body::Empty => Bytes::new(),
            Body::Text(text) => Bytes::copy_from_slice(text.as_bytes()),
            Body::Json(value) => Bytes::from(value.to_string()),
            Body::Bytes(bytes) => bytes.clone(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Body::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Body::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }

    /// JSON rendering used in error messages: text is quoted, empty is `""`.
    pub fn to_json_string(&self) -> String {
        match self {
            Body::Empty => "\"\"".to_string(),
            Body::Text(text) => Value::String(text.clone()).to_string(),
            Body::Json(value) => value.to_string(),
            Body::Bytes(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()).to_string(),
        }
    }
}

impl fmt::Display for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => Ok(()),
            Body::Text(text) => f.write_str(text),
            Body::Json(value) => write!(f, "{value}"),
            Body::Bytes(bytes) => f.write_str(&String::from_utf8_lossy(bytes)),
        }
    }
}

/// Read-only description of the request that produced a response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestMeta {
    pub id: Uuid,
    pub method: String,
    /// Final URI, after any redirects the engine followed.
    pub uri: String,
    pub headers: Vec<(String, String)>,
}

/// A completed HTTP exchange.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub body: Body,
    pub request: RequestMeta,
}

impl Response {
    /// Build a response for `request` that did not move (no redirects).
    pub fn for_request(request: &EngineRequest, status_code: u16, body: Body) -> Self {
        Self {
            status_code,
            headers: Vec::new(),
            body,
            request: request.meta(),
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A request as handed to a `RequestEngine`.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineRequest {
    pub id: Uuid,
    /// Upper-cased method.
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Option<RequestBody>,
    /// Serialize the body as JSON and parse the response as JSON.
    pub json: bool,
    pub timeout: Option<Duration>,
    pub follow_redirect: bool,
    /// Engine-specific fields, forwarded untouched.
    pub extra: serde_json::Map<String, Value>,
}

impl EngineRequest {
    pub fn meta(&self) -> RequestMeta {
        RequestMeta {
            id: self.id,
            method: self.method.clone(),
            uri: self.uri.clone(),
            headers: self.headers.clone(),
        }
    }

    /// The path and query of `uri`, or the whole `uri` if it has no authority.
    pub fn path(&self) -> &str {
        match self.uri.split_once("://") {
            Some((_, rest)) => rest.find('/').map_or("/", |at| &rest[at..]),
            None => &self.uri,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}
