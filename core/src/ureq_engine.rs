//! Blocking `ureq` agent behind the callback-style engine contract.
//!
//! # Design
//! Each request runs on tokio's blocking pool. Status codes are never errors
//! at this layer (`http_status_as_error(false)`); classification happens in
//! the dispatcher. The body is read in chunks so listeners see `Data` events
//! before the exchange completes. A streamed request body is pulled from its
//! stream on the blocking thread and sent chunked.

use std::io::{self, Read};

use bytes::{Buf, Bytes};
use futures::executor::{block_on_stream, BlockingStream};
use futures::stream::BoxStream;
use ureq::{Agent, RequestBuilder, ResponseExt, SendBody};

use crate::engine::{EngineCallback, EventEmitter, RequestEngine};
use crate::error::{TransportError, TransportErrorKind};
use crate::http::{Body, EngineRequest, RequestBody, RequestMeta, Response};

const CHUNK_SIZE: usize = 8192;

#[derive(Debug, Clone)]
pub struct UreqEngine {
    agent: Agent,
}

impl UreqEngine {
    pub fn new() -> Self {
        let agent = Agent::config_builder()
            .http_status_as_error(false)
            .build()
            .new_agent();
        Self { agent }
    }

    /// Use a preconfigured agent. It should keep `http_status_as_error` off,
    /// otherwise error statuses surface as transport failures.
    pub fn with_agent(agent: Agent) -> Self {
        Self { agent }
    }
}

impl Default for UreqEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestEngine for UreqEngine {
    fn request(&self, request: EngineRequest, events: EventEmitter, done: EngineCallback) {
        let agent = self.agent.clone();
        tokio::task::spawn_blocking(move || done(execute(&agent, &request, &events)));
    }
}

fn execute(
    agent: &Agent,
    request: &EngineRequest,
    events: &EventEmitter,
) -> Result<Response, TransportError> {
    let payload = match &request.body {
        Some(RequestBody::Stream(stream)) => match stream.take() {
            Some(chunks) => Some(Payload::Streamed(StreamReader::new(chunks))),
            None => {
                return Err(TransportError::new(
                    TransportErrorKind::Other,
                    "request body stream was already consumed",
                ))
            }
        },
        Some(body) => Some(Payload::Buffered(
            body.encode(request.json)
                .map_err(|err| TransportError::new(TransportErrorKind::Other, err.to_string()))?,
        )),
        None => None,
    };
    let uri = request.uri.as_str();

    let outcome = match request.method.as_str() {
        "GET" | "HEAD" | "DELETE" | "OPTIONS" | "TRACE" => {
            if payload.is_some() {
                tracing::warn!(method = %request.method, "request body ignored for bodyless method");
            }
            match request.method.as_str() {
                "GET" => prepare(agent.get(uri), request).call(),
                "HEAD" => prepare(agent.head(uri), request).call(),
                "DELETE" => prepare(agent.delete(uri), request).call(),
                "OPTIONS" => prepare(agent.options(uri), request).call(),
                _ => prepare(agent.trace(uri), request).call(),
            }
        }
        "POST" | "PUT" | "PATCH" => {
            let builder = match request.method.as_str() {
                "POST" => agent.post(uri),
                "PUT" => agent.put(uri),
                _ => agent.patch(uri),
            };
            let mut builder = prepare(builder, request);
            if payload.is_some() && request.json && request.header("content-type").is_none() {
                builder = builder.header("content-type", "application/json");
            }
            match payload {
                Some(Payload::Buffered(bytes)) => builder.send(&bytes[..]),
                Some(Payload::Streamed(mut reader)) => builder.send(SendBody::from_reader(&mut reader)),
                None => builder.send_empty(),
            }
        }
        other => {
            return Err(TransportError::new(
                TransportErrorKind::UnsupportedMethod,
                format!("method {other} is not supported by this engine"),
            ))
        }
    };

    let mut response = outcome.map_err(map_error)?;
    let status_code = response.status().as_u16();
    let final_uri = response.get_uri().to_string();
    let headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect();
    events.response(status_code, &headers);

    let mut raw = Vec::new();
    let mut reader = response.body_mut().as_reader();
    let mut chunk = [0u8; CHUNK_SIZE];
    loop {
        let read = reader.read(&mut chunk).map_err(TransportError::from)?;
        if read == 0 {
            break;
        }
        raw.extend_from_slice(&chunk[..read]);
        if events.has_listeners() {
            events.data(Bytes::copy_from_slice(&chunk[..read]));
        }
    }
    tracing::debug!(status = status_code, bytes = raw.len(), "body read");

    Ok(Response {
        status_code,
        headers,
        body: Body::decode(&raw, request.json),
        request: RequestMeta {
            uri: final_uri,
            ..request.meta()
        },
    })
}

enum Payload {
    Buffered(Vec<u8>),
    Streamed(StreamReader),
}

/// Blocking `Read` over a stream of chunks.
struct StreamReader {
    chunks: BlockingStream<BoxStream<'static, Bytes>>,
    current: Bytes,
}

impl StreamReader {
    fn new(chunks: BoxStream<'static, Bytes>) -> Self {
        Self {
            chunks: block_on_stream(chunks),
            current: Bytes::new(),
        }
    }
}

impl Read for StreamReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.current.is_empty() {
            match self.chunks.next() {
                Some(chunk) => self.current = chunk,
                None => return Ok(0),
            }
        }
        let read = buf.len().min(self.current.len());
        buf[..read].copy_from_slice(&self.current[..read]);
        self.current.advance(read);
        Ok(read)
    }
}

fn prepare<B>(mut builder: RequestBuilder<B>, request: &EngineRequest) -> RequestBuilder<B> {
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if request.json && request.header("accept").is_none() {
        builder = builder.header("accept", "application/json");
    }
    for (name, value) in &request.query {
        builder = builder.query(name, value);
    }
    let mut config = builder.config();
    if !request.follow_redirect {
        config = config.max_redirects(0);
    }
    if let Some(timeout) = request.timeout {
        config = config.timeout_global(Some(timeout));
    }
    config.build()
}

fn map_error(err: ureq::Error) -> TransportError {
    let message = err.to_string();
    let kind = match err {
        ureq::Error::Io(io) => return TransportError::from(io),
        ureq::Error::ConnectionFailed => TransportErrorKind::ConnectionRefused,
        ureq::Error::HostNotFound => TransportErrorKind::HostNotFound,
        ureq::Error::Timeout(_) => TransportErrorKind::Timeout,
        ureq::Error::BadUri(_) => TransportErrorKind::InvalidUri,
        ureq::Error::TooManyRedirects => TransportErrorKind::TooManyRedirects,
        _ => TransportErrorKind::Other,
    };
    TransportError::new(kind, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_keep_their_kind() {
        let err = map_error(ureq::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        )));
        assert_eq!(err.kind, TransportErrorKind::ConnectionRefused);
    }

    #[test]
    fn ureq_error_kinds_map() {
        assert_eq!(map_error(ureq::Error::HostNotFound).kind, TransportErrorKind::HostNotFound);
        assert_eq!(
            map_error(ureq::Error::TooManyRedirects).kind,
            TransportErrorKind::TooManyRedirects
        );
        assert_eq!(
            map_error(ureq::Error::BadUri("nope".into())).kind,
            TransportErrorKind::InvalidUri
        );
    }

    #[test]
    fn stream_reader_spans_chunks() {
        use futures::StreamExt;

        let chunks = futures::stream::iter([
            Bytes::from_static(b"hel"),
            Bytes::new(),
            Bytes::from_static(b"lo"),
        ]);
        let mut reader = StreamReader::new(chunks.boxed());
        let mut buf = [0u8; 2];
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf, b"he");

        let mut rest = String::new();
        reader.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "llo");
    }

    #[tokio::test]
    async fn consumed_stream_body_is_a_transport_error() {
        let engine = UreqEngine::new();
        let mut request = crate::test_support::engine_request("POST", "http://127.0.0.1:1/");
        let body = RequestBody::stream(futures::stream::empty::<Bytes>());
        if let RequestBody::Stream(stream) = &body {
            let _ = stream.take();
        }
        request.body = Some(body);
        let (tx, rx) = tokio::sync::oneshot::channel();
        engine.request(
            request,
            EventEmitter::detached(),
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        );
        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::Other);
        assert!(err.message.contains("already consumed"), "{}", err.message);
    }

    #[tokio::test]
    async fn unknown_methods_are_rejected_without_io() {
        let engine = UreqEngine::new();
        let mut request = crate::test_support::engine_request("GET", "http://127.0.0.1:1/");
        request.method = "BREW".into();
        let (tx, rx) = tokio::sync::oneshot::channel();
        engine.request(
            request,
            EventEmitter::detached(),
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        );
        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::UnsupportedMethod);
    }
}
