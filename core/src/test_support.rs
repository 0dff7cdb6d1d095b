//! Helpers shared by the unit tests.

use uuid::Uuid;

use crate::defaults::DefaultsChain;
use crate::error::{TransportError, TransportErrorKind};
use crate::http::{Body, EngineRequest, Response};
use crate::options::{normalize, EffectiveOptions, RequestOptions};

pub(crate) fn options_for(uri: &str) -> EffectiveOptions {
    normalize(&DefaultsChain::new(), RequestOptions::new(uri))
        .expect("valid options")
        .options
}

pub(crate) fn engine_request(method: &str, uri: &str) -> EngineRequest {
    options_for(uri)
        .to_engine_request(Uuid::new_v4())
        .with_method(method)
}

pub(crate) fn response(status_code: u16, body: Body) -> Response {
    Response::for_request(&engine_request("GET", "http://localhost/"), status_code, body)
}

/// Mirrors the mock server: `/{code}` answers with that status and
/// `"{METHOD} {path}"`. Port 1 refuses connections.
pub(crate) fn echo(request: &EngineRequest) -> Result<Response, TransportError> {
    if request.uri.contains(":1/") {
        return Err(TransportError::new(
            TransportErrorKind::ConnectionRefused,
            "connect ECONNREFUSED 127.0.0.1:1",
        ));
    }
    let path = request.path();
    let status = path
        .trim_start_matches('/')
        .split(['?', '/'])
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .unwrap_or(404);
    let body = Body::decode(format!("{} {path}", request.method).as_bytes(), request.json);
    Ok(Response::for_request(request, status, body))
}

impl EngineRequest {
    fn with_method(mut self, method: &str) -> Self {
        self.method = method.to_string();
        self
    }
}
