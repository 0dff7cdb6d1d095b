use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::any,
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpListener;

/// Shared counters for a running server instance.
#[derive(Clone, Debug, Default)]
pub struct AppState {
    hits: Arc<AtomicU64>,
}

impl AppState {
    /// Number of requests served so far, redirects included.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::SeqCst)
    }

    fn record(&self) {
        self.hits.fetch_add(1, Ordering::SeqCst);
    }
}

/// JSON description of a request, returned by `/echo`.
#[derive(Clone, Debug, Serialize)]
pub struct Echo {
    pub method: String,
    pub url: String,
    pub headers: serde_json::Map<String, Value>,
    pub body: Value,
}

pub fn app() -> Router {
    app_with_state(AppState::default())
}

pub fn app_with_state(state: AppState) -> Router {
    Router::new()
        .route("/echo", any(echo))
        .fallback(echo_status)
        .with_state(state)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    run_with_state(listener, AppState::default()).await
}

pub async fn run_with_state(listener: TcpListener, state: AppState) -> Result<(), std::io::Error> {
    axum::serve(listener, app_with_state(state)).await
}

fn path_of(uri: &Uri) -> &str {
    uri.path_and_query().map(|p| p.as_str()).unwrap_or("/")
}

/// `/{code}` answers with that status and `"{METHOD} {path}"` as the body.
/// Redirect codes point at `/200`; anything unparseable is a 404.
async fn echo_status(State(state): State<AppState>, method: Method, uri: Uri) -> Response {
    state.record();
    let body = format!("{method} {}", path_of(&uri));
    let status = uri
        .path()
        .trim_start_matches('/')
        .parse::<u16>()
        .ok()
        .filter(|code| *code >= 200)
        .and_then(|code| StatusCode::from_u16(code).ok());

    tracing::debug!(%method, path = %uri.path(), ?status, "echo");

    match status {
        Some(status) if status.is_redirection() => {
            (status, [(header::LOCATION, "/200")], body).into_response()
        }
        Some(status) => (status, body).into_response(),
        None => (StatusCode::NOT_FOUND, body).into_response(),
    }
}

async fn echo(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Echo> {
    state.record();
    let headers = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), Value::String(v.to_string())))
        })
        .collect();
    let body = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()))
    };
    Json(Echo {
        method: method.to_string(),
        url: path_of(&uri).to_string(),
        headers,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_of_keeps_query() {
        let uri: Uri = "/200?a=1".parse().unwrap();
        assert_eq!(path_of(&uri), "/200?a=1");
    }

    #[test]
    fn path_of_defaults_to_root() {
        let uri: Uri = "http://localhost".parse().unwrap();
        assert_eq!(path_of(&uri), "/");
    }

    #[test]
    fn state_counts_hits() {
        let state = AppState::default();
        let clone = state.clone();
        clone.record();
        clone.record();
        assert_eq!(state.hits(), 2);
    }

    #[test]
    fn echo_serializes_to_json() {
        let echo = Echo {
            method: "POST".to_string(),
            url: "/echo".to_string(),
            headers: serde_json::Map::new(),
            body: serde_json::json!({"a": 1}),
        };
        let json = serde_json::to_value(&echo).unwrap();
        assert_eq!(json["method"], "POST");
        assert_eq!(json["body"]["a"], 1);
    }
}
