//! Values a dispatched request can fulfill with.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::http::{Body, Response};

/// Fulfillment value of a dispatched request.
///
/// Without a transform this is the body, or the full response when
/// `resolve_with_full_response` is set. A transform may return any variant.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Fulfillment {
    Body(Body),
    Response(Arc<Response>),
    Value(Value),
}

impl Fulfillment {
    pub fn text(text: impl Into<String>) -> Self {
        Fulfillment::Body(Body::Text(text.into()))
    }

    /// Text of a `Body::Text` fulfillment.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Fulfillment::Body(body) => body.as_text(),
            _ => None,
        }
    }

    pub fn as_body(&self) -> Option<&Body> {
        match self {
            Fulfillment::Body(body) => Some(body),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&Response> {
        match self {
            Fulfillment::Response(response) => Some(response),
            _ => None,
        }
    }

    /// JSON payload of a `Value` fulfillment or a JSON body.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Fulfillment::Value(value) => Some(value),
            Fulfillment::Body(body) => body.as_json(),
            Fulfillment::Response(_) => None,
        }
    }
}

impl From<Body> for Fulfillment {
    fn from(body: Body) -> Self {
        Fulfillment::Body(body)
    }
}

impl From<Value> for Fulfillment {
    fn from(value: Value) -> Self {
        Fulfillment::Value(value)
    }
}
