//! Per-call options and their normalization.
//!
//! # Design
//! `RequestOptions` is the caller-facing partial record: every field is
//! optional so that defaults layers and per-call options can be overlaid key by
//! key. `normalize` composes the layers onto a fresh record and resolves it
//! into `EffectiveOptions`, the fully specified configuration of one call.
//! Nothing here mutates a layer; every call works on its own copy.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::defaults::DefaultsChain;
use crate::error::{OptionsError, TransportError};
use crate::http::{Body, EngineRequest, RequestBody, Response};
use crate::transform::Transform;

/// Caller callback, invoked with the raw engine outcome.
pub type CallbackFn =
    dyn Fn(Option<&TransportError>, Option<&Response>, Option<&Body>) + Send + Sync;

/// Shareable handle to a caller callback.
#[derive(Clone)]
pub struct Callback(Arc<CallbackFn>);

impl Callback {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Option<&TransportError>, Option<&Response>, Option<&Body>) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub(crate) fn call(
        &self,
        error: Option<&TransportError>,
        response: Option<&Response>,
        body: Option<&Body>,
    ) {
        (self.0)(error, response, body)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Callback(..)")
    }
}

/// A boolean option as supplied by the caller. Anything that is not a
/// boolean resolves to the option's default.
#[derive(Debug, Clone, PartialEq)]
pub enum Flag {
    Bool(bool),
    Malformed(Value),
}

impl Flag {
    pub fn resolve(&self, default: bool) -> bool {
        match self {
            Flag::Bool(value) => *value,
            Flag::Malformed(_) => default,
        }
    }

    fn from_json(value: &Value) -> Self {
        match value {
            Value::Bool(value) => Flag::Bool(*value),
            other => Flag::Malformed(other.clone()),
        }
    }
}

impl From<bool> for Flag {
    fn from(value: bool) -> Self {
        Flag::Bool(value)
    }
}

fn resolve_flag(flag: &Option<Flag>, default: bool) -> bool {
    flag.as_ref().map_or(default, |f| f.resolve(default))
}

/// Partial options for one call or one defaults layer.
#[derive(Clone, Default)]
pub struct RequestOptions {
    pub uri: Option<String>,
    /// Alias of `uri`; `uri` wins when both are set.
    pub url: Option<String>,
    pub base_url: Option<String>,
    pub method: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub qs: BTreeMap<String, String>,
    pub body: Option<RequestBody>,
    pub json: Option<bool>,
    pub timeout: Option<Duration>,
    pub follow_redirect: Option<Flag>,
    pub simple: Option<Flag>,
    pub resolve_with_full_response: Option<Flag>,
    pub transform_2xx_only: Option<Flag>,
    pub transform: Option<Transform>,
    pub callback: Option<Callback>,
    /// Unknown fields, forwarded verbatim to the engine.
    pub extra: Map<String, Value>,
}

impl RequestOptions {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: Some(uri.into()),
            ..Self::default()
        }
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.qs.insert(name.into(), value.into());
        self
    }

    pub fn body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn json(mut self, json: bool) -> Self {
        self.json = Some(json);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn follow_redirect(mut self, follow: bool) -> Self {
        self.follow_redirect = Some(Flag::Bool(follow));
        self
    }

    pub fn simple(mut self, simple: bool) -> Self {
        self.simple = Some(Flag::Bool(simple));
        self
    }

    pub fn resolve_with_full_response(mut self, full: bool) -> Self {
        self.resolve_with_full_response = Some(Flag::Bool(full));
        self
    }

    pub fn transform_2xx_only(mut self, only: bool) -> Self {
        self.transform_2xx_only = Some(Flag::Bool(only));
        self
    }

    pub fn transform(mut self, transform: Transform) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn callback<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<&TransportError>, Option<&Response>, Option<&Body>) + Send + Sync + 'static,
    {
        self.callback = Some(Callback::new(f));
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Build options from a dynamic value: a string is a URI, an object is an
    /// options bag with the usual camelCase keys.
    ///
    /// Known keys are type-checked, except the boolean flags which fall back to
    /// their defaults. `transform` and `callback` cannot be expressed in JSON
    /// and are ignored. Unknown keys land in `extra`.
    pub fn from_json(value: &Value) -> Result<Self, OptionsError> {
        let object = match value {
            Value::String(uri) => return Ok(Self::new(uri.clone())),
            Value::Object(object) => object,
            Value::Null => return Err(OptionsError::InvalidShape("null")),
            Value::Bool(_) => return Err(OptionsError::InvalidShape("a boolean")),
            Value::Number(_) => return Err(OptionsError::InvalidShape("a number")),
            Value::Array(_) => return Err(OptionsError::InvalidShape("an array")),
        };

        let mut options = Self::default();
        for (key, value) in object {
            match key.as_str() {
                "uri" => options.uri = Some(expect_string("uri", value)?),
                "url" => options.url = Some(expect_string("url", value)?),
                "baseUrl" => options.base_url = Some(expect_string("baseUrl", value)?),
                "method" => options.method = Some(expect_string("method", value)?),
                "headers" => options.headers = expect_string_map("headers", value)?,
                "qs" => options.qs = expect_string_map("qs", value)?,
                "body" => {
                    options.body = Some(match value {
                        Value::String(text) => RequestBody::Text(text.clone()),
                        other => RequestBody::Json(other.clone()),
                    })
                }
                "json" => match value {
                    Value::Bool(json) => options.json = Some(*json),
                    Value::Null => {}
                    body => {
                        options.json = Some(true);
                        options.body = Some(RequestBody::Json(body.clone()));
                    }
                },
                "timeout" => {
                    let millis = value.as_u64().ok_or(OptionsError::InvalidField {
                        field: "timeout",
                        expected: "a non-negative number of milliseconds",
                    })?;
                    options.timeout = Some(Duration::from_millis(millis));
                }
                "followRedirect" => options.follow_redirect = Some(Flag::from_json(value)),
                "simple" => options.simple = Some(Flag::from_json(value)),
                "resolveWithFullResponse" => {
                    options.resolve_with_full_response = Some(Flag::from_json(value))
                }
                "transform2xxOnly" => options.transform_2xx_only = Some(Flag::from_json(value)),
                "transform" | "callback" => {
                    tracing::debug!(key = %key, "ignoring non-function option");
                }
                _ => {
                    options.extra.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(options)
    }

    /// Overlay `layer` on top of `self`, key by key. Map-valued fields merge
    /// per entry.
    pub fn overlay(mut self, layer: &RequestOptions) -> Self {
        fn pick<T: Clone>(base: &mut Option<T>, over: &Option<T>) {
            if over.is_some() {
                base.clone_from(over);
            }
        }

        pick(&mut self.uri, &layer.uri);
        pick(&mut self.url, &layer.url);
        pick(&mut self.base_url, &layer.base_url);
        pick(&mut self.method, &layer.method);
        pick(&mut self.body, &layer.body);
        pick(&mut self.json, &layer.json);
        pick(&mut self.timeout, &layer.timeout);
        pick(&mut self.follow_redirect, &layer.follow_redirect);
        pick(&mut self.simple, &layer.simple);
        pick(&mut self.resolve_with_full_response, &layer.resolve_with_full_response);
        pick(&mut self.transform_2xx_only, &layer.transform_2xx_only);
        pick(&mut self.transform, &layer.transform);
        pick(&mut self.callback, &layer.callback);
        self.headers
            .extend(layer.headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.qs
            .extend(layer.qs.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.extra
            .extend(layer.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("uri", &self.uri)
            .field("url", &self.url)
            .field("base_url", &self.base_url)
            .field("method", &self.method)
            .field("headers", &self.headers)
            .field("qs", &self.qs)
            .field("body", &self.body)
            .field("json", &self.json)
            .field("timeout", &self.timeout)
            .field("follow_redirect", &self.follow_redirect)
            .field("simple", &self.simple)
            .field("resolve_with_full_response", &self.resolve_with_full_response)
            .field("transform_2xx_only", &self.transform_2xx_only)
            .field("transform", &self.transform)
            .field("callback", &self.callback.is_some())
            .field("extra", &self.extra)
            .finish()
    }
}

impl From<&str> for RequestOptions {
    fn from(uri: &str) -> Self {
        Self::new(uri)
    }
}

impl From<String> for RequestOptions {
    fn from(uri: String) -> Self {
        Self::new(uri)
    }
}

impl From<&String> for RequestOptions {
    fn from(uri: &String) -> Self {
        Self::new(uri.clone())
    }
}

fn expect_string(field: &'static str, value: &Value) -> Result<String, OptionsError> {
    value.as_str().map(str::to_string).ok_or(OptionsError::InvalidField {
        field,
        expected: "a string",
    })
}

fn expect_string_map(
    field: &'static str,
    value: &Value,
) -> Result<BTreeMap<String, String>, OptionsError> {
    let invalid = OptionsError::InvalidField {
        field,
        expected: "an object of strings",
    };
    let object = value.as_object().ok_or_else(|| invalid.clone())?;
    object
        .iter()
        .map(|(k, v)| match v {
            Value::String(s) => Ok((k.clone(), s.clone())),
            Value::Number(n) => Ok((k.clone(), n.to_string())),
            Value::Bool(b) => Ok((k.clone(), b.to_string())),
            _ => Err(invalid.clone()),
        })
        .collect()
}

/// Fully resolved configuration of one call. The callback is not part of it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectiveOptions {
    /// Final URI; empty only when the call carries a callback and no URI.
    pub uri: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub qs: BTreeMap<String, String>,
    pub body: Option<RequestBody>,
    pub json: bool,
    pub timeout_ms: Option<u64>,
    pub follow_redirect: bool,
    pub simple: bool,
    pub resolve_with_full_response: bool,
    pub transform_2xx_only: bool,
    #[serde(skip)]
    pub transform: Option<Transform>,
    pub extra: Map<String, Value>,
}

impl EffectiveOptions {
    pub fn to_engine_request(&self, id: Uuid) -> EngineRequest {
        EngineRequest {
            id,
            method: self.method.clone(),
            uri: self.uri.clone(),
            headers: self
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            query: self.qs.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            body: self.body.clone(),
            json: self.json,
            timeout: self.timeout_ms.map(Duration::from_millis),
            follow_redirect: self.follow_redirect,
            extra: self.extra.clone(),
        }
    }
}

/// Output of `normalize`: the effective options and the callback, if any.
#[derive(Debug, Clone)]
pub struct Normalized {
    pub options: EffectiveOptions,
    pub callback: Option<Callback>,
}

/// Compose `call` over `chain` and resolve the result.
///
/// Fails synchronously when there is no URI and no callback to report the
/// failure to.
pub fn normalize(chain: &DefaultsChain, call: RequestOptions) -> Result<Normalized, OptionsError> {
    let merged = chain.compose(call);
    let method = normalize_method(merged.method.as_deref())?;
    let uri = resolve_uri(&merged)?;
    if uri.is_empty() && merged.callback.is_none() {
        return Err(OptionsError::MissingUri);
    }

    let options = EffectiveOptions {
        uri,
        method,
        headers: merged.headers,
        qs: merged.qs,
        body: merged.body,
        json: merged.json.unwrap_or(false),
        timeout_ms: merged
            .timeout
            .map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
        follow_redirect: resolve_flag(&merged.follow_redirect, true),
        simple: resolve_flag(&merged.simple, true),
        resolve_with_full_response: resolve_flag(&merged.resolve_with_full_response, false),
        transform_2xx_only: resolve_flag(&merged.transform_2xx_only, false),
        transform: merged.transform,
        extra: merged.extra,
    };
    Ok(Normalized {
        options,
        callback: merged.callback,
    })
}

/// Upper-case `method`, defaulting to `GET`.
pub fn normalize_method(method: Option<&str>) -> Result<String, OptionsError> {
    let method = match method {
        None | Some("") => return Ok("GET".to_string()),
        Some(method) => method,
    };
    let is_token = method.bytes().all(|b| {
        b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
    });
    if !is_token {
        return Err(OptionsError::InvalidMethod(method.to_string()));
    }
    Ok(method.to_ascii_uppercase())
}

fn resolve_uri(merged: &RequestOptions) -> Result<String, OptionsError> {
    let uri = merged
        .uri
        .as_deref()
        .or(merged.url.as_deref())
        .unwrap_or_default();
    let Some(base) = merged.base_url.as_deref() else {
        return Ok(uri.to_string());
    };
    if uri.contains("://") {
        return Err(OptionsError::AbsoluteUriWithBaseUrl(uri.to_string()));
    }
    if uri.is_empty() {
        return Ok(base.to_string());
    }
    Ok(format!(
        "{}/{}",
        base.trim_end_matches('/'),
        uri.trim_start_matches('/')
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn normalize_call(call: RequestOptions) -> Result<EffectiveOptions, OptionsError> {
        normalize(&DefaultsChain::new(), call).map(|n| n.options)
    }

    #[test]
    fn string_is_uri() {
        let options = normalize_call("http://localhost/200".into()).unwrap();
        assert_eq!(options.uri, "http://localhost/200");
        assert_eq!(options.method, "GET");
        assert!(options.simple);
        assert!(!options.resolve_with_full_response);
        assert!(options.follow_redirect);
    }

    #[test]
    fn url_is_an_alias_and_uri_wins() {
        let mut call = RequestOptions::default();
        call.url = Some("http://localhost/url".into());
        assert_eq!(normalize_call(call.clone()).unwrap().uri, "http://localhost/url");

        call.uri = Some("http://localhost/uri".into());
        assert_eq!(normalize_call(call).unwrap().uri, "http://localhost/uri");
    }

    #[test]
    fn method_is_upper_cased() {
        for method in ["get", "Get", "gEt", "GET"] {
            let options = normalize_call(RequestOptions::new("http://x/").method(method)).unwrap();
            assert_eq!(options.method, "GET");
        }
        let options = normalize_call(RequestOptions::new("http://x/").method("patch")).unwrap();
        assert_eq!(options.method, "PATCH");
    }

    #[test]
    fn invalid_method_fails_synchronously() {
        let err = normalize_call(RequestOptions::new("http://x/").method("GE T")).unwrap_err();
        assert_eq!(err, OptionsError::InvalidMethod("GE T".into()));
    }

    #[test]
    fn missing_uri_without_callback_fails() {
        let err = normalize_call(RequestOptions::default()).unwrap_err();
        assert_eq!(err, OptionsError::MissingUri);
    }

    #[test]
    fn missing_uri_with_callback_is_deferred() {
        let normalized = normalize(
            &DefaultsChain::new(),
            RequestOptions::default().callback(|_, _, _| {}),
        )
        .unwrap();
        assert!(normalized.options.uri.is_empty());
        assert!(normalized.callback.is_some());
    }

    #[test]
    fn malformed_flags_fall_back_to_defaults() {
        for bad in [json!("false"), json!(0), json!(null), json!({}), json!([true])] {
            let mut call = RequestOptions::new("http://x/");
            call.simple = Some(Flag::Malformed(bad.clone()));
            call.resolve_with_full_response = Some(Flag::Malformed(bad));
            let options = normalize_call(call).unwrap();
            assert!(options.simple);
            assert!(!options.resolve_with_full_response);
        }
    }

    #[test]
    fn malformed_call_flag_overrides_layer_value() {
        let chain = DefaultsChain::new().extend(RequestOptions::default().simple(false));
        let mut call = RequestOptions::new("http://x/");
        call.simple = Some(Flag::Malformed(json!("no")));
        let options = normalize(&chain, call).unwrap().options;
        assert!(options.simple);
    }

    #[test]
    fn base_url_joins_relative_uri() {
        let call = RequestOptions::new("/200").base_url("http://localhost:3000/");
        assert_eq!(normalize_call(call).unwrap().uri, "http://localhost:3000/200");

        let call = RequestOptions::new("200").base_url("http://localhost:3000");
        assert_eq!(normalize_call(call).unwrap().uri, "http://localhost:3000/200");
    }

    #[test]
    fn base_url_rejects_absolute_uri() {
        let call = RequestOptions::new("http://other/").base_url("http://localhost");
        assert!(matches!(
            normalize_call(call),
            Err(OptionsError::AbsoluteUriWithBaseUrl(_))
        ));
    }

    #[test]
    fn from_json_reads_known_keys_and_passes_unknown_through() {
        let options = RequestOptions::from_json(&json!({
            "uri": "http://localhost/200",
            "method": "post",
            "headers": {"x-n": 1},
            "qs": {"a": "b"},
            "json": {"k": "v"},
            "timeout": 1500,
            "simple": false,
            "resolveWithFullResponse": "yes",
            "transform": "not a function",
            "agentOptions": {"keepAlive": true}
        }))
        .unwrap();
        assert_eq!(options.method.as_deref(), Some("post"));
        assert_eq!(options.headers["x-n"], "1");
        assert_eq!(options.qs["a"], "b");
        assert_eq!(options.json, Some(true));
        assert_eq!(options.body, Some(RequestBody::Json(json!({"k": "v"}))));
        assert_eq!(options.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(options.simple, Some(Flag::Bool(false)));
        assert_eq!(
            options.resolve_with_full_response,
            Some(Flag::Malformed(json!("yes")))
        );
        assert!(options.transform.is_none());
        assert_eq!(options.extra["agentOptions"], json!({"keepAlive": true}));

        let effective = normalize_call(options).unwrap();
        assert_eq!(effective.method, "POST");
        assert!(!effective.simple);
        assert!(!effective.resolve_with_full_response);
        assert_eq!(effective.timeout_ms, Some(1500));
    }

    #[test]
    fn from_json_accepts_a_bare_string() {
        let options = RequestOptions::from_json(&json!("http://localhost/200")).unwrap();
        assert_eq!(options.uri.as_deref(), Some("http://localhost/200"));
    }

    #[test]
    fn from_json_rejects_wrong_shapes() {
        assert_eq!(
            RequestOptions::from_json(&json!(42)).unwrap_err(),
            OptionsError::InvalidShape("a number")
        );
        assert_eq!(
            RequestOptions::from_json(&json!({"uri": 1})).unwrap_err(),
            OptionsError::InvalidField {
                field: "uri",
                expected: "a string"
            }
        );
        assert!(RequestOptions::from_json(&json!({"headers": {"a": []}})).is_err());
    }

    #[test]
    fn overlay_merges_maps_per_key() {
        let base = RequestOptions::default()
            .header("a", "1")
            .header("b", "1")
            .extra("x", json!(1));
        let layer = RequestOptions::default().header("b", "2").extra("y", json!(2));
        let merged = base.overlay(&layer);
        assert_eq!(merged.headers["a"], "1");
        assert_eq!(merged.headers["b"], "2");
        assert_eq!(merged.extra.len(), 2);
    }

    #[test]
    fn normalizing_does_not_touch_the_chain() {
        let chain = DefaultsChain::new().extend(RequestOptions::default().header("a", "1"));
        let first = normalize(&chain, RequestOptions::new("http://x/").header("b", "2"))
            .unwrap()
            .options;
        let second = normalize(&chain, RequestOptions::new("http://x/")).unwrap().options;
        assert_eq!(first.headers.len(), 2);
        assert_eq!(second.headers.len(), 1);
        assert_eq!(chain.layers()[0].headers.len(), 1);
    }

    #[test]
    fn engine_request_carries_options() {
        let options = normalize_call(
            RequestOptions::new("http://x/")
                .query("q", "1")
                .timeout(Duration::from_secs(2))
                .follow_redirect(false),
        )
        .unwrap();
        let request = options.to_engine_request(Uuid::nil());
        assert_eq!(request.query, vec![("q".to_string(), "1".to_string())]);
        assert_eq!(request.timeout, Some(Duration::from_secs(2)));
        assert!(!request.follow_redirect);
    }
}
