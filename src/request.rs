//! The request model handed to filters and handlers.
//!
//! A [`Request`] is owned exclusively by the context that created it until it
//! completes; nothing here is shared across threads concurrently, so the
//! accessors take plain `&self`/`&mut self`.
//!
//! Typed parameter extraction looks through three sources with fixed
//! precedence: route params, then query params, then the JSON body. A
//! missing required parameter is a 400 "parameter is required"; a present
//! but unparsable one is a 400 "invalid value format".

use http::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::ApiError;
use crate::ids::RequestId;
use crate::response::{HeaderVec, Response};
use crate::router::{ParamVec, RouteTarget};
use std::sync::Arc;

/// One in-flight HTTP request.
pub struct Request {
    pub id: RequestId,
    pub method: Method,
    pub path: String,
    headers: HeaderVec,
    route_params: ParamVec,
    query_params: ParamVec,
    body: Option<Value>,
    target: Option<Arc<RouteTarget>>,
    response: Option<Response>,
    processed: bool,
}

impl Request {
    #[must_use]
    pub fn new(
        method: Method,
        path: impl Into<String>,
        headers: HeaderVec,
        query_params: ParamVec,
        body: Option<Value>,
    ) -> Self {
        Request {
            id: RequestId::new(),
            method,
            path: path.into(),
            headers,
            route_params: ParamVec::new(),
            query_params,
            body,
            target: None,
            response: None,
            processed: false,
        }
    }

    /// Attach the routing result: matched handler plus captured params.
    pub fn set_route(&mut self, target: Arc<RouteTarget>, params: ParamVec) {
        self.target = Some(target);
        self.route_params = params;
    }

    #[must_use]
    pub fn target(&self) -> Option<&Arc<RouteTarget>> {
        self.target.as_ref()
    }

    /// Header lookup, case-insensitive per RFC 7230.
    #[must_use]
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    /// Required typed parameter; route > query > body precedence.
    pub fn param<T: DeserializeOwned>(&self, key: &str) -> Result<T, ApiError> {
        match self.find_param(key) {
            Some(source) => source.parse(key),
            None => Err(ApiError::param_required(key)),
        }
    }

    /// Optional typed parameter. Absence yields `default`; a present value
    /// that fails to parse is still a 400.
    pub fn optional_param<T: DeserializeOwned>(
        &self,
        key: &str,
        default: T,
    ) -> Result<T, ApiError> {
        match self.find_param(key) {
            Some(source) => source.parse(key),
            None => Ok(default),
        }
    }

    fn find_param(&self, key: &str) -> Option<ParamSource<'_>> {
        if let Some((_, v)) = self.route_params.iter().rfind(|(k, _)| k.as_ref() == key) {
            return Some(ParamSource::Text(v));
        }
        if let Some((_, v)) = self.query_params.iter().rfind(|(k, _)| k.as_ref() == key) {
            return Some(ParamSource::Text(v));
        }
        match self.body.as_ref() {
            Some(Value::Object(map)) => map.get(key).map(ParamSource::Json),
            _ => None,
        }
    }

    /// Store the response produced for this request.
    pub fn set_response(&mut self, response: Response) {
        self.response = Some(response);
    }

    #[must_use]
    pub fn take_response(&mut self) -> Option<Response> {
        self.response.take()
    }

    #[must_use]
    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    /// Mark the request processed. Set-once: returns `true` only for the
    /// call that performed the transition, so completion work cannot run
    /// twice.
    pub fn set_processed(&mut self) -> bool {
        let first = !self.processed;
        self.processed = true;
        first
    }

    #[must_use]
    pub fn is_processed(&self) -> bool {
        self.processed
    }
}

enum ParamSource<'a> {
    /// Route or query segment: untyped text, parsed leniently.
    Text(&'a str),
    /// Already-typed JSON body field.
    Json(&'a Value),
}

impl ParamSource<'_> {
    fn parse<T: DeserializeOwned>(&self, key: &str) -> Result<T, ApiError> {
        match self {
            // Try the text as a JSON literal first ("5", "true", "[1,2]"),
            // then as a bare string so `T = String` works for plain text.
            ParamSource::Text(text) => serde_json::from_str(text)
                .or_else(|_| serde_json::from_value(Value::String((*text).to_string())))
                .map_err(|_| ApiError::param_invalid(key)),
            ParamSource::Json(value) => {
                serde_json::from_value((*value).clone()).map_err(|_| ApiError::param_invalid(key))
            }
        }
    }
}
