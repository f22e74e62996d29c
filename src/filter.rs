//! Ordered middleware wrapped around handler execution.
//!
//! `begin_request` hooks run forward; the walk stops as soon as the request
//! becomes processed (auth rejection, cache hit, or the terminal
//! [`ExecuteHandlerFilter`] finishing the handler). Only filters whose begin
//! actually ran get their `end_request`, in reverse order, and each teardown
//! is guarded independently — one filter failing to clean up is logged and
//! never suppresses the rest.
//!
//! This is also the error boundary: handler and filter failures (including
//! panics) are converted to error responses exactly once, here. A response
//! already carrying a 5xx is never overwritten by a later generic
//! translation.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::error::ApiError;
use crate::request::Request;
use crate::response::Response;

/// A middleware stage with optional hooks around handler execution.
pub trait RequestFilter: Send + Sync {
    fn begin_request(&self, _request: &mut Request) -> Result<(), ApiError> {
        Ok(())
    }

    fn end_request(&self, _request: &mut Request) -> Result<(), ApiError> {
        Ok(())
    }
}

/// Terminal chain stage: runs the routed handler and stores its response.
pub struct ExecuteHandlerFilter;

impl RequestFilter for ExecuteHandlerFilter {
    fn begin_request(&self, request: &mut Request) -> Result<(), ApiError> {
        let Some(target) = request.target().map(Arc::clone) else {
            return Err(ApiError::internal("no handler assigned to request"));
        };
        let response = (target.handler)(request)?;
        request.set_response(response);
        request.set_processed();
        Ok(())
    }
}

/// Ordered list of filters executed around every request.
pub struct RequestFilterChain {
    filters: Vec<Box<dyn RequestFilter>>,
}

impl Default for RequestFilterChain {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestFilterChain {
    #[must_use]
    pub fn new() -> Self {
        RequestFilterChain {
            filters: Vec::new(),
        }
    }

    pub fn add_filter(&mut self, filter: Box<dyn RequestFilter>) {
        self.filters.push(filter);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Run the chain to completion on the current thread.
    ///
    /// On return the request is processed and carries a response of some
    /// kind; failures have already been translated to error responses.
    pub fn run(&self, request: &mut Request) {
        let started = Instant::now();
        let mut began = 0;

        for filter in &self.filters {
            if request.is_processed() {
                break;
            }
            began += 1;
            match Self::guarded(|| filter.begin_request(request)) {
                Ok(()) => {}
                Err(err) => {
                    Self::fail(request, err);
                    break;
                }
            }
        }

        for filter in self.filters[..began].iter().rev() {
            if let Err(err) = Self::guarded(|| filter.end_request(request)) {
                // Isolated: remaining teardowns still run.
                error!(
                    request_id = %request.id,
                    path = %request.path,
                    error = %err,
                    "filter end_request failed"
                );
            }
        }

        request.set_processed();
        if request.response().is_none() {
            warn!(
                request_id = %request.id,
                path = %request.path,
                "filter chain finished without a response"
            );
            request.set_response(Response::error(ApiError::internal(
                "request produced no response",
            )));
        }

        info!(
            request_id = %request.id,
            method = %request.method,
            path = %request.path,
            response_kind = request.response().map(Response::kind_name).unwrap_or("none"),
            latency_us = started.elapsed().as_micros() as u64,
            "filter chain complete"
        );
    }

    /// Catch both explicit errors and panics from a hook.
    fn guarded<F: FnOnce() -> Result<(), ApiError>>(hook: F) -> Result<(), ApiError> {
        match catch_unwind(AssertUnwindSafe(hook)) {
            Ok(result) => result,
            Err(panic) => {
                error!(panic_message = ?panic, "filter hook panicked");
                Err(ApiError::internal("internal error"))
            }
        }
    }

    /// Translate a failure into the request's response, unless a server
    /// error is already set.
    fn fail(request: &mut Request, err: ApiError) {
        let keep_existing = request
            .response()
            .is_some_and(Response::is_server_error);
        if !keep_existing {
            request.set_response(Response::error(err));
        }
        request.set_processed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::{HeaderVec, ResponseKind};
    use crate::router::{ParamVec, Router};
    use http::{Method, StatusCode};
    use parking_lot::Mutex;

    struct TraceFilter {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        reject: Option<ApiError>,
        fail_end: bool,
    }

    impl TraceFilter {
        fn new(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Box<Self> {
            Box::new(TraceFilter {
                name,
                log: Arc::clone(log),
                reject: None,
                fail_end: false,
            })
        }
    }

    impl RequestFilter for TraceFilter {
        fn begin_request(&self, request: &mut Request) -> Result<(), ApiError> {
            self.log.lock().push(format!("begin:{}", self.name));
            if let Some(err) = &self.reject {
                request.set_response(Response::error(err.clone()));
                request.set_processed();
            }
            Ok(())
        }

        fn end_request(&self, _request: &mut Request) -> Result<(), ApiError> {
            self.log.lock().push(format!("end:{}", self.name));
            if self.fail_end {
                return Err(ApiError::internal("teardown failed"));
            }
            Ok(())
        }
    }

    fn routed_request(handler: impl Fn(&mut Request) -> Result<Response, ApiError> + Send + Sync + 'static) -> Request {
        let mut router = Router::new();
        router.define_routes().get("test", handler);
        let mut request = Request::new(
            Method::GET,
            "/test",
            HeaderVec::new(),
            ParamVec::new(),
            None,
        );
        match router.dispatch(&Method::GET, "/test") {
            crate::router::RouteResult::Matched { target, params } => {
                request.set_route(target, params)
            }
            _ => panic!("route must match"),
        }
        request
    }

    fn chain_with(filters: Vec<Box<dyn RequestFilter>>) -> RequestFilterChain {
        let mut chain = RequestFilterChain::new();
        for filter in filters {
            chain.add_filter(filter);
        }
        chain.add_filter(Box::new(ExecuteHandlerFilter));
        chain
    }

    #[test]
    fn end_hooks_run_in_reverse_for_begun_filters_only() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain_with(vec![
            TraceFilter::new("a", &log),
            TraceFilter::new("b", &log),
        ]);

        let mut request = routed_request(|_| Ok(Response::ok()));
        chain.run(&mut request);

        assert_eq!(
            *log.lock(),
            vec!["begin:a", "begin:b", "end:b", "end:a"]
        );
        assert!(request.is_processed());
    }

    #[test]
    fn short_circuit_skips_later_filters_and_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut rejecting = TraceFilter::new("auth", &log);
        rejecting.reject = Some(ApiError::Unauthorized("bad token".into()));
        let chain = chain_with(vec![rejecting, TraceFilter::new("later", &log)]);

        let mut request = routed_request(|_| panic!("handler must not run"));
        chain.run(&mut request);

        assert_eq!(*log.lock(), vec!["begin:auth", "end:auth"]);
        match &request.response().map(|r| match &r.kind {
            ResponseKind::Error(err) => err.status(),
            _ => StatusCode::OK,
        }) {
            Some(status) => assert_eq!(*status, StatusCode::UNAUTHORIZED),
            None => panic!("expected a response"),
        }
    }

    #[test]
    fn teardown_failure_does_not_suppress_other_teardowns() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut failing = TraceFilter::new("flaky", &log);
        failing.fail_end = true;
        let chain = chain_with(vec![TraceFilter::new("outer", &log), failing]);

        let mut request = routed_request(|_| Ok(Response::ok()));
        chain.run(&mut request);

        assert_eq!(
            *log.lock(),
            vec!["begin:outer", "begin:flaky", "end:flaky", "end:outer"]
        );
    }

    #[test]
    fn handler_error_maps_to_status() {
        let chain = chain_with(vec![]);
        let mut request = routed_request(|_| Err(ApiError::not_found("no such track")));
        chain.run(&mut request);

        match request.response().map(|r| &r.kind) {
            Some(ResponseKind::Error(err)) => assert_eq!(err.status(), StatusCode::NOT_FOUND),
            _ => panic!("expected error response"),
        }
    }

    #[test]
    fn handler_panic_becomes_500() {
        let chain = chain_with(vec![]);
        let mut request = routed_request(|_| panic!("handler exploded"));
        chain.run(&mut request);

        match request.response().map(|r| &r.kind) {
            Some(ResponseKind::Error(err)) => {
                assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR)
            }
            _ => panic!("expected error response"),
        }
    }

    #[test]
    fn existing_5xx_is_not_overwritten() {
        struct PoisonFilter;
        impl RequestFilter for PoisonFilter {
            fn begin_request(&self, request: &mut Request) -> Result<(), ApiError> {
                request.set_response(Response::error(ApiError::internal("original failure")));
                Err(ApiError::invalid_request("secondary failure"))
            }
        }

        let chain = chain_with(vec![Box::new(PoisonFilter)]);
        let mut request = routed_request(|_| Ok(Response::ok()));
        chain.run(&mut request);

        match request.response().map(|r| &r.kind) {
            Some(ResponseKind::Error(err)) => {
                assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(err.to_string(), "original failure");
            }
            _ => panic!("expected error response"),
        }
    }

    #[test]
    fn double_set_processed_is_harmless() {
        struct DoubleProcess;
        impl RequestFilter for DoubleProcess {
            fn begin_request(&self, request: &mut Request) -> Result<(), ApiError> {
                request.set_response(Response::ok());
                assert!(request.set_processed());
                assert!(!request.set_processed());
                Ok(())
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain_with(vec![Box::new(DoubleProcess), TraceFilter::new("x", &log)]);
        let mut request = routed_request(|_| panic!("handler must not run"));
        chain.run(&mut request);
        assert!(log.lock().is_empty());
    }
}
