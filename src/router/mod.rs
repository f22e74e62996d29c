//! URL router: trie of path segments with per-method handler slots.
//!
//! Templates are `/`-separated segments. A segment starting with `:` binds a
//! parameter; a parameter ending in `*` is a greedy terminal capturing the
//! remainder of the path verbatim, including `/`:
//!
//! ```text
//! api/player                    literal route
//! api/playlists/:plref/items    one bound parameter
//! api/browser/roots/:path*      greedy tail (file-browser paths)
//! ```
//!
//! Matching walks the trie depth-first. Literal children are tried before
//! parameter children structurally, so a more specific route wins over a
//! shallower greedy one without any priority score — keep it a trie; a
//! flattened sorted matcher silently diverges on overlapping greedy routes.
//!
//! Method resolution happens after the path match: a matched node without a
//! handler for the request's method is a 405 (the node exists, other methods
//! are registered there), while `OPTIONS` is special-cased to succeed without
//! invoking any handler. No node at all is a 404.

mod trie;

use std::sync::Arc;

use http::Method;
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::request::Request;
use crate::response::Response;
use crate::work_queue::WorkQueue;
use trie::{TemplateSegment, TrieNode};

/// Maximum path parameters before heap allocation; remote-control routes
/// carry at most a couple.
pub const MAX_INLINE_PARAMS: usize = 8;

/// Stack-allocated parameter storage. Names are `Arc<str>` shared with the
/// trie; values are per-request path text.
pub type ParamVec = SmallVec<[(Arc<str>, String); MAX_INLINE_PARAMS]>;

/// A route's handler body.
pub type HandlerFn = Arc<dyn Fn(&mut Request) -> Result<Response, ApiError> + Send + Sync>;

/// Everything the engine needs to run a matched route.
pub struct RouteTarget {
    pub handler: HandlerFn,
    /// Queue the filter chain runs on; `None` falls back to the transport's
    /// default queue.
    pub work_queue: Option<Arc<dyn WorkQueue>>,
}

/// Outcome of routing one request.
pub enum RouteResult {
    Matched {
        target: Arc<RouteTarget>,
        params: ParamVec,
    },
    /// `OPTIONS` on an existing path: succeed without a handler.
    Options,
    Error(ApiError),
}

/// Trie-backed router mapping (method, path) to handlers.
pub struct Router {
    root: TrieNode,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    #[must_use]
    pub fn new() -> Self {
        Router {
            root: TrieNode::root(),
        }
    }

    /// Start a builder scoped to one controller's prefix and work queue.
    pub fn define_routes(&mut self) -> RoutesBuilder<'_> {
        RoutesBuilder {
            router: self,
            prefix: String::new(),
            work_queue: None,
        }
    }

    /// Register `template` for `method`.
    ///
    /// # Panics
    ///
    /// Panics on a malformed template (a greedy `:name*` segment followed by
    /// more segments); route tables are built once at startup and a bad
    /// template is a programming error, not a runtime condition.
    pub fn define_route(&mut self, method: Method, template: &str, target: Arc<RouteTarget>) {
        let segments = parse_template(template);
        debug!(method = %method, template = %template, "route registered");
        if !self.root.insert(&segments, method.clone(), target) {
            warn!(method = %method, template = %template, "route replaced an existing handler");
        }
    }

    /// Match a concrete request path.
    #[must_use]
    pub fn dispatch(&self, method: &Method, path: &str) -> RouteResult {
        let segments: SmallVec<[&str; 8]> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();

        let mut params = ParamVec::new();
        let Some(node) = self.root.find(&segments, &mut params) else {
            return RouteResult::Error(ApiError::not_found("no route matches the request path"));
        };

        if let Some(target) = node.target(method) {
            return RouteResult::Matched {
                target: Arc::clone(target),
                params,
            };
        }
        if *method == Method::OPTIONS {
            return RouteResult::Options;
        }
        debug!(
            method = %method,
            path = %path,
            registered = ?node.methods(),
            "path exists but method is not registered"
        );
        RouteResult::Error(ApiError::MethodNotAllowed)
    }
}

fn parse_template(template: &str) -> Vec<TemplateSegment> {
    let raw: Vec<&str> = template.split('/').filter(|s| !s.is_empty()).collect();
    let mut segments = Vec::with_capacity(raw.len());
    for (i, segment) in raw.iter().enumerate() {
        let parsed = if let Some(name) = segment.strip_prefix(':') {
            if let Some(name) = name.strip_suffix('*') {
                assert!(
                    i == raw.len() - 1,
                    "greedy parameter ':{name}*' must be the last segment of '{template}'"
                );
                TemplateSegment::Tail(Arc::from(name))
            } else {
                TemplateSegment::Param(Arc::from(name))
            }
        } else {
            TemplateSegment::Literal((*segment).to_string())
        };
        segments.push(parsed);
    }
    segments
}

/// Route registration scoped to a prefix and an optional work queue, the
/// shape every controller uses to describe itself.
pub struct RoutesBuilder<'r> {
    router: &'r mut Router,
    prefix: String,
    work_queue: Option<Arc<dyn WorkQueue>>,
}

impl RoutesBuilder<'_> {
    pub fn set_prefix(&mut self, prefix: &str) -> &mut Self {
        self.prefix = prefix.trim_matches('/').to_string();
        self
    }

    /// Run this controller's handlers on `queue` instead of the transport
    /// default (e.g. the serialized player-control queue).
    pub fn use_work_queue(&mut self, queue: Arc<dyn WorkQueue>) -> &mut Self {
        self.work_queue = Some(queue);
        self
    }

    pub fn define<H>(&mut self, method: Method, path: &str, handler: H) -> &mut Self
    where
        H: Fn(&mut Request) -> Result<Response, ApiError> + Send + Sync + 'static,
    {
        let template = if self.prefix.is_empty() {
            path.trim_matches('/').to_string()
        } else {
            format!("{}/{}", self.prefix, path.trim_matches('/'))
        };
        let target = Arc::new(RouteTarget {
            handler: Arc::new(handler),
            work_queue: self.work_queue.clone(),
        });
        self.router.define_route(method, &template, target);
        self
    }

    pub fn get<H>(&mut self, path: &str, handler: H) -> &mut Self
    where
        H: Fn(&mut Request) -> Result<Response, ApiError> + Send + Sync + 'static,
    {
        self.define(Method::GET, path, handler)
    }

    pub fn post<H>(&mut self, path: &str, handler: H) -> &mut Self
    where
        H: Fn(&mut Request) -> Result<Response, ApiError> + Send + Sync + 'static,
    {
        self.define(Method::POST, path, handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    fn router_with(routes: &[(Method, &str)]) -> Router {
        let mut router = Router::new();
        for (method, template) in routes {
            let template_owned = (*template).to_string();
            router.define_route(
                method.clone(),
                template,
                Arc::new(RouteTarget {
                    handler: Arc::new(move |_req| {
                        Ok(Response::json(serde_json::json!({ "route": template_owned })))
                    }),
                    work_queue: None,
                }),
            );
        }
        router
    }

    fn matched_params(result: RouteResult) -> ParamVec {
        match result {
            RouteResult::Matched { params, .. } => params,
            RouteResult::Options => panic!("expected a handler match, got OPTIONS shortcut"),
            RouteResult::Error(err) => panic!("expected a handler match, got {err}"),
        }
    }

    fn param<'p>(params: &'p ParamVec, name: &str) -> &'p str {
        params
            .iter()
            .find(|(k, _)| k.as_ref() == name)
            .map(|(_, v)| v.as_str())
            .unwrap_or_else(|| panic!("param {name} not captured"))
    }

    #[test]
    fn literal_and_param_capture() {
        let router = router_with(&[
            (Method::GET, "param/:p"),
            (Method::GET, "lparam/:p*"),
        ]);

        let params = matched_params(router.dispatch(&Method::GET, "/param/hello"));
        assert_eq!(param(&params, "p"), "hello");

        let params = matched_params(router.dispatch(&Method::GET, "/lparam/hello/world"));
        assert_eq!(param(&params, "p"), "hello/world");
    }

    #[test]
    fn deeper_literal_prefix_beats_shallower_greedy() {
        let router = router_with(&[
            (Method::GET, ":path*"),
            (Method::GET, "prefix/:path*"),
            (Method::GET, "prefix/nested/:path*"),
        ]);

        let params = matched_params(router.dispatch(&Method::GET, "/prefix/nested/foo"));
        assert_eq!(param(&params, "path"), "foo");

        let params = matched_params(router.dispatch(&Method::GET, "/prefix/foo"));
        assert_eq!(param(&params, "path"), "foo");

        let params = matched_params(router.dispatch(&Method::GET, "/foo"));
        assert_eq!(param(&params, "path"), "foo");
    }

    #[test]
    fn backtracks_past_a_dead_literal_branch() {
        let router = router_with(&[
            (Method::GET, "files/special/manifest"),
            (Method::GET, "files/:path*"),
        ]);

        // "special" matches the literal child but that branch has no terminal
        // for this path; the walk must fall back to the greedy sibling.
        let params = matched_params(router.dispatch(&Method::GET, "/files/special/other"));
        assert_eq!(param(&params, "path"), "special/other");
    }

    #[test]
    fn method_mismatch_is_405_only_when_path_exists() {
        let router = router_with(&[(Method::GET, "api/player")]);

        match router.dispatch(&Method::POST, "/api/player") {
            RouteResult::Error(err) => assert_eq!(err.status(), StatusCode::METHOD_NOT_ALLOWED),
            _ => panic!("expected 405"),
        }
        match router.dispatch(&Method::POST, "/api/unknown") {
            RouteResult::Error(err) => assert_eq!(err.status(), StatusCode::NOT_FOUND),
            _ => panic!("expected 404"),
        }
    }

    #[test]
    fn options_succeeds_without_a_handler() {
        let router = router_with(&[(Method::GET, "api/player")]);
        assert!(matches!(
            router.dispatch(&Method::OPTIONS, "/api/player"),
            RouteResult::Options
        ));
    }

    #[test]
    fn greedy_tail_matches_empty_remainder() {
        let router = router_with(&[(Method::GET, "browser/roots/:path*")]);
        let params = matched_params(router.dispatch(&Method::GET, "/browser/roots"));
        assert_eq!(param(&params, "path"), "");
    }

    #[test]
    fn builder_applies_prefix() {
        let mut router = Router::new();
        router
            .define_routes()
            .set_prefix("/api/playlists")
            .get(":plref/items/:range", |_req| Ok(Response::ok()));

        let params =
            matched_params(router.dispatch(&Method::GET, "/api/playlists/p1/items/0:100"));
        assert_eq!(param(&params, "plref"), "p1");
        assert_eq!(param(&params, "range"), "0:100");
    }
}
