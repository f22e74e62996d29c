//! Request lifecycle driver between a transport backend and the route table.
//!
//! The transport thread owns every connection write and both stream timers.
//! Handlers run on work queues; their completions are marshalled back through
//! the transport work queue before touching a connection, so per-connection
//! writes are strictly serialized without per-connection locks.
//!
//! Event streams live in an active-streams map walked by two timers: a short
//! one-shot armed per [`Server::dispatch_events`] signal that coalesces
//! bursts of player updates into one push, and a periodic heartbeat that
//! writes a comment frame and reaps connections whose write fails.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_channel::Sender;
use http::StatusCode;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::error::ApiError;
use crate::events::{EventDispatcher, EventSet};
use crate::filter::{ExecuteHandlerFilter, RequestFilter, RequestFilterChain};
use crate::request::Request;
use crate::response::{
    content_type_for_path, EventStreamSource, HeaderVec, Response, ResponseKind,
};
use crate::router::{RouteResult, Router};
use crate::runtime_config::RuntimeConfig;
use crate::timer::Timer;
use crate::work_queue::{WorkQueue, WorkQueueExt};

use super::core::{RequestCore, SerializedResponse, ServerCore};

/// Everything a server instance needs to start serving.
pub struct ServerConfig {
    pub port: u16,
    /// Accept connections from non-loopback addresses.
    pub allow_remote: bool,
    pub router: Arc<Router>,
    /// Middleware run around every handler, in registration order.
    pub filters: Vec<Box<dyn RequestFilter>>,
    pub runtime: RuntimeConfig,
}

/// One in-flight request: the parsed model plus its connection handle.
///
/// Moves between threads as a unit; only the thread currently processing the
/// request touches it.
struct RequestContext {
    request: Request,
    core: Box<dyn RequestCore>,
    /// Clone of the server's destroyed-signal sender, so teardown completes
    /// only once every in-flight context is gone.
    _alive: Sender<()>,
}

struct StreamContext {
    core: Box<dyn RequestCore>,
    source: Box<dyn EventStreamSource>,
    last_event: Option<Value>,
    _alive: Sender<()>,
}

/// Transport-independent request engine.
pub struct Server {
    core: Arc<dyn ServerCore>,
    router: Arc<Router>,
    chain: Arc<RequestFilterChain>,
    dispatcher: EventDispatcher,
    transport_queue: Arc<dyn WorkQueue>,
    /// Active event-stream connections. Touched only on the transport thread.
    streams: Mutex<HashMap<u64, StreamContext>>,
    next_stream_id: AtomicU64,
    dispatch_timer: Arc<dyn Timer>,
    ping_timer: Arc<dyn Timer>,
    dispatch_delay: Duration,
    destroyed: Sender<()>,
}

impl Server {
    /// Wire the engine to `core`, bind the listening socket and arm the
    /// stream heartbeat.
    ///
    /// `destroyed` disconnects once the server and every context it created
    /// are gone; [`super::ServerThread`] waits on it before rebinding.
    pub fn create(
        core: Arc<dyn ServerCore>,
        config: ServerConfig,
        destroyed: Sender<()>,
    ) -> io::Result<Arc<Self>> {
        let port = config.port;
        let allow_remote = config.allow_remote;
        let ping_interval = config.runtime.ping_interval;

        let factory = core.timer_factory();
        let transport_queue = core.work_queue();

        let server = Arc::new_cyclic(|weak: &Weak<Server>| {
            let on_dispatch = weak.clone();
            let dispatch_timer = factory.create_timer(Box::new(move || {
                if let Some(server) = on_dispatch.upgrade() {
                    server.push_stream_updates();
                }
            }));
            let on_ping = weak.clone();
            let ping_timer = factory.create_timer(Box::new(move || {
                if let Some(server) = on_ping.upgrade() {
                    server.ping_streams();
                }
            }));

            let mut chain = RequestFilterChain::new();
            for filter in config.filters {
                chain.add_filter(filter);
            }
            chain.add_filter(Box::new(ExecuteHandlerFilter));

            Server {
                core: Arc::clone(&core),
                router: config.router,
                chain: Arc::new(chain),
                dispatcher: EventDispatcher::new(),
                transport_queue,
                streams: Mutex::new(HashMap::new()),
                next_stream_id: AtomicU64::new(0),
                dispatch_timer,
                ping_timer,
                dispatch_delay: config.runtime.event_dispatch_delay,
                destroyed,
            }
        });

        let on_request = Arc::downgrade(&server);
        server
            .core
            .set_request_callback(Box::new(move |request_core| {
                match on_request.upgrade() {
                    Some(server) => server.handle_request(request_core),
                    None => {
                        let mut request_core = request_core;
                        request_core.abort();
                    }
                }
            }));
        server.core.bind(port, allow_remote)?;
        server.ping_timer.run_periodic(ping_interval);
        Ok(server)
    }

    /// Run the transport event loop until [`Server::exit`].
    pub fn run(&self) {
        self.core.run();
    }

    /// Ask the transport loop to return. Callable from any thread.
    pub fn exit(&self) {
        self.core.exit();
    }

    /// The dispatcher player backends publish change events through.
    #[must_use]
    pub fn event_dispatcher(&self) -> EventDispatcher {
        self.dispatcher.clone()
    }

    /// Publish change events and schedule a push to active event streams.
    ///
    /// Callable from any thread. Signals arriving while the dispatch timer is
    /// already armed coalesce into the pending push.
    pub fn dispatch_events(&self, events: EventSet) {
        self.dispatcher.dispatch(events);
        if !self.dispatch_timer.is_active() {
            self.dispatch_timer.run_once(self.dispatch_delay);
        }
    }

    /// Entry point for every incoming request, on the transport thread.
    ///
    /// Builds the request model synchronously; parse and route failures are
    /// answered right here, everything else is enqueued on the route's work
    /// queue (or the transport queue when the route names none).
    fn handle_request(self: &Arc<Self>, core: Box<dyn RequestCore>) {
        let mut body = None;
        let mut parse_error = None;
        if let Some(bytes) = core.body() {
            if !bytes.is_empty() {
                match serde_json::from_slice::<Value>(&bytes) {
                    Ok(value) => body = Some(value),
                    Err(err) => {
                        debug!(error = %err, "request body is not valid JSON");
                        parse_error = Some(ApiError::invalid_request("malformed request body"));
                    }
                }
            }
        }

        let mut request = Request::new(
            core.method(),
            core.path(),
            core.headers(),
            core.query_params(),
            body,
        );
        debug!(
            request_id = %request.id,
            method = %request.method,
            path = %request.path,
            "request received"
        );

        if let Some(err) = parse_error {
            finish_with_error(&mut request, err);
        } else {
            match self.router.dispatch(&request.method, &request.path) {
                RouteResult::Matched { target, params } => request.set_route(target, params),
                RouteResult::Options => {
                    request.set_response(Response::ok());
                    request.set_processed();
                }
                RouteResult::Error(err) => finish_with_error(&mut request, err),
            }
        }

        let ctx = RequestContext {
            request,
            core,
            _alive: self.destroyed.clone(),
        };
        if ctx.request.is_processed() {
            self.process_response(ctx);
            return;
        }

        let queue = ctx
            .request
            .target()
            .and_then(|t| t.work_queue.as_ref().map(Arc::clone))
            .unwrap_or_else(|| Arc::clone(&self.transport_queue));
        let chain = Arc::clone(&self.chain);
        let server = Arc::downgrade(self);
        // Weak so a task parked in the queue cannot keep the transport alive.
        let transport = Arc::downgrade(&self.transport_queue);
        queue.push(move || {
            let mut ctx = ctx;
            chain.run(&mut ctx.request);
            match transport.upgrade() {
                Some(transport) => transport.push(move || {
                    let mut ctx = ctx;
                    match server.upgrade() {
                        Some(server) => server.process_response(ctx),
                        None => ctx.core.abort(),
                    }
                }),
                None => ctx.core.abort(),
            }
        });
    }

    /// Deliver the request's response, recursing through wrapper kinds.
    fn process_response(self: &Arc<Self>, mut ctx: RequestContext) {
        let Some(response) = ctx.request.take_response() else {
            warn!(request_id = %ctx.request.id, "request completed without a response");
            ctx.core.abort();
            return;
        };
        let Response { kind, headers } = response;
        match kind {
            ResponseKind::Async(future) => {
                let server = Arc::downgrade(self);
                let transport = Arc::downgrade(&self.transport_queue);
                future.then(move |mut inner| {
                    // Outer layers win on conflicting header names.
                    inner.absorb_outer_headers(&headers);
                    let Some(transport) = transport.upgrade() else {
                        let mut ctx = ctx;
                        ctx.core.abort();
                        return;
                    };
                    transport.push(move || {
                        let mut ctx = ctx;
                        match server.upgrade() {
                            Some(server) => {
                                ctx.request.set_response(inner);
                                server.process_response(ctx);
                            }
                            // Stale completion after teardown: nothing left
                            // to write to.
                            None => ctx.core.abort(),
                        }
                    });
                });
            }
            ResponseKind::EventStream(source) => self.register_stream(ctx, source, headers),
            kind => {
                let serialized = serialize_response(kind, headers);
                ctx.core.send_response(serialized);
            }
        }
    }

    /// Open an event-stream connection: headers, first event, registration.
    fn register_stream(
        &self,
        ctx: RequestContext,
        mut source: Box<dyn EventStreamSource>,
        headers: HeaderVec,
    ) {
        let RequestContext {
            request,
            mut core,
            _alive,
        } = ctx;

        let mut head = SerializedResponse {
            status: StatusCode::OK,
            headers,
            body: Vec::new(),
        };
        head.headers
            .retain(|(k, _)| !k.eq_ignore_ascii_case("content-type"));
        head.headers
            .push((Arc::from("Content-Type"), "text/event-stream".to_string()));
        set_default_header(&mut head, "Cache-Control", "no-cache");
        core.send_response_begin(head);

        let first = source.next_event();
        if let Some(event) = &first {
            if let Some(frame) = sse_frame(event) {
                if !core.send_response_body(&frame) {
                    core.abort();
                    return;
                }
            }
        }

        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        debug!(request_id = %request.id, stream_id = id, "event stream opened");
        self.streams.lock().insert(
            id,
            StreamContext {
                core,
                source,
                last_event: first,
                _alive,
            },
        );
    }

    /// Dispatch-timer body: poll every stream source once, pushing only
    /// payloads that differ from the last one sent on that connection.
    fn push_stream_updates(&self) {
        self.sweep_streams(|stream| {
            let Some(event) = stream.source.next_event() else {
                return true;
            };
            if stream.last_event.as_ref() == Some(&event) {
                return true;
            }
            let delivered = match sse_frame(&event) {
                Some(frame) => stream.core.send_response_body(&frame),
                None => true,
            };
            stream.last_event = Some(event);
            delivered
        });
    }

    /// Heartbeat-timer body: a comment frame keeps intermediaries from
    /// timing the connection out and surfaces dead sockets.
    fn ping_streams(&self) {
        self.sweep_streams(|stream| stream.core.send_response_body(b": ping\n\n"));
    }

    /// Run `push` over every active stream, reaping those whose write fails.
    ///
    /// The map lock is released while sources are polled and writes happen,
    /// so a source may call back into the server (dispatch, even opening a
    /// new stream) without deadlocking on the map.
    fn sweep_streams<F>(&self, mut push: F)
    where
        F: FnMut(&mut StreamContext) -> bool,
    {
        let taken: Vec<(u64, StreamContext)> = self.streams.lock().drain().collect();
        let mut survivors = Vec::with_capacity(taken.len());
        for (id, mut stream) in taken {
            if push(&mut stream) {
                survivors.push((id, stream));
            } else {
                debug!(stream_id = id, "event stream client gone; reaping");
                stream.core.abort();
            }
        }
        self.streams.lock().extend(survivors);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.dispatch_timer.stop();
        self.ping_timer.stop();
        // Streams still alive at teardown get an orderly end-of-stream, not
        // an abort; the client sees a closed stream, not a broken one.
        let mut streams = self.streams.lock();
        for (_, mut stream) in streams.drain() {
            stream.core.send_response_end();
        }
    }
}

fn finish_with_error(request: &mut Request, err: ApiError) {
    request.set_response(Response::error(err));
    request.set_processed();
}

fn set_default_header(out: &mut SerializedResponse, name: &str, value: &str) {
    if !out
        .headers
        .iter()
        .any(|(k, _)| k.eq_ignore_ascii_case(name))
    {
        out.headers.push((Arc::from(name), value.to_string()));
    }
}

fn set_error_payload(out: &mut SerializedResponse, err: &ApiError) {
    out.status = err.status();
    out.body = serde_json::to_vec(&err.to_body()).unwrap_or_default();
    set_default_header(out, "Content-Type", "application/json");
}

fn sse_frame(event: &Value) -> Option<Vec<u8>> {
    match serde_json::to_string(event) {
        Ok(json) => Some(format!("data: {json}\n\n").into_bytes()),
        Err(err) => {
            error!(error = %err, "failed to serialize event payload");
            None
        }
    }
}

/// Render a concrete response kind to bytes.
///
/// A handler-set `Content-Type` header always wins over the kind's default.
fn serialize_response(kind: ResponseKind, headers: HeaderVec) -> SerializedResponse {
    let mut out = SerializedResponse {
        status: StatusCode::OK,
        headers,
        body: Vec::new(),
    };
    match kind {
        ResponseKind::Simple(status) => out.status = status,
        ResponseKind::Json(value) => match serde_json::to_vec(&value) {
            Ok(body) => {
                out.body = body;
                set_default_header(&mut out, "Content-Type", "application/json");
            }
            Err(err) => {
                error!(error = %err, "failed to serialize JSON response");
                set_error_payload(&mut out, &ApiError::internal("failed to serialize response"));
            }
        },
        ResponseKind::Data {
            bytes,
            content_type,
        } => {
            out.body = bytes;
            set_default_header(&mut out, "Content-Type", &content_type);
        }
        ResponseKind::File { path, content_type } => match std::fs::read(&path) {
            Ok(bytes) => {
                out.body = bytes;
                let content_type = content_type
                    .unwrap_or_else(|| content_type_for_path(&path).to_string());
                set_default_header(&mut out, "Content-Type", &content_type);
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                set_error_payload(&mut out, &ApiError::not_found("file not found"));
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to read response file");
                set_error_payload(&mut out, &ApiError::internal("failed to read file"));
            }
        },
        ResponseKind::Error(err) => set_error_payload(&mut out, &err),
        // Wrapper kinds are unwrapped before serialization; reaching here is
        // a logic error upstream.
        ResponseKind::Async(_) | ResponseKind::EventStream(_) => {
            set_error_payload(
                &mut out,
                &ApiError::internal("response kind cannot be serialized"),
            );
        }
    }
    out
}
