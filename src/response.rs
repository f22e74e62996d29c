//! Response model: one tagged variant per delivery strategy.
//!
//! Exactly one kind is active per response. Transport-facing consumers match
//! on [`ResponseKind`] exhaustively, so adding a kind is a compile-time event
//! for every serializer, not a runtime surprise.
//!
//! [`ResponseFuture`] is the async member of the family: a handler returns
//! `Response::deferred(...)` immediately and completes the promise from any
//! thread later. The engine chains a continuation that re-enters response
//! processing on the transport queue — continuations here only hand the value
//! over, they never touch transport state on the producer thread.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use http::StatusCode;
use parking_lot::Mutex;
use serde_json::Value;
use smallvec::SmallVec;
use tracing::warn;

use crate::error::ApiError;

/// Maximum inline headers before heap allocation; most responses carry a few.
pub const MAX_INLINE_HEADERS: usize = 8;

/// Stack-allocated header storage. Names are `Arc<str>` because the same
/// names recur constantly; values are per-response data.
pub type HeaderVec = SmallVec<[(Arc<str>, String); MAX_INLINE_HEADERS]>;

/// Pull source feeding an event-stream response.
///
/// Polled by the engine's dispatch timer; return the current payload, or
/// `None` when there is nothing to say. The engine deduplicates consecutive
/// identical payloads per connection.
pub trait EventStreamSource: Send {
    fn next_event(&mut self) -> Option<Value>;
}

impl<F: FnMut() -> Option<Value> + Send> EventStreamSource for F {
    fn next_event(&mut self) -> Option<Value> {
        self()
    }
}

/// The active delivery strategy of a [`Response`].
pub enum ResponseKind {
    /// Status only, empty body.
    Simple(StatusCode),
    /// Raw bytes with an explicit content type.
    Data {
        bytes: Vec<u8>,
        content_type: String,
    },
    /// File streamed from disk; content type sniffed from the extension
    /// unless set explicitly.
    File {
        path: PathBuf,
        content_type: Option<String>,
    },
    /// 200 with a JSON body.
    Json(Value),
    /// Long-lived `text/event-stream` connection fed by a pull source.
    EventStream(Box<dyn EventStreamSource>),
    /// Wraps a future of another response; unwrapped recursively until a
    /// concrete kind is reached, merging headers from every layer.
    Async(ResponseFuture),
    /// Error payload rendered as `{"error": {...}}` with the mapped status.
    Error(ApiError),
}

/// A response plus the headers attached at this wrapping layer.
pub struct Response {
    pub kind: ResponseKind,
    pub headers: HeaderVec,
}

impl Response {
    fn from_kind(kind: ResponseKind) -> Self {
        Response {
            kind,
            headers: HeaderVec::new(),
        }
    }

    /// 204 with no body; the usual result of a player mutation.
    #[must_use]
    pub fn ok() -> Self {
        Self::from_kind(ResponseKind::Simple(StatusCode::NO_CONTENT))
    }

    #[must_use]
    pub fn simple(status: StatusCode) -> Self {
        Self::from_kind(ResponseKind::Simple(status))
    }

    #[must_use]
    pub fn json(body: Value) -> Self {
        Self::from_kind(ResponseKind::Json(body))
    }

    #[must_use]
    pub fn data(bytes: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self::from_kind(ResponseKind::Data {
            bytes,
            content_type: content_type.into(),
        })
    }

    #[must_use]
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::from_kind(ResponseKind::File {
            path: path.into(),
            content_type: None,
        })
    }

    #[must_use]
    pub fn event_stream(source: impl EventStreamSource + 'static) -> Self {
        Self::from_kind(ResponseKind::EventStream(Box::new(source)))
    }

    #[must_use]
    pub fn deferred(future: ResponseFuture) -> Self {
        Self::from_kind(ResponseKind::Async(future))
    }

    #[must_use]
    pub fn error(err: ApiError) -> Self {
        Self::from_kind(ResponseKind::Error(err))
    }

    /// Add or replace a header at this layer.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((Arc::from(name), value.into()));
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    #[must_use]
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Merge headers from an outer (wrapping) layer; the outer layer wins on
    /// conflicting keys. Used while unwrapping async chains.
    pub fn absorb_outer_headers(&mut self, outer: &HeaderVec) {
        for (name, value) in outer {
            self.set_header(name, value.clone());
        }
    }

    /// `true` for `Error` kinds in the 5xx range; such a response is never
    /// silently replaced by a later generic error translation.
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        match &self.kind {
            ResponseKind::Error(err) => err.is_server_error(),
            ResponseKind::Simple(status) => status.is_server_error(),
            _ => false,
        }
    }

    /// Variant name for logging.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            ResponseKind::Simple(_) => "simple",
            ResponseKind::Data { .. } => "data",
            ResponseKind::File { .. } => "file",
            ResponseKind::Json(_) => "json",
            ResponseKind::EventStream(_) => "event_stream",
            ResponseKind::Async(_) => "async",
            ResponseKind::Error(_) => "error",
        }
    }
}

// Manual Debug: event-stream sources and futures are opaque.
impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("kind", &self.kind_name())
            .field("headers", &self.headers)
            .finish()
    }
}

impl From<ApiError> for Response {
    fn from(err: ApiError) -> Self {
        Response::error(err)
    }
}

/// Content type derived from a file extension.
///
/// Covers the web UI asset types plus the artwork formats player backends
/// hand out; everything else is served as an opaque byte stream.
#[must_use]
pub fn content_type_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("ico") => "image/x-icon",
        Some("woff2") => "font/woff2",
        _ => "application/octet-stream",
    }
}

type Continuation = Box<dyn FnOnce(Response) + Send + 'static>;

enum FutureState {
    Pending,
    /// Value arrived before the continuation.
    Ready(Response),
    /// Continuation arrived before the value.
    Waiting(Continuation),
    Done,
}

struct FutureShared {
    state: Mutex<FutureState>,
}

/// Write side of a deferred response. Complete it from any thread; dropping
/// it unfulfilled resolves the future with a 500 so no request hangs.
pub struct ResponsePromise {
    shared: Arc<FutureShared>,
    completed: bool,
}

/// Read side of a deferred response; carried inside [`ResponseKind::Async`].
pub struct ResponseFuture {
    shared: Arc<FutureShared>,
}

/// Create a connected promise/future pair.
#[must_use]
pub fn response_future() -> (ResponsePromise, ResponseFuture) {
    let shared = Arc::new(FutureShared {
        state: Mutex::new(FutureState::Pending),
    });
    (
        ResponsePromise {
            shared: Arc::clone(&shared),
            completed: false,
        },
        ResponseFuture { shared },
    )
}

impl ResponsePromise {
    /// Resolve the future. A failed production becomes a recoverable error
    /// response, never a propagating panic across the thread boundary.
    pub fn complete(mut self, result: Result<Response, ApiError>) {
        self.completed = true;
        let response = match result {
            Ok(response) => response,
            Err(err) => Response::error(err),
        };
        Self::deliver(&self.shared, response);
    }

    fn deliver(shared: &Arc<FutureShared>, response: Response) {
        let continuation = {
            let mut state = shared.state.lock();
            match std::mem::replace(&mut *state, FutureState::Done) {
                FutureState::Pending => {
                    *state = FutureState::Ready(response);
                    return;
                }
                FutureState::Waiting(continuation) => Some((continuation, response)),
                // Double delivery: first value wins.
                other => {
                    *state = other;
                    None
                }
            }
        };
        if let Some((continuation, response)) = continuation {
            continuation(response);
        }
    }
}

impl Drop for ResponsePromise {
    fn drop(&mut self) {
        if !self.completed {
            warn!("response promise dropped without completion");
            Self::deliver(
                &self.shared,
                Response::error(ApiError::internal("deferred response was abandoned")),
            );
        }
    }
}

impl ResponseFuture {
    /// Register the single continuation. Runs immediately on the calling
    /// thread when the value is already there, otherwise later on whatever
    /// thread completes the promise.
    pub fn then<F: FnOnce(Response) + Send + 'static>(self, continuation: F) {
        let ready = {
            let mut state = self.shared.state.lock();
            match std::mem::replace(&mut *state, FutureState::Done) {
                FutureState::Pending => {
                    *state = FutureState::Waiting(Box::new(continuation));
                    return;
                }
                FutureState::Ready(response) => response,
                other => {
                    *state = other;
                    warn!("response future continuation registered twice; ignored");
                    return;
                }
            }
        };
        continuation(ready);
    }
}
