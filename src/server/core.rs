//! Traits a transport backend implements to host the engine.
//!
//! The engine never opens a socket itself. A backend provides a
//! [`ServerCore`] (the listening side plus its event loop, work queue and
//! timers) and hands each incoming connection to the engine as a
//! [`RequestCore`]. All engine-initiated writes happen through these traits
//! on the transport thread.

use std::io;
use std::sync::Arc;

use http::{Method, StatusCode};

use crate::response::HeaderVec;
use crate::router::ParamVec;
use crate::timer::TimerFactory;
use crate::work_queue::WorkQueue;

/// A fully serialized response ready to be written to a connection.
pub struct SerializedResponse {
    pub status: StatusCode,
    pub headers: HeaderVec,
    pub body: Vec<u8>,
}

/// Callback the engine registers to receive incoming requests.
pub type RequestCallback = Box<dyn Fn(Box<dyn RequestCore>) + Send + Sync>;

/// One incoming connection, owned by the engine until it responds.
pub trait RequestCore: Send {
    fn method(&self) -> Method;
    /// Request path without the query string.
    fn path(&self) -> String;
    fn headers(&self) -> HeaderVec;
    fn query_params(&self) -> ParamVec;
    /// Raw request body, if the client sent one.
    fn body(&self) -> Option<Vec<u8>>;

    /// Drop the connection without a response.
    fn abort(&mut self);

    /// Write a complete response and close.
    fn send_response(&mut self, response: SerializedResponse);

    /// Begin a streaming response: status and headers, body left open.
    fn send_response_begin(&mut self, response: SerializedResponse);

    /// Write one body chunk. `false` means the client is gone; the engine
    /// reaps the connection.
    fn send_response_body(&mut self, data: &[u8]) -> bool;

    /// Close a streaming response. The engine calls this for every stream
    /// still open when the server shuts down.
    fn send_response_end(&mut self);
}

/// The listening side of a transport backend.
///
/// `run` blocks on the backend's event loop until `exit` is called from any
/// thread; between them the backend delivers requests to the registered
/// callback on the transport thread.
pub trait ServerCore: Send + Sync {
    /// Queue that marshals work onto the transport thread.
    fn work_queue(&self) -> Arc<dyn WorkQueue>;

    /// Timers firing on the transport thread.
    fn timer_factory(&self) -> Arc<dyn TimerFactory>;

    fn set_request_callback(&self, callback: RequestCallback);

    fn bind(&self, port: u16, allow_remote: bool) -> io::Result<()>;

    fn run(&self);

    fn exit(&self);
}

/// Decode an URL query string into parameter pairs.
///
/// Percent-decoding and `+`-as-space follow form-urlencoded rules; repeated
/// keys are all kept, and the parameter lookup takes the last one.
#[must_use]
pub fn parse_query_string(query: &str) -> ParamVec {
    url::form_urlencoded::parse(query.as_bytes())
        .map(|(key, value)| (Arc::from(key.as_ref()), value.into_owned()))
        .collect()
}
