//! # tunebridge
//!
//! **tunebridge** is a transport-independent request-processing engine for
//! music-player remote-control APIs: an HTTP/JSON core that routes requests,
//! runs middleware and handlers on work queues, and streams player state
//! changes over Server-Sent Events — without owning a socket itself.
//!
//! ## Overview
//!
//! A player plugin embeds the engine by implementing two traits
//! ([`server::ServerCore`] and [`server::RequestCore`]) over whatever socket
//! machinery its host process provides, then describes its REST surface with
//! the route builder. The engine takes care of everything in between:
//! parameter extraction, the filter chain, sync/async/streaming responses,
//! event coalescing and connection lifecycle.
//!
//! ## Architecture
//!
//! - **[`router`]** - URL trie matching templates like `api/playlists/:plref`
//!   with greedy tail parameters for file-browser paths
//! - **[`request`]** / **[`response`]** - the request model with typed
//!   parameter extraction, and one response variant per delivery strategy
//! - **[`filter`]** - ordered middleware with guarded teardown; the single
//!   error boundary translating failures and panics into error responses
//! - **[`work_queue`]** - single-thread, thread-pool and host-loop-adapting
//!   FIFO queues; the serialized player-control queue is one of these
//! - **[`timer`]** - one-shot/periodic timers over a pluggable clock
//! - **[`events`]** - bitmask change-event dispatcher with polled listeners
//! - **[`server`]** - the engine itself plus the lifecycle thread that owns
//!   bind/run/teardown cycles
//! - **[`runtime_config`]** - `TUNEBRIDGE_*` environment knobs
//!
//! ## Threading
//!
//! One transport thread owns every connection write and timer. Handlers run
//! on work queues and may block there; completions are marshalled back to the
//! transport thread before touching a connection.

pub mod error;
pub mod events;
pub mod filter;
pub mod ids;
pub mod request;
pub mod response;
pub mod router;
pub mod runtime_config;
pub mod server;
pub mod timer;
pub mod work_queue;

pub use error::ApiError;
pub use events::{EventDispatcher, EventListener, EventSet};
pub use filter::{RequestFilter, RequestFilterChain};
pub use ids::RequestId;
pub use request::Request;
pub use response::{response_future, Response, ResponseFuture, ResponseKind, ResponsePromise};
pub use router::{RouteResult, RouteTarget, Router, RoutesBuilder};
pub use runtime_config::RuntimeConfig;
pub use server::{Server, ServerConfig, ServerThread};
pub use work_queue::{ExternalWorkQueue, ThreadPoolWorkQueue, ThreadWorkQueue, WorkQueue};
