//! Server orchestration: transport traits, the request engine, and the
//! lifecycle thread.
//!
//! Transport backends implement [`ServerCore`] and [`RequestCore`]; the
//! [`Server`] drives routing, middleware, queue hops and response delivery on
//! top of them; [`ServerThread`] owns bind/run/teardown cycles so the rest of
//! the application only ever sends restart and exit commands.

mod core;
mod engine;
mod thread;

pub use self::core::{
    parse_query_string, RequestCallback, RequestCore, SerializedResponse, ServerCore,
};
pub use engine::{Server, ServerConfig};
pub use thread::{CoreFactory, ReadyCallback, ServerThread};
