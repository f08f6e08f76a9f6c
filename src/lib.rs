//! # gale
//!
//! A fast and extensible HTTP/1.1 server-and-client framework for building
//! microservices.
//!
//! The server side parses HTTP/1.1 off raw byte streams, routes requests
//! through a middleware-composed radix tree to user handlers, and writes
//! responses with streaming, file-serving, and connection-hijacking
//! support. The client side keeps pooled per-host connections with
//! retry/backoff, service discovery, and load balancing behind a pluggable
//! middleware chain.
//!
//! ## A minimal server
//!
//! ```no_run
//! use gale::{handler, Context, Engine, ServerOptions};
//! use http::StatusCode;
//!
//! fn hello(cx: &mut Context) -> gale::BoxFuture<'_, ()> {
//!     Box::pin(async move {
//!         let name = cx.param("name").to_owned();
//!         cx.string(StatusCode::OK, format!("hello {}", name));
//!     })
//! }
//!
//! #[tokio::main]
//! async fn main() -> gale::Result<()> {
//!     let mut engine = Engine::new(ServerOptions::default());
//!     engine.get("/hello/:name", handler(hello));
//!     engine.run().await
//! }
//! ```

mod body;
pub mod client;
mod common;
mod context;
pub mod discovery;
mod engine;
mod error;
pub mod fs;
mod headers;
pub mod netio;
mod protocol;
mod proto;
mod request;
mod response;
mod route;
pub mod server;
pub mod tracer;

pub use crate::body::Body;
pub use crate::common::BoxFuture;
pub use crate::context::{
    handler, Context, ErrorTag, Handler, HandlerFn, HandlersChain, HijackHandler, TaggedError,
    ABORT_INDEX,
};
pub use crate::engine::{ContinueHandler, Engine, RouteGroup};
pub use crate::error::{Error, Result};
pub use crate::headers::HeaderMap;
pub use crate::netio::Conn;
pub use crate::protocol::{ProtocolServer, H2C_PREFACE};
pub use crate::request::Request;
pub use crate::response::{Response, ResponseWriter};
pub use crate::route::Params;
pub use crate::server::{Network, ServerOptions};
