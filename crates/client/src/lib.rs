//! A micro HTTP and WebSocket client core
//!
//! This crate builds immutable request descriptions, dispatches them blocking or asynchronously
//! on one shared worker pool, composes in-flight requests through an explicit [`Promise`] type,
//! and manages long-lived WebSocket sessions with ordered event delivery.
//!
//! Network I/O is not part of the crate. Sockets, TLS, DNS, connection pooling and every wire
//! codec sit behind the [`Transport`] trait, which callers implement or obtain elsewhere.
//!
//! # Features
//!
//! - Ordered, case-insensitive header store with add and replace semantics
//! - Staging request builder that reports construction errors synchronously
//! - Blocking and promise-based dispatch sharing one execution path
//! - `then_apply`, `then_accept`, `then_compose` and `then_combine` continuations
//! - Cancellation and per-request timeouts
//! - WebSocket sessions whose listener sees frames strictly in arrival order
//!
//! # Example
//!
//! ```no_run
//! use micro_client::response::handlers;
//! use micro_client::transport::Transport;
//! use micro_client::{Client, ClientError, Request};
//!
//! fn fetch_both(transport: impl Transport) -> Result<(), ClientError> {
//!     let client = Client::new(transport);
//!
//!     let todo = Request::builder_with("https://jsonplaceholder.typicode.com/todos/1").get().build()?;
//!     let post = Request::builder_with("https://jsonplaceholder.typicode.com/posts")
//!         .post()
//!         .headers(&["Content-Type", "application/json", "Accept", "application/json"])
//!         .body(r#"{"title":"foo"}"#)
//!         .build()?;
//!
//!     let first = client.send_async(&todo, handlers::string()).then_apply(|response| response.into_body());
//!     let second = client.send_async(&post, handlers::string()).then_apply(|response| response.into_body());
//!
//!     let combined = first.then_combine(&second, |a, b| format!("{a} : {b}")).wait()?;
//!     println!("{combined}");
//!     Ok(())
//! }
//! ```

mod client;
mod utils;

pub mod error;
pub mod future;
pub mod headers;
pub mod request;
pub mod response;
pub mod transport;
pub mod websocket;

pub use client::Client;
pub use client::ClientBuilder;
pub use error::ClientError;
pub use future::Promise;
pub use future::WorkerPool;
pub use headers::HeaderStore;
pub use request::Request;
pub use request::RequestBody;
pub use request::RequestBuilder;
pub use response::Response;
pub use websocket::Listener;
pub use websocket::WebSocket;
