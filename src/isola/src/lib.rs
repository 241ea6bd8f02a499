//! This crate provides a WebAssembly-backed sandbox host for Python guest code.
//!
//! A [`Context`] prepares the WASI Python interpreter template once; each
//! [`Sandbox`] derived from it loads a user script, invokes named
//! functions with JSON or streaming arguments, and streams back results,
//! logs, standard I/O and error events. Guest HTTP requests are bridged
//! back into the embedder through a per-sandbox [`HttpHandler`].
#![deny(dead_code, missing_docs, unused_mut)]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]

mod args;
mod config;
mod context;
mod error;
mod event;
mod guest;
mod http;
mod metrics;
mod run;
mod sandbox;
mod stream;

/// One argument to a guest call: a JSON value or a stream of JSON values.
pub use args::RunArg;
/// A partial Context configuration.
pub use config::ContextPatch;
/// A host-path/guest-path pair granted to the guest filesystem view.
pub use config::MountConfig;
/// Permissions on a mounted directory or its files.
pub use config::MountPerms;
/// A partial Sandbox configuration.
pub use config::SandboxPatch;
/// The process-wide factory holding the guest template and shared defaults.
pub use context::Context;
/// The error type for isola operations.
pub use error::IsolaError;
/// The Result of an isola operation.
pub use error::Result;
/// A kind-tagged message emitted by the guest during a run.
pub use event::Event;
/// The callback trait for per-event delivery.
pub use event::EventHandler;
/// The kind of a guest event.
pub use event::EventKind;
/// The default outbound HTTP handler backed by `reqwest`.
pub use http::DefaultHttpHandler;
/// A response body in one of the canonical modes.
pub use http::HttpBody;
/// The handler trait guest HTTP requests are dispatched to.
pub use http::HttpHandler;
/// A guest-originated HTTP request.
pub use http::HttpRequest;
/// The handler's HTTP response.
pub use http::HttpResponse;
/// The events of one call, yielded as they arrive.
pub use run::EventStream;
/// Aggregated terminal view of one guest call.
pub use run::RunResult;
/// A per-execution sandbox with its own guest runtime and resource caps.
pub use sandbox::Sandbox;
/// Bounded JSON-payload FIFO consumed by the guest as an iterable.
pub use stream::JsonStream;
