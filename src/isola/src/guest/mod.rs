//! The wasmtime-backed guest runtime.
//!
//! `template` holds the process-wide compiled interpreter image and the
//! epoch ticker driving interruption; `instance` owns one store per
//! sandbox; `host_calls` is the import surface the guest reaches back
//! through.

pub(crate) mod host_calls;
pub(crate) mod instance;
pub(crate) mod template;

pub(crate) use instance::{GuestInstance, RunControl};
pub(crate) use template::Template;
