//! Shared constants and call framing utilities for isola.
//!
//! Everything the host-side engine and the guest-side runtime shim must
//! agree on lives here: export names, the host-call op codes, event kind
//! strings, HTTP body modes, and the return-code convention of the
//! `host_call` import. The crate is `no_std` (with `alloc`) so the guest
//! runtime can depend on it when compiled for `wasm32-wasip1`.
#![no_std]
#![deny(missing_docs, unused_mut)]

/// Import module name under which the host registers its functions.
pub const HOST_MODULE: &str = "isola";

/// The single host-call entry point.
///
/// Signature on the wire:
/// `host_call(op: u32, req_ptr: u32, req_len: u32, resp_ptr: u32, resp_cap: u32) -> i64`.
///
/// The request and response are JSON envelopes in guest linear memory; the
/// return value follows the `RC_*` / grow-hint convention below.
pub const HOST_CALL: &str = "host_call";

/// Guest linear memory export.
pub const EXPORT_MEMORY: &str = "memory";
/// Guest allocator export: `isola_alloc(len: u32) -> u32`.
pub const EXPORT_ALLOC: &str = "isola_alloc";
/// WASI reactor initializer, called once after instantiation.
pub const EXPORT_INITIALIZE: &str = "_initialize";
/// Guest runtime startup: `isola_start(req_ptr, req_len, resp_ptr, resp_cap) -> i64`.
pub const EXPORT_START: &str = "isola_start";
/// Script delivery: `isola_load_script(req_ptr, req_len, resp_ptr, resp_cap) -> i64`.
pub const EXPORT_LOAD_SCRIPT: &str = "isola_load_script";
/// Function invocation: `isola_run(req_ptr, req_len, resp_ptr, resp_cap) -> i64`.
pub const EXPORT_RUN: &str = "isola_run";

// Host-call op codes. Stable; new ops append.

/// Emit a run event: `{"kind": str, "data": str?}`.
pub const OP_EMIT: u32 = 1;
/// Monotonic clock: `{}` -> `{"nanos": u64}`.
pub const OP_MONOTONIC_NOW: u32 = 2;
/// Start a timer: `{"ms": u64}` -> `{"pollable": u32}`.
pub const OP_SLEEP: u32 = 3;
/// Block until one registered pollable is ready:
/// `{"pollables": [u32]}` -> `{"ready": [u32]}`.
pub const OP_POLL_WAIT: u32 = 4;
/// Reap a ready pollable, returning its op-specific payload.
pub const OP_POLL_REAP: u32 = 5;
/// Request the next element of a stream argument:
/// `{"stream": u32}` -> `{"pollable": u32}`; the reaped payload is
/// `{"done": bool, "value": str?}`.
pub const OP_STREAM_NEXT: u32 = 6;
/// Begin an HTTP fetch; the reaped payload carries status, headers and the
/// body in one of the `BODY_*` modes.
pub const OP_HTTP_FETCH: u32 = 7;
/// Request the next chunk of a streamed HTTP body:
/// `{"source": u32}` -> `{"pollable": u32}`; the reaped payload is
/// `{"done": bool, "chunk": base64?}`.
pub const OP_HTTP_READ: u32 = 8;
/// Release a streamed HTTP body source.
pub const OP_HTTP_CLOSE: u32 = 9;
/// Reserved for the WebSocket capability.
pub const OP_WS_CONNECT: u32 = 10;

// Event kinds as emitted by the guest. The host rewrites the `*_json`
// kinds to `result` / `end` before user delivery.

/// A yielded intermediate result (JSON payload).
pub const KIND_RESULT_JSON: &str = "result_json";
/// Terminal event carrying the call's return value (JSON payload).
pub const KIND_END_JSON: &str = "end_json";
/// A line of standard output.
pub const KIND_STDOUT: &str = "stdout";
/// A line of standard error.
pub const KIND_STDERR: &str = "stderr";
/// A recoverable error message.
pub const KIND_ERROR: &str = "error";
/// A log record.
pub const KIND_LOG: &str = "log";

/// Normalized form of [`KIND_RESULT_JSON`].
pub const KIND_RESULT: &str = "result";
/// Normalized form of [`KIND_END_JSON`].
pub const KIND_END: &str = "end";

// HTTP body modes in the fetch reply.

/// No body.
pub const BODY_NONE: &str = "none";
/// Body delivered inline as a single base64 buffer.
pub const BODY_BYTES: &str = "bytes";
/// Body delivered as a chunk source read via [`OP_HTTP_READ`].
pub const BODY_STREAM: &str = "stream";

// Return codes for host_call and the guest entry points. Non-negative
// values are the number of envelope bytes written to the response buffer.

/// The op code is not recognized by this host.
pub const RC_UNKNOWN_OP: i64 = -1;
/// The request envelope could not be decoded.
pub const RC_BAD_REQUEST: i64 = -2;
/// Guest memory access failed (out-of-bounds pointers).
pub const RC_MEMORY: i64 = -3;
/// Values at or below this base encode a grow hint; see [`grow_hint`].
pub const RC_GROW_BASE: i64 = -16;

/// Encode "response needs `needed` bytes, retry with a larger buffer".
#[must_use]
pub const fn grow_hint(needed: usize) -> i64 {
    RC_GROW_BASE - needed as i64
}

/// Decode a grow hint, if `rc` is one.
#[must_use]
pub const fn required_len(rc: i64) -> Option<usize> {
    if rc <= RC_GROW_BASE {
        Some((RC_GROW_BASE - rc) as usize)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grow_hint_roundtrip() {
        assert_eq!(required_len(grow_hint(0)), Some(0));
        assert_eq!(required_len(grow_hint(1)), Some(1));
        assert_eq!(required_len(grow_hint(65_536)), Some(65_536));
    }

    #[test]
    fn plain_errors_are_not_grow_hints() {
        assert_eq!(required_len(RC_UNKNOWN_OP), None);
        assert_eq!(required_len(RC_BAD_REQUEST), None);
        assert_eq!(required_len(RC_MEMORY), None);
        assert_eq!(required_len(0), None);
        assert_eq!(required_len(128), None);
    }
}
