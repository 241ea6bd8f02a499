//! The `isola` import module: everything the guest can reach back into
//! the host for.
//!
//! A single `host_call(op, req_ptr, req_len, resp_ptr, resp_cap)` entry
//! dispatches on an op code; requests and replies are JSON in guest
//! memory. Blocking capabilities hand back a pollable id; the guest's
//! cooperative loop parks in `OP_POLL_WAIT` and reaps payloads with
//! `OP_POLL_REAP`. Completion work runs on the host scheduler captured at
//! sandbox creation — never on the guest worker.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, OnceLock, RwLock};
use std::time::{Duration, Instant};

use base64::Engine as _;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedSender;
use wasmtime::{Caller, Extern, Linker, Memory};

use super::instance::{GuestState, RunControl};
use crate::error::{IsolaError, Result};
use crate::event::{Event, EventKind};
use crate::http::{HttpBridge, HttpRequest, SourceTable, read_chunk_future};
use crate::stream::JsonStream;

/// How often a blocked `OP_POLL_WAIT` re-checks the kill switch.
const WAIT_POLL_TICK: Duration = Duration::from_millis(25);

/// Per-instance host-call context, owned by the store.
pub(crate) struct HostCtx {
    scheduler: Handle,
    control: Arc<RunControl>,
    http: Arc<RwLock<Option<HttpBridge>>>,
    sources: SourceTable,
    event_sink: Option<UnboundedSender<Event>>,
    call_timeout: Option<Duration>,
    streams: HashMap<u32, JsonStream>,
    next_stream: u32,
    polls: PollTable,
}

impl HostCtx {
    pub(crate) fn new(
        scheduler: Handle,
        http: Arc<RwLock<Option<HttpBridge>>>,
        control: Arc<RunControl>,
    ) -> Self {
        Self {
            scheduler,
            control,
            http,
            sources: SourceTable::default(),
            event_sink: None,
            call_timeout: None,
            streams: HashMap::new(),
            next_stream: 0,
            polls: PollTable::default(),
        }
    }

    pub(crate) fn begin_call(&mut self, sink: UnboundedSender<Event>, timeout: Option<Duration>) {
        self.event_sink = Some(sink);
        self.call_timeout = timeout;
    }

    pub(crate) fn end_call(&mut self) {
        self.event_sink = None;
        self.call_timeout = None;
        // End leftover stream arguments so blocked producers and any
        // in-flight consumer tasks observe termination.
        for stream in self.streams.values() {
            stream.end();
        }
        self.streams.clear();
        self.polls.reset();
    }

    pub(crate) fn register_stream(&mut self, stream: JsonStream) -> u32 {
        self.next_stream += 1;
        self.streams.insert(self.next_stream, stream);
        self.next_stream
    }

    fn post_event(&self, kind: EventKind, data: Option<String>) {
        // No sink means the sandbox is past this call's lifetime; drop
        // silently per the bus contract.
        if let Some(sink) = &self.event_sink {
            let _ = sink.send(Event::new(kind, data));
        }
    }

    fn register_pollable(
        &mut self,
        fut: impl std::future::Future<Output = Value> + Send + 'static,
    ) -> u32 {
        self.polls.register(&self.scheduler, fut)
    }
}

/// Worker-blocking pollable registry.
///
/// Registration spawns the completion future on the scheduler; the guest
/// worker blocks in [`PollTable::wait`] on a condvar that completions
/// signal.
#[derive(Default)]
struct PollTable {
    next_id: u32,
    shared: Arc<PollShared>,
}

#[derive(Default)]
struct PollShared {
    state: Mutex<PollState>,
    ready_cv: Condvar,
}

#[derive(Default)]
struct PollState {
    pending: HashSet<u32>,
    ready: HashMap<u32, Value>,
}

impl PollTable {
    fn register(
        &mut self,
        scheduler: &Handle,
        fut: impl std::future::Future<Output = Value> + Send + 'static,
    ) -> u32 {
        self.next_id += 1;
        let id = self.next_id;
        let shared = Arc::clone(&self.shared);
        shared
            .state
            .lock()
            .expect("poll table poisoned")
            .pending
            .insert(id);
        scheduler.spawn(async move {
            let payload = fut.await;
            let mut state = shared.state.lock().expect("poll table poisoned");
            // A reset between registration and completion discards the
            // payload; don't resurrect the id.
            if state.pending.remove(&id) {
                state.ready.insert(id, payload);
                shared.ready_cv.notify_all();
            }
        });
        id
    }

    /// Block until at least one of `ids` is ready, honoring the kill
    /// switch and armed deadline.
    fn wait(&self, ids: &[u32], control: &RunControl) -> Result<Vec<u32>> {
        let mut state = self.shared.state.lock().expect("poll table poisoned");
        loop {
            let ready: Vec<u32> = ids
                .iter()
                .copied()
                .filter(|id| state.ready.contains_key(id))
                .collect();
            if !ready.is_empty() {
                return Ok(ready);
            }
            if !ids.iter().any(|id| state.pending.contains(id)) {
                return Err(IsolaError::internal(
                    "waited on pollables that were never registered",
                ));
            }
            control.check()?;
            let (next, _timeout) = self
                .shared
                .ready_cv
                .wait_timeout(state, WAIT_POLL_TICK)
                .expect("poll table poisoned");
            state = next;
        }
    }

    fn take(&self, id: u32) -> Option<Value> {
        self.shared
            .state
            .lock()
            .expect("poll table poisoned")
            .ready
            .remove(&id)
    }

    fn restore(&self, id: u32, payload: Value) {
        self.shared
            .state
            .lock()
            .expect("poll table poisoned")
            .ready
            .insert(id, payload);
    }

    fn reset(&mut self) {
        let mut state = self.shared.state.lock().expect("poll table poisoned");
        state.pending.clear();
        state.ready.clear();
    }
}

/// Register the `isola` import module on the linker.
pub(crate) fn register(linker: &mut Linker<GuestState>) -> Result<()> {
    linker
        .func_wrap(
            isola_common::HOST_MODULE,
            isola_common::HOST_CALL,
            |mut caller: Caller<'_, GuestState>,
             op: u32,
             req_ptr: u32,
             req_len: u32,
             resp_ptr: u32,
             resp_cap: u32|
             -> wasmtime::Result<i64> {
                dispatch(&mut caller, op, req_ptr, req_len, resp_ptr, resp_cap)
                    .map_err(wasmtime::Error::from_anyhow)
            },
        )
        .map_err(|e| IsolaError::internal(format!("failed to register host_call: {e:#}")))?;
    Ok(())
}

#[derive(Deserialize)]
struct EmitRequest {
    kind: String,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Deserialize)]
struct SleepRequest {
    ms: u64,
}

#[derive(Deserialize)]
struct WaitRequest {
    pollables: Vec<u32>,
}

#[derive(Deserialize)]
struct ReapRequest {
    pollable: u32,
}

#[derive(Deserialize)]
struct StreamNextRequest {
    stream: u32,
}

#[derive(Deserialize)]
struct FetchRequest {
    method: String,
    url: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    /// Base64 request body.
    #[serde(default)]
    body: Option<String>,
}

#[derive(Deserialize)]
struct SourceRequest {
    source: u32,
}

fn dispatch(
    caller: &mut Caller<'_, GuestState>,
    op: u32,
    req_ptr: u32,
    req_len: u32,
    resp_ptr: u32,
    resp_cap: u32,
) -> anyhow::Result<i64> {
    let Some(memory) = guest_memory(caller) else {
        return Ok(isola_common::RC_MEMORY);
    };
    let Some(request) = read_bytes(&memory, caller, req_ptr, req_len) else {
        return Ok(isola_common::RC_MEMORY);
    };

    let reply = match op {
        isola_common::OP_EMIT => {
            let Ok(req) = serde_json::from_slice::<EmitRequest>(&request) else {
                return Ok(isola_common::RC_BAD_REQUEST);
            };
            let kind = EventKind::from_wire(&req.kind).map_err(anyhow::Error::new)?;
            caller.data().host.post_event(kind, req.data);
            json!({})
        }
        isola_common::OP_MONOTONIC_NOW => {
            json!({ "nanos": monotonic_nanos() })
        }
        isola_common::OP_SLEEP => {
            let Ok(req) = serde_json::from_slice::<SleepRequest>(&request) else {
                return Ok(isola_common::RC_BAD_REQUEST);
            };
            let duration = Duration::from_millis(req.ms);
            let id = caller.data_mut().host.register_pollable(async move {
                tokio::time::sleep(duration).await;
                json!({})
            });
            json!({ "pollable": id })
        }
        isola_common::OP_POLL_WAIT => {
            let Ok(req) = serde_json::from_slice::<WaitRequest>(&request) else {
                return Ok(isola_common::RC_BAD_REQUEST);
            };
            if req.pollables.is_empty() {
                return Ok(isola_common::RC_BAD_REQUEST);
            }
            let host = &caller.data().host;
            let ready = host
                .polls
                .wait(&req.pollables, &host.control)
                .map_err(anyhow::Error::new)?;
            json!({ "ready": ready })
        }
        isola_common::OP_POLL_REAP => {
            let Ok(req) = serde_json::from_slice::<ReapRequest>(&request) else {
                return Ok(isola_common::RC_BAD_REQUEST);
            };
            match caller.data().host.polls.take(req.pollable) {
                Some(payload) => {
                    // A reply that does not fit must stay reapable for the
                    // retry with a larger buffer.
                    let rc = write_reply(&memory, caller, resp_ptr, resp_cap, &payload)?;
                    if isola_common::required_len(rc).is_some() {
                        caller.data().host.polls.restore(req.pollable, payload);
                    }
                    return Ok(rc);
                }
                None => json!({ "err": format!("pollable {} is not ready", req.pollable) }),
            }
        }
        isola_common::OP_STREAM_NEXT => {
            let Ok(req) = serde_json::from_slice::<StreamNextRequest>(&request) else {
                return Ok(isola_common::RC_BAD_REQUEST);
            };
            match caller.data().host.streams.get(&req.stream).cloned() {
                Some(stream) => {
                    let id = caller.data_mut().host.register_pollable(async move {
                        match tokio::task::spawn_blocking(move || stream.take()).await {
                            Ok(Some(value)) => json!({ "done": false, "value": value }),
                            Ok(None) => json!({ "done": true }),
                            Err(e) => json!({ "err": format!("stream consumer failed: {e}") }),
                        }
                    });
                    json!({ "pollable": id })
                }
                None => json!({ "err": format!("unknown stream argument {}", req.stream) }),
            }
        }
        isola_common::OP_HTTP_FETCH => {
            let Ok(req) = serde_json::from_slice::<FetchRequest>(&request) else {
                return Ok(isola_common::RC_BAD_REQUEST);
            };
            let bridge = caller
                .data()
                .host
                .http
                .read()
                .expect("http handler slot poisoned")
                .clone();
            match bridge {
                Some(bridge) => {
                    let body = match req.body {
                        Some(encoded) => {
                            match base64::engine::general_purpose::STANDARD.decode(&encoded) {
                                Ok(bytes) => Some(Bytes::from(bytes)),
                                Err(_) => return Ok(isola_common::RC_BAD_REQUEST),
                            }
                        }
                        None => None,
                    };
                    let host = &mut caller.data_mut().host;
                    let fut = bridge.fetch_future(
                        HttpRequest {
                            method: req.method,
                            url: req.url,
                            headers: req.headers,
                            body,
                        },
                        host.call_timeout,
                        host.sources.clone(),
                    );
                    let id = host.register_pollable(fut);
                    json!({ "pollable": id })
                }
                None => json!({ "err": "no http handler installed" }),
            }
        }
        isola_common::OP_HTTP_READ => {
            let Ok(req) = serde_json::from_slice::<SourceRequest>(&request) else {
                return Ok(isola_common::RC_BAD_REQUEST);
            };
            let host = &mut caller.data_mut().host;
            let fut = read_chunk_future(host.sources.clone(), req.source);
            let id = host.register_pollable(fut);
            json!({ "pollable": id })
        }
        isola_common::OP_HTTP_CLOSE => {
            let Ok(req) = serde_json::from_slice::<SourceRequest>(&request) else {
                return Ok(isola_common::RC_BAD_REQUEST);
            };
            caller.data().host.sources.remove(req.source);
            json!({})
        }
        isola_common::OP_WS_CONNECT => {
            json!({ "err": "websocket capability is not enabled in this engine" })
        }
        _ => return Ok(isola_common::RC_UNKNOWN_OP),
    };

    write_reply(&memory, caller, resp_ptr, resp_cap, &reply)
}

fn guest_memory(caller: &mut Caller<'_, GuestState>) -> Option<Memory> {
    match caller.get_export(isola_common::EXPORT_MEMORY) {
        Some(Extern::Memory(memory)) => Some(memory),
        _ => None,
    }
}

fn read_bytes(
    memory: &Memory,
    caller: &Caller<'_, GuestState>,
    ptr: u32,
    len: u32,
) -> Option<Vec<u8>> {
    let data = memory.data(caller);
    let start = ptr as usize;
    let end = start.checked_add(len as usize)?;
    if end > data.len() {
        return None;
    }
    Some(data[start..end].to_vec())
}

fn write_reply(
    memory: &Memory,
    caller: &mut Caller<'_, GuestState>,
    ptr: u32,
    cap: u32,
    reply: &Value,
) -> anyhow::Result<i64> {
    let bytes = serde_json::to_vec(reply)?;
    if bytes.len() > cap as usize {
        return Ok(isola_common::grow_hint(bytes.len()));
    }
    let data = memory.data_mut(caller);
    let start = ptr as usize;
    let Some(end) = start.checked_add(bytes.len()) else {
        return Ok(isola_common::RC_MEMORY);
    };
    if end > data.len() {
        return Ok(isola_common::RC_MEMORY);
    }
    data[start..end].copy_from_slice(&bytes);
    Ok(bytes.len() as i64)
}

fn monotonic_nanos() -> u64 {
    static BASE: OnceLock<Instant> = OnceLock::new();
    let base = *BASE.get_or_init(Instant::now);
    base.elapsed().as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn pollables_complete_and_reap_once() {
        let mut table = PollTable::default();
        let control = RunControl::new();
        let id = table.register(&Handle::current(), async { json!({ "value": 7 }) });

        let shared_table = table;
        let ready = tokio::task::spawn_blocking({
            let control = Arc::clone(&control);
            move || {
                let ready = shared_table.wait(&[id], &control).unwrap();
                (ready, shared_table.take(id), shared_table.take(id))
            }
        })
        .await
        .unwrap();

        assert_eq!(ready.0, vec![id]);
        assert_eq!(ready.1, Some(json!({ "value": 7 })));
        assert_eq!(ready.2, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn wait_aborts_on_kill() {
        let mut table = PollTable::default();
        let control = RunControl::new();
        let id = table.register(&Handle::current(), async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            json!({})
        });

        control.kill();
        let result = tokio::task::spawn_blocking({
            let control = Arc::clone(&control);
            move || table.wait(&[id], &control)
        })
        .await
        .unwrap();
        assert!(matches!(result, Err(IsolaError::Canceled)));
    }

    #[test]
    fn wait_on_unregistered_pollable_is_an_error() {
        let table = PollTable::default();
        let control = RunControl::new();
        assert!(matches!(
            table.wait(&[42], &control),
            Err(IsolaError::Internal(_))
        ));
    }

    #[test]
    fn monotonic_clock_is_monotonic() {
        let a = monotonic_nanos();
        let b = monotonic_nanos();
        assert!(b >= a);
    }
}
