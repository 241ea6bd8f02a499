//! A per-sandbox guest runtime instance.
//!
//! Every instance owns its wasmtime store, WASI view, and host-call
//! context; the compiled module is referenced from the shared template.
//! All methods here are blocking and run on a sandbox worker, never on the
//! host scheduler.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{Level, instrument};
use wasmtime::{Linker, Memory, Store, StoreLimits, StoreLimitsBuilder, TypedFunc, UpdateDeadline};
use wasmtime_wasi::p1::WasiP1Ctx;
use wasmtime_wasi::p2::pipe::MemoryOutputPipe;
use wasmtime_wasi::{DirPerms, FilePerms, WasiCtxBuilder};

use super::host_calls::{self, HostCtx};
use super::template::Template;
use crate::args::ArgEntry;
use crate::config::{MountPerms, SandboxLimits};
use crate::error::{IsolaError, Result};
use crate::event::{Event, EventKind};
use crate::http::HttpBridge;

/// Upper bound on buffered WASI-level stdio per run. Guest-level prints go
/// through the event path; this only catches raw fd writes.
const STDIO_CAPACITY: usize = 8 * 1024 * 1024;

/// Initial response buffer handed to guest entry points; grown on demand.
const INITIAL_RESP_CAP: u32 = 4096;

/// Where the runtime library directory appears inside the guest.
const GUEST_LIB_DIR: &str = "/usr/local/lib";

/// Cross-domain kill switch for one sandbox's guest calls.
///
/// The epoch callback polls it between guest instructions; host-call waits
/// poll it while blocked. `kill` wins over the armed deadline.
pub(crate) struct RunControl {
    kill: AtomicBool,
    deadline: Mutex<Option<Instant>>,
}

impl RunControl {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            kill: AtomicBool::new(false),
            deadline: Mutex::new(None),
        })
    }

    /// Request termination of the in-flight call (and any future call).
    pub(crate) fn kill(&self) {
        self.kill.store(true, Ordering::Release);
    }

    pub(crate) fn killed(&self) -> bool {
        self.kill.load(Ordering::Acquire)
    }

    /// Arm the wall-clock deadline for one guest entry.
    fn arm(&self, timeout: Option<Duration>) {
        *self.deadline.lock().expect("run control poisoned") =
            timeout.map(|t| Instant::now() + t);
    }

    fn disarm(&self) {
        *self.deadline.lock().expect("run control poisoned") = None;
    }

    /// Fail with the termination cause, if one applies.
    pub(crate) fn check(&self) -> Result<()> {
        if self.killed() {
            return Err(IsolaError::Canceled);
        }
        let deadline = *self.deadline.lock().expect("run control poisoned");
        if let Some(deadline) = deadline
            && Instant::now() >= deadline
        {
            return Err(IsolaError::DeadlineExceeded);
        }
        Ok(())
    }
}

impl std::fmt::Debug for RunControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunControl")
            .field("killed", &self.killed())
            .finish()
    }
}

/// Store data: the WASI view, the resource limiter, and the host-call
/// context.
pub(crate) struct GuestState {
    pub(crate) wasi: WasiP1Ctx,
    pub(crate) limits: StoreLimits,
    pub(crate) host: HostCtx,
}

#[derive(Serialize)]
struct LoadRequest<'a> {
    source: &'a str,
}

#[derive(Serialize)]
struct RunRequest<'a> {
    name: &'a str,
    args: Vec<ArgWire<'a>>,
}

#[derive(Serialize)]
struct ArgWire<'a> {
    tag: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<u32>,
}

/// Reply envelope of every guest entry point.
#[derive(Debug, Default, Deserialize)]
struct Reply {
    #[serde(default)]
    err: Option<String>,
    /// JSON form of the call's return value; absent when it returned
    /// nothing.
    #[serde(default, rename = "final")]
    final_json: Option<String>,
}

#[derive(Clone, Copy)]
enum Entry {
    Start,
    LoadScript,
    Run,
}

/// One live guest runtime.
pub(crate) struct GuestInstance {
    store: Store<GuestState>,
    memory: Memory,
    alloc_fn: TypedFunc<u32, u32>,
    start_fn: TypedFunc<(u32, u32, u32, u32), i64>,
    load_fn: TypedFunc<(u32, u32, u32, u32), i64>,
    run_fn: TypedFunc<(u32, u32, u32, u32), i64>,
    control: Arc<RunControl>,
    stdout: MemoryOutputPipe,
    stderr: MemoryOutputPipe,
    stdout_seen: usize,
    stderr_seen: usize,
}

impl GuestInstance {
    /// Instantiate the template with this sandbox's limits. Blocking.
    #[instrument(err(Debug), skip_all, level = Level::INFO)]
    pub(crate) fn new(
        template: &Template,
        limits: &SandboxLimits,
        runtime_lib_dir: Option<&Path>,
        http: Arc<std::sync::RwLock<Option<HttpBridge>>>,
        scheduler: Handle,
        control: Arc<RunControl>,
    ) -> Result<Self> {
        let stdout = MemoryOutputPipe::new(STDIO_CAPACITY);
        let stderr = MemoryOutputPipe::new(STDIO_CAPACITY);

        let mut builder = WasiCtxBuilder::new();
        builder.stdout(stdout.clone());
        builder.stderr(stderr.clone());
        if let Some(lib_dir) = runtime_lib_dir {
            builder
                .preopened_dir(lib_dir, GUEST_LIB_DIR, DirPerms::READ, FilePerms::READ)
                .map_err(|e| {
                    IsolaError::invalid(format!(
                        "cannot mount runtime library directory '{}': {e}",
                        lib_dir.display()
                    ))
                })?;
        }
        for mount in &limits.mounts {
            let wire = mount.to_wire()?;
            builder
                .preopened_dir(
                    &mount.host_path,
                    &wire.guest,
                    dir_perms(mount.dir_perms),
                    file_perms(mount.file_perms),
                )
                .map_err(|e| {
                    IsolaError::invalid(format!("cannot mount '{}': {e}", wire.host))
                })?;
        }
        if !limits.env.contains_key("PYTHONHOME") {
            builder.env("PYTHONHOME", "/usr/local");
        }
        if !limits.env.contains_key("PYTHONPATH") {
            builder.env("PYTHONPATH", GUEST_LIB_DIR);
        }
        for (name, value) in &limits.env {
            builder.env(name, value);
        }
        let wasi = builder.build_p1();

        let store_limits = match limits.max_memory {
            Some(bytes) => StoreLimitsBuilder::new().memory_size(bytes as usize).build(),
            None => StoreLimits::default(),
        };

        let mut store = Store::new(
            template.engine(),
            GuestState {
                wasi,
                limits: store_limits,
                host: HostCtx::new(scheduler, http, Arc::clone(&control)),
            },
        );
        store.limiter(|state| &mut state.limits);

        let callback_control = Arc::clone(&control);
        store.epoch_deadline_callback(move |_ctx| {
            callback_control.check().map_err(wasmtime::Error::from)?;
            Ok(UpdateDeadline::Continue(1))
        });
        store.set_epoch_deadline(1);

        let mut linker: Linker<GuestState> = Linker::new(template.engine());
        wasmtime_wasi::p1::add_to_linker_sync(&mut linker, |state: &mut GuestState| {
            &mut state.wasi
        })
        .map_err(|e| IsolaError::internal(format!("failed to link wasi: {e:#}")))?;
        host_calls::register(&mut linker)?;

        let instance = linker
            .instantiate(&mut store, template.module())
            .map_err(|e| IsolaError::internal(format!("failed to instantiate runtime: {e:#}")))?;

        let memory = instance
            .get_memory(&mut store, isola_common::EXPORT_MEMORY)
            .ok_or_else(|| IsolaError::internal("runtime does not export linear memory"))?;
        let alloc_fn = typed_export(&instance, &mut store, isola_common::EXPORT_ALLOC)?;
        let start_fn = typed_export(&instance, &mut store, isola_common::EXPORT_START)?;
        let load_fn = typed_export(&instance, &mut store, isola_common::EXPORT_LOAD_SCRIPT)?;
        let run_fn = typed_export(&instance, &mut store, isola_common::EXPORT_RUN)?;

        // WASI reactors expect a one-time initializer before any export.
        if let Some(init) = instance.get_func(&mut store, isola_common::EXPORT_INITIALIZE) {
            init.typed::<(), ()>(&store)
                .and_then(|f| f.call(&mut store, ()))
                .map_err(|e| {
                    IsolaError::internal(format!("runtime initialization trapped: {e:#}"))
                })?;
        }

        Ok(Self {
            store,
            memory,
            alloc_fn,
            start_fn,
            load_fn,
            run_fn,
            control,
            stdout,
            stderr,
            stdout_seen: 0,
            stderr_seen: 0,
        })
    }

    /// Install the per-call event sink and arm the deadline.
    pub(crate) fn begin_call(&mut self, sink: UnboundedSender<Event>, timeout: Option<Duration>) {
        self.store.data_mut().host.begin_call(sink, timeout);
        self.control.arm(timeout);
    }

    /// Tear down per-call state: disarm the deadline, drop the sink, and
    /// end any stream arguments still registered so their producers and
    /// consumers unblock.
    pub(crate) fn end_call(&mut self) {
        self.control.disarm();
        self.store.data_mut().host.end_call();
    }

    /// Run guest-side startup with the config wire form.
    #[instrument(err(Debug), skip_all, level = Level::INFO)]
    pub(crate) fn start(&mut self, config_json: &str) -> Result<()> {
        let reply = self.call_entry(Entry::Start, config_json.as_bytes())?;
        match reply.err {
            Some(err) => Err(IsolaError::internal(format!(
                "guest runtime failed to start: {err}"
            ))),
            None => Ok(()),
        }
    }

    /// Deliver script source to the guest.
    #[instrument(err(Debug), skip_all, level = Level::DEBUG)]
    pub(crate) fn load_script(&mut self, source: &str) -> Result<()> {
        let request = serde_json::to_string(&LoadRequest { source })?;
        let reply = self.call_entry(Entry::LoadScript, request.as_bytes())?;
        match reply.err {
            Some(err) => Err(IsolaError::GuestAborted(err)),
            None => Ok(()),
        }
    }

    /// Invoke a named top-level function. Returns the JSON form of its
    /// return value, or `None` when it returned nothing.
    ///
    /// Stream arguments are registered with the host-call context for the
    /// duration of the call; [`end_call`](Self::end_call) clears them.
    #[instrument(err(Debug), skip(self, entries), level = Level::DEBUG)]
    pub(crate) fn call_run(&mut self, name: &str, entries: &[ArgEntry]) -> Result<Option<String>> {
        let mut args = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry {
                ArgEntry::Json { name, json } => args.push(ArgWire {
                    tag: "json",
                    name: name.as_deref(),
                    value: Some(json),
                    stream: None,
                }),
                ArgEntry::Stream { name, stream } => {
                    let handle = self.store.data_mut().host.register_stream(stream.clone());
                    args.push(ArgWire {
                        tag: "stream",
                        name: name.as_deref(),
                        value: None,
                        stream: Some(handle),
                    });
                }
            }
        }
        let request = serde_json::to_string(&RunRequest { name, args })?;
        let reply = self.call_entry(Entry::Run, request.as_bytes())?;
        match reply.err {
            Some(err) => Err(IsolaError::GuestAborted(err)),
            None => Ok(reply.final_json),
        }
    }

    /// Flush WASI-level stdio written since the last drain into events.
    ///
    /// The guest runtime routes prints through the event path; this picks
    /// up raw fd writes so no output is silently lost.
    pub(crate) fn drain_stdio(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        drain_pipe(&self.stdout, &mut self.stdout_seen, EventKind::Stdout, &mut events);
        drain_pipe(&self.stderr, &mut self.stderr_seen, EventKind::Stderr, &mut events);
        events
    }

    /// Drive one guest entry with the grow-and-retry response convention.
    fn call_entry(&mut self, entry: Entry, request: &[u8]) -> Result<Reply> {
        let func = match entry {
            Entry::Start => self.start_fn,
            Entry::LoadScript => self.load_fn,
            Entry::Run => self.run_fn,
        };
        let req_ptr = self.copy_in(request)?;
        let req_len = request.len() as u32;

        let mut resp_cap = INITIAL_RESP_CAP;
        loop {
            let resp_ptr = self.guest_alloc(resp_cap)?;
            let rc = func
                .call(&mut self.store, (req_ptr, req_len, resp_ptr, resp_cap))
                .map_err(IsolaError::from)?;
            if rc >= 0 {
                let bytes = self.read_guest(resp_ptr, rc as usize)?;
                let text = String::from_utf8(bytes).map_err(|_| {
                    IsolaError::internal("guest reply is not valid UTF-8")
                })?;
                if text.is_empty() {
                    return Ok(Reply::default());
                }
                return Ok(serde_json::from_str(&text).map_err(|e| {
                    IsolaError::internal(format!("malformed guest reply: {e}"))
                })?);
            }
            if let Some(needed) = isola_common::required_len(rc) {
                resp_cap = needed.max(resp_cap as usize * 2) as u32;
                continue;
            }
            return Err(IsolaError::internal(format!(
                "guest entry failed with code {rc}"
            )));
        }
    }

    fn guest_alloc(&mut self, len: u32) -> Result<u32> {
        let ptr = self
            .alloc_fn
            .call(&mut self.store, len)
            .map_err(IsolaError::from)?;
        if ptr == 0 {
            return Err(IsolaError::internal("guest allocator returned null"));
        }
        Ok(ptr)
    }

    fn copy_in(&mut self, bytes: &[u8]) -> Result<u32> {
        let ptr = self.guest_alloc(bytes.len().max(1) as u32)?;
        self.memory
            .write(&mut self.store, ptr as usize, bytes)
            .map_err(|e| IsolaError::internal(format!("guest memory write failed: {e}")))?;
        Ok(ptr)
    }

    fn read_guest(&mut self, ptr: u32, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.memory
            .read(&self.store, ptr as usize, &mut buf)
            .map_err(|e| IsolaError::internal(format!("guest memory read failed: {e}")))?;
        Ok(buf)
    }
}

impl std::fmt::Debug for GuestInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestInstance").finish()
    }
}

fn typed_export<Params, Results>(
    instance: &wasmtime::Instance,
    store: &mut Store<GuestState>,
    name: &str,
) -> Result<TypedFunc<Params, Results>>
where
    Params: wasmtime::WasmParams,
    Results: wasmtime::WasmResults,
{
    instance
        .get_typed_func::<Params, Results>(store, name)
        .map_err(|e| IsolaError::internal(format!("runtime export '{name}' is unusable: {e:#}")))
}

fn drain_pipe(
    pipe: &MemoryOutputPipe,
    seen: &mut usize,
    kind: EventKind,
    events: &mut Vec<Event>,
) {
    let contents = pipe.contents();
    if contents.len() <= *seen {
        return;
    }
    let fresh = String::from_utf8_lossy(&contents[*seen..]).into_owned();
    *seen = contents.len();
    for line in fresh.split_inclusive('\n') {
        events.push(Event::new(kind, Some(line.to_string())));
    }
}

fn dir_perms(perms: MountPerms) -> DirPerms {
    match perms {
        MountPerms::Read => DirPerms::READ,
        MountPerms::Write => DirPerms::MUTATE,
        MountPerms::ReadWrite => DirPerms::all(),
    }
}

fn file_perms(perms: MountPerms) -> FilePerms {
    match perms {
        MountPerms::Read => FilePerms::READ,
        MountPerms::Write => FilePerms::WRITE,
        MountPerms::ReadWrite => FilePerms::all(),
    }
}
