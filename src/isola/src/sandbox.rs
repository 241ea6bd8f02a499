//! A per-execution sandbox: one guest runtime, one script, a sequence of
//! calls.
//!
//! The guest instance lives in a slot behind an async mutex, which
//! serializes `start`/`load_script`/`run`/`close` for one sandbox while
//! distinct sandboxes run independently. Guest work always executes on a
//! blocking worker; a spawned driver restores the slot and applies the
//! producer join/cancel policy even when the caller's future is dropped
//! mid-run.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use tokio::runtime::Handle;
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{Level, instrument};

use crate::args::{RunArg, encode_args};
use crate::config::{SandboxLimits, SandboxPatch};
use crate::error::{IsolaError, Result};
use crate::event::{CallbackSlot, Event, EventHandler, EventKind};
use crate::guest::{GuestInstance, RunControl, Template};
use crate::http::{DefaultHttpHandler, HttpBridge, HttpHandler};
use crate::metrics::{METRIC_RUN_TERMINATIONS, METRIC_RUNS, METRIC_TERMINATION_CAUSE, SandboxMetricsGuard};
use crate::run::{EventStream, RunGuard, RunResult, pump_events};

/// State shared between the sandbox handle, its guest instance, and the
/// run drivers.
pub(crate) struct SandboxShared {
    limits: StdMutex<SandboxLimits>,
    callbacks: CallbackSlot,
    http: Arc<StdRwLock<Option<HttpBridge>>>,
    control: Arc<RunControl>,
    scheduler: Handle,
}

/// The guest runtime slot plus a signal for slot restorations, so that
/// `close` can wait out an interrupted operation without polling.
struct SlotCell {
    inner: Mutex<GuestSlot>,
    changed: Notify,
}

/// Occupancy of the guest runtime slot.
enum GuestSlot {
    /// Created but not started.
    Fresh,
    /// Started and ready for the next operation.
    Idle(Box<GuestInstance>),
    /// An operation moved the instance to a worker and has not restored it
    /// yet (only observable after that operation was cancelled).
    Busy,
    /// A run was interrupted mid-execution; the interpreter state is not
    /// trustworthy anymore.
    Poisoned,
    /// Torn down.
    Closed,
}

/// A single executor of one script and a sequence of calls, with its own
/// guest runtime and resource caps.
///
/// Minted by [`Context::instantiate`]. One call is in flight at a time per
/// sandbox; concurrent operations on the same sandbox queue behind it.
///
/// [`Context::instantiate`]: crate::Context::instantiate
pub struct Sandbox {
    shared: Arc<SandboxShared>,
    slot: Arc<SlotCell>,
    template: Arc<Template>,
    runtime_lib_dir: Option<PathBuf>,
    prelude: Option<String>,
    // metric drop guard to manage sandbox gauge
    _metric_guard: SandboxMetricsGuard<Sandbox>,
}

impl Sandbox {
    #[instrument(err(Debug), skip_all, level = Level::DEBUG)]
    pub(crate) fn new(
        template: Arc<Template>,
        limits: SandboxLimits,
        runtime_lib_dir: Option<PathBuf>,
        prelude: Option<String>,
        scheduler: Handle,
    ) -> Result<Self> {
        // Per-sandbox default handler; no process-wide client singleton.
        let default_handler = DefaultHttpHandler::new()?;
        let http = Arc::new(StdRwLock::new(Some(HttpBridge::new(
            Arc::new(default_handler),
            scheduler.clone(),
        ))));
        Ok(Self {
            shared: Arc::new(SandboxShared {
                limits: StdMutex::new(limits),
                callbacks: CallbackSlot::default(),
                http,
                control: RunControl::new(),
                scheduler,
            }),
            slot: Arc::new(SlotCell {
                inner: Mutex::new(GuestSlot::Fresh),
                changed: Notify::new(),
            }),
            template,
            runtime_lib_dir,
            prelude,
            _metric_guard: SandboxMetricsGuard::new(),
        })
    }

    /// Merge per-instance overrides: memory ceiling, timeout, mounts, env.
    ///
    /// Timeouts are given in seconds and stored as whole milliseconds via
    /// ceiling; see [`SandboxPatch::timeout_secs`].
    ///
    /// # Errors
    ///
    /// [`IsolaError::InvalidArgument`] for a non-finite or non-positive
    /// timeout or an invalid mount entry; a failed patch changes nothing.
    #[instrument(err(Debug), skip_all, level = Level::DEBUG)]
    pub fn configure(&self, patch: SandboxPatch) -> Result<()> {
        self.shared
            .limits
            .lock()
            .expect("limits lock poisoned")
            .apply(patch)
    }

    /// Register the user event callback, replacing any previous one.
    ///
    /// The swap is effective at the next delivered event: the previous
    /// callback sees no events emitted strictly after the swap.
    pub fn set_callback(&self, handler: impl EventHandler + 'static) {
        self.shared.callbacks.set(Some(Arc::new(handler)));
    }

    /// Remove the user event callback.
    pub fn clear_callback(&self) {
        self.shared.callbacks.set(None);
    }

    /// Install the HTTP handler guest fetches are dispatched to, replacing
    /// the default outbound handler.
    ///
    /// The handler runs on the scheduler captured here, never on the guest
    /// worker. If the sandbox has a timeout, each dispatch is wrapped in a
    /// timeout of the same duration.
    pub fn set_http_handler(&self, handler: impl HttpHandler + 'static) {
        let scheduler = Handle::try_current().unwrap_or_else(|_| self.shared.scheduler.clone());
        *self.shared.http.write().expect("http slot poisoned") =
            Some(HttpBridge::new(Arc::new(handler), scheduler));
    }

    /// Remove the HTTP handler entirely; guest fetches then fail with an
    /// error the guest observes.
    pub fn clear_http_handler(&self) {
        *self.shared.http.write().expect("http slot poisoned") = None;
    }

    /// Whether a terminated run left the guest runtime in an untrusted
    /// state. A poisoned sandbox fails every further operation until
    /// closed.
    pub async fn poisoned(&self) -> bool {
        matches!(&*self.slot.inner.lock().await, GuestSlot::Poisoned)
    }

    /// Perform guest-side initialization. Blocking work runs on a worker.
    ///
    /// # Errors
    ///
    /// Starting twice is an error, as is starting a closed or poisoned
    /// sandbox.
    #[instrument(err(Debug), skip_all, level = Level::INFO)]
    pub async fn start(&self) -> Result<()> {
        let mut slot = self.slot.inner.lock().await;
        match &*slot {
            GuestSlot::Fresh => {}
            other => return Err(slot_error(other, "start")),
        }

        let limits = self
            .shared
            .limits
            .lock()
            .expect("limits lock poisoned")
            .clone();
        let config_json = limits.to_wire_json()?;
        let template = Arc::clone(&self.template);
        let runtime_lib_dir = self.runtime_lib_dir.clone();
        let http = Arc::clone(&self.shared.http);
        let scheduler = self.shared.scheduler.clone();
        let control = Arc::clone(&self.shared.control);

        let (event_tx, event_rx) = unbounded_channel();
        let pump = tokio::spawn(pump_events(
            event_rx,
            self.shared.callbacks.clone(),
            |_| {},
        ));

        let worker = tokio::task::spawn_blocking(move || -> Result<GuestInstance> {
            let mut instance = GuestInstance::new(
                &template,
                &limits,
                runtime_lib_dir.as_deref(),
                http,
                scheduler,
                control,
            )?;
            // The run timeout does not bound startup; only kill applies.
            instance.begin_call(event_tx.clone(), None);
            let outcome = instance.start(&config_json);
            for event in instance.drain_stdio() {
                let _ = event_tx.send(event);
            }
            instance.end_call();
            outcome.map(|()| instance)
        });

        let outcome = worker
            .await
            .map_err(|e| IsolaError::internal(format!("start worker failed: {e}")));
        let _ = pump.await;
        let instance = outcome??;
        *slot = GuestSlot::Idle(Box::new(instance));
        Ok(())
    }

    /// Deliver script source to the guest. The context prelude, if any, is
    /// prepended host-side before delivery; subsequent runs may reference
    /// any top-level name the script defines.
    ///
    /// # Errors
    ///
    /// [`IsolaError::GuestAborted`] when the script itself fails to load
    /// (syntax error, import-time exception).
    #[instrument(err(Debug), skip_all, level = Level::DEBUG)]
    pub async fn load_script(&self, source: &str) -> Result<()> {
        let full_source = match &self.prelude {
            Some(prelude) => format!("{prelude}\n{source}"),
            None => source.to_string(),
        };
        self.guest_op(move |instance| instance.load_script(&full_source))
            .await
    }

    /// Invoke `name` in the guest with the given arguments, returning the
    /// aggregated result after the call has terminated and every attached
    /// producer task has joined (or been cancelled, on failure).
    ///
    /// Cancelling the future propagates: the guest call is interrupted and
    /// every attached stream producer reaches a terminal state.
    #[instrument(err(Debug), skip(self, args), level = Level::INFO)]
    pub async fn run(&self, name: &str, args: Vec<RunArg>) -> Result<RunResult> {
        let (driver, guard) = self.launch(name.to_string(), args, None).await?;
        let outcome = driver.await;
        guard.disarm();
        outcome.map_err(|e| IsolaError::internal(format!("run driver failed: {e}")))?
    }

    /// Invoke `name` in the guest, yielding events as they arrive.
    ///
    /// The stream terminates after the guest call ends and the event queue
    /// has drained; on guest failure it ends without a terminal `end`
    /// event. Dropping the stream early cancels the run and its producers.
    #[instrument(err(Debug), skip(self, args), level = Level::INFO)]
    pub async fn run_stream(&self, name: &str, args: Vec<RunArg>) -> Result<EventStream> {
        let (forward_tx, forward_rx) = unbounded_channel();
        let (driver, guard) = self.launch(name.to_string(), args, Some(forward_tx)).await?;
        // The stream owns cancellation; the driver's verdict is only worth
        // a log line since failures already surfaced as error events.
        tokio::spawn(async move {
            match driver.await {
                Ok(Err(err)) => tracing::debug!(error = %err, "streamed run failed"),
                Err(err) => tracing::warn!(error = %err, "run driver failed"),
                Ok(Ok(_)) => {}
            }
        });
        Ok(EventStream::new(forward_rx, guard))
    }

    /// Cancel any in-flight run, detach callbacks and the HTTP handler,
    /// and release the guest runtime.
    ///
    /// Waits for the interrupted run to unwind before releasing, so the
    /// sandbox is fully quiesced when this returns.
    #[instrument(skip_all, level = Level::INFO)]
    pub async fn close(&self) {
        self.shared.control.kill();
        self.shared.callbacks.set(None);
        self.clear_http_handler();

        // Wait out an interrupted operation that still owns the instance:
        // its driver restores the slot and signals `changed`.
        let previous = loop {
            let mut slot = self.slot.inner.lock().await;
            if matches!(&*slot, GuestSlot::Busy) {
                let mut restored = std::pin::pin!(self.slot.changed.notified());
                restored.as_mut().enable();
                drop(slot);
                restored.await;
                continue;
            }
            break std::mem::replace(&mut *slot, GuestSlot::Closed);
        };
        if let GuestSlot::Idle(instance) = previous {
            // Store teardown can be slow for large heaps; keep it off the
            // scheduler.
            let _ = tokio::task::spawn_blocking(move || drop(instance)).await;
        }
    }

    /// [`close`](Self::close), awaiting cancelled work before returning.
    ///
    /// `close` already waits for teardown; this alias keeps the paired
    /// names of the source API.
    pub async fn aclose(&self) {
        self.close().await;
    }

    /// Acquire the instance, run one blocking guest operation with event
    /// delivery, and restore the slot — even if this future is dropped.
    async fn guest_op<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut GuestInstance) -> Result<T> + Send + 'static,
    {
        let instance = self.acquire().await?;
        let (event_tx, event_rx) = unbounded_channel();
        let pump = tokio::spawn(pump_events(
            event_rx,
            self.shared.callbacks.clone(),
            |_| {},
        ));

        let worker = tokio::task::spawn_blocking(move || {
            let mut instance = instance;
            // The per-call timeout bounds runs, not script delivery.
            instance.begin_call(event_tx.clone(), None);
            let outcome = op(&mut instance);
            for event in instance.drain_stdio() {
                let _ = event_tx.send(event);
            }
            instance.end_call();
            (instance, outcome)
        });

        let slot = Arc::clone(&self.slot);
        let driver = tokio::spawn(async move {
            let outcome = restore_slot(&slot, worker).await;
            let _ = pump.await;
            outcome
        });
        driver
            .await
            .map_err(|e| IsolaError::internal(format!("guest op driver failed: {e}")))?
    }

    /// Start one run: guest worker, event pump, and the restoring driver.
    ///
    /// The returned guard fires on abandonment; the driver completes the
    /// run autonomously either way.
    async fn launch(
        &self,
        name: String,
        args: Vec<RunArg>,
        forward: Option<UnboundedSender<Event>>,
    ) -> Result<(JoinHandle<Result<RunResult>>, RunGuard)> {
        let encoded = match encode_args(args) {
            Ok(encoded) => encoded,
            Err(err) => return Err(err),
        };
        let producer_aborts: Vec<_> = encoded
            .producers
            .iter()
            .map(JoinHandle::abort_handle)
            .collect();
        let arg_streams = encoded.streams.clone();

        let instance = match self.acquire().await {
            Ok(instance) => instance,
            Err(err) => {
                // The run never started; tear the producers down now.
                for stream in &arg_streams {
                    stream.end();
                }
                for producer in encoded.producers {
                    producer.abort();
                }
                return Err(err);
            }
        };

        metrics::counter!(METRIC_RUNS).increment(1);
        let timeout = self
            .shared
            .limits
            .lock()
            .expect("limits lock poisoned")
            .timeout();
        let done = Arc::new(AtomicBool::new(false));
        let (event_tx, event_rx) = unbounded_channel();

        let entries = encoded.entries;
        let worker = tokio::task::spawn_blocking(move || {
            let mut instance = instance;
            instance.begin_call(event_tx.clone(), timeout);
            let outcome = instance.call_run(&name, &entries);
            for event in instance.drain_stdio() {
                let _ = event_tx.send(event);
            }
            let outcome = match outcome {
                Ok(final_json) => {
                    let _ = event_tx.send(Event::new(EventKind::End, final_json));
                    Ok(())
                }
                Err(err) => {
                    let _ = event_tx.send(Event::new(EventKind::Error, Some(err.to_string())));
                    Err(err)
                }
            };
            instance.end_call();
            (instance, outcome)
        });

        let pump = {
            let callbacks = self.shared.callbacks.clone();
            tokio::spawn(async move {
                let mut collected = Vec::new();
                pump_events(event_rx, callbacks, |event: Event| {
                    if let Some(forward) = &forward {
                        let _ = forward.send(event.clone());
                    }
                    collected.push(event);
                })
                .await;
                collected
            })
        };

        let slot = Arc::clone(&self.slot);
        let driver_done = Arc::clone(&done);
        let driver_streams = arg_streams.clone();
        let producers = encoded.producers;
        let driver = tokio::spawn(async move {
            let outcome = restore_slot(&slot, worker).await;

            match outcome {
                Ok(()) => {
                    // Producers should have completed naturally when the
                    // guest drained and closed the stream; await any
                    // stragglers and surface their failures.
                    let mut producer_failure = None;
                    for producer in producers {
                        match producer.await {
                            Ok(Ok(())) => {}
                            Ok(Err(err)) => {
                                producer_failure.get_or_insert(err);
                            }
                            Err(err) => {
                                producer_failure.get_or_insert(IsolaError::internal(format!(
                                    "stream producer failed: {err}"
                                )));
                            }
                        }
                    }
                    let events = pump
                        .await
                        .map_err(|e| IsolaError::internal(format!("event pump failed: {e}")))?;
                    driver_done.store(true, Ordering::Release);
                    match producer_failure {
                        Some(err) => Err(err),
                        None => RunResult::from_events(events),
                    }
                }
                Err(err) => {
                    record_termination(&err);
                    for stream in &driver_streams {
                        stream.end();
                    }
                    for producer in &producers {
                        producer.abort();
                    }
                    for producer in producers {
                        // Cancel-and-join with exception suppression.
                        let _ = producer.await;
                    }
                    let _ = pump.await;
                    driver_done.store(true, Ordering::Release);
                    Err(err)
                }
            }
        });

        let guard = RunGuard::new(
            done,
            Arc::clone(&self.shared.control),
            arg_streams,
            producer_aborts,
        );
        Ok((driver, guard))
    }

    /// Take the instance out of the slot, leaving it `Busy`.
    async fn acquire(&self) -> Result<Box<GuestInstance>> {
        let mut slot = self.slot.inner.lock().await;
        match std::mem::replace(&mut *slot, GuestSlot::Busy) {
            GuestSlot::Idle(instance) => Ok(instance),
            other => {
                let err = slot_error(&other, "call");
                *slot = other;
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox").finish()
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        // Unblock any worker still running; resources release when the
        // last driver finishes with the slot.
        self.shared.control.kill();
    }
}

/// Await the worker and put the instance back, poisoning the slot when the
/// run was interrupted mid-execution.
async fn restore_slot<T>(
    cell: &SlotCell,
    worker: JoinHandle<(Box<GuestInstance>, Result<T>)>,
) -> Result<T> {
    let outcome = match worker.await {
        Ok((instance, outcome)) => {
            let mut slot = cell.inner.lock().await;
            if !matches!(&*slot, GuestSlot::Closed) {
                *slot = match &outcome {
                    // A guest-level exception unwound cleanly inside the
                    // interpreter; the runtime stays usable.
                    Ok(_) | Err(IsolaError::GuestAborted(_)) => GuestSlot::Idle(instance),
                    Err(_) => GuestSlot::Poisoned,
                };
            }
            outcome
        }
        Err(err) => {
            let mut slot = cell.inner.lock().await;
            if !matches!(&*slot, GuestSlot::Closed) {
                *slot = GuestSlot::Poisoned;
            }
            Err(IsolaError::internal(format!("guest worker failed: {err}")))
        }
    };
    cell.changed.notify_waiters();
    outcome
}

fn slot_error(slot: &GuestSlot, operation: &str) -> IsolaError {
    match slot {
        GuestSlot::Fresh => IsolaError::internal(format!(
            "cannot {operation}: sandbox has not been started"
        )),
        GuestSlot::Idle(_) => IsolaError::internal(format!(
            "cannot {operation}: sandbox is already started"
        )),
        GuestSlot::Busy => IsolaError::internal(format!(
            "cannot {operation}: a previous operation was interrupted and is still unwinding"
        )),
        GuestSlot::Poisoned => IsolaError::internal(format!(
            "cannot {operation}: sandbox is poisoned by an interrupted run"
        )),
        GuestSlot::Closed => {
            IsolaError::internal(format!("cannot {operation}: sandbox is closed"))
        }
    }
}

fn record_termination(err: &IsolaError) {
    let cause = match err {
        IsolaError::DeadlineExceeded => "timeout",
        IsolaError::Canceled => "canceled",
        IsolaError::GuestAborted(_) => "guest-abort",
        _ => "internal",
    };
    metrics::counter!(METRIC_RUN_TERMINATIONS, METRIC_TERMINATION_CAUSE => cause).increment(1);
    tracing::warn!(cause, "run terminated abnormally");
}
