//! Run orchestration: event collation, the caller-facing event stream,
//! and cancellation propagation.
//!
//! Both `run` and `run_stream` drive the same per-run pipeline; `run`
//! folds the delivered events into a [`RunResult`] while `run_stream`
//! forwards them to the caller. The fold is one function, so the two views
//! of a call agree by construction.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::AbortHandle;

use crate::error::{IsolaError, Result};
use crate::event::{CallbackSlot, Event, EventKind};
use crate::guest::RunControl;
use crate::stream::JsonStream;

/// Aggregated view of one completed call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunResult {
    /// JSON values yielded during the call, in emission order.
    pub results: Vec<serde_json::Value>,
    /// The call's return value, or `None` when it returned nothing.
    pub final_value: Option<serde_json::Value>,
    /// Captured standard output.
    pub stdout: Vec<String>,
    /// Captured standard error.
    pub stderr: Vec<String>,
    /// Captured log records.
    pub logs: Vec<String>,
    /// Recoverable error messages emitted during the call.
    pub errors: Vec<String>,
}

impl RunResult {
    /// Fold one event into the aggregate.
    pub(crate) fn absorb(&mut self, event: &Event) -> Result<()> {
        match event.kind {
            EventKind::Result => {
                let data = event.data.as_deref().ok_or_else(|| {
                    IsolaError::internal("result event is missing its payload")
                })?;
                self.results.push(serde_json::from_str(data).map_err(|e| {
                    IsolaError::internal(format!("malformed result payload: {e}"))
                })?);
            }
            EventKind::End => {
                self.final_value = match event.data.as_deref() {
                    Some(data) => Some(serde_json::from_str(data).map_err(|e| {
                        IsolaError::internal(format!("malformed end payload: {e}"))
                    })?),
                    None => None,
                };
            }
            EventKind::Stdout => self.stdout.push(event.data.clone().unwrap_or_default()),
            EventKind::Stderr => self.stderr.push(event.data.clone().unwrap_or_default()),
            EventKind::Log => self.logs.push(event.data.clone().unwrap_or_default()),
            EventKind::Error => self.errors.push(event.data.clone().unwrap_or_default()),
        }
        Ok(())
    }

    /// Aggregate a recorded event sequence by the documented kind-to-field
    /// mapping. The events of [`Sandbox::run_stream`] aggregate to the same
    /// value the matching [`Sandbox::run`] returns.
    ///
    /// [`Sandbox::run`]: crate::Sandbox::run
    /// [`Sandbox::run_stream`]: crate::Sandbox::run_stream
    ///
    /// # Errors
    ///
    /// Fails when a `result` or `end` payload is not valid JSON.
    pub fn from_events<I>(events: I) -> Result<Self>
    where
        I: IntoIterator<Item = Event>,
    {
        let mut aggregate = RunResult::default();
        for event in events {
            aggregate.absorb(&event)?;
        }
        Ok(aggregate)
    }
}

/// Deliver every queued event to the sink and to the user callback slot,
/// in order, until the channel closes.
///
/// The slot is re-read per event, so a swap mid-run takes effect at the
/// next event.
pub(crate) async fn pump_events(
    mut rx: UnboundedReceiver<Event>,
    callbacks: CallbackSlot,
    mut sink: impl FnMut(Event),
) {
    while let Some(event) = rx.recv().await {
        sink(event.clone());
        callbacks.deliver(event).await;
    }
}

/// Drop-armed cleanup for one run: fires on abandonment (the caller
/// cancelled `run` or dropped the event stream), killing the guest call,
/// ending the stream arguments, and aborting their producers.
pub(crate) struct RunGuard {
    armed: bool,
    done: Arc<AtomicBool>,
    control: Arc<RunControl>,
    streams: Vec<JsonStream>,
    producers: Vec<AbortHandle>,
}

impl RunGuard {
    pub(crate) fn new(
        done: Arc<AtomicBool>,
        control: Arc<RunControl>,
        streams: Vec<JsonStream>,
        producers: Vec<AbortHandle>,
    ) -> Self {
        Self {
            armed: true,
            done,
            control,
            streams,
            producers,
        }
    }

    /// The run completed through the normal path; dropping is now a no-op.
    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.armed || self.done.load(Ordering::Acquire) {
            return;
        }
        self.control.kill();
        for stream in &self.streams {
            stream.end();
        }
        for producer in &self.producers {
            producer.abort();
        }
    }
}

/// The events of one call, yielded as they arrive.
///
/// Returned by [`Sandbox::run_stream`]. Terminates after the guest call
/// ends and the queue has drained. Dropping it early cancels the run and
/// every attached stream producer.
///
/// [`Sandbox::run_stream`]: crate::Sandbox::run_stream
pub struct EventStream {
    rx: UnboundedReceiver<Event>,
    guard: Option<RunGuard>,
}

impl EventStream {
    pub(crate) fn new(rx: UnboundedReceiver<Event>, guard: RunGuard) -> Self {
        Self {
            rx,
            guard: Some(guard),
        }
    }
}

impl futures::Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(None) => {
                if let Some(guard) = self.guard.take() {
                    guard.disarm();
                }
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream").finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use futures::StreamExt;
    use serde_json::json;

    use super::*;

    fn sample_events() -> Vec<Event> {
        vec![
            Event::new(EventKind::Stdout, Some("hello\n".into())),
            Event::new(EventKind::Result, Some("0".into())),
            Event::new(EventKind::Result, Some("1".into())),
            Event::new(EventKind::Log, Some("checkpoint".into())),
            Event::new(EventKind::Error, Some("soft failure".into())),
            Event::new(EventKind::End, Some("7".into())),
        ]
    }

    #[test]
    fn aggregation_maps_kinds_to_fields() {
        let result = RunResult::from_events(sample_events()).unwrap();
        assert_eq!(result.results, vec![json!(0), json!(1)]);
        assert_eq!(result.final_value, Some(json!(7)));
        assert_eq!(result.stdout, vec!["hello\n"]);
        assert_eq!(result.logs, vec!["checkpoint"]);
        assert_eq!(result.errors, vec!["soft failure"]);
        assert!(result.stderr.is_empty());
    }

    #[test]
    fn end_without_data_means_no_final() {
        let result =
            RunResult::from_events([Event::new(EventKind::End, None)]).unwrap();
        assert_eq!(result.final_value, None);
    }

    #[test]
    fn malformed_result_payload_is_internal() {
        let result = RunResult::from_events([Event::new(
            EventKind::Result,
            Some("not json".into()),
        )]);
        assert!(matches!(result, Err(IsolaError::Internal(_))));
    }

    #[tokio::test]
    async fn pump_preserves_order_for_sink_and_callback() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let callbacks = CallbackSlot::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        callbacks.set(Some(Arc::new(move |event: Event| {
            sink_seen.lock().unwrap().push(("cb", event.data));
        })));

        for event in sample_events() {
            tx.send(event).unwrap();
        }
        drop(tx);

        let collected = Arc::new(Mutex::new(Vec::new()));
        let pump_collected = collected.clone();
        pump_events(rx, callbacks, move |event| {
            pump_collected.lock().unwrap().push(("sink", event.data));
        })
        .await;

        let log = seen.lock().unwrap();
        let sinks = collected.lock().unwrap();
        assert_eq!(log.len(), sinks.len());
        // Per-consumer order equals emission order.
        let expected: Vec<_> = sample_events().into_iter().map(|e| e.data).collect();
        assert_eq!(log.iter().map(|(_, d)| d.clone()).collect::<Vec<_>>(), expected);
        assert_eq!(
            sinks.iter().map(|(_, d)| d.clone()).collect::<Vec<_>>(),
            expected
        );
    }

    #[tokio::test]
    async fn dropping_the_stream_fires_the_guard() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let control = RunControl::new();
        let stream_arg = JsonStream::new(1).unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let guard = RunGuard::new(
            Arc::clone(&done),
            Arc::clone(&control),
            vec![stream_arg.clone()],
            Vec::new(),
        );
        let events = EventStream::new(rx, guard);

        tx.send(Event::new(EventKind::Stdout, Some("x".into()))).unwrap();
        drop(events);
        assert!(control.killed());
        assert!(stream_arg.is_ended());
    }

    #[tokio::test]
    async fn drained_stream_does_not_kill() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let control = RunControl::new();
        let done = Arc::new(AtomicBool::new(false));
        let guard = RunGuard::new(Arc::clone(&done), Arc::clone(&control), Vec::new(), Vec::new());
        let mut events = EventStream::new(rx, guard);

        tx.send(Event::new(EventKind::End, None)).unwrap();
        drop(tx);
        while events.next().await.is_some() {}
        drop(events);
        assert!(!control.killed());
    }

    #[tokio::test]
    async fn completed_run_is_not_killed_by_late_drop() {
        let (_tx, rx) = tokio::sync::mpsc::unbounded_channel::<Event>();
        let control = RunControl::new();
        let done = Arc::new(AtomicBool::new(false));
        let guard = RunGuard::new(Arc::clone(&done), Arc::clone(&control), Vec::new(), Vec::new());
        let events = EventStream::new(rx, guard);

        // The driver finished its cleanup before the caller dropped the
        // stream without draining it.
        done.store(true, Ordering::Release);
        drop(events);
        assert!(!control.killed());
    }
}
