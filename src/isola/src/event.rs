//! Typed one-way delivery of guest-originated events to the host.
//!
//! The guest execution worker posts `(kind, data)` pairs; the per-run pump
//! on the host scheduler delivers them, in emission order, to the run's
//! sink and to whatever user callback is registered at delivery time. The
//! callback slot is re-read per event, so a mid-run swap takes effect at
//! the very next event and the previous callback sees nothing further.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::error::{IsolaError, Result};

/// The kind of an [`Event`] emitted by the guest during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A yielded intermediate result; `data` is its JSON form.
    Result,
    /// The terminal event of a call; `data` is the return value's JSON
    /// form, or `None` when the call returned nothing.
    End,
    /// A line of standard output.
    Stdout,
    /// A line of standard error.
    Stderr,
    /// A recoverable error message.
    Error,
    /// A log record.
    Log,
}

impl EventKind {
    /// Parse a wire kind, normalizing the guest's `*_json` kinds.
    ///
    /// # Errors
    ///
    /// An unrecognized kind is an [`IsolaError::Internal`] — it means the
    /// guest runtime and the engine disagree about the wire contract.
    pub fn from_wire(kind: &str) -> Result<Self> {
        match kind {
            isola_common::KIND_RESULT_JSON | isola_common::KIND_RESULT => Ok(EventKind::Result),
            isola_common::KIND_END_JSON | isola_common::KIND_END => Ok(EventKind::End),
            isola_common::KIND_STDOUT => Ok(EventKind::Stdout),
            isola_common::KIND_STDERR => Ok(EventKind::Stderr),
            isola_common::KIND_ERROR => Ok(EventKind::Error),
            isola_common::KIND_LOG => Ok(EventKind::Log),
            other => Err(IsolaError::internal(format!(
                "unrecognized event kind '{other}'"
            ))),
        }
    }

    /// The normalized string form delivered to users.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Result => isola_common::KIND_RESULT,
            EventKind::End => isola_common::KIND_END,
            EventKind::Stdout => isola_common::KIND_STDOUT,
            EventKind::Stderr => isola_common::KIND_STDERR,
            EventKind::Error => isola_common::KIND_ERROR,
            EventKind::Log => isola_common::KIND_LOG,
        }
    }
}

/// A kind-tagged, optionally-payloaded message emitted by the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// What this event is.
    pub kind: EventKind,
    /// UTF-8 payload; JSON for `result`/`end`, free-form text otherwise.
    pub data: Option<String>,
}

impl Event {
    pub(crate) fn new(kind: EventKind, data: Option<String>) -> Self {
        Self { kind, data }
    }
}

/// A user event callback, invoked on the host scheduler for every event of
/// a run.
///
/// Plain `Fn(Event)` closures implement this via a blanket impl; implement
/// the trait directly when delivery needs to await. Handlers run on the
/// scheduler, never on the guest worker, and are awaited in order, so a
/// slow handler backpressures delivery rather than reordering it.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Deliver one event.
    async fn on_event(&self, event: Event);
}

#[async_trait]
impl<F> EventHandler for F
where
    F: Fn(Event) + Send + Sync,
{
    async fn on_event(&self, event: Event) {
        self(event);
    }
}

/// The sandbox's user-callback slot.
///
/// Registration replaces the whole slot; delivery reads it per event.
#[derive(Clone, Default)]
pub(crate) struct CallbackSlot {
    current: Arc<RwLock<Option<Arc<dyn EventHandler>>>>,
}

impl CallbackSlot {
    pub(crate) fn set(&self, handler: Option<Arc<dyn EventHandler>>) {
        *self.current.write().expect("callback slot poisoned") = handler;
    }

    pub(crate) fn get(&self) -> Option<Arc<dyn EventHandler>> {
        self.current.read().expect("callback slot poisoned").clone()
    }

    /// Deliver `event` to the currently registered handler, if any.
    ///
    /// A handler failure is logged and never aborts the run.
    pub(crate) async fn deliver(&self, event: Event) {
        use futures::FutureExt;
        if let Some(handler) = self.get() {
            let delivery = std::panic::AssertUnwindSafe(handler.on_event(event));
            if delivery.catch_unwind().await.is_err() {
                tracing::warn!("event callback panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn wire_kinds_normalize() {
        assert_eq!(EventKind::from_wire("result_json").unwrap(), EventKind::Result);
        assert_eq!(EventKind::from_wire("end_json").unwrap(), EventKind::End);
        assert_eq!(EventKind::from_wire("stdout").unwrap(), EventKind::Stdout);
        assert_eq!(EventKind::from_wire("stderr").unwrap(), EventKind::Stderr);
        assert_eq!(EventKind::from_wire("error").unwrap(), EventKind::Error);
        assert_eq!(EventKind::from_wire("log").unwrap(), EventKind::Log);
        // Already-normalized kinds pass through.
        assert_eq!(EventKind::from_wire("result").unwrap(), EventKind::Result);
        assert_eq!(EventKind::from_wire("end").unwrap(), EventKind::End);
    }

    #[test]
    fn unknown_kind_is_internal() {
        assert!(matches!(
            EventKind::from_wire("telemetry"),
            Err(IsolaError::Internal(_))
        ));
    }

    #[tokio::test]
    async fn swapped_callback_sees_only_later_events() {
        let slot = CallbackSlot::default();
        let seen_a = Arc::new(Mutex::new(Vec::new()));
        let seen_b = Arc::new(Mutex::new(Vec::new()));

        let sink_a = seen_a.clone();
        slot.set(Some(Arc::new(move |event: Event| {
            sink_a.lock().unwrap().push(event.data.clone());
        })));
        slot.deliver(Event::new(EventKind::Stdout, Some("first".into())))
            .await;

        let sink_b = seen_b.clone();
        slot.set(Some(Arc::new(move |event: Event| {
            sink_b.lock().unwrap().push(event.data.clone());
        })));
        slot.deliver(Event::new(EventKind::Stdout, Some("second".into())))
            .await;

        assert_eq!(*seen_a.lock().unwrap(), vec![Some("first".to_string())]);
        assert_eq!(*seen_b.lock().unwrap(), vec![Some("second".to_string())]);
    }

    #[tokio::test]
    async fn cleared_callback_drops_events() {
        let slot = CallbackSlot::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        slot.set(Some(Arc::new(move |event: Event| {
            sink.lock().unwrap().push(event.kind);
        })));
        slot.set(None);
        slot.deliver(Event::new(EventKind::Log, None)).await;
        assert!(seen.lock().unwrap().is_empty());
    }
}
