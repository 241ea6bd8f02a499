//! Bounded FIFO of JSON payloads carrying iterable arguments into the guest.
//!
//! The producer side lives on the host; the consumer side is the guest
//! runtime, pulling from the sandbox worker thread. End-of-stream is the
//! explicit handoff point: once [`JsonStream::end`] has been observed by a
//! draining consumer, the host owns nothing further.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use crate::error::{IsolaError, Result};

/// A bounded, thread-safe FIFO of JSON-encoded payloads with a terminal
/// "ended" flag.
///
/// Handles are cheap clones of a shared core. The channel never inspects
/// payloads; callers are responsible for handing it valid JSON.
#[derive(Clone)]
pub struct JsonStream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    state: Mutex<StreamState>,
    // Signalled when space frees up or the stream ends.
    space: Condvar,
    // Signalled when an item arrives or the stream ends.
    items: Condvar,
}

struct StreamState {
    queue: VecDeque<String>,
    capacity: usize,
    ended: bool,
}

impl JsonStream {
    /// Create a stream with the given capacity.
    ///
    /// # Errors
    ///
    /// Fails with [`IsolaError::InvalidArgument`] when `capacity` is zero.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(IsolaError::invalid("stream capacity must be at least 1"));
        }
        Ok(Self {
            inner: Arc::new(StreamInner {
                state: Mutex::new(StreamState {
                    queue: VecDeque::new(),
                    capacity,
                    ended: false,
                }),
                space: Condvar::new(),
                items: Condvar::new(),
            }),
        })
    }

    /// Create a stream pre-filled with the serialized forms of `values` and
    /// already ended.
    ///
    /// Capacity is sized to the input so the fill never blocks.
    ///
    /// # Errors
    ///
    /// Fails when a value cannot be serialized.
    pub fn from_values<I, T>(values: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: serde::Serialize,
    {
        let payloads = values
            .into_iter()
            .map(|value| serde_json::to_string(&value))
            .collect::<std::result::Result<VecDeque<_>, _>>()?;
        let capacity = payloads.len().max(1);
        let stream = Self::new(capacity)?;
        {
            let mut state = stream.inner.state.lock().expect("stream lock poisoned");
            state.queue = payloads;
            state.ended = true;
        }
        stream.inner.items.notify_all();
        Ok(stream)
    }

    /// Push one JSON payload.
    ///
    /// In blocking mode this waits until space is available or the stream
    /// ends; in non-blocking mode a full queue fails immediately with
    /// [`IsolaError::StreamFull`] and has no side effect.
    ///
    /// # Errors
    ///
    /// [`IsolaError::StreamClosed`] once [`end`](Self::end) has been called,
    /// including for pushers that were blocked waiting when it happened.
    pub fn push_json(&self, payload: impl Into<String>, blocking: bool) -> Result<()> {
        let payload = payload.into();
        let mut state = self.inner.state.lock().expect("stream lock poisoned");
        loop {
            if state.ended {
                return Err(IsolaError::StreamClosed);
            }
            if state.queue.len() < state.capacity {
                state.queue.push_back(payload);
                self.inner.items.notify_one();
                return Ok(());
            }
            if !blocking {
                return Err(IsolaError::StreamFull);
            }
            state = self.inner.space.wait(state).expect("stream lock poisoned");
        }
    }

    /// Mark the stream ended. Idempotent.
    ///
    /// Further pushes fail with [`IsolaError::StreamClosed`]; a consumer that
    /// drains the queue then observes termination.
    pub fn end(&self) {
        let mut state = self.inner.state.lock().expect("stream lock poisoned");
        if !state.ended {
            state.ended = true;
            self.inner.space.notify_all();
            self.inner.items.notify_all();
        }
    }

    /// Whether [`end`](Self::end) has been called.
    pub fn is_ended(&self) -> bool {
        self.inner.state.lock().expect("stream lock poisoned").ended
    }

    /// Consumer side: block until an item or termination.
    ///
    /// Returns `None` exactly once the queue is drained and the stream has
    /// ended.
    pub(crate) fn take(&self) -> Option<String> {
        let mut state = self.inner.state.lock().expect("stream lock poisoned");
        loop {
            if let Some(payload) = state.queue.pop_front() {
                self.inner.space.notify_one();
                return Some(payload);
            }
            if state.ended {
                return None;
            }
            state = self.inner.items.wait(state).expect("stream lock poisoned");
        }
    }
}

impl std::fmt::Debug for JsonStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().expect("stream lock poisoned");
        f.debug_struct("JsonStream")
            .field("queued", &state.queue.len())
            .field("capacity", &state.capacity)
            .field("ended", &state.ended)
            .finish()
    }
}
