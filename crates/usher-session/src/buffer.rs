//! Event buffer: orders, filters, and delivers generation-tagged events.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tracing::{debug, warn};

use usher_core::events::{
    ErrorEvent, MessageChunk, MessageStart, SessionComplete, ToolComplete, ToolStart,
};
use usher_core::{EventEnvelope, EventKind, GenerationId};

use crate::handlers::{EventHandlers, NoopHandlers};

/// Buffer lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    /// Queueing until a subscriber signals readiness.
    NotReady,
    /// Delivering synchronously on arrival.
    Ready,
    /// Rejecting everything until resurrected.
    Destroyed,
}

/// One event held for a not-yet-ready subscriber.
#[derive(Debug, Clone)]
struct BufferedEvent {
    kind: EventKind,
    envelope: EventEnvelope,
    enqueue_order: u64,
}

struct BufferInner {
    lifecycle: Lifecycle,
    generation: Option<GenerationId>,
    queue: VecDeque<BufferedEvent>,
    handlers: Arc<dyn EventHandlers>,
    next_enqueue: u64,
}

/// Orders, filters by generation, and delivers events to the active
/// handler set; absorbs events that arrive before handlers are ready.
///
/// All operations are synchronous and serialized behind one lock, so an
/// event pushed concurrently with [`reset`](Self::reset) either delivers
/// before the reset or observes `Destroyed` -- never half of each.
/// Within one generation, delivery preserves push order.
pub struct EventBuffer {
    inner: Mutex<BufferInner>,
    capacity: usize,
}

impl EventBuffer {
    /// Create a buffer holding at most `capacity` queued events.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(BufferInner {
                lifecycle: Lifecycle::NotReady,
                generation: None,
                queue: VecDeque::new(),
                handlers: Arc::new(NoopHandlers),
                next_enqueue: 0,
            }),
            capacity,
        }
    }

    /// Recover the guard even if a handler panicked while delivering.
    fn lock(&self) -> MutexGuard<'_, BufferInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Set the active generation, purging queued events that do not match.
    ///
    /// Resurrects a destroyed buffer. Repeated calls with the same id are
    /// no-ops, so a retried call cannot purge its own queue.
    pub fn set_current_generation(&self, id: GenerationId) {
        let mut inner = self.lock();
        if inner.lifecycle == Lifecycle::Destroyed {
            debug!(generation = %id, "resurrecting destroyed buffer");
            inner.lifecycle = Lifecycle::NotReady;
        }
        if inner.generation.as_ref() == Some(&id) {
            return;
        }
        let before = inner.queue.len();
        inner.queue.retain(|event| event.envelope.generation_id == id);
        let purged = before - inner.queue.len();
        if purged > 0 {
            debug!(generation = %id, purged, "purged queued events from superseded generation");
        }
        inner.generation = Some(id);
    }

    /// Swap delivery targets without disturbing buffered or ready state.
    ///
    /// Used when the owning caller instance is replaced but the
    /// subscription must persist. A live caller updating handlers implies
    /// continued use, so this also resurrects a destroyed buffer.
    pub fn update_handlers(&self, handlers: Arc<dyn EventHandlers>) {
        let mut inner = self.lock();
        if inner.lifecycle == Lifecycle::Destroyed {
            debug!("resurrecting destroyed buffer on handler update");
            inner.lifecycle = Lifecycle::NotReady;
        }
        inner.handlers = handlers;
    }

    /// Accept one transport event.
    ///
    /// Destroyed buffers drop everything. Envelopes without a usable
    /// generation id are dropped with a warning. Ready buffers deliver
    /// matching events synchronously in call order and drop stale ones;
    /// otherwise events queue until [`set_ready`](Self::set_ready),
    /// evicting the oldest entry past capacity.
    pub fn push(&self, kind: EventKind, raw: &Value) {
        let mut inner = self.lock();
        if inner.lifecycle == Lifecycle::Destroyed {
            debug!(event = %kind, "dropping event pushed at destroyed buffer");
            return;
        }

        let envelope = match EventEnvelope::from_value(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(event = %kind, error = %err, "dropping event with unusable envelope");
                return;
            }
        };

        if inner.lifecycle == Lifecycle::Ready {
            if inner.generation.as_ref() == Some(&envelope.generation_id) {
                dispatch(&inner.handlers, kind, envelope.payload);
            } else {
                debug!(
                    event = %kind,
                    generation = %envelope.generation_id,
                    "dropping stale event"
                );
            }
            return;
        }

        let enqueue_order = inner.next_enqueue;
        inner.next_enqueue += 1;
        inner.queue.push_back(BufferedEvent {
            kind,
            envelope,
            enqueue_order,
        });
        if inner.queue.len() > self.capacity
            && let Some(evicted) = inner.queue.pop_front()
        {
            warn!(
                event = %evicted.kind,
                enqueue_order = evicted.enqueue_order,
                capacity = self.capacity,
                "event queue overflow, evicting oldest entry"
            );
        }
    }

    /// Accept one transport event by wire name.
    ///
    /// Names outside the catalog are ignored (forward compatible, never an
    /// error); known names behave exactly like [`push`](Self::push).
    pub fn push_named(&self, event_name: &str, raw: &Value) {
        match EventKind::from_name(event_name) {
            Some(kind) => self.push(kind, raw),
            None => debug!(event = event_name, "ignoring unknown event name"),
        }
    }

    /// Flip to ready and flush queued events for the current generation in
    /// FIFO order, then clear the queue. No-op when destroyed.
    pub fn set_ready(&self) {
        let mut inner = self.lock();
        match inner.lifecycle {
            Lifecycle::Destroyed => {
                debug!("ignoring set_ready on destroyed buffer");
                return;
            }
            Lifecycle::Ready => return,
            Lifecycle::NotReady => {}
        }
        inner.lifecycle = Lifecycle::Ready;

        let queued: Vec<BufferedEvent> = inner.queue.drain(..).collect();
        let total = queued.len();
        let mut flushed = 0usize;
        for event in queued {
            if inner.generation.as_ref() == Some(&event.envelope.generation_id) {
                dispatch(&inner.handlers, event.kind, event.envelope.payload);
                flushed += 1;
            }
        }
        if total > 0 {
            debug!(flushed, dropped = total - flushed, "flushed buffered events");
        }
    }

    /// Hard teardown.
    ///
    /// Flips to destroyed first, so any push serialized behind this call
    /// is rejected, then clears queue, readiness, and generation. Only an
    /// explicit resurrection call accepts events again.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.lifecycle = Lifecycle::Destroyed;
        let dropped = inner.queue.len();
        inner.queue.clear();
        inner.generation = None;
        if dropped > 0 {
            debug!(dropped, "buffer reset discarded queued events");
        }
    }

    /// Whether the buffer is delivering immediately.
    pub fn is_ready(&self) -> bool {
        self.lock().lifecycle == Lifecycle::Ready
    }

    /// Whether the buffer is rejecting everything.
    pub fn is_destroyed(&self) -> bool {
        self.lock().lifecycle == Lifecycle::Destroyed
    }

    /// Number of queued, undelivered events.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Whether no events are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current generation, if one is set.
    pub fn current_generation(&self) -> Option<GenerationId> {
        self.lock().generation.clone()
    }
}

/// Fixed mapping from catalog kind to one handler slot.
///
/// Payloads that fail to decode against the catalog shape are dropped
/// with a warning; handlers never see a partially-decoded event.
fn dispatch(handlers: &Arc<dyn EventHandlers>, kind: EventKind, payload: Value) {
    fn decode<T: serde::de::DeserializeOwned>(kind: EventKind, payload: Value) -> Option<T> {
        match serde_json::from_value(payload) {
            Ok(decoded) => Some(decoded),
            Err(err) => {
                warn!(event = %kind, error = %err, "dropping event with malformed payload");
                None
            }
        }
    }

    match kind {
        EventKind::MessageStart => {
            if let Some(event) = decode::<MessageStart>(kind, payload) {
                handlers.on_message_start(event);
            }
        }
        EventKind::MessageChunk => {
            if let Some(event) = decode::<MessageChunk>(kind, payload) {
                handlers.on_message_chunk(event);
            }
        }
        EventKind::ToolStart => {
            if let Some(event) = decode::<ToolStart>(kind, payload) {
                handlers.on_tool_start(event);
            }
        }
        EventKind::ToolComplete => {
            if let Some(event) = decode::<ToolComplete>(kind, payload) {
                handlers.on_tool_complete(event);
            }
        }
        EventKind::SessionComplete => {
            if let Some(event) = decode::<SessionComplete>(kind, payload) {
                handlers.on_session_complete(event);
            }
        }
        EventKind::Error => {
            if let Some(event) = decode::<ErrorEvent>(kind, payload) {
                handlers.on_error(event);
            }
        }
    }
}
