//! Request/generation tracking.

use std::sync::{Arc, Mutex};

use usher_core::GenerationId;

use crate::buffer::EventBuffer;

/// Mints a generation per outgoing request and registers it with the
/// buffer before the request can be dispatched.
///
/// [`begin_request`](Self::begin_request) completes the buffer
/// registration synchronously before returning, so no event for the new
/// request can outrun the generation filter.
pub struct RequestTracker {
    buffer: Arc<EventBuffer>,
    current: Mutex<Option<GenerationId>>,
}

impl RequestTracker {
    /// Track requests against the given buffer.
    pub fn new(buffer: Arc<EventBuffer>) -> Self {
        Self {
            buffer,
            current: Mutex::new(None),
        }
    }

    /// Mint a fresh generation and make it current on the buffer.
    pub fn begin_request(&self) -> GenerationId {
        let id = GenerationId::mint();
        self.buffer.set_current_generation(id.clone());
        *self.lock() = Some(id.clone());
        id
    }

    /// The most recently minted generation, if any.
    pub fn current_generation(&self) -> Option<GenerationId> {
        self.lock().clone()
    }

    /// The buffer this tracker registers generations with.
    pub fn buffer(&self) -> &Arc<EventBuffer> {
        &self.buffer
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<GenerationId>> {
        self.current
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
