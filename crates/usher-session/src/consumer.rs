//! Thin consumer state machine driven by delivered events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::json;
use tracing::{debug, warn};

use usher_core::GenerationId;
use usher_core::events::{
    ErrorEvent, MessageChunk, MessageStart, SessionComplete, ToolComplete, ToolStart,
};

use crate::generation::RequestTracker;
use crate::handlers::EventHandlers;
use crate::transport::{Transport, TransportError};

/// Where the current turn stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnPhase {
    #[default]
    Idle,
    /// Request dispatched, no response event yet.
    Sending,
    /// Response events are arriving.
    Streaming,
    /// The response cycle finished.
    Complete,
    /// The backend reported an error for the turn.
    Failed,
}

#[derive(Default)]
struct TurnState {
    phase: TurnPhase,
    transcript: String,
    pending_tools: HashMap<String, String>,
    last_error: Option<String>,
}

/// Drives one conversation turn at a time over the session layer.
///
/// Turn state lives here, not in the buffer, so a remount can swap the
/// buffer's handler set to a fresh consumer `Arc` without losing the
/// turn. Registered through the subscription registry as its own handler
/// set; transitions are driven only by delivered events.
pub struct TurnConsumer {
    transport: Arc<dyn Transport>,
    tracker: RequestTracker,
    state: Mutex<TurnState>,
}

impl TurnConsumer {
    /// Build a consumer over the transport and a session's tracker.
    pub fn new(transport: Arc<dyn Transport>, tracker: RequestTracker) -> Self {
        Self {
            transport,
            tracker,
            state: Mutex::new(TurnState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TurnState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Dispatch a user message as a new turn.
    ///
    /// The generation is minted and registered with the buffer before the
    /// request leaves, so no response event can outrun the filter.
    /// Beginning a new turn silently supersedes the previous one.
    pub async fn send(&self, text: &str) -> Result<GenerationId, TransportError> {
        let generation = self.tracker.begin_request();
        {
            let mut state = self.lock();
            state.phase = TurnPhase::Sending;
            state.transcript.clear();
            state.pending_tools.clear();
            state.last_error = None;
        }

        let args = json!({ "generationId": generation, "text": text });
        match self.transport.invoke("send_message", args).await {
            Ok(_) => Ok(generation),
            Err(err) => {
                let mut state = self.lock();
                state.phase = TurnPhase::Failed;
                state.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    /// Current phase of the turn.
    pub fn phase(&self) -> TurnPhase {
        self.lock().phase
    }

    /// Accumulated streamed text for the current turn.
    pub fn transcript(&self) -> String {
        self.lock().transcript.clone()
    }

    /// Tool calls started but not yet completed, as `(id, name)` pairs.
    pub fn pending_tools(&self) -> Vec<(String, String)> {
        let state = self.lock();
        let mut tools: Vec<(String, String)> = state
            .pending_tools
            .iter()
            .map(|(id, name)| (id.clone(), name.clone()))
            .collect();
        tools.sort();
        tools
    }

    /// Last backend or dispatch error, if the turn failed.
    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    /// The tracker this consumer mints generations from.
    pub fn tracker(&self) -> &RequestTracker {
        &self.tracker
    }
}

impl EventHandlers for TurnConsumer {
    fn on_message_start(&self, event: MessageStart) {
        debug!(message_id = %event.message_id, "turn streaming");
        self.lock().phase = TurnPhase::Streaming;
    }

    fn on_message_chunk(&self, event: MessageChunk) {
        let mut state = self.lock();
        state.phase = TurnPhase::Streaming;
        state.transcript.push_str(&event.text);
    }

    fn on_tool_start(&self, event: ToolStart) {
        self.lock()
            .pending_tools
            .insert(event.tool_id, event.tool_name);
    }

    fn on_tool_complete(&self, event: ToolComplete) {
        let mut state = self.lock();
        if state.pending_tools.remove(&event.tool_id).is_none() {
            debug!(tool_id = %event.tool_id, "completion for unknown tool call");
        }
    }

    fn on_session_complete(&self, event: SessionComplete) {
        let mut state = self.lock();
        debug!(stop_reason = ?event.stop_reason, "turn complete");
        state.phase = TurnPhase::Complete;
        state.pending_tools.clear();
    }

    fn on_error(&self, event: ErrorEvent) {
        let mut state = self.lock();
        warn!(code = %event.code, message = %event.message, "turn failed");
        state.phase = TurnPhase::Failed;
        state.last_error = Some(event.message);
    }
}
