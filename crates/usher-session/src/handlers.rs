//! Handler sets invoked with delivered events.

use usher_core::events::{
    ErrorEvent, MessageChunk, MessageStart, SessionComplete, ToolComplete, ToolStart,
};

/// Caller-supplied delivery targets, one slot per catalog event.
///
/// Every method defaults to a no-op so subscribers implement only the
/// slots they care about. Handlers run on the transport callback path
/// while the owning buffer is locked and must not call back into it.
pub trait EventHandlers: Send + Sync {
    fn on_message_start(&self, _event: MessageStart) {}
    fn on_message_chunk(&self, _event: MessageChunk) {}
    fn on_tool_start(&self, _event: ToolStart) {}
    fn on_tool_complete(&self, _event: ToolComplete) {}
    fn on_session_complete(&self, _event: SessionComplete) {}
    fn on_error(&self, _event: ErrorEvent) {}
}

/// Handler set that ignores everything; a buffer's initial target.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandlers;

impl EventHandlers for NoopHandlers {}
