//! Versioned catalog of namespaced event names.

/// Typed key into the fixed event catalog.
///
/// Exactly one payload shape exists per kind, and dispatch tables key off
/// this enum, so an unknown wire name can never reach a handler slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The backend began a response message.
    MessageStart,
    /// A streamed text fragment of the response.
    MessageChunk,
    /// The backend started executing a tool call.
    ToolStart,
    /// A tool call finished.
    ToolComplete,
    /// The request's response cycle finished.
    SessionComplete,
    /// The backend reported an error for the request.
    Error,
}

impl EventKind {
    /// Every kind in the catalog, in a stable order.
    pub const ALL: [Self; 6] = [
        Self::MessageStart,
        Self::MessageChunk,
        Self::ToolStart,
        Self::ToolComplete,
        Self::SessionComplete,
        Self::Error,
    ];

    /// The namespaced wire name for this kind.
    pub const fn name(self) -> &'static str {
        match self {
            Self::MessageStart => "assistant:v1:message-start",
            Self::MessageChunk => "assistant:v1:message-chunk",
            Self::ToolStart => "assistant:v1:tool-start",
            Self::ToolComplete => "assistant:v1:tool-complete",
            Self::SessionComplete => "assistant:v1:session-complete",
            Self::Error => "assistant:v1:error",
        }
    }

    /// Resolve a wire name back to a catalog kind.
    ///
    /// Unknown names return `None`; callers ignore them for forward
    /// compatibility.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
