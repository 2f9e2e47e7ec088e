//! Transport seam consumed by the session layer.
//!
//! The real transport (IPC bridge, RPC client) lives outside this crate;
//! the session layer only needs listener registration and request
//! dispatch.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Callback handed to the transport, invoked for every delivered event.
pub type EventSink = Arc<dyn Fn(Value) + Send + Sync>;

/// Teardown closure for one listener registration.
pub type Unregister = Box<dyn FnOnce() + Send>;

/// Errors surfaced by transport implementations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("listener registration failed for {event}: {reason}")]
    Register { event: String, reason: String },

    #[error("invoke {method} failed: {reason}")]
    Invoke { method: String, reason: String },
}

/// Low-level pub-sub and RPC primitives the session layer is built on.
///
/// Implementations must invoke a registered sink in event arrival order
/// for its event name; the session layer makes no other ordering
/// assumptions about the transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Register a listener for one namespaced event name.
    ///
    /// The returned closure unregisters the listener and must be safe to
    /// call exactly once.
    async fn register_listener(
        &self,
        event_name: &str,
        sink: EventSink,
    ) -> Result<Unregister, TransportError>;

    /// Dispatch a request to the backend.
    async fn invoke(&self, method: &str, args: Value) -> Result<Value, TransportError>;
}
