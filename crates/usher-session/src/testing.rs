//! Shared test doubles for session layer tests.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::watch;

use usher_core::GenerationId;
use usher_core::events::{
    ErrorEvent, MessageChunk, MessageStart, SessionComplete, ToolComplete, ToolStart,
};

use crate::handlers::EventHandlers;
use crate::transport::{EventSink, Transport, TransportError, Unregister};

/// Handler set recording every delivery as a compact string.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, entry: String) {
        self.events.lock().unwrap().push(entry);
    }
}

impl EventHandlers for Recorder {
    fn on_message_start(&self, event: MessageStart) {
        self.record(format!("start:{}", event.message_id));
    }

    fn on_message_chunk(&self, event: MessageChunk) {
        self.record(format!("chunk:{}", event.text));
    }

    fn on_tool_start(&self, event: ToolStart) {
        self.record(format!("tool-start:{}", event.tool_id));
    }

    fn on_tool_complete(&self, event: ToolComplete) {
        self.record(format!("tool-complete:{}", event.tool_id));
    }

    fn on_session_complete(&self, _event: SessionComplete) {
        self.record("complete".to_string());
    }

    fn on_error(&self, event: ErrorEvent) {
        self.record(format!("error:{}", event.code));
    }
}

/// Build the wire envelope a backend would emit.
pub fn envelope(generation: &str, payload: Value) -> Value {
    json!({ "generationId": generation, "payload": payload })
}

#[derive(Default)]
struct FakeInner {
    sinks: HashMap<String, Vec<(u64, EventSink)>>,
    next_sink: u64,
    invocations: Vec<(String, Value)>,
    fail_events: Vec<String>,
    fail_invocations: bool,
    held_events: Vec<String>,
}

/// In-memory transport recording registrations and invocations.
///
/// Events emitted through [`emit`](Self::emit) reach whatever sinks are
/// currently registered, exactly like a real pub-sub bridge. Individual
/// event names can be made to fail registration, or to hold registration
/// open until the test releases it.
pub struct FakeTransport {
    inner: Arc<Mutex<FakeInner>>,
    hold_tx: watch::Sender<bool>,
    hold_rx: watch::Receiver<bool>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        let (hold_tx, hold_rx) = watch::channel(false);
        Arc::new(Self {
            inner: Arc::new(Mutex::new(FakeInner::default())),
            hold_tx,
            hold_rx,
        })
    }

    /// Make registration for `event_name` fail.
    pub fn fail_event(&self, event_name: &str) {
        self.inner
            .lock()
            .unwrap()
            .fail_events
            .push(event_name.to_string());
    }

    /// Make every `invoke` fail.
    pub fn fail_invocations(&self) {
        self.inner.lock().unwrap().fail_invocations = true;
    }

    /// Hold registration for `event_name` open until
    /// [`release_holds`](Self::release_holds).
    pub fn hold_event(&self, event_name: &str) {
        self.inner
            .lock()
            .unwrap()
            .held_events
            .push(event_name.to_string());
    }

    /// Let every held registration settle.
    pub fn release_holds(&self) {
        let _ = self.hold_tx.send(true);
    }

    /// Number of live sinks for one event name.
    pub fn listener_count(&self, event_name: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .sinks
            .get(event_name)
            .map_or(0, Vec::len)
    }

    /// Number of live sinks across all event names.
    pub fn total_listeners(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .sinks
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Every `invoke` call so far, in order.
    pub fn invocations(&self) -> Vec<(String, Value)> {
        self.inner.lock().unwrap().invocations.clone()
    }

    /// Emit an envelope-wrapped payload to every sink registered for
    /// `event_name`.
    pub fn emit(&self, event_name: &str, generation: &GenerationId, payload: Value) {
        self.emit_raw(event_name, envelope(generation.as_str(), payload));
    }

    /// Emit a raw value without envelope wrapping (malformed-path tests).
    pub fn emit_raw(&self, event_name: &str, value: Value) {
        let sinks: Vec<EventSink> = self
            .inner
            .lock()
            .unwrap()
            .sinks
            .get(event_name)
            .map(|entries| entries.iter().map(|(_, sink)| Arc::clone(sink)).collect())
            .unwrap_or_default();
        for sink in sinks {
            sink(value.clone());
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn register_listener(
        &self,
        event_name: &str,
        sink: EventSink,
    ) -> Result<Unregister, TransportError> {
        let held = self
            .inner
            .lock()
            .unwrap()
            .held_events
            .iter()
            .any(|held| held == event_name);
        if held {
            let mut rx = self.hold_rx.clone();
            let _ = rx.wait_for(|released| *released).await;
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.fail_events.iter().any(|failed| failed == event_name) {
            return Err(TransportError::Register {
                event: event_name.to_string(),
                reason: "injected failure".to_string(),
            });
        }

        let id = inner.next_sink;
        inner.next_sink += 1;
        inner
            .sinks
            .entry(event_name.to_string())
            .or_default()
            .push((id, sink));

        let shared = Arc::clone(&self.inner);
        let name = event_name.to_string();
        Ok(Box::new(move || {
            if let Ok(mut inner) = shared.lock()
                && let Some(entries) = inner.sinks.get_mut(&name)
            {
                entries.retain(|(sink_id, _)| *sink_id != id);
            }
        }))
    }

    async fn invoke(&self, method: &str, args: Value) -> Result<Value, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_invocations {
            return Err(TransportError::Invoke {
                method: method.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        inner.invocations.push((method.to_string(), args));
        Ok(Value::Null)
    }
}
