//! Subscription coordination: ref-counted session entries sharing one
//! transport registration each.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{RwLock, watch};
use tracing::{debug, info, warn};

use usher_core::EventKind;

use crate::buffer::EventBuffer;
use crate::generation::RequestTracker;
use crate::handlers::EventHandlers;
use crate::transport::{EventSink, Transport, Unregister};
use crate::types::{SessionConfig, SessionError, SubscriptionStats};

/// Where first-time transport registration currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetupPhase {
    Pending,
    Complete,
    Failed,
}

/// Per-session coordination state.
///
/// Short, synchronous critical sections only; never held across an await.
struct EntryState {
    ref_count: usize,
    /// Receiver for the shared in-flight setup; `None` until the first
    /// subscriber starts registration.
    setup: Option<watch::Receiver<SetupPhase>>,
    /// Why setup failed, held for the subscriber that reports it.
    setup_error: Option<SessionError>,
    /// Consolidated transport teardown, populated once setup completes.
    teardown: Vec<Unregister>,
}

struct SessionEntry {
    session_id: String,
    buffer: Arc<EventBuffer>,
    state: Mutex<EntryState>,
}

impl SessionEntry {
    fn lock(&self) -> MutexGuard<'_, EntryState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

type SessionMap = Arc<RwLock<HashMap<String, Arc<SessionEntry>>>>;

/// Process-wide registry of ref-counted session subscriptions.
///
/// One entry exists per session id. Every subscriber to a session shares
/// the entry's buffer and its single transport registration, no matter
/// how many subscribe; teardown happens only when the last one releases.
pub struct SubscriptionRegistry {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    sessions: SessionMap,
    shut_down: AtomicBool,
}

impl SubscriptionRegistry {
    /// Create a registry over the given transport.
    pub fn new(transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        Self {
            transport,
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults(transport: Arc<dyn Transport>) -> Self {
        Self::new(transport, SessionConfig::default())
    }

    /// Subscribe a handler set to a session.
    ///
    /// The first subscriber performs the transport registration: every
    /// catalog event name, one combined concurrent step, with each
    /// callback wired into the shared buffer. Later subscribers join the
    /// existing registration and return immediately, whether or not setup
    /// has settled yet. Any registration failure rejects the whole call
    /// and leaves no partial registration behind; a rejected subscribe is
    /// terminal for the session.
    pub async fn subscribe(
        &self,
        session_id: &str,
        handlers: Arc<dyn EventHandlers>,
    ) -> Result<SubscriptionGuard, SessionError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SessionError::ShutDown);
        }

        let (entry, first_caller_rx) = {
            let mut sessions = self.sessions.write().await;
            // Re-check under the lock: a concurrent shutdown drains the
            // map after setting the flag, so no entry may be added past it.
            if self.shut_down.load(Ordering::SeqCst) {
                return Err(SessionError::ShutDown);
            }
            let entry = Arc::clone(sessions.entry(session_id.to_string()).or_insert_with(|| {
                Arc::new(SessionEntry {
                    session_id: session_id.to_string(),
                    buffer: Arc::new(EventBuffer::new(self.config.queue_capacity)),
                    state: Mutex::new(EntryState {
                        ref_count: 0,
                        setup: None,
                        setup_error: None,
                        teardown: Vec::new(),
                    }),
                })
            }));

            let mut state = entry.lock();
            state.ref_count += 1;
            entry.buffer.update_handlers(handlers);

            let rx = if state.setup.is_some() {
                // Setup exists or is in flight: share it and deliver
                // immediately.
                entry.buffer.set_ready();
                debug!(
                    session_id,
                    ref_count = state.ref_count,
                    "joined existing session subscription"
                );
                None
            } else {
                let (tx, rx) = watch::channel(SetupPhase::Pending);
                state.setup = Some(rx.clone());
                self.spawn_setup(&entry, tx);
                Some(rx)
            };
            drop(state);
            (entry, rx)
        };

        let guard = SubscriptionGuard {
            sessions: Arc::clone(&self.sessions),
            entry: Arc::clone(&entry),
            released: AtomicBool::new(false),
        };

        let Some(mut rx) = first_caller_rx else {
            return Ok(guard);
        };

        // First caller: resolve only once every registration settles.
        let settled = rx
            .wait_for(|phase| *phase != SetupPhase::Pending)
            .await
            .map_or(SetupPhase::Failed, |phase| *phase);
        match settled {
            SetupPhase::Complete => Ok(guard),
            SetupPhase::Failed | SetupPhase::Pending => {
                // The setup task already rolled every reference back, so
                // the guard must not release again.
                guard.released.store(true, Ordering::SeqCst);
                let err = entry.lock().setup_error.take();
                drop(guard);
                Err(err.unwrap_or(SessionError::Registration(
                    crate::transport::TransportError::Register {
                        event: "*".to_string(),
                        reason: "first-time setup was abandoned".to_string(),
                    },
                )))
            }
        }
    }

    /// Run first-time registration on a detached task so a cancelled
    /// subscribe cannot abandon it halfway through.
    fn spawn_setup(&self, entry: &Arc<SessionEntry>, tx: watch::Sender<SetupPhase>) {
        let transport = Arc::clone(&self.transport);
        let sessions = Arc::clone(&self.sessions);
        let entry = Arc::clone(entry);
        let timeout = self.config.registration_timeout;

        tokio::spawn(async move {
            match register_all(transport.as_ref(), &entry, timeout).await {
                Ok(teardown) => {
                    {
                        let mut state = entry.lock();
                        state.teardown = teardown;
                    }
                    entry.buffer.set_ready();
                    let _ = tx.send(SetupPhase::Complete);
                    info!(session_id = %entry.session_id, "session subscription established");
                }
                Err(err) => {
                    warn!(
                        session_id = %entry.session_id,
                        error = %err,
                        "session registration failed, rolling back"
                    );
                    {
                        let mut state = entry.lock();
                        state.ref_count = 0;
                        state.setup_error = Some(err);
                        state.teardown.clear();
                    }
                    entry.buffer.reset();
                    let mut sessions = sessions.write().await;
                    if let Some(current) = sessions.get(&entry.session_id)
                        && Arc::ptr_eq(current, &entry)
                    {
                        sessions.remove(&entry.session_id);
                    }
                    drop(sessions);
                    let _ = tx.send(SetupPhase::Failed);
                }
            }
        });
    }

    /// Shared buffer for a live session, if one exists.
    ///
    /// Correlation and test hook; prefer [`SubscriptionGuard::buffer`].
    pub async fn session_buffer(&self, session_id: &str) -> Option<Arc<EventBuffer>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|entry| Arc::clone(&entry.buffer))
    }

    /// Registry statistics.
    pub async fn stats(&self) -> SubscriptionStats {
        let sessions = self.sessions.read().await;
        let total_subscribers = sessions.values().map(|entry| entry.lock().ref_count).sum();
        SubscriptionStats {
            session_count: sessions.len(),
            total_subscribers,
        }
    }

    /// Tear down every live session and refuse further subscriptions.
    ///
    /// The host calls this exactly once at exit; repeated calls are
    /// no-ops, and pending first-time setups are awaited so no
    /// registration outlives the registry.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let entries: Vec<Arc<SessionEntry>> = self
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        let count = entries.len();
        for entry in entries {
            await_setup(&entry).await;
            let teardown = {
                let mut state = entry.lock();
                state.ref_count = 0;
                state.setup = None;
                std::mem::take(&mut state.teardown)
            };
            for unregister in teardown {
                unregister();
            }
            entry.buffer.reset();
        }
        if count > 0 {
            info!(sessions = count, "subscription registry shut down");
        }
    }
}

/// Register a listener for every catalog event name as one combined
/// concurrent step.
///
/// Either every registration succeeds, or every registration that did
/// succeed is unregistered again and the first error is returned.
async fn register_all(
    transport: &dyn Transport,
    entry: &Arc<SessionEntry>,
    timeout: std::time::Duration,
) -> Result<Vec<Unregister>, SessionError> {
    let registrations = EventKind::ALL.into_iter().map(|kind| {
        let buffer = Arc::clone(&entry.buffer);
        let sink: EventSink = Arc::new(move |value: Value| buffer.push(kind, &value));
        transport.register_listener(kind.name(), sink)
    });

    let results = match tokio::time::timeout(timeout, join_all(registrations)).await {
        Ok(results) => results,
        Err(_) => return Err(SessionError::RegistrationTimeout(timeout)),
    };

    let mut teardown = Vec::with_capacity(results.len());
    let mut first_error = None;
    for result in results {
        match result {
            Ok(unregister) => teardown.push(unregister),
            Err(err) if first_error.is_none() => first_error = Some(err),
            Err(_) => {}
        }
    }

    if let Some(err) = first_error {
        // Roll back the registrations that did land.
        for unregister in teardown {
            unregister();
        }
        return Err(SessionError::Registration(err));
    }
    Ok(teardown)
}

/// Wait for an in-flight first-time setup to settle, if one exists.
///
/// An abandoned setup (sender dropped without sending) counts as settled.
async fn await_setup(entry: &Arc<SessionEntry>) {
    let rx = entry.lock().setup.clone();
    if let Some(mut rx) = rx
        && *rx.borrow() == SetupPhase::Pending
    {
        let _ = rx.wait_for(|phase| *phase != SetupPhase::Pending).await;
    }
}

/// Complete a release that took the reference count to zero.
///
/// Awaits any pending setup first (never leave a live registration), then
/// re-checks the count: a subscriber that raced in while setup settled
/// keeps the session alive.
async fn finish_release(sessions: SessionMap, entry: Arc<SessionEntry>) {
    await_setup(&entry).await;

    let teardown = {
        let mut sessions = sessions.write().await;
        let mut state = entry.lock();
        if state.ref_count > 0 {
            return;
        }
        if let Some(current) = sessions.get(&entry.session_id)
            && Arc::ptr_eq(current, &entry)
        {
            sessions.remove(&entry.session_id);
        }
        state.setup = None;
        std::mem::take(&mut state.teardown)
    };

    let listeners = teardown.len();
    for unregister in teardown {
        unregister();
    }
    entry.buffer.reset();
    if listeners > 0 {
        debug!(
            session_id = %entry.session_id,
            listeners,
            "transport registration torn down"
        );
    }
}

/// Handle for one subscriber's share of a session subscription.
///
/// [`release`](Self::release) is idempotent and safe to call while
/// first-time setup is still in flight; the last release performs the
/// transport teardown. Dropping an unreleased guard releases it on a
/// detached task when a runtime is available.
pub struct SubscriptionGuard {
    sessions: SessionMap,
    entry: Arc<SessionEntry>,
    released: AtomicBool,
}

impl SubscriptionGuard {
    /// The session this guard subscribes to.
    pub fn session_id(&self) -> &str {
        &self.entry.session_id
    }

    /// Shared event buffer for this session.
    pub fn buffer(&self) -> Arc<EventBuffer> {
        Arc::clone(&self.entry.buffer)
    }

    /// Request tracker bound to this session's buffer.
    pub fn tracker(&self) -> RequestTracker {
        RequestTracker::new(self.buffer())
    }

    /// Release this subscriber's reference.
    ///
    /// Calling more than once is a no-op and the reference count can
    /// never go below zero. The last release waits out any in-flight
    /// setup, then tears down the transport registration and resets the
    /// buffer.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let now_zero = {
            let mut state = self.entry.lock();
            state.ref_count = state.ref_count.saturating_sub(1);
            state.ref_count == 0
        };
        if now_zero {
            finish_release(Arc::clone(&self.sessions), Arc::clone(&self.entry)).await;
        } else {
            debug!(
                session_id = %self.entry.session_id,
                "subscriber released, session stays live"
            );
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let now_zero = {
            let mut state = self.entry.lock();
            state.ref_count = state.ref_count.saturating_sub(1);
            state.ref_count == 0
        };
        if !now_zero {
            return;
        }
        // Best effort: finish on a detached task so a forgotten guard
        // cannot leak the transport registration.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            debug!(
                session_id = %self.entry.session_id,
                "last subscription guard dropped without release, tearing down in background"
            );
            handle.spawn(finish_release(
                Arc::clone(&self.sessions),
                Arc::clone(&self.entry),
            ));
        } else {
            warn!(
                session_id = %self.entry.session_id,
                "subscription guard dropped outside a runtime, transport registration leaked"
            );
        }
    }
}
