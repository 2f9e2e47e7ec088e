//! Session layer configuration, statistics, and errors.

use std::time::Duration;

use crate::transport::TransportError;

/// Configuration for session subscriptions.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum events held while a buffer is not ready; the oldest entry
    /// is evicted past this.
    pub queue_capacity: usize,
    /// Upper bound on first-time listener registration.
    pub registration_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            registration_timeout: Duration::from_secs(10),
        }
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Number of live session entries.
    pub session_count: usize,
    /// Total subscriber references across all sessions.
    pub total_subscribers: usize,
}

/// Session layer errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// First-time listener registration failed; the session is unusable.
    #[error("transport registration failed: {0}")]
    Registration(#[from] TransportError),

    /// Registration did not settle within the configured bound.
    #[error("transport registration timed out after {0:?}")]
    RegistrationTimeout(Duration),

    /// The registry was shut down by the host.
    #[error("subscription registry is shut down")]
    ShutDown,
}
