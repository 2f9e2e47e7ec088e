//! Generation ids correlating events to one outstanding request.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque, process-unique token identifying one request/response cycle.
///
/// Every event the backend emits for a request carries the generation id
/// of that request; the delivery layer drops anything tagged with a stale
/// one. Exactly one generation is current per buffer at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenerationId(String);

impl GenerationId {
    /// Mint a fresh process-unique generation id.
    pub fn mint() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// View the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for GenerationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GenerationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for GenerationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}
