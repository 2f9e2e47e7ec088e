//! Tagged envelope wrapping every event payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::generation::GenerationId;

/// Wire envelope around a single event payload.
///
/// The generation id is mandatory and checked at deserialization, so no
/// untagged event can ever reach a handler. The payload shape is fixed by
/// the catalog name the envelope arrived under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Generation of the request this event belongs to.
    pub generation_id: GenerationId,
    /// Emission order assigned by the backend; informational.
    #[serde(default)]
    pub seq: u64,
    /// Event payload; decoded against the catalog shape at delivery.
    #[serde(default)]
    pub payload: Value,
}

impl EventEnvelope {
    /// Build an envelope around a payload (backends and tests).
    pub const fn new(generation_id: GenerationId, payload: Value) -> Self {
        Self {
            generation_id,
            seq: 0,
            payload,
        }
    }

    /// Parse an envelope out of a raw transport value.
    ///
    /// A missing, null, or empty generation id maps to
    /// [`CoreError::MissingGeneration`]; any other structural problem maps
    /// to [`CoreError::MalformedEnvelope`]. Unknown fields are ignored.
    pub fn from_value(raw: &Value) -> Result<Self> {
        let Some(object) = raw.as_object() else {
            return Err(CoreError::MalformedEnvelope(format!(
                "expected object, got {raw}"
            )));
        };

        match object.get("generationId") {
            None | Some(Value::Null) => return Err(CoreError::MissingGeneration),
            Some(Value::String(id)) if id.is_empty() => {
                return Err(CoreError::MissingGeneration);
            }
            Some(Value::String(_)) => {}
            Some(other) => {
                return Err(CoreError::MalformedEnvelope(format!(
                    "generation id must be a string, got {other}"
                )));
            }
        }

        serde_json::from_value(raw.clone()).map_err(CoreError::from)
    }
}
