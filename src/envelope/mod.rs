//! Event envelope.
//!
//! Every event exchanged between services travels inside an [`Envelope`]:
//! identity, origin, type and creation time around an opaque JSON payload.
//!
//! ## Wire Format
//!
//! ```json
//! {
//!   "id": "5b0f6c1e-...",
//!   "source": "billing.1.4.0",
//!   "specversion": "0.3",
//!   "type": "billing.invoice.created",
//!   "time": "2024-05-01T10:00:00.123Z",
//!   "data": { "amount": 42 }
//! }
//! ```
//!
//! Only `data` can change after construction, through [`Envelope::set_at_path`].

mod path;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Envelope format version.
pub const SPEC_VERSION: &str = "0.3";

/// Errors that can occur while building, decoding or editing an envelope.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode envelope: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Invalid data path '{path}': {reason}")]
    Path { path: String, reason: String },
}

/// Immutable event wrapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    id: String,
    source: String,
    #[serde(rename = "specversion")]
    spec_version: String,
    #[serde(rename = "type")]
    event_type: String,
    time: DateTime<Utc>,
    #[serde(default)]
    data: Value,
}

impl Envelope {
    /// Wrap `payload` in a new envelope with a fresh id and the current UTC time.
    pub fn new<T: Serialize + ?Sized>(
        source: impl Into<String>,
        event_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self, EnvelopeError> {
        let data = serde_json::to_value(payload).map_err(EnvelopeError::Encode)?;

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            source: source.into(),
            spec_version: SPEC_VERSION.to_string(),
            event_type: event_type.into(),
            time: Utc::now(),
            data,
        })
    }

    /// Decode an envelope from its JSON wire form.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(bytes).map_err(EnvelopeError::Decode)
    }

    /// Encode the envelope to its JSON wire form.
    pub fn to_vec(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(EnvelopeError::Encode)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn spec_version(&self) -> &str {
        &self.spec_version
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Convert `data` into a concrete type.
    ///
    /// Fails with [`EnvelopeError::Decode`] when the payload's structure does not
    /// match `T`.
    pub fn decode_data_into<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        T::deserialize(&self.data).map_err(EnvelopeError::Decode)
    }

    /// Read the value at a dot-separated `path` inside `data`.
    ///
    /// Numeric segments index arrays, `\.` escapes a literal dot. Returns `None`
    /// when the path is malformed or nothing lives there.
    pub fn get_at_path(&self, path: &str) -> Option<&Value> {
        let segments = path::parse(path).ok()?;
        path::get(&self.data, &segments)
    }

    /// Write `value` at a dot-separated `path` inside `data`.
    ///
    /// Missing intermediate objects and arrays are created. A `-1` segment
    /// appends to an array.
    pub fn set_at_path<T: Serialize + ?Sized>(
        &mut self,
        path: &str,
        value: &T,
    ) -> Result<(), EnvelopeError> {
        let segments = path::parse(path)?;
        let value = serde_json::to_value(value).map_err(EnvelopeError::Encode)?;
        path::set(&mut self.data, &segments, value).map_err(|reason| EnvelopeError::Path {
            path: path.to_string(),
            reason,
        })
    }
}
