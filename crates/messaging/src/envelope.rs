//! The message envelope exchanged by every client and server.
//!
//! Envelopes are JSON documents:
//!
//! ```json
//! { "status": "ok", "data": ..., "action": "name", "timeOut": 5000,
//!   "attachments": { "file": "<base64>" } }
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Envelope encoding and decoding errors.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// A value could not be serialized.
    #[error("cannot encode message: {0}")]
    Encode(String),

    /// Bytes could not be parsed as an envelope or payload.
    #[error("cannot decode message: {0}")]
    Decode(String),
}

/// Outcome carried by an envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// The data is a result.
    Ok,
    /// The data describes a failure.
    Error,
}

/// Serialized message wrapper.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Whether `data` is a result or a failure.
    pub status: Status,

    /// The payload.
    #[serde(default)]
    pub data: Value,

    /// Action the receiver should dispatch to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    /// Processing deadline in milliseconds, overriding the receiver default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_out: Option<u64>,

    /// Named binary attachments.
    #[serde(
        default,
        skip_serializing_if = "BTreeMap::is_empty",
        with = "base64_attachments"
    )]
    pub attachments: BTreeMap<String, Bytes>,
}

impl Envelope {
    /// An `ok` envelope carrying `data`.
    #[must_use]
    pub const fn ok(data: Value) -> Self {
        Self {
            status: Status::Ok,
            data,
            action: None,
            time_out: None,
            attachments: BTreeMap::new(),
        }
    }

    /// An `error` envelope carrying `reason`.
    #[must_use]
    pub fn error(reason: impl Into<Value>) -> Self {
        Self {
            status: Status::Error,
            ..Self::ok(reason.into())
        }
    }

    /// An `ok` envelope carrying `payload` serialized to JSON.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if the payload cannot be represented as
    /// JSON (for example a map with non-string keys).
    pub fn from_payload<T: Serialize + ?Sized>(payload: &T) -> Result<Self, CodecError> {
        serde_json::to_value(payload)
            .map(Self::ok)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Sets the action.
    #[must_use]
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Sets the processing deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.time_out = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Adds every attachment in `attachments`.
    #[must_use]
    pub fn with_attachments(mut self, attachments: BTreeMap<String, Bytes>) -> Self {
        self.attachments.extend(attachments);
        self
    }

    /// Whether the status is `ok`.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    /// The processing deadline requested by the sender. A zero `timeOut`
    /// counts as absent so the receiver's default applies.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.time_out
            .filter(|millis| *millis > 0)
            .map(Duration::from_millis)
    }

    /// Deserializes `data` into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] if `data` does not match `T`.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        T::deserialize(&self.data).map_err(|e| CodecError::Decode(e.to_string()))
    }

    /// Encodes the envelope to bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if serialization fails.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Decodes an envelope from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] for anything that is not an envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

mod base64_attachments {
    use std::collections::BTreeMap;

    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::de::Error as _;
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        attachments: &BTreeMap<String, Bytes>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(attachments.len()))?;
        for (name, content) in attachments {
            map.serialize_entry(name, &STANDARD.encode(content))?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, Bytes>, D::Error> {
        BTreeMap::<String, String>::deserialize(deserializer)?
            .into_iter()
            .map(|(name, encoded)| {
                STANDARD
                    .decode(encoded)
                    .map(|content| (name, Bytes::from(content)))
                    .map_err(D::Error::custom)
            })
            .collect()
    }
}
