use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;

use eventline_core::ValidationErrors;

/// An immutable, typed fact proposed for an entity's history.
///
/// The set of event kinds is closed per stream: implement this on an enum whose
/// variants are the kinds, and map each variant to a stable `event_type` tag.
/// Durable entries store the tag and the attributes separately, so
/// [`from_attributes`](Event::from_attributes) must accept exactly what
/// [`to_attributes`](Event::to_attributes) produced for the same tag.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable type tag (e.g. `"counter.added"`).
    fn event_type(&self) -> &'static str;

    /// Serialized attributes of this event (without the type tag).
    fn to_attributes(&self) -> Result<JsonValue, EventCodecError>;

    /// Rehydrate an event from its type tag and attributes.
    fn from_attributes(event_type: &str, attributes: JsonValue) -> Result<Self, EventCodecError>;

    /// Schema/rule validation of the event's own attributes.
    fn validate(&self) -> ValidationErrors {
        ValidationErrors::new()
    }
}

#[derive(Debug, Error)]
pub enum EventCodecError {
    #[error("unknown event type: {0}")]
    UnknownType(String),

    #[error("malformed attributes for {event_type}: {source}")]
    Attributes {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Serialize one variant's attribute struct.
pub fn encode_attributes<T: Serialize>(
    event_type: &str,
    attributes: &T,
) -> Result<JsonValue, EventCodecError> {
    serde_json::to_value(attributes).map_err(|source| EventCodecError::Attributes {
        event_type: event_type.to_string(),
        source,
    })
}

/// Deserialize one variant's attribute struct.
pub fn decode_attributes<T: DeserializeOwned>(
    event_type: &str,
    attributes: JsonValue,
) -> Result<T, EventCodecError> {
    serde_json::from_value(attributes).map_err(|source| EventCodecError::Attributes {
        event_type: event_type.to_string(),
        source,
    })
}
