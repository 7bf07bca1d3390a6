//! Events carried by the host bus

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Context;

/// Event type a listener uses to receive every event
pub const MATCH_ALL: &str = "*";

/// A payload with a fixed event type
pub trait EventPayload: Serialize {
    const EVENT_TYPE: &'static str;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    pub data: Value,
    pub time_fired: DateTime<Utc>,
    pub context: Context,
}

impl Event {
    pub fn new(event_type: impl Into<String>, data: Value, context: Context) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            time_fired: Utc::now(),
            context,
        }
    }

    /// Encode a typed payload. A payload that fails to serialize is sent
    /// with null data.
    pub fn from_payload<P: EventPayload>(payload: &P, context: Context) -> Self {
        let data = serde_json::to_value(payload).unwrap_or(Value::Null);
        Self::new(P::EVENT_TYPE, data, context)
    }

    /// Decode the data back into a typed payload
    pub fn decode<T: DeserializeOwned>(&self) -> Option<T> {
        T::deserialize(&self.data).ok()
    }

    pub fn is(&self, event_type: &str) -> bool {
        self.event_type == event_type
    }
}
