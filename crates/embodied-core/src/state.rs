//! Entity state records

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{split_entity_id, Context};

pub const ATTR_FRIENDLY_NAME: &str = "friendly_name";

/// An entity's value at one moment.
///
/// Equality looks at entity id, value and attributes only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
    /// Last time `state` took a different value
    pub last_changed: DateTime<Utc>,
    /// Last write of value or attributes
    pub last_updated: DateTime<Utc>,
    pub context: Context,
}

impl State {
    pub fn new(
        entity_id: impl Into<String>,
        state: impl Into<String>,
        attributes: HashMap<String, Value>,
        context: Context,
    ) -> Self {
        let now = Utc::now();
        Self {
            entity_id: entity_id.into(),
            state: state.into(),
            attributes,
            last_changed: now,
            last_updated: now,
            context,
        }
    }

    /// The state that replaces this one after a write
    pub fn successor(
        &self,
        state: impl Into<String>,
        attributes: HashMap<String, Value>,
        context: Context,
    ) -> Self {
        let mut next = Self::new(self.entity_id.clone(), state, attributes, context);
        if next.state == self.state {
            next.last_changed = self.last_changed;
        }
        next
    }

    pub fn domain(&self) -> &str {
        split_entity_id(&self.entity_id).0
    }

    /// `friendly_name`, else the object id with spaces for underscores
    pub fn name(&self) -> Option<String> {
        let friendly = self
            .attributes
            .get(ATTR_FRIENDLY_NAME)
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty());
        if let Some(name) = friendly {
            return Some(name.to_string());
        }
        match split_entity_id(&self.entity_id).1 {
            "" => None,
            object_id => Some(object_id.replace('_', " ")),
        }
    }

    /// Value, attributes and both timestamps as sent upstream
    pub fn snapshot(&self) -> Value {
        json!({
            "state": self.state,
            "attributes": self.attributes,
            "last_changed": self.last_changed.to_rfc3339(),
            "last_updated": self.last_updated.to_rfc3339(),
        })
    }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        self.entity_id == other.entity_id
            && self.state == other.state
            && self.attributes == other.attributes
    }
}
