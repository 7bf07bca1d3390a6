//! Origin and causality of events and service calls

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Context of the action that caused this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl Context {
    pub fn new() -> Self {
        Self::with_id(Ulid::new().to_string())
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user_id: None,
            parent_id: None,
        }
    }

    pub fn user(self, user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..self
        }
    }

    pub fn parent(self, parent_id: impl Into<String>) -> Self {
        Self {
            parent_id: Some(parent_id.into()),
            ..self
        }
    }

    /// Flat object of the non-empty fields, `None` if all are empty
    pub fn to_compact_json(&self) -> Option<Value> {
        let present: Map<String, Value> = [
            ("id", Some(self.id.as_str())),
            ("user_id", self.user_id.as_deref()),
            ("parent_id", self.parent_id.as_deref()),
        ]
        .into_iter()
        .filter_map(|(key, value)| {
            let value = value.filter(|v| !v.is_empty())?;
            Some((key.to_string(), Value::from(value)))
        })
        .collect();

        (!present.is_empty()).then_some(Value::Object(present))
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_compact_json_drops_blank_fields() {
        assert_eq!(
            Context::with_id("ctx-1").user("").to_compact_json(),
            Some(json!({"id": "ctx-1"}))
        );
        assert_eq!(
            Context::with_id("ctx-2").user("u").parent("p").to_compact_json(),
            Some(json!({"id": "ctx-2", "user_id": "u", "parent_id": "p"}))
        );
        assert_eq!(Context::with_id("").to_compact_json(), None);
    }
}
