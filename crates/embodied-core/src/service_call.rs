//! Service invocations

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Context;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCall {
    pub domain: String,
    pub service: String,
    pub service_data: Value,
    pub context: Context,
}

impl ServiceCall {
    pub fn new(
        domain: impl Into<String>,
        service: impl Into<String>,
        service_data: Value,
        context: Context,
    ) -> Self {
        Self {
            domain: domain.into(),
            service: service.into(),
            service_data,
            context,
        }
    }

    /// Fold a target map into service data.
    ///
    /// Null data becomes an object; keys already present in the data are
    /// kept. Non-object data is returned untouched.
    pub fn merge_target(service_data: Value, target: Option<&Map<String, Value>>) -> Value {
        let mut data = match service_data {
            Value::Null => Map::new(),
            Value::Object(map) => map,
            scalar => return scalar,
        };
        for (key, value) in target.into_iter().flatten() {
            if !data.contains_key(key) {
                data.insert(key.clone(), value.clone());
            }
        }
        Value::Object(data)
    }

    pub fn service_id(&self) -> String {
        format!("{}.{}", self.domain, self.service)
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        T::deserialize(self.service_data.get(key)?).ok()
    }

    /// `entity_id` as a list, whether given as one string or an array
    pub fn entity_ids(&self) -> Vec<String> {
        match self.service_data.get("entity_id") {
            Some(Value::String(one)) => vec![one.clone()],
            Some(Value::Array(many)) => many
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Whether a service hands a value back to its caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupportsResponse {
    #[default]
    None,
    Optional,
    Only,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_accessors() {
        let call = ServiceCall::new(
            "light",
            "turn_on",
            json!({"brightness": 200, "entity_id": "light.desk"}),
            Context::new(),
        );

        assert_eq!(call.service_id(), "light.turn_on");
        assert_eq!(call.get::<u8>("brightness"), Some(200));
        assert_eq!(call.get::<u8>("color"), None);
        assert_eq!(call.entity_ids(), vec!["light.desk"]);
    }

    #[test]
    fn test_data_wins_over_target() {
        let target = json!({"entity_id": "light.kitchen", "area_id": "kitchen"});
        let merged = ServiceCall::merge_target(
            json!({"brightness": 255, "area_id": "pantry"}),
            target.as_object(),
        );

        assert_eq!(
            merged,
            json!({"brightness": 255, "area_id": "pantry", "entity_id": "light.kitchen"})
        );
    }

    #[test]
    fn test_target_into_null_data() {
        let target = json!({"entity_id": ["light.a", "light.b"]});
        let merged = ServiceCall::merge_target(Value::Null, target.as_object());
        let call = ServiceCall::new("light", "turn_off", merged, Context::new());

        assert_eq!(call.entity_ids(), vec!["light.a", "light.b"]);
        assert_eq!(ServiceCall::merge_target(json!(5), target.as_object()), json!(5));
    }

    #[test]
    fn test_no_entity_ids() {
        let call = ServiceCall::new("robot", "dock", json!({}), Context::new());
        assert!(call.entity_ids().is_empty());
    }
}
