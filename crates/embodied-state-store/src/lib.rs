//! Current entity states
//!
//! Every effective write or removal fires `state_changed` on the bus with
//! the old and new state. A write that repeats the stored value and
//! attributes is dropped silently.

use dashmap::DashMap;
use embodied_core::events::StateChangedData;
use embodied_core::{Context, State};
use embodied_event_bus::EventBus;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{instrument, trace};

pub struct StateStore {
    states: DashMap<String, State>,
    bus: Arc<EventBus>,
}

impl StateStore {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            states: DashMap::new(),
            bus,
        }
    }

    /// Write an entity's state and return what is stored afterwards
    #[instrument(skip(self, state, attributes, context))]
    pub fn set(
        &self,
        entity_id: &str,
        state: impl Into<String>,
        attributes: HashMap<String, Value>,
        context: Context,
    ) -> State {
        let state = state.into();
        let old_state = self.get(entity_id);

        let new_state = match &old_state {
            Some(old) if old.state == state && old.attributes == attributes => {
                trace!("Unchanged state write dropped");
                return old.clone();
            }
            Some(old) => old.successor(state, attributes, context.clone()),
            None => State::new(entity_id, state, attributes, context.clone()),
        };

        self.states
            .insert(entity_id.to_string(), new_state.clone());
        self.announce(entity_id, old_state, Some(new_state.clone()), context);
        new_state
    }

    /// Forget an entity; the change event carries no new state
    #[instrument(skip(self, context))]
    pub fn remove(&self, entity_id: &str, context: Context) -> Option<State> {
        let (_, old_state) = self.states.remove(entity_id)?;
        self.announce(entity_id, Some(old_state.clone()), None, context);
        Some(old_state)
    }

    fn announce(
        &self,
        entity_id: &str,
        old_state: Option<State>,
        new_state: Option<State>,
        context: Context,
    ) {
        let change = StateChangedData {
            entity_id: entity_id.to_string(),
            old_state,
            new_state,
        };
        self.bus.fire_payload(&change, context);
    }

    pub fn get(&self, entity_id: &str) -> Option<State> {
        self.states.get(entity_id).map(|s| s.value().clone())
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embodied_core::events::STATE_CHANGED;
    use serde_json::json;

    fn store() -> (Arc<EventBus>, StateStore) {
        let bus = Arc::new(EventBus::new());
        (bus.clone(), StateStore::new(bus))
    }

    #[tokio::test]
    async fn test_first_write_has_no_old_state() {
        let (bus, store) = store();
        let mut rx = bus.subscribe(STATE_CHANGED);

        store.set("light.kitchen", "on", HashMap::new(), Context::with_id("c1"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.data["entity_id"], "light.kitchen");
        assert!(event.data["old_state"].is_null());
        assert_eq!(event.data["new_state"]["state"], "on");
        assert_eq!(event.context.id, "c1");
    }

    #[test]
    fn test_repeat_write_is_silent() {
        let (bus, store) = store();
        let mut rx = bus.subscribe(STATE_CHANGED);

        store.set("sensor.count", "1", HashMap::new(), Context::new());
        store.set("sensor.count", "1", HashMap::new(), Context::new());

        assert!(rx.try_recv().is_some());
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_attribute_only_change_is_written() {
        let (bus, store) = store();
        let mut rx = bus.subscribe(STATE_CHANGED);
        store.set("sensor.count", "1", HashMap::new(), Context::new());

        let attrs = HashMap::from([("last_source".to_string(), json!("event_forward"))]);
        let state = store.set("sensor.count", "1", attrs, Context::new());

        assert_eq!(state.attributes["last_source"], "event_forward");
        assert!(rx.try_recv().is_some());
        let second = rx.try_recv().unwrap();
        assert_eq!(second.data["old_state"]["attributes"], json!({}));
        assert_eq!(store.get("sensor.count").unwrap().state, "1");
    }

    #[test]
    fn test_remove_announces_and_forgets() {
        let (bus, store) = store();
        store.set("switch.fan", "on", HashMap::new(), Context::new());
        let mut rx = bus.subscribe(STATE_CHANGED);

        assert!(store.remove("switch.fan", Context::new()).is_some());
        let event = rx.try_recv().unwrap();
        assert!(event.data["new_state"].is_null());
        assert_eq!(event.data["old_state"]["state"], "on");

        assert!(store.get("switch.fan").is_none());
        assert!(store.is_empty());
        assert!(store.remove("switch.fan", Context::new()).is_none());
    }
}
