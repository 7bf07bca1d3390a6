//! Status entities
//!
//! Three host entities mirror one entry's controller: the autonomy switch, the
//! upstream connectivity sensor and the failure counter. They are republished
//! from a controller listener, so every pause or health change shows up as a
//! host state change.

use embodied_core::Context;
use embodied_registries::Registries;
use embodied_state_store::StateStore;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::debug;

use crate::autonomy::{AutonomyController, ListenerRemover};
use crate::constants::DOMAIN;

/// Object id fragment derived from an entry id
fn slug(entry_id: &str) -> String {
    entry_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}

pub struct StatusEntities {
    entry_id: String,
    title: String,
    autonomy_switch: String,
    upstream_sensor: String,
    failure_sensor: String,
    controller: Weak<AutonomyController>,
    states: Arc<StateStore>,
}

impl StatusEntities {
    pub fn new(
        title: impl Into<String>,
        controller: &Arc<AutonomyController>,
        states: Arc<StateStore>,
    ) -> Self {
        let entry_id = controller.entry_id().to_string();
        let slug = slug(&entry_id);
        Self {
            autonomy_switch: format!("switch.{slug}_autonomy"),
            upstream_sensor: format!("binary_sensor.{slug}_upstream_available"),
            failure_sensor: format!("sensor.{slug}_upstream_failure_count"),
            entry_id,
            title: title.into(),
            controller: Arc::downgrade(controller),
            states,
        }
    }

    pub fn autonomy_switch(&self) -> &str {
        &self.autonomy_switch
    }

    pub fn upstream_sensor(&self) -> &str {
        &self.upstream_sensor
    }

    pub fn failure_sensor(&self) -> &str {
        &self.failure_sensor
    }

    pub fn entity_ids(&self) -> Vec<String> {
        vec![
            self.autonomy_switch.clone(),
            self.upstream_sensor.clone(),
            self.failure_sensor.clone(),
        ]
    }

    /// Record the entities in the entity registry under this entry
    pub fn register(&self, registries: &Registries) {
        let slug = slug(&self.entry_id);
        for (entity_id, suffix) in [
            (&self.autonomy_switch, "autonomy"),
            (&self.upstream_sensor, "upstream"),
            (&self.failure_sensor, "failures"),
        ] {
            let unique_id = format!("{slug}_{suffix}");
            registries.entities.get_or_create(
                DOMAIN,
                entity_id,
                Some(&unique_id),
                Some(&self.entry_id),
            );
        }
    }

    /// Republish on every controller change
    pub fn attach(self: &Arc<Self>) -> Option<ListenerRemover> {
        let controller = self.controller.upgrade()?;
        let status = Arc::downgrade(self);
        Some(controller.add_listener(move || {
            if let Some(status) = status.upgrade() {
                status.publish();
            }
        }))
    }

    /// Write all three states from the controller's current values
    pub fn publish(&self) {
        let Some(controller) = self.controller.upgrade() else {
            return;
        };
        let snapshot = controller.snapshot();

        let mut attrs = HashMap::new();
        attrs.insert(
            "friendly_name".to_string(),
            json!(format!("{} Autonomy", self.title)),
        );
        attrs.insert("icon".to_string(), json!("mdi:robot"));
        self.states.set(
            &self.autonomy_switch,
            on_off(!snapshot.paused),
            attrs,
            Context::new(),
        );

        let mut attrs = HashMap::new();
        attrs.insert(
            "friendly_name".to_string(),
            json!(format!("{} Upstream available", self.title)),
        );
        attrs.insert("device_class".to_string(), json!("connectivity"));
        self.states.set(
            &self.upstream_sensor,
            on_off(snapshot.consecutive_failures == 0),
            attrs,
            Context::new(),
        );

        let mut attrs = HashMap::new();
        attrs.insert(
            "friendly_name".to_string(),
            json!(format!("{} Upstream failures", self.title)),
        );
        attrs.insert("icon".to_string(), json!("mdi:alert"));
        if let Some(last_failure) = snapshot.last_failure {
            attrs.insert("last_failure".to_string(), Value::String(last_failure));
        }
        if let Some(last_source) = snapshot.last_source {
            attrs.insert("last_source".to_string(), Value::String(last_source));
        }
        self.states.set(
            &self.failure_sensor,
            snapshot.consecutive_failures.to_string(),
            attrs,
            Context::new(),
        );
    }

    /// Drop the published states
    pub fn remove(&self) {
        for entity_id in self.entity_ids() {
            self.states.remove(&entity_id, Context::new());
        }
        debug!(entry_id = %self.entry_id, "Removed status entities");
    }
}
