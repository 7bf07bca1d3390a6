//! Common test utilities for the bridge
//!
//! [`TestHost`] is an isolated host with captured events; [`RecordingClient`]
//! stands in for the upstream endpoint.

#![allow(dead_code)]

use async_trait::async_trait;
use embodied_bridge::{Bridge, ClientFactory, Host};
use embodied_client::{ClientError, ClientResult, UpstreamClient};
use embodied_components::{register_persistent_notification_services, PersistentNotificationManager};
use embodied_config::IntegrationConfig;
use embodied_config_entries::ConfigEntry;
use embodied_core::{Context, Event, ServiceCall, State, SupportsResponse};
use embodied_event_bus::ListenerHandle;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const ENTRY_ID: &str = "robot1";

/// A host instance with every fired event captured
pub struct TestHost {
    pub host: Host,
    pub notifications: Arc<PersistentNotificationManager>,
    captured_events: Arc<Mutex<Vec<Event>>>,
    _capture: ListenerHandle,
    _dir: TempDir,
}

impl TestHost {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let host = Host::new(dir.path());

        let notifications = Arc::new(PersistentNotificationManager::new());
        register_persistent_notification_services(
            &host.services,
            notifications.clone(),
            host.bus.clone(),
        );

        let captured_events = Arc::new(Mutex::new(Vec::new()));
        let sink = captured_events.clone();
        let capture = host.bus.listen_all(move |event: &Event| {
            sink.lock().unwrap().push(event.clone());
        });

        Self {
            host,
            notifications,
            captured_events,
            _capture: capture,
            _dir: dir,
        }
    }

    /// Captured events of one type, in firing order
    pub fn events(&self, event_type: &str) -> Vec<Event> {
        self.captured_events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.event_type.as_str() == event_type)
            .cloned()
            .collect()
    }

    pub fn set_state(&self, entity_id: &str, state: &str) -> State {
        self.host
            .states
            .set(entity_id, state, HashMap::new(), Context::new())
    }

    pub fn state(&self, entity_id: &str) -> Option<String> {
        self.host.states.get(entity_id).map(|s| s.state)
    }

    /// Register `light.turn_on` answering `{"status": "ok"}`; returns its calls
    pub fn register_light(&self) -> Arc<Mutex<Vec<ServiceCall>>> {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        self.host.services.register(
            "light",
            "turn_on",
            move |call: ServiceCall| {
                sink.lock().unwrap().push(call);
                async { Ok(Some(json!({"status": "ok"}))) }
            },
            None,
            SupportsResponse::Optional,
        );
        calls
    }

    /// Add and set up the bridge entry [`ENTRY_ID`]
    pub async fn add_entry(
        &self,
        bridge: &Arc<Bridge>,
        exposure: &[&str],
        options: HashMap<String, Value>,
    ) -> ConfigEntry {
        self.add_entry_with_id(bridge, ENTRY_ID, exposure, options).await
    }

    /// Add and set up one bridge entry, each with its own endpoint
    pub async fn add_entry_with_id(
        &self,
        bridge: &Arc<Bridge>,
        entry_id: &str,
        exposure: &[&str],
        options: HashMap<String, Value>,
    ) -> ConfigEntry {
        bridge.register_handlers();
        let config = IntegrationConfig::new(format!("http://{entry_id}.local/api"))
            .with_exposure(exposure.iter().copied());
        let entry = self
            .host
            .config_entries
            .add(
                ConfigEntry::new("aiembodied", "Robot")
                    .with_entry_id(entry_id)
                    .with_data(config.to_entry_data())
                    .with_options(options),
            )
            .await
            .unwrap();
        self.host.config_entries.setup(entry_id).await.unwrap();
        entry
    }

    /// Register `switch.turn_on` / `turn_off` writing the target's state
    pub fn register_switches(&self) {
        for (service, value) in [("turn_on", "on"), ("turn_off", "off")] {
            let states = self.host.states.clone();
            self.host.services.register(
                "switch",
                service,
                move |call: ServiceCall| {
                    for entity_id in call.entity_ids() {
                        states.set(&entity_id, value, HashMap::new(), call.context.clone());
                    }
                    async { Ok(None) }
                },
                None,
                SupportsResponse::None,
            );
        }
    }

    /// Wait until a notification with this id exists
    pub async fn wait_for_notification(&self, notification_id: &str) -> bool {
        for _ in 0..100 {
            if self.notifications.get(notification_id).is_some() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

/// Upstream double recording every payload
#[derive(Default)]
pub struct RecordingClient {
    failing: AtomicBool,
    payloads: Mutex<Vec<Value>>,
}

impl RecordingClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Payloads whose `type` field matches
    pub fn payloads(&self, payload_type: &str) -> Vec<Value> {
        self.payloads
            .lock()
            .unwrap()
            .iter()
            .filter(|payload| payload["type"] == payload_type)
            .cloned()
            .collect()
    }

    pub fn factory(self: &Arc<Self>) -> ClientFactory {
        let client = self.clone();
        Arc::new(move |_: &IntegrationConfig| {
            let client: Arc<dyn UpstreamClient> = client.clone();
            Ok(client)
        })
    }
}

#[async_trait]
impl UpstreamClient for RecordingClient {
    async fn post_json(&self, payload: &Value) -> ClientResult<Value> {
        self.payloads.lock().unwrap().push(payload.clone());
        if self.failing.load(Ordering::SeqCst) {
            Err(ClientError::communication("connection refused"))
        } else {
            Ok(json!({}))
        }
    }
}
