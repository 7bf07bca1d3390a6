//! Entry runtime
//!
//! [`Bridge`] owns one [`EntryRuntime`] per loaded config entry and the
//! process-wide services: `aiembodied.invoke_service` for inbound actions and
//! `aiembodied.set_autonomy` for the pause switch. When no other component
//! handles the `switch` domain, `switch.turn_on` / `switch.turn_off` drive the
//! autonomy switches too; any other switch id is rejected.
//!
//! An entry whose data changes is reloaded. An options change only applies
//! `autonomy_paused`.

use dashmap::DashMap;
use embodied_client::{ClientConfig, EmbodiedClient, UpstreamClient};
use embodied_config::{IntegrationConfig, IntegrationOptions, DEFAULT_FAILURE_THRESHOLD, DEFAULT_TIMEOUT};
use embodied_config_entries::{ConfigEntries, ConfigEntry, UpdateListenerHandle};
use embodied_core::{ServiceCall, SupportsResponse};
use embodied_event_bus::EventBus;
use embodied_registries::Registries;
use embodied_service_registry::{ServiceError, ServiceRegistry, ServiceResult};
use embodied_state_store::StateStore;
use serde_json::json;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::autonomy::{AutonomyController, ListenerRemover};
use crate::constants::{DOMAIN, SERVICE_INVOKE, SERVICE_SET_AUTONOMY};
use crate::error::{BridgeError, BridgeResult, GateError};
use crate::exposure::ExposureFilter;
use crate::forwarder::{BridgeEntities, ForwarderDeps, StateChangeForwarder};
use crate::gate::{ActionInvocationGate, ActionRequest, ActionResponse};
use crate::host::{ConfigEntryOptionsStore, ServiceNotifier};
use crate::status::StatusEntities;

const SWITCH_DOMAIN: &str = "switch";

/// Builds the upstream client for an entry
pub type ClientFactory =
    Arc<dyn Fn(&IntegrationConfig) -> BridgeResult<Arc<dyn UpstreamClient>> + Send + Sync>;

/// Host subsystems the bridge runs against
#[derive(Clone)]
pub struct Host {
    pub bus: Arc<EventBus>,
    pub states: Arc<StateStore>,
    pub services: Arc<ServiceRegistry>,
    pub registries: Arc<Registries>,
    pub config_entries: Arc<ConfigEntries>,
}

impl Host {
    /// Fresh host subsystems persisting under `config_dir/.storage`
    pub fn new(config_dir: impl AsRef<Path>) -> Self {
        let bus = Arc::new(EventBus::new());
        let registries = Arc::new(Registries::new(config_dir));
        Self {
            states: Arc::new(StateStore::new(bus.clone())),
            services: Arc::new(ServiceRegistry::new()),
            config_entries: Arc::new(ConfigEntries::new(registries.storage.clone())),
            registries,
            bus,
        }
    }
}

/// Default client: reqwest against the configured endpoint
pub fn http_client_factory() -> ClientFactory {
    Arc::new(|config: &IntegrationConfig| {
        let mut client_config = ClientConfig::new(config.endpoint.clone())
            .with_timeout(Duration::from_secs(DEFAULT_TIMEOUT));
        client_config.headers = config.headers.clone();
        if let Some(token) = &config.auth_token {
            client_config = client_config.with_auth_token(token.clone());
        }
        let client: Arc<dyn UpstreamClient> = Arc::new(EmbodiedClient::new(client_config)?);
        Ok(client)
    })
}

/// Everything running for one config entry
pub struct EntryRuntime {
    entry_id: String,
    config: IntegrationConfig,
    options: IntegrationOptions,
    autonomy: Arc<AutonomyController>,
    forwarder: Arc<StateChangeForwarder>,
    gate: ActionInvocationGate,
    status: Arc<StatusEntities>,
    update_listener: Mutex<Option<UpdateListenerHandle>>,
    status_listener: Option<ListenerRemover>,
}

impl EntryRuntime {
    pub fn entry_id(&self) -> &str {
        &self.entry_id
    }

    pub fn config(&self) -> &IntegrationConfig {
        &self.config
    }

    /// Options as they were at setup
    pub fn options(&self) -> &IntegrationOptions {
        &self.options
    }

    pub fn autonomy(&self) -> &Arc<AutonomyController> {
        &self.autonomy
    }

    pub fn forwarder(&self) -> &Arc<StateChangeForwarder> {
        &self.forwarder
    }

    pub fn gate(&self) -> &ActionInvocationGate {
        &self.gate
    }

    pub fn status(&self) -> &Arc<StatusEntities> {
        &self.status
    }

    fn shutdown(&self) {
        self.forwarder.shutdown();
        let handle = match self.update_listener.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.remove();
        }
        if let Some(remover) = &self.status_listener {
            remover.remove();
        }
        self.status.remove();
    }
}

pub struct Bridge {
    host: Host,
    runtimes: DashMap<String, Arc<EntryRuntime>>,
    client_factory: ClientFactory,
    /// Status entities of every runtime
    published: BridgeEntities,
    owns_switch_services: AtomicBool,
}

impl Bridge {
    pub fn new(host: Host) -> Arc<Self> {
        Self::with_client_factory(host, http_client_factory())
    }

    pub fn with_client_factory(host: Host, client_factory: ClientFactory) -> Arc<Self> {
        Arc::new(Self {
            host,
            runtimes: DashMap::new(),
            client_factory,
            published: BridgeEntities::new(),
            owns_switch_services: AtomicBool::new(false),
        })
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn runtime(&self, entry_id: &str) -> Option<Arc<EntryRuntime>> {
        self.runtimes.get(entry_id).map(|r| r.value().clone())
    }

    pub fn runtime_count(&self) -> usize {
        self.runtimes.len()
    }

    /// Entity ids published by all runtimes; never forwarded
    pub fn published_entities(&self) -> &BridgeEntities {
        &self.published
    }

    /// Route `aiembodied` entries of the config entry manager to this bridge
    pub fn register_handlers(self: &Arc<Self>) {
        let bridge = Arc::downgrade(self);
        self.host
            .config_entries
            .register_setup_handler(DOMAIN, move |entry: ConfigEntry| {
                let bridge = bridge.clone();
                async move {
                    let bridge = bridge.upgrade().ok_or_else(|| "bridge is gone".to_string())?;
                    bridge
                        .setup_entry(&entry)
                        .map(|_| ())
                        .map_err(|err| err.to_string())
                }
            });

        let bridge = Arc::downgrade(self);
        self.host
            .config_entries
            .register_unload_handler(DOMAIN, move |entry: ConfigEntry| {
                let bridge = bridge.clone();
                async move {
                    if let Some(bridge) = bridge.upgrade() {
                        bridge.unload_entry(&entry.entry_id);
                    }
                    Ok::<(), String>(())
                }
            });
    }

    /// Start the runtime of one entry
    #[instrument(skip(self, entry), fields(entry_id = %entry.entry_id))]
    pub fn setup_entry(self: &Arc<Self>, entry: &ConfigEntry) -> BridgeResult<Arc<EntryRuntime>> {
        if self.runtimes.contains_key(&entry.entry_id) {
            return Err(BridgeError::AlreadySetUp(entry.entry_id.clone()));
        }

        let config = IntegrationConfig::from_entry_data(&entry.data)?;
        let options = IntegrationOptions::from_entry_options(&entry.options);
        let client = (self.client_factory)(&config)?;
        let host = &self.host;

        let autonomy = Arc::new(AutonomyController::new(
            entry.entry_id.clone(),
            options.autonomy_paused,
            DEFAULT_FAILURE_THRESHOLD,
            Arc::new(ConfigEntryOptionsStore::new(host.config_entries.clone())),
            Arc::new(ServiceNotifier::new(host.services.clone())),
        ));

        let status = Arc::new(StatusEntities::new(
            entry.title.clone(),
            &autonomy,
            host.states.clone(),
        ));
        status.register(&host.registries);
        self.published.insert(status.entity_ids());

        let forwarder = Arc::new(StateChangeForwarder::new(
            entry.entry_id.clone(),
            ExposureFilter::compile(&config.exposure),
            self.published.clone(),
            ForwarderDeps {
                source: host.bus.clone(),
                client: client.clone(),
                audit: host.bus.clone(),
                areas: host.registries.clone(),
                autonomy: Some(autonomy.clone()),
            },
        ));
        autonomy.add_pause_callbacks([forwarder.pause_callback()]);

        let gate = ActionInvocationGate::new(
            autonomy.clone(),
            host.services.clone(),
            client,
            host.bus.clone(),
        );

        let status_listener = status.attach();
        status.publish();

        if options.autonomy_paused {
            forwarder.set_paused(true);
        } else {
            forwarder.setup();
        }

        let bridge = Arc::downgrade(self);
        let update_listener =
            host.config_entries
                .add_update_listener(&entry.entry_id, move |entry: ConfigEntry| {
                    let bridge = bridge.clone();
                    async move {
                        if let Some(bridge) = bridge.upgrade() {
                            bridge.apply_entry_update(entry).await;
                        }
                    }
                });

        let runtime = Arc::new(EntryRuntime {
            entry_id: entry.entry_id.clone(),
            config,
            options,
            autonomy,
            forwarder,
            gate,
            status,
            update_listener: Mutex::new(Some(update_listener)),
            status_listener,
        });

        self.runtimes.insert(entry.entry_id.clone(), runtime.clone());
        self.register_services();

        info!(
            exposed_entities = runtime.forwarder.filter().entities().len(),
            exposed_domains = runtime.forwarder.filter().domains().len(),
            paused = runtime.options.autonomy_paused,
            "Embodied AI entry set up"
        );
        Ok(runtime)
    }

    /// Stop the runtime of one entry. Returns whether it was running.
    #[instrument(skip(self))]
    pub fn unload_entry(&self, entry_id: &str) -> bool {
        let Some((_, runtime)) = self.runtimes.remove(entry_id) else {
            return false;
        };
        runtime.shutdown();
        // Removal events fired by shutdown are still excluded
        self.published.remove(runtime.status.entity_ids());

        if self.runtimes.is_empty() {
            self.unregister_services();
        }
        info!("Embodied AI entry unloaded");
        true
    }

    /// Reload on changed data, otherwise follow `autonomy_paused`
    async fn apply_entry_update(&self, entry: ConfigEntry) {
        let Some(runtime) = self.runtime(&entry.entry_id) else {
            return;
        };

        let data_changed = IntegrationConfig::from_entry_data(&entry.data)
            .map_or(true, |config| config != runtime.config);
        if data_changed {
            info!(entry_id = %entry.entry_id, "Entry data changed, reloading");
            if let Err(err) = self.host.config_entries.reload(&entry.entry_id).await {
                warn!(entry_id = %entry.entry_id, error = %err, "Reload failed");
            }
            return;
        }

        let paused = IntegrationOptions::from_entry_options(&entry.options).autonomy_paused;
        runtime.autonomy.set_paused_with(paused, false, false).await;
    }

    /// Route an action request to its entry's gate
    pub async fn invoke(&self, request: ActionRequest) -> Result<ActionResponse, GateError> {
        if request.entry_id.trim().is_empty() {
            return Err(GateError::Configuration("entry_id is required".to_string()));
        }
        let runtime = self.runtime(&request.entry_id).ok_or_else(|| {
            GateError::Configuration(format!("unknown entry {}", request.entry_id))
        })?;
        runtime.gate.invoke(request).await
    }

    fn register_services(self: &Arc<Self>) {
        let services = &self.host.services;

        if !services.has_service(DOMAIN, SERVICE_INVOKE) {
            let bridge = Arc::downgrade(self);
            services.register(
                DOMAIN,
                SERVICE_INVOKE,
                move |call: ServiceCall| handle_invoke(bridge.clone(), call),
                Some(json!({
                    "type": "object",
                    "properties": {
                        "entry_id": {"type": "string"},
                        "domain": {"type": "string"},
                        "service": {"type": "string"},
                        "service_data": {"type": "object"},
                        "target": {"type": "object"},
                        "correlation_id": {"type": "string"}
                    }
                })),
                SupportsResponse::Optional,
            );
            debug!("Registered {DOMAIN}.{SERVICE_INVOKE}");
        }

        if !services.has_service(DOMAIN, SERVICE_SET_AUTONOMY) {
            let bridge = Arc::downgrade(self);
            services.register(
                DOMAIN,
                SERVICE_SET_AUTONOMY,
                move |call: ServiceCall| handle_set_autonomy(bridge.clone(), call),
                Some(json!({
                    "type": "object",
                    "required": ["entry_id", "enabled"],
                    "properties": {
                        "entry_id": {"type": "string"},
                        "enabled": {"type": "boolean"}
                    }
                })),
                SupportsResponse::None,
            );
        }

        if !services.has_service(SWITCH_DOMAIN, "turn_on") {
            for (service, paused) in [("turn_on", false), ("turn_off", true)] {
                let bridge = Arc::downgrade(self);
                services.register(
                    SWITCH_DOMAIN,
                    service,
                    move |call: ServiceCall| handle_switch(bridge.clone(), call, paused),
                    None,
                    SupportsResponse::None,
                );
            }
            self.owns_switch_services.store(true, Ordering::SeqCst);
        }
    }

    fn unregister_services(&self) {
        let services = &self.host.services;
        services.unregister(DOMAIN, SERVICE_INVOKE);
        services.unregister(DOMAIN, SERVICE_SET_AUTONOMY);
        if self.owns_switch_services.swap(false, Ordering::SeqCst) {
            services.unregister(SWITCH_DOMAIN, "turn_on");
            services.unregister(SWITCH_DOMAIN, "turn_off");
        }
    }

    /// The runtime owning each autonomy switch; fails on any other id
    fn runtimes_for_switches(
        &self,
        entity_ids: &[String],
    ) -> Result<Vec<Arc<EntryRuntime>>, ServiceError> {
        if entity_ids.is_empty() {
            return Err(ServiceError::InvalidData("entity_id is required".to_string()));
        }
        entity_ids
            .iter()
            .map(|entity_id| {
                self.runtimes
                    .iter()
                    .find(|r| entity_id.eq_ignore_ascii_case(r.status.autonomy_switch()))
                    .map(|r| r.value().clone())
                    .ok_or_else(|| {
                        ServiceError::CallFailed(format!("{entity_id} is not an autonomy switch"))
                    })
            })
            .collect()
    }
}

fn upgrade(bridge: &Weak<Bridge>) -> Result<Arc<Bridge>, ServiceError> {
    bridge
        .upgrade()
        .ok_or_else(|| ServiceError::CallFailed("bridge is gone".to_string()))
}

fn gate_error(err: GateError) -> ServiceError {
    match err {
        GateError::Configuration(_) => ServiceError::InvalidData(err.to_string()),
        GateError::Paused => ServiceError::CallFailed(err.to_string()),
    }
}

async fn handle_invoke(bridge: Weak<Bridge>, call: ServiceCall) -> ServiceResult {
    let bridge = upgrade(&bridge)?;

    let request = ActionRequest::from_value(call.service_data)
        .map_err(gate_error)?
        .with_default_context(&call.context);
    let response = bridge.invoke(request).await.map_err(gate_error)?;

    serde_json::to_value(response)
        .map(Some)
        .map_err(|err| ServiceError::CallFailed(err.to_string()))
}

async fn handle_switch(bridge: Weak<Bridge>, call: ServiceCall, paused: bool) -> ServiceResult {
    let bridge = upgrade(&bridge)?;
    let entity_ids = call.entity_ids();
    let runtimes = bridge.runtimes_for_switches(&entity_ids).map_err(|err| {
        warn!(?entity_ids, error = %err, "Rejected switch call");
        err
    })?;
    for runtime in runtimes {
        runtime.autonomy.set_paused(paused).await;
    }
    Ok(None)
}

async fn handle_set_autonomy(bridge: Weak<Bridge>, call: ServiceCall) -> ServiceResult {
    let bridge = upgrade(&bridge)?;
    let (Some(entry_id), Some(enabled)) = (call.get::<String>("entry_id"), call.get::<bool>("enabled"))
    else {
        return Err(ServiceError::InvalidData(
            "entry_id and enabled are required".to_string(),
        ));
    };
    let runtime = bridge
        .runtime(&entry_id)
        .ok_or_else(|| ServiceError::InvalidData(format!("unknown entry {entry_id}")))?;
    runtime.autonomy.set_paused(!enabled).await;
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use embodied_client::ClientResult;
    use embodied_core::Context;
    use serde_json::Value;
    use std::collections::HashMap;
    use tempfile::TempDir;

    struct NullClient;

    #[async_trait::async_trait]
    impl UpstreamClient for NullClient {
        async fn post_json(&self, _payload: &Value) -> ClientResult<Value> {
            Ok(json!({}))
        }
    }

    fn bridge(dir: &TempDir) -> Arc<Bridge> {
        Bridge::with_client_factory(
            Host::new(dir.path()),
            Arc::new(|_: &IntegrationConfig| {
                let client: Arc<dyn UpstreamClient> = Arc::new(NullClient);
                Ok(client)
            }),
        )
    }

    fn entry(exposure: &[&str]) -> ConfigEntry {
        let config = IntegrationConfig::new("http://robot.local/api")
            .with_exposure(exposure.iter().copied());
        ConfigEntry::new(DOMAIN, "Robot")
            .with_entry_id("e1")
            .with_data(config.to_entry_data())
    }

    #[test]
    fn test_setup_and_unload() {
        let dir = TempDir::new().unwrap();
        let bridge = bridge(&dir);
        let services = bridge.host().services.clone();

        let runtime = bridge.setup_entry(&entry(&["light"])).unwrap();
        assert!(runtime.forwarder().is_subscribed());
        assert!(services.has_service(DOMAIN, SERVICE_INVOKE));
        assert!(services.has_service(DOMAIN, SERVICE_SET_AUTONOMY));
        assert!(services.has_service("switch", "turn_off"));
        assert!(bridge.published_entities().contains("sensor.e1_upstream_failure_count"));
        assert!(matches!(
            bridge.setup_entry(&entry(&["light"])),
            Err(BridgeError::AlreadySetUp(_))
        ));

        assert!(bridge.unload_entry("e1"));
        assert!(!bridge.unload_entry("e1"));
        assert!(!runtime.forwarder().is_subscribed());
        assert!(!services.has_service(DOMAIN, SERVICE_INVOKE));
        assert!(!services.has_service(DOMAIN, SERVICE_SET_AUTONOMY));
        assert!(!services.has_service("switch", "turn_on"));
        assert!(bridge.published_entities().is_empty());
        assert!(bridge.host().states.get("switch.e1_autonomy").is_none());
    }

    #[test]
    fn test_paused_entry_does_not_subscribe() {
        let dir = TempDir::new().unwrap();
        let bridge = bridge(&dir);
        let mut options = HashMap::new();
        options.insert("autonomy_paused".to_string(), json!(true));

        let runtime = bridge
            .setup_entry(&entry(&["light"]).with_options(options))
            .unwrap();

        assert!(runtime.autonomy().paused());
        assert!(runtime.forwarder().is_paused());
        assert!(!runtime.forwarder().is_subscribed());
        assert_eq!(
            bridge.host().states.get("switch.e1_autonomy").unwrap().state,
            "off"
        );
    }

    #[test]
    fn test_invalid_entry_data_fails_setup() {
        let dir = TempDir::new().unwrap();
        let bridge = bridge(&dir);

        let result = bridge.setup_entry(&ConfigEntry::new(DOMAIN, "Broken").with_entry_id("bad"));

        assert!(matches!(result, Err(BridgeError::Config(_))));
        assert_eq!(bridge.runtime_count(), 0);
    }

    #[tokio::test]
    async fn test_invoke_unknown_entry() {
        let dir = TempDir::new().unwrap();
        let bridge = bridge(&dir);

        let err = bridge
            .invoke(ActionRequest::new("nope", "light", "turn_on"))
            .await
            .unwrap_err();
        assert_eq!(err, GateError::Configuration("unknown entry nope".to_string()));

        let err = bridge
            .invoke(ActionRequest::new("", "light", "turn_on"))
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_switch_services_reject_other_switches() {
        let dir = TempDir::new().unwrap();
        let bridge = bridge(&dir);
        let runtime = bridge.setup_entry(&entry(&["light"])).unwrap();
        let services = bridge.host().services.clone();

        for entity_ids in [json!("switch.porch"), json!(["switch.e1_autonomy", "switch.porch"])] {
            let result = services
                .call("switch", "turn_off", json!({"entity_id": entity_ids}), Context::new(), false)
                .await;
            assert!(matches!(
                result,
                Err(ServiceError::CallFailed(message)) if message == "switch.porch is not an autonomy switch"
            ));
        }
        assert!(!runtime.autonomy().paused());

        let result = services
            .call("switch", "turn_off", json!({}), Context::new(), false)
            .await;
        assert!(matches!(result, Err(ServiceError::InvalidData(_))));

        services
            .call("switch", "turn_off", json!({"entity_id": "switch.e1_autonomy"}), Context::new(), false)
            .await
            .unwrap();
        assert!(runtime.autonomy().paused());
    }

    #[tokio::test]
    async fn test_set_autonomy_service() {
        let dir = TempDir::new().unwrap();
        let bridge = bridge(&dir);
        let runtime = bridge.setup_entry(&entry(&["light"])).unwrap();
        let services = bridge.host().services.clone();

        services
            .call(DOMAIN, SERVICE_SET_AUTONOMY, json!({"entry_id": "e1", "enabled": false}), Context::new(), false)
            .await
            .unwrap();
        assert!(runtime.autonomy().paused());
        assert!(!runtime.forwarder().is_subscribed());

        services
            .call(DOMAIN, SERVICE_SET_AUTONOMY, json!({"entry_id": "e1", "enabled": true}), Context::new(), false)
            .await
            .unwrap();
        assert!(!runtime.autonomy().paused());

        let result = services
            .call(DOMAIN, SERVICE_SET_AUTONOMY, json!({"entry_id": "e2", "enabled": true}), Context::new(), false)
            .await;
        assert!(matches!(result, Err(ServiceError::InvalidData(message)) if message == "unknown entry e2"));
    }

    #[test]
    fn test_gate_errors_map_to_service_errors() {
        assert!(matches!(
            gate_error(GateError::Paused),
            ServiceError::CallFailed(message) if message == "autonomy is paused"
        ));
        assert!(matches!(
            gate_error(GateError::Configuration("x".into())),
            ServiceError::InvalidData(_)
        ));
    }
}
