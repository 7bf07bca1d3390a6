//! Host collaborators
//!
//! The bridge talks to the host only through the traits in this module. Each
//! trait has an adapter over the in-workspace host crates; tests substitute
//! in-memory doubles.

use async_trait::async_trait;
use embodied_config::OPTIONS_AUTONOMY_PAUSED;
use embodied_config_entries::{ConfigEntries, ConfigEntryUpdate};
use embodied_core::events::{StateChangedData, STATE_CHANGED};
use embodied_core::{Context, Event, State, SupportsResponse};
use embodied_event_bus::{EventBus, ListenerHandle};
use embodied_registries::Registries;
use embodied_service_registry::ServiceRegistry;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::error::{ExecutionError, PersistError};

/// One state change delivered by the host
#[derive(Debug, Clone)]
pub struct StateChange {
    pub entity_id: String,
    pub old_state: Option<State>,
    pub new_state: Option<State>,
    pub context: Context,
}

impl StateChange {
    /// Decode a `state_changed` bus event
    pub fn from_event(event: &Event) -> Option<Self> {
        let data: StateChangedData = event.decode()?;
        Some(Self {
            entity_id: data.entity_id,
            old_state: data.old_state,
            new_state: data.new_state,
            context: event.context.clone(),
        })
    }
}

pub type StateChangeCallback = Arc<dyn Fn(StateChange) + Send + Sync>;

/// Cancels a subscription when [`Subscription::cancel`] is called
pub struct Subscription {
    cancel: Box<dyn FnOnce() + Send + Sync>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Box::new(cancel),
        }
    }

    pub fn cancel(self) {
        (self.cancel)()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Subscription")
    }
}

/// Delivers state changes for every entity
pub trait StateChangeSource: Send + Sync {
    /// The callback runs synchronously on delivery and must not block
    fn subscribe_state_changes(&self, callback: StateChangeCallback) -> Subscription;
}

/// Receives audit events
pub trait AuditSink: Send + Sync {
    fn audit(&self, event_type: &str, data: Value);
}

/// Executes host actions
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(
        &self,
        domain: &str,
        service: &str,
        service_data: Value,
        context: Context,
    ) -> Result<Option<Value>, ExecutionError>;
}

/// Displays one-shot user-visible alerts. Fire-and-forget.
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, message: &str, notification_id: &str);
}

/// Resolves the display name of an entity's area
pub trait AreaResolver: Send + Sync {
    fn area_for(&self, entity_id: &str) -> Option<String>;
}

/// Durable storage of the autonomy pause flag
#[async_trait]
pub trait OptionsStore: Send + Sync {
    /// The stored flag, `None` when never written
    fn stored_paused(&self, entry_id: &str) -> Option<bool>;

    async fn store_paused(&self, entry_id: &str, paused: bool) -> Result<(), PersistError>;
}

impl StateChangeSource for EventBus {
    fn subscribe_state_changes(&self, callback: StateChangeCallback) -> Subscription {
        let handle: ListenerHandle = self.listen(STATE_CHANGED, move |event| {
            match StateChange::from_event(event) {
                Some(change) => callback(change),
                None => trace!("Ignoring malformed state_changed event"),
            }
        });
        Subscription::new(move || handle.remove())
    }
}

impl AuditSink for EventBus {
    fn audit(&self, event_type: &str, data: Value) {
        self.fire(Event::new(event_type, data, Context::new()));
    }
}

#[async_trait]
impl CommandExecutor for ServiceRegistry {
    async fn execute(
        &self,
        domain: &str,
        service: &str,
        service_data: Value,
        context: Context,
    ) -> Result<Option<Value>, ExecutionError> {
        // Only ask for a response from services able to produce one
        let return_response = self
            .get_service(domain, service)
            .map(|description| description.supports_response != SupportsResponse::None)
            .unwrap_or(false);

        self.call(domain, service, service_data, context, return_response)
            .await
            .map_err(|err| ExecutionError(err.to_string()))
    }
}

impl AreaResolver for Registries {
    fn area_for(&self, entity_id: &str) -> Option<String> {
        self.area_name_for(entity_id)
    }
}

/// Raises notifications through `persistent_notification.create`
pub struct ServiceNotifier {
    services: Arc<ServiceRegistry>,
}

impl ServiceNotifier {
    pub fn new(services: Arc<ServiceRegistry>) -> Self {
        Self { services }
    }
}

impl Notifier for ServiceNotifier {
    fn notify(&self, title: &str, message: &str, notification_id: &str) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(notification_id, "No runtime available, dropping notification");
            return;
        };

        let services = self.services.clone();
        let data = json!({
            "title": title,
            "message": message,
            "notification_id": notification_id,
        });
        runtime.spawn(async move {
            if let Err(err) = services
                .call("persistent_notification", "create", data, Context::new(), false)
                .await
            {
                warn!(error = %err, "Failed to create notification");
            }
        });
    }
}

/// Keeps the pause flag in the config entry options
pub struct ConfigEntryOptionsStore {
    entries: Arc<ConfigEntries>,
}

impl ConfigEntryOptionsStore {
    pub fn new(entries: Arc<ConfigEntries>) -> Self {
        Self { entries }
    }
}

#[async_trait]
impl OptionsStore for ConfigEntryOptionsStore {
    fn stored_paused(&self, entry_id: &str) -> Option<bool> {
        self.entries
            .get(entry_id)?
            .options
            .get(OPTIONS_AUTONOMY_PAUSED)
            .and_then(Value::as_bool)
    }

    async fn store_paused(&self, entry_id: &str, paused: bool) -> Result<(), PersistError> {
        let entry = self
            .entries
            .get(entry_id)
            .ok_or_else(|| PersistError(format!("unknown config entry {entry_id}")))?;

        let mut options = entry.options;
        options.insert(OPTIONS_AUTONOMY_PAUSED.to_string(), Value::Bool(paused));

        debug!(entry_id, paused, "Persisting autonomy flag");
        self.entries
            .update(entry_id, ConfigEntryUpdate::new().options(options))
            .await
            .map(|_| ())
            .map_err(|err| PersistError(err.to_string()))
    }
}
