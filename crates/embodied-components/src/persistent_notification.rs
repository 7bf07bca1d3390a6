//! User-visible alerts that stay until dismissed
//!
//! Services: `persistent_notification.create`, `.dismiss` and
//! `.dismiss_all`. Every change is announced on the bus as
//! `persistent_notifications_updated`.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use embodied_core::{Context, Event, ServiceCall, SupportsResponse};
use embodied_event_bus::EventBus;
use embodied_service_registry::{ServiceError, ServiceRegistry, ServiceResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

pub const DOMAIN: &str = "persistent_notification";

pub const EVENT_NOTIFICATIONS_UPDATED: &str = "persistent_notifications_updated";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub notification_id: String,
    /// Markdown body
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateType {
    Added,
    Updated,
    Removed,
}

#[derive(Debug, Default)]
pub struct PersistentNotificationManager {
    active: DashMap<String, Notification>,
}

impl PersistentNotificationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Show a notification, replacing any with the same id
    pub fn create(
        &self,
        notification_id: impl Into<String>,
        message: impl Into<String>,
        title: Option<String>,
    ) -> (Notification, UpdateType) {
        let notification = Notification {
            notification_id: notification_id.into(),
            message: message.into(),
            title,
            created_at: Utc::now(),
        };
        let replaced = self
            .active
            .insert(notification.notification_id.clone(), notification.clone())
            .is_some();

        info!(notification_id = %notification.notification_id, replaced, "Notification shown");
        let update = if replaced {
            UpdateType::Updated
        } else {
            UpdateType::Added
        };
        (notification, update)
    }

    /// Take a notification down; unknown ids are ignored
    pub fn dismiss(&self, notification_id: &str) -> Option<Notification> {
        let (_, notification) = self.active.remove(notification_id)?;
        info!(notification_id, "Notification dismissed");
        Some(notification)
    }

    pub fn dismiss_all(&self) -> Vec<Notification> {
        let ids: Vec<String> = self.active.iter().map(|n| n.key().clone()).collect();
        ids.iter().filter_map(|id| self.dismiss(id)).collect()
    }

    pub fn get(&self, notification_id: &str) -> Option<Notification> {
        self.active.get(notification_id).map(|n| n.value().clone())
    }

    /// Active notifications, oldest first
    pub fn all(&self) -> Vec<Notification> {
        let mut all: Vec<Notification> = self.active.iter().map(|n| n.value().clone()).collect();
        all.sort_by_key(|n| n.created_at);
        all
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

fn announce(bus: &EventBus, update: UpdateType, changed: &[Notification], context: Context) {
    if changed.is_empty() {
        return;
    }
    let notifications: Map<String, Value> = changed
        .iter()
        .map(|n| (n.notification_id.clone(), json!(n)))
        .collect();
    bus.fire(Event::new(
        EVENT_NOTIFICATIONS_UPDATED,
        json!({"update_type": update, "notifications": notifications}),
        context,
    ));
}

fn required(call: &ServiceCall, field: &str) -> Result<String, ServiceError> {
    call.get(field)
        .ok_or_else(|| ServiceError::InvalidData(format!("{field} is required")))
}

/// Register the services over `manager`, announcing changes on `bus`
pub fn register_services(
    services: &ServiceRegistry,
    manager: Arc<PersistentNotificationManager>,
    bus: Arc<EventBus>,
) {
    let (create_manager, create_bus) = (manager.clone(), bus.clone());
    services.register(
        DOMAIN,
        "create",
        move |call: ServiceCall| {
            let (manager, bus) = (create_manager.clone(), create_bus.clone());
            async move {
                let message = required(&call, "message")?;
                let notification_id = call
                    .get::<String>("notification_id")
                    .unwrap_or_else(|| ulid::Ulid::new().to_string().to_lowercase());
                let (notification, update) =
                    manager.create(notification_id, message, call.get("title"));
                announce(&bus, update, &[notification], call.context);
                ServiceResult::Ok(None)
            }
        },
        Some(json!({
            "type": "object",
            "required": ["message"],
            "properties": {
                "message": {"type": "string"},
                "title": {"type": "string"},
                "notification_id": {"type": "string"}
            }
        })),
        SupportsResponse::None,
    );

    let (dismiss_manager, dismiss_bus) = (manager.clone(), bus.clone());
    services.register(
        DOMAIN,
        "dismiss",
        move |call: ServiceCall| {
            let (manager, bus) = (dismiss_manager.clone(), dismiss_bus.clone());
            async move {
                let notification_id = required(&call, "notification_id")?;
                let removed: Vec<_> = manager.dismiss(&notification_id).into_iter().collect();
                announce(&bus, UpdateType::Removed, &removed, call.context);
                ServiceResult::Ok(None)
            }
        },
        Some(json!({
            "type": "object",
            "required": ["notification_id"],
            "properties": {"notification_id": {"type": "string"}}
        })),
        SupportsResponse::None,
    );

    services.register(
        DOMAIN,
        "dismiss_all",
        move |call: ServiceCall| {
            let (manager, bus) = (manager.clone(), bus.clone());
            async move {
                let removed = manager.dismiss_all();
                debug!(count = removed.len(), "Dismissed all notifications");
                announce(&bus, UpdateType::Removed, &removed, call.context);
                ServiceResult::Ok(None)
            }
        },
        None,
        SupportsResponse::None,
    );
}
