//! Built-in host components
//!
//! Components the bridge relies on that the host provides natively.

pub mod persistent_notification;

pub use persistent_notification::{
    register_services as register_persistent_notification_services, Notification,
    PersistentNotificationManager, UpdateType,
};
