//! Constants shared across the bridge runtime

pub use embodied_config::DOMAIN;

/// Audit event fired after each forwarded state change
pub const EVENT_UPDATE_FORWARDED: &str = "aiembodied.update_forwarded";

/// Audit event fired after each executed action
pub const EVENT_ACTION_EXECUTED: &str = "aiembodied.action_executed";

/// Process-wide service used by the upstream side to execute host actions
pub const SERVICE_INVOKE: &str = "invoke_service";

/// Failure sources recorded by the autonomy controller
pub const SOURCE_EVENT_FORWARD: &str = "event_forward";
pub const SOURCE_ACTION_RESULT: &str = "action_result";

/// Prefix of the connectivity notification id; the entry id is appended
pub const NOTIFICATION_AUTONOMY_FAILURE: &str = "aiembodied_autonomy_failure";
pub const NOTIFICATION_TITLE: &str = "Embodied AI connectivity issues";
pub const NOTIFICATION_MESSAGE: &str = "The Embodied AI integration has encountered multiple \
     communication failures. Autonomy may be degraded.";

/// Bridge-owned toggle for one entry's autonomy
pub const SERVICE_SET_AUTONOMY: &str = "set_autonomy";
