//! Records shared by the host crates and the bridge
//!
//! Entity ids are plain `domain.object_id` strings. Nothing here validates
//! them; an id without a dot is all domain.

mod context;
mod event;
mod service_call;
mod state;

pub use context::Context;
pub use event::{Event, EventPayload, MATCH_ALL};
pub use service_call::{ServiceCall, SupportsResponse};
pub use state::{State, ATTR_FRIENDLY_NAME};

/// `(domain, object_id)`; the object id is empty when there is no dot
pub fn split_entity_id(entity_id: &str) -> (&str, &str) {
    entity_id.split_once('.').unwrap_or((entity_id, ""))
}

pub fn domain_of(entity_id: &str) -> &str {
    split_entity_id(entity_id).0
}

/// Events fired by the host itself
pub mod events {
    use serde::{Deserialize, Serialize};

    use crate::{EventPayload, State};

    pub const STATE_CHANGED: &str = "state_changed";

    /// Old and new state of one entity; `None` on creation or removal
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct StateChangedData {
        pub entity_id: String,
        pub old_state: Option<State>,
        pub new_state: Option<State>,
    }

    impl EventPayload for StateChangedData {
        const EVENT_TYPE: &'static str = STATE_CHANGED;
    }
}
