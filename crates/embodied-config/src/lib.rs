//! Configuration for the embodied AI bridge
//!
//! - [`normalize_config_data`] validates user input for a new entry
//! - [`IntegrationOptions`] holds the runtime options, including the pause flag
//! - [`load_server_config`] reads the server YAML file (`!secret`, `!env_var`)

mod error;
mod integration;
mod loader;
mod parse;
mod secrets;

pub use error::{ConfigError, ConfigResult};
pub use integration::{normalize_config_data, IntegrationConfig, IntegrationOptions};
pub use loader::{load_server_config, EntrySection, ServerConfig, YamlLoader};
pub use parse::{coerce_positive_int, parse_mapping, parse_string_collection, MappingError};
pub use secrets::Secrets;

/// Integration domain
pub const DOMAIN: &str = "aiembodied";

pub const CONF_ENDPOINT: &str = "endpoint";
pub const CONF_AUTH_TOKEN: &str = "auth_token";
pub const CONF_HEADERS: &str = "headers";
pub const CONF_EXPOSURE: &str = "exposure";
pub const CONF_THROTTLE: &str = "throttle";
pub const CONF_BATCHING: &str = "batching";
pub const CONF_ROUTING: &str = "routing";

pub const OPTIONS_DEBUG: &str = "debug";
pub const OPTIONS_MAX_EVENTS_PER_MINUTE: &str = "max_events_per_minute";
pub const OPTIONS_BURST_SIZE: &str = "burst_size";
pub const OPTIONS_AUTONOMY_PAUSED: &str = "autonomy_paused";

/// Upstream request timeout in seconds
pub const DEFAULT_TIMEOUT: u64 = 10;
/// Consecutive failures before autonomy is reported unavailable
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_THROTTLE: u32 = 60;
pub const DEFAULT_MAX_EVENTS_PER_MINUTE: u32 = 120;
pub const DEFAULT_BURST_SIZE: u32 = 10;
