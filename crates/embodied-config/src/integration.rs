//! Integration configuration and options
//!
//! [`IntegrationConfig`] is fixed at entry creation (connection, exposure,
//! routing). [`IntegrationOptions`] are the runtime tunables a user can change
//! later, including the persisted pause flag.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::error::{ConfigError, ConfigResult};
use crate::parse::{
    coerce_int, coerce_positive_int, display_value, parse_mapping, parse_string_collection,
    truthy,
};
use crate::{
    CONF_AUTH_TOKEN, CONF_BATCHING, CONF_ENDPOINT, CONF_EXPOSURE, CONF_HEADERS, CONF_ROUTING,
    CONF_THROTTLE, DEFAULT_BURST_SIZE, DEFAULT_MAX_EVENTS_PER_MINUTE, DEFAULT_THROTTLE,
    OPTIONS_AUTONOMY_PAUSED, OPTIONS_BURST_SIZE, OPTIONS_DEBUG, OPTIONS_MAX_EVENTS_PER_MINUTE,
};

fn default_throttle() -> u32 {
    DEFAULT_THROTTLE
}

fn default_true() -> bool {
    true
}

fn default_max_events() -> u32 {
    DEFAULT_MAX_EVENTS_PER_MINUTE
}

fn default_burst() -> u32 {
    DEFAULT_BURST_SIZE
}

/// Validated configuration of one bridge entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationConfig {
    pub endpoint: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Entity and domain patterns whose changes are forwarded
    #[serde(default)]
    pub exposure: Vec<String>,
    /// Accepted and stored, not enforced
    #[serde(default = "default_throttle")]
    pub throttle: u32,
    /// Accepted and stored, not enforced
    #[serde(default = "default_true")]
    pub batching: bool,
    #[serde(default)]
    pub routing: HashMap<String, String>,
}

impl IntegrationConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            auth_token: None,
            headers: HashMap::new(),
            exposure: Vec::new(),
            throttle: DEFAULT_THROTTLE,
            batching: true,
            routing: HashMap::new(),
        }
    }

    pub fn with_exposure<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exposure = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Rebuild from stored entry data
    pub fn from_entry_data(data: &HashMap<String, Value>) -> ConfigResult<Self> {
        let input: Map<String, Value> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        normalize_config_data(&input)
    }

    /// Serialize into entry data
    pub fn to_entry_data(&self) -> HashMap<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map.into_iter().collect(),
            _ => HashMap::new(),
        }
    }
}

/// Validate and normalize raw user input for a new entry.
///
/// - `endpoint` is required (trimmed, non-empty)
/// - `headers` and `routing` must parse as mappings
/// - `exposure` is a comma/newline separated list
/// - `throttle` must be a positive integer (60 when absent)
/// - `auth_token` is trimmed; empty becomes `None`
pub fn normalize_config_data(input: &Map<String, Value>) -> ConfigResult<IntegrationConfig> {
    let endpoint = input
        .get(CONF_ENDPOINT)
        .map(display_value)
        .unwrap_or_default()
        .trim()
        .to_string();
    if endpoint.is_empty() {
        return Err(ConfigError::validation(CONF_ENDPOINT, "required"));
    }

    let null = Value::Null;
    let headers = parse_mapping(input.get(CONF_HEADERS).unwrap_or(&null))
        .map_err(|_| ConfigError::validation(CONF_HEADERS, "invalid_headers"))?;

    let exposure = parse_string_collection(input.get(CONF_EXPOSURE).unwrap_or(&null));

    let routing = parse_mapping(input.get(CONF_ROUTING).unwrap_or(&null))
        .map_err(|_| ConfigError::validation(CONF_ROUTING, "invalid_routing"))?;

    let throttle = match input.get(CONF_THROTTLE) {
        None => DEFAULT_THROTTLE,
        Some(value) => coerce_int(value)
            .filter(|n| *n > 0)
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| ConfigError::validation(CONF_THROTTLE, "invalid_throttle"))?,
    };

    let batching = input.get(CONF_BATCHING).map(truthy).unwrap_or(true);

    let auth_token = input
        .get(CONF_AUTH_TOKEN)
        .map(display_value)
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());

    Ok(IntegrationConfig {
        endpoint,
        auth_token,
        headers,
        exposure,
        throttle,
        batching,
        routing,
    })
}

/// Runtime options of one bridge entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationOptions {
    #[serde(default)]
    pub debug: bool,
    /// Accepted and stored, not enforced
    #[serde(default = "default_max_events")]
    pub max_events_per_minute: u32,
    /// Accepted and stored, not enforced
    #[serde(default = "default_burst")]
    pub burst_size: u32,
    #[serde(default)]
    pub autonomy_paused: bool,
}

impl Default for IntegrationOptions {
    fn default() -> Self {
        Self {
            debug: false,
            max_events_per_minute: DEFAULT_MAX_EVENTS_PER_MINUTE,
            burst_size: DEFAULT_BURST_SIZE,
            autonomy_paused: false,
        }
    }
}

impl IntegrationOptions {
    /// Validate raw options input. Absent values take their defaults;
    /// present rate values must be positive integers.
    pub fn from_input(input: &Map<String, Value>) -> ConfigResult<Self> {
        let positive = |key: &str, default: u32| -> ConfigResult<u32> {
            match input.get(key) {
                None => Ok(default),
                Some(value) => coerce_positive_int(value)
                    .ok_or_else(|| ConfigError::validation(key, "invalid_positive_int")),
            }
        };

        Ok(Self {
            debug: input.get(OPTIONS_DEBUG).map(truthy).unwrap_or(false),
            max_events_per_minute: positive(
                OPTIONS_MAX_EVENTS_PER_MINUTE,
                DEFAULT_MAX_EVENTS_PER_MINUTE,
            )?,
            burst_size: positive(OPTIONS_BURST_SIZE, DEFAULT_BURST_SIZE)?,
            autonomy_paused: input.get(OPTIONS_AUTONOMY_PAUSED).map(truthy).unwrap_or(false),
        })
    }

    /// Read stored entry options, falling back to defaults for bad values
    pub fn from_entry_options(options: &HashMap<String, Value>) -> Self {
        let defaults = Self::default();
        Self {
            debug: options.get(OPTIONS_DEBUG).map(truthy).unwrap_or(defaults.debug),
            max_events_per_minute: options
                .get(OPTIONS_MAX_EVENTS_PER_MINUTE)
                .and_then(coerce_positive_int)
                .unwrap_or(defaults.max_events_per_minute),
            burst_size: options
                .get(OPTIONS_BURST_SIZE)
                .and_then(coerce_positive_int)
                .unwrap_or(defaults.burst_size),
            autonomy_paused: options
                .get(OPTIONS_AUTONOMY_PAUSED)
                .map(truthy)
                .unwrap_or(defaults.autonomy_paused),
        }
    }

    pub fn to_entry_options(&self) -> HashMap<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map.into_iter().collect(),
            _ => HashMap::new(),
        }
    }
}
