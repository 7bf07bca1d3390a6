//! A single configured integration instance

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Where an entry is in its setup/unload cycle. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntryState {
    #[default]
    NotLoaded,
    Loaded,
    SetupError,
    FailedUnload,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntrySource {
    #[default]
    User,
    /// Created from the YAML configuration file
    Import,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub entry_id: String,
    pub domain: String,
    pub title: String,

    /// Connection settings fixed when the entry was created
    #[serde(default)]
    pub data: HashMap<String, Value>,

    /// Settings that may change while the entry is loaded
    #[serde(default)]
    pub options: HashMap<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,

    #[serde(default)]
    pub source: ConfigEntrySource,

    #[serde(skip)]
    pub state: ConfigEntryState,

    /// Why setup or unload failed
    #[serde(skip)]
    pub reason: Option<String>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl ConfigEntry {
    pub fn new(domain: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            entry_id: ulid::Ulid::new().to_string(),
            domain: domain.into(),
            title: title.into(),
            data: HashMap::new(),
            options: HashMap::new(),
            unique_id: None,
            source: ConfigEntrySource::default(),
            state: ConfigEntryState::default(),
            reason: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_entry_id(self, entry_id: impl Into<String>) -> Self {
        Self {
            entry_id: entry_id.into(),
            ..self
        }
    }

    pub fn with_data(self, data: HashMap<String, Value>) -> Self {
        Self { data, ..self }
    }

    pub fn with_options(self, options: HashMap<String, Value>) -> Self {
        Self { options, ..self }
    }

    pub fn with_unique_id(self, unique_id: impl Into<String>) -> Self {
        Self {
            unique_id: Some(unique_id.into()),
            ..self
        }
    }

    pub fn with_source(self, source: ConfigEntrySource) -> Self {
        Self { source, ..self }
    }

    pub fn is_loaded(&self) -> bool {
        self.state == ConfigEntryState::Loaded
    }

    /// Decode one option; `None` when absent or of the wrong shape
    pub fn option<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        T::deserialize(self.options.get(key)?).ok()
    }
}

/// Partial replacement of an entry's mutable fields
#[derive(Debug, Default)]
pub struct ConfigEntryUpdate {
    title: Option<String>,
    data: Option<HashMap<String, Value>>,
    options: Option<HashMap<String, Value>>,
}

impl ConfigEntryUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(self, title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..self
        }
    }

    pub fn data(self, data: HashMap<String, Value>) -> Self {
        Self {
            data: Some(data),
            ..self
        }
    }

    pub fn options(self, options: HashMap<String, Value>) -> Self {
        Self {
            options: Some(options),
            ..self
        }
    }

    /// Write the set fields into `entry`, reporting whether anything differed
    pub(crate) fn apply(self, entry: &mut ConfigEntry) -> bool {
        let mut changed = false;
        if let Some(title) = self.title.filter(|t| *t != entry.title) {
            entry.title = title;
            changed = true;
        }
        if let Some(data) = self.data.filter(|d| *d != entry.data) {
            entry.data = data;
            changed = true;
        }
        if let Some(options) = self.options.filter(|o| *o != entry.options) {
            entry.options = options;
            changed = true;
        }
        changed
    }
}
