//! Registered entities
//!
//! An entity registered by an integration keeps its `entity_id` across
//! restarts: registering again with the same `(platform, unique_id)` pair
//! returns the stored record even when a different id is requested.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::storage::{Storable, Storage, StorageResult};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EntityRegistryError {
    #[error("entity {0} is not registered")]
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityEntry {
    pub entity_id: String,
    pub platform: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_entry_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_id: Option<String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default = "Utc::now")]
    pub registered_at: DateTime<Utc>,
}

impl EntityEntry {
    pub fn domain(&self) -> &str {
        self.entity_id
            .split_once('.')
            .map_or(self.entity_id.as_str(), |(domain, _)| domain)
    }
}

#[derive(Default, Serialize, Deserialize)]
struct EntityDocument {
    entities: Vec<EntityEntry>,
}

impl Storable for EntityDocument {
    const KEY: &'static str = "core.entity_registry";
    const VERSION: u32 = 1;
}

type UniqueKey = (String, String);

pub struct EntityRegistry {
    storage: Arc<Storage>,
    entries: DashMap<String, Arc<EntityEntry>>,
    unique: DashMap<UniqueKey, String>,
}

impl EntityRegistry {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            entries: DashMap::new(),
            unique: DashMap::new(),
        }
    }

    pub async fn load(&self) -> StorageResult<()> {
        let Some(document) = self.storage.read::<EntityDocument>().await? else {
            return Ok(());
        };
        info!(count = document.entities.len(), "Restored entity registry");
        for entry in document.entities {
            self.insert(Arc::new(entry));
        }
        Ok(())
    }

    pub async fn save(&self) -> StorageResult<()> {
        let mut entities: Vec<EntityEntry> =
            self.entries.iter().map(|e| e.value().as_ref().clone()).collect();
        entities.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        self.storage.write(&EntityDocument { entities }).await
    }

    fn insert(&self, entry: Arc<EntityEntry>) {
        if let Some(unique_id) = &entry.unique_id {
            self.unique.insert(
                (entry.platform.clone(), unique_id.clone()),
                entry.entity_id.clone(),
            );
        }
        self.entries.insert(entry.entity_id.clone(), entry);
    }

    pub fn get(&self, entity_id: &str) -> Option<Arc<EntityEntry>> {
        self.entries.get(entity_id).map(|e| Arc::clone(e.value()))
    }

    pub fn find_unique(&self, platform: &str, unique_id: &str) -> Option<Arc<EntityEntry>> {
        let entity_id = self
            .unique
            .get(&(platform.to_string(), unique_id.to_string()))?
            .clone();
        self.get(&entity_id)
    }

    /// Register an entity or return the existing record
    pub fn get_or_create(
        &self,
        platform: &str,
        entity_id: &str,
        unique_id: Option<&str>,
        config_entry_id: Option<&str>,
    ) -> Arc<EntityEntry> {
        if let Some(existing) = unique_id.and_then(|uid| self.find_unique(platform, uid)) {
            return existing;
        }
        if let Some(existing) = self.get(entity_id) {
            return existing;
        }

        let entry = Arc::new(EntityEntry {
            entity_id: entity_id.to_string(),
            platform: platform.to_string(),
            unique_id: unique_id.map(str::to_string),
            config_entry_id: config_entry_id.map(str::to_string),
            name: None,
            area_id: None,
            disabled: false,
            registered_at: Utc::now(),
        });
        self.insert(Arc::clone(&entry));
        debug!(entity_id, platform, "Registered entity");
        entry
    }

    /// Apply `edit` to a copy of the record and store it.
    ///
    /// `entity_id`, `platform` and `unique_id` are identity and stay fixed.
    pub fn update(
        &self,
        entity_id: &str,
        edit: impl FnOnce(&mut EntityEntry),
    ) -> Result<Arc<EntityEntry>, EntityRegistryError> {
        let mut slot = self
            .entries
            .get_mut(entity_id)
            .ok_or_else(|| EntityRegistryError::Unknown(entity_id.to_string()))?;

        let mut edited = slot.value().as_ref().clone();
        edit(&mut edited);
        edited.entity_id = slot.entity_id.clone();
        edited.platform = slot.platform.clone();
        edited.unique_id = slot.unique_id.clone();

        let edited = Arc::new(edited);
        *slot.value_mut() = Arc::clone(&edited);
        Ok(edited)
    }

    pub fn remove(&self, entity_id: &str) -> Option<Arc<EntityEntry>> {
        let (_, entry) = self.entries.remove(entity_id)?;
        if let Some(unique_id) = &entry.unique_id {
            self.unique
                .remove(&(entry.platform.clone(), unique_id.clone()));
        }
        debug!(entity_id, "Removed entity");
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry() -> (TempDir, EntityRegistry) {
        let dir = TempDir::new().unwrap();
        let registry = EntityRegistry::new(Arc::new(Storage::new(dir.path())));
        (dir, registry)
    }

    #[test]
    fn test_unique_id_keeps_entity_id() {
        let (_dir, registry) = registry();

        let first = registry.get_or_create("aiembodied", "switch.robot_autonomy", Some("robot_autonomy"), None);
        let again = registry.get_or_create("aiembodied", "switch.other", Some("robot_autonomy"), None);

        assert_eq!(again.entity_id, first.entity_id);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unique_id_is_scoped_by_platform() {
        let (_dir, registry) = registry();

        registry.get_or_create("hue", "light.a", Some("1"), None);
        registry.get_or_create("zwave", "light.b", Some("1"), None);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.find_unique("zwave", "1").unwrap().entity_id, "light.b");
    }

    #[test]
    fn test_update_keeps_identity() {
        let (_dir, registry) = registry();
        registry.get_or_create("hue", "light.kitchen", Some("hue-1"), None);

        let updated = registry
            .update("light.kitchen", |e| {
                e.area_id = Some("kitchen".to_string());
                e.entity_id = "light.renamed".to_string();
            })
            .unwrap();

        assert_eq!(updated.entity_id, "light.kitchen");
        assert_eq!(updated.area_id.as_deref(), Some("kitchen"));
        assert_eq!(updated.domain(), "light");
        assert_eq!(
            registry.update("light.nope", |_| {}),
            Err(EntityRegistryError::Unknown("light.nope".to_string()))
        );
    }

    #[test]
    fn test_remove_frees_unique_id() {
        let (_dir, registry) = registry();
        registry.get_or_create("aiembodied", "switch.r_autonomy", Some("r_autonomy"), Some("r"));
        registry.get_or_create("aiembodied", "sensor.r_failures", Some("r_failures"), Some("r"));
        registry.get_or_create("hue", "light.kitchen", None, None);

        assert!(registry.remove("switch.r_autonomy").is_some());
        assert!(registry.find_unique("aiembodied", "r_autonomy").is_none());
        assert_eq!(registry.len(), 2);
    }
}
