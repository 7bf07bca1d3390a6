//! Areas (rooms, zones) entities can be placed in
//!
//! Area ids are derived from the name at creation: "Living Room" becomes
//! `living_room`, with a numeric suffix when that id is taken.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::storage::{Storable, Storage, StorageResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaEntry {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
}

impl AreaEntry {
    /// The name, or the id for areas stored without one
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    fn answers_to(&self, name: &str) -> bool {
        let wanted = fold(name);
        fold(&self.name) == wanted || self.aliases.iter().any(|alias| fold(alias) == wanted)
    }
}

fn fold(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn base_id(name: &str) -> String {
    let id: String = name
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    let id = id.trim_matches('_').to_string();
    if id.is_empty() {
        "area".to_string()
    } else {
        id
    }
}

#[derive(Default, Serialize, Deserialize)]
struct AreaDocument {
    areas: Vec<AreaEntry>,
}

impl Storable for AreaDocument {
    const KEY: &'static str = "core.area_registry";
    const VERSION: u32 = 1;
}

pub struct AreaRegistry {
    storage: Arc<Storage>,
    areas: DashMap<String, Arc<AreaEntry>>,
}

impl AreaRegistry {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            areas: DashMap::new(),
        }
    }

    pub async fn load(&self) -> StorageResult<()> {
        if let Some(document) = self.storage.read::<AreaDocument>().await? {
            info!(count = document.areas.len(), "Restored area registry");
            for area in document.areas {
                self.areas.insert(area.id.clone(), Arc::new(area));
            }
        }
        Ok(())
    }

    pub async fn save(&self) -> StorageResult<()> {
        let mut areas: Vec<AreaEntry> =
            self.areas.iter().map(|a| a.value().as_ref().clone()).collect();
        areas.sort_by(|a, b| a.id.cmp(&b.id));
        self.storage.write(&AreaDocument { areas }).await
    }

    pub fn get(&self, area_id: &str) -> Option<Arc<AreaEntry>> {
        self.areas.get(area_id).map(|a| Arc::clone(a.value()))
    }

    /// Case and whitespace insensitive lookup by name or alias
    pub fn find_by_name(&self, name: &str) -> Option<Arc<AreaEntry>> {
        self.areas
            .iter()
            .find(|a| a.answers_to(name))
            .map(|a| Arc::clone(a.value()))
    }

    pub fn create(&self, name: &str) -> Arc<AreaEntry> {
        let base = base_id(name);
        let mut id = base.clone();
        let mut suffix = 2;
        while self.areas.contains_key(&id) {
            id = format!("{base}_{suffix}");
            suffix += 1;
        }

        let area = Arc::new(AreaEntry {
            id: id.clone(),
            name: name.trim().to_string(),
            icon: None,
            aliases: Vec::new(),
        });
        self.areas.insert(id, Arc::clone(&area));
        debug!(area_id = %area.id, "Created area");
        area
    }

    /// Edit an area in place; the id stays fixed
    pub fn update(&self, area_id: &str, edit: impl FnOnce(&mut AreaEntry)) -> Option<Arc<AreaEntry>> {
        let mut slot = self.areas.get_mut(area_id)?;
        let mut edited = slot.value().as_ref().clone();
        edit(&mut edited);
        edited.id = area_id.to_string();

        let edited = Arc::new(edited);
        *slot.value_mut() = Arc::clone(&edited);
        Some(edited)
    }

    pub fn remove(&self, area_id: &str) -> Option<Arc<AreaEntry>> {
        self.areas.remove(area_id).map(|(_, area)| area)
    }

    pub fn len(&self) -> usize {
        self.areas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }
}
