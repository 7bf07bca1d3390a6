//! Entity and area registries
//!
//! Both registries persist as versioned JSON documents in the host's
//! `.storage/` directory. The forwarder reads area names from here when
//! building state change payloads.

pub mod area_registry;
pub mod entity_registry;
pub mod storage;

pub use area_registry::{AreaEntry, AreaRegistry};
pub use entity_registry::{EntityEntry, EntityRegistry, EntityRegistryError};
pub use storage::{Storable, Storage, StorageError, StorageResult};

use std::path::Path;
use std::sync::Arc;

pub struct Registries {
    pub storage: Arc<Storage>,
    pub entities: EntityRegistry,
    pub areas: AreaRegistry,
}

impl Registries {
    pub fn new(config_dir: impl AsRef<Path>) -> Self {
        let storage = Arc::new(Storage::new(config_dir));
        Self {
            entities: EntityRegistry::new(Arc::clone(&storage)),
            areas: AreaRegistry::new(Arc::clone(&storage)),
            storage,
        }
    }

    pub async fn load_all(&self) -> StorageResult<()> {
        tokio::try_join!(self.entities.load(), self.areas.load())?;
        Ok(())
    }

    pub async fn save_all(&self) -> StorageResult<()> {
        tokio::try_join!(self.entities.save(), self.areas.save())?;
        Ok(())
    }

    /// Area name for an entity, or the bare area id when the area record
    /// is gone
    pub fn area_name_for(&self, entity_id: &str) -> Option<String> {
        let area_id = self.entities.get(entity_id)?.area_id.clone()?;
        Some(
            self.areas
                .get(&area_id)
                .map_or(area_id, |area| area.display_name().to_string()),
        )
    }
}
