//! Entry store, lifecycle and update notification

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use embodied_registries::{Storable, Storage, StorageError, StorageResult};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::entry::{ConfigEntry, ConfigEntryState, ConfigEntryUpdate};

#[derive(Debug, Error)]
pub enum ConfigEntriesError {
    #[error("no config entry {0}")]
    NotFound(String),

    #[error("{domain} already has an entry for {unique_id}")]
    AlreadyExists { domain: String, unique_id: String },

    #[error("setup of {entry_id} failed: {reason}")]
    SetupFailed { entry_id: String, reason: String },

    #[error("unload of {entry_id} failed: {reason}")]
    UnloadFailed { entry_id: String, reason: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type ConfigEntriesResult<T> = Result<T, ConfigEntriesError>;

#[derive(Default, Serialize, Deserialize)]
struct EntriesDocument {
    entries: Vec<ConfigEntry>,
}

impl Storable for EntriesDocument {
    const KEY: &'static str = "core.config_entries";
    const VERSION: u32 = 1;
}

/// Per-domain hook run on setup or unload
pub type EntryHandler =
    Arc<dyn Fn(ConfigEntry) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// Awaited with the new entry after an update changed something
pub type UpdateListener = Arc<dyn Fn(ConfigEntry) -> BoxFuture<'static, ()> + Send + Sync>;

struct Subscription {
    entry_id: String,
    listener: UpdateListener,
}

type Subscriptions = DashMap<u64, Subscription>;

/// Returned by [`ConfigEntries::add_update_listener`]
#[derive(Debug)]
pub struct UpdateListenerHandle {
    id: u64,
    subscriptions: Weak<Subscriptions>,
}

impl UpdateListenerHandle {
    /// Stop listening. A no-op once the manager is dropped.
    pub fn remove(self) {
        if let Some(subscriptions) = self.subscriptions.upgrade() {
            subscriptions.remove(&self.id);
        }
    }
}

#[derive(Default)]
struct DomainHandlers {
    setup: Option<EntryHandler>,
    unload: Option<EntryHandler>,
}

pub struct ConfigEntries {
    storage: Arc<Storage>,
    entries: DashMap<String, ConfigEntry>,
    handlers: DashMap<String, DomainHandlers>,
    subscriptions: Arc<Subscriptions>,
    next_subscription: AtomicU64,
    /// Held across setup and unload so the two never interleave
    lifecycle: Mutex<()>,
}

impl ConfigEntries {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            entries: DashMap::new(),
            handlers: DashMap::new(),
            subscriptions: Arc::new(DashMap::new()),
            next_subscription: AtomicU64::new(0),
            lifecycle: Mutex::new(()),
        }
    }

    pub async fn load(&self) -> StorageResult<()> {
        let Some(document) = self.storage.read::<EntriesDocument>().await? else {
            return Ok(());
        };
        info!(count = document.entries.len(), "Restored config entries");
        for entry in document.entries {
            self.entries.insert(entry.entry_id.clone(), entry);
        }
        Ok(())
    }

    pub async fn save(&self) -> StorageResult<()> {
        let mut entries: Vec<ConfigEntry> = self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        self.storage.write(&EntriesDocument { entries }).await
    }

    pub fn get(&self, entry_id: &str) -> Option<ConfigEntry> {
        self.entries.get(entry_id).map(|e| e.value().clone())
    }

    pub fn get_by_domain(&self, domain: &str) -> Vec<ConfigEntry> {
        self.entries
            .iter()
            .filter(|e| e.domain == domain)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn get_by_unique_id(&self, domain: &str, unique_id: &str) -> Option<ConfigEntry> {
        self.entries
            .iter()
            .find(|e| e.domain == domain && e.unique_id.as_deref() == Some(unique_id))
            .map(|e| e.value().clone())
    }

    /// Store a new entry. A `(domain, unique_id)` pair may only exist once.
    pub async fn add(&self, entry: ConfigEntry) -> ConfigEntriesResult<ConfigEntry> {
        if let Some(unique_id) = &entry.unique_id {
            if self.get_by_unique_id(&entry.domain, unique_id).is_some() {
                return Err(ConfigEntriesError::AlreadyExists {
                    domain: entry.domain.clone(),
                    unique_id: unique_id.clone(),
                });
            }
        }

        self.entries.insert(entry.entry_id.clone(), entry.clone());
        self.save().await?;
        info!(entry_id = %entry.entry_id, domain = %entry.domain, "Added config entry");
        Ok(entry)
    }

    /// Apply an update, persist it and await the entry's update listeners.
    ///
    /// An update that changes nothing is neither saved nor announced.
    /// Listeners run after the map is released and may update the entry
    /// again.
    pub async fn update(
        &self,
        entry_id: &str,
        update: ConfigEntryUpdate,
    ) -> ConfigEntriesResult<ConfigEntry> {
        let updated = {
            let mut slot = self
                .entries
                .get_mut(entry_id)
                .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
            if !update.apply(slot.value_mut()) {
                return Ok(slot.value().clone());
            }
            slot.value().clone()
        };

        self.save().await?;
        debug!(entry_id, "Updated config entry");

        for listener in self.listeners_for(entry_id) {
            if AssertUnwindSafe(listener(updated.clone()))
                .catch_unwind()
                .await
                .is_err()
            {
                error!(entry_id, "Update listener panicked");
            }
        }
        Ok(updated)
    }

    fn listeners_for(&self, entry_id: &str) -> Vec<UpdateListener> {
        let mut matching: Vec<(u64, UpdateListener)> = self
            .subscriptions
            .iter()
            .filter(|s| s.entry_id == entry_id)
            .map(|s| (*s.key(), Arc::clone(&s.listener)))
            .collect();
        matching.sort_by_key(|(id, _)| *id);
        matching.into_iter().map(|(_, listener)| listener).collect()
    }

    pub fn add_update_listener<F, Fut>(&self, entry_id: &str, listener: F) -> UpdateListenerHandle
    where
        F: Fn(ConfigEntry) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.insert(
            id,
            Subscription {
                entry_id: entry_id.to_string(),
                listener: Arc::new(move |entry| listener(entry).boxed()),
            },
        );
        UpdateListenerHandle {
            id,
            subscriptions: Arc::downgrade(&self.subscriptions),
        }
    }

    pub fn update_listener_count(&self, entry_id: &str) -> usize {
        self.subscriptions
            .iter()
            .filter(|s| s.entry_id == entry_id)
            .count()
    }

    /// Drop an entry, unloading it first when loaded
    pub async fn remove(&self, entry_id: &str) -> ConfigEntriesResult<ConfigEntry> {
        if self.get(entry_id).is_some_and(|e| e.is_loaded()) {
            self.unload(entry_id).await?;
        }
        let (_, entry) = self
            .entries
            .remove(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
        self.subscriptions.retain(|_, s| s.entry_id != entry_id);
        self.save().await?;
        info!(entry_id, "Removed config entry");
        Ok(entry)
    }

    fn mark(&self, entry_id: &str, state: ConfigEntryState, reason: Option<String>) {
        if let Some(mut entry) = self.entries.get_mut(entry_id) {
            entry.state = state;
            entry.reason = reason;
        }
    }

    pub fn register_setup_handler<F, Fut>(&self, domain: &str, handler: F)
    where
        F: Fn(ConfigEntry) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.handlers.entry(domain.to_string()).or_default().setup =
            Some(Arc::new(move |entry| handler(entry).boxed()));
    }

    pub fn register_unload_handler<F, Fut>(&self, domain: &str, handler: F)
    where
        F: Fn(ConfigEntry) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.handlers.entry(domain.to_string()).or_default().unload =
            Some(Arc::new(move |entry| handler(entry).boxed()));
    }

    fn handler(
        &self,
        domain: &str,
        pick: impl Fn(&DomainHandlers) -> Option<EntryHandler>,
    ) -> Option<EntryHandler> {
        self.handlers.get(domain).and_then(|h| pick(h.value()))
    }

    /// Run the domain's setup handler. Loaded entries are left alone and a
    /// domain without a handler loads trivially.
    #[instrument(skip(self))]
    pub async fn setup(&self, entry_id: &str) -> ConfigEntriesResult<()> {
        let _cycle = self.lifecycle.lock().await;
        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
        if entry.is_loaded() {
            return Ok(());
        }

        if let Some(setup) = self.handler(&entry.domain, |h| h.setup.clone()) {
            if let Err(reason) = setup(entry).await {
                warn!(%reason, "Config entry setup failed");
                self.mark(entry_id, ConfigEntryState::SetupError, Some(reason.clone()));
                return Err(ConfigEntriesError::SetupFailed {
                    entry_id: entry_id.to_string(),
                    reason,
                });
            }
        }
        self.mark(entry_id, ConfigEntryState::Loaded, None);
        info!("Config entry loaded");
        Ok(())
    }

    /// Run the domain's unload handler for a loaded entry
    #[instrument(skip(self))]
    pub async fn unload(&self, entry_id: &str) -> ConfigEntriesResult<()> {
        let _cycle = self.lifecycle.lock().await;
        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
        if entry.state != ConfigEntryState::Loaded {
            self.mark(entry_id, ConfigEntryState::NotLoaded, None);
            return Ok(());
        }

        if let Some(unload) = self.handler(&entry.domain, |h| h.unload.clone()) {
            if let Err(reason) = unload(entry).await {
                warn!(%reason, "Config entry unload failed");
                self.mark(entry_id, ConfigEntryState::FailedUnload, Some(reason.clone()));
                return Err(ConfigEntriesError::UnloadFailed {
                    entry_id: entry_id.to_string(),
                    reason,
                });
            }
        }
        self.mark(entry_id, ConfigEntryState::NotLoaded, None);
        info!("Config entry unloaded");
        Ok(())
    }

    pub async fn reload(&self, entry_id: &str) -> ConfigEntriesResult<()> {
        self.unload(entry_id).await?;
        self.setup(entry_id).await
    }

    fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub async fn setup_all(&self) -> Vec<ConfigEntriesResult<()>> {
        let mut results = Vec::new();
        for entry_id in self.ids() {
            results.push(self.setup(&entry_id).await);
        }
        results
    }

    /// Unload whatever is loaded, one result per loaded entry
    pub async fn unload_all(&self) -> Vec<ConfigEntriesResult<()>> {
        let mut results = Vec::new();
        for entry_id in self.ids() {
            if self.get(&entry_id).is_some_and(|e| e.is_loaded()) {
                results.push(self.unload(&entry_id).await);
            }
        }
        results
    }
}
