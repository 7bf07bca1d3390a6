//! Config entries: configured integration instances
//!
//! [`ConfigEntries`] stores entries in `.storage/core.config_entries`, runs
//! the per-domain setup and unload handlers, and awaits update listeners
//! whenever an entry's title, data or options change.

pub mod entry;
pub mod manager;

pub use entry::{ConfigEntry, ConfigEntrySource, ConfigEntryState, ConfigEntryUpdate};
pub use manager::{
    ConfigEntries, ConfigEntriesError, ConfigEntriesResult, EntryHandler, UpdateListener,
    UpdateListenerHandle,
};
