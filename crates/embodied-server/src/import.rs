//! Import of the YAML `aiembodied:` section as a config entry

use anyhow::Result;
use embodied_config::{normalize_config_data, EntrySection, IntegrationOptions, DOMAIN};
use embodied_config_entries::{ConfigEntries, ConfigEntry, ConfigEntrySource, ConfigEntryUpdate};
use tracing::info;

const DEFAULT_TITLE: &str = "Embodied AI";

/// Create or refresh the entry described by the YAML section.
///
/// Entries are keyed by endpoint. A refresh replaces title and data but
/// keeps the stored options, so a persisted pause survives restarts.
pub async fn import_entry(entries: &ConfigEntries, section: &EntrySection) -> Result<String> {
    let config = normalize_config_data(&section.data)?;
    let title = section
        .title
        .clone()
        .unwrap_or_else(|| DEFAULT_TITLE.to_string());

    if let Some(existing) = entries.get_by_unique_id(DOMAIN, &config.endpoint) {
        entries
            .update(
                &existing.entry_id,
                ConfigEntryUpdate::new()
                    .title(title)
                    .data(config.to_entry_data()),
            )
            .await?;
        info!(entry_id = %existing.entry_id, "Refreshed imported entry");
        return Ok(existing.entry_id);
    }

    let options = IntegrationOptions::from_input(&section.options)?;
    let entry = entries
        .add(
            ConfigEntry::new(DOMAIN, title)
                .with_unique_id(config.endpoint.clone())
                .with_source(ConfigEntrySource::Import)
                .with_data(config.to_entry_data())
                .with_options(options.to_entry_options()),
        )
        .await?;
    info!(entry_id = %entry.entry_id, endpoint = %config.endpoint, "Imported entry");
    Ok(entry.entry_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use embodied_config_entries::ConfigEntryState;
    use embodied_registries::Storage;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn section(value: Value) -> EntrySection {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_import_creates_then_refreshes() {
        let dir = TempDir::new().unwrap();
        let entries = ConfigEntries::new(Arc::new(Storage::new(dir.path())));

        let first = section(json!({
            "title": "Robot",
            "endpoint": "http://robot.local/api",
            "exposure": "light, sensor.outdoor",
            "options": {"burst_size": 5}
        }));
        let entry_id = import_entry(&entries, &first).await.unwrap();

        let entry = entries.get(&entry_id).unwrap();
        assert_eq!(entry.title, "Robot");
        assert_eq!(entry.source, ConfigEntrySource::Import);
        assert_eq!(entry.state, ConfigEntryState::NotLoaded);
        assert_eq!(entry.data["exposure"], json!(["light", "sensor.outdoor"]));
        assert_eq!(entry.options["burst_size"], json!(5));

        let mut options = entry.options.clone();
        options.insert("autonomy_paused".to_string(), json!(true));
        entries
            .update(&entry_id, ConfigEntryUpdate::new().options(options))
            .await
            .unwrap();

        let second = section(json!({
            "endpoint": "http://robot.local/api",
            "exposure": ["light"]
        }));
        assert_eq!(import_entry(&entries, &second).await.unwrap(), entry_id);

        let entry = entries.get(&entry_id).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entry.title, "Embodied AI");
        assert_eq!(entry.data["exposure"], json!(["light"]));
        assert_eq!(entry.options["autonomy_paused"], json!(true));
    }

    #[tokio::test]
    async fn test_import_rejects_missing_endpoint() {
        let dir = TempDir::new().unwrap();
        let entries = ConfigEntries::new(Arc::new(Storage::new(dir.path())));

        let result = import_entry(&entries, &section(json!({}))).await;

        assert!(result.is_err());
        assert!(entries.is_empty());
    }
}
