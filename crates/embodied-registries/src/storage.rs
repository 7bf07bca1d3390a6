//! Versioned JSON documents under `<config_dir>/.storage`
//!
//! Every document is wrapped in an envelope carrying its key and schema
//! version:
//!
//! ```json
//! { "version": 1, "minor_version": 1, "key": "core.config_entries", "data": {} }
//! ```

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

const STORAGE_DIR: &str = ".storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed storage document {key}: {source}")]
    Json {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{key} has schema version {found}, this build reads {expected}")]
    VersionMismatch {
        key: String,
        expected: u32,
        found: u32,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;

/// A document that lives under a fixed storage key
pub trait Storable: Serialize + DeserializeOwned {
    const KEY: &'static str;
    const VERSION: u32;
    const MINOR_VERSION: u32 = 1;
}

#[derive(Deserialize)]
struct Envelope<T> {
    version: u32,
    #[serde(default)]
    minor_version: u32,
    data: T,
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    version: u32,
    minor_version: u32,
    key: &'a str,
    data: &'a T,
}

#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(config_dir: impl AsRef<Path>) -> Self {
        Self {
            root: config_dir.as_ref().join(STORAGE_DIR),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Read a document, `None` when it was never written.
    ///
    /// A major version other than the one compiled in is refused; an older
    /// minor version is read as-is.
    pub async fn read<T: Storable>(&self) -> StorageResult<Option<T>> {
        let raw = match fs::read_to_string(self.path_for(T::KEY)).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(io_error(T::KEY, source)),
        };

        let envelope: Envelope<T> =
            serde_json::from_str(&raw).map_err(|source| StorageError::Json {
                key: T::KEY.to_string(),
                source,
            })?;

        if envelope.version != T::VERSION {
            return Err(StorageError::VersionMismatch {
                key: T::KEY.to_string(),
                expected: T::VERSION,
                found: envelope.version,
            });
        }
        if envelope.minor_version < T::MINOR_VERSION {
            warn!(
                key = T::KEY,
                stored = envelope.minor_version,
                current = T::MINOR_VERSION,
                "Reading storage written by an older minor version"
            );
        }
        debug!(key = T::KEY, "Read storage document");
        Ok(Some(envelope.data))
    }

    /// Write a document through a sibling temp file and rename
    pub async fn write<T: Storable>(&self, data: &T) -> StorageResult<()> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|source| io_error(T::KEY, source))?;

        let envelope = EnvelopeRef {
            version: T::VERSION,
            minor_version: T::MINOR_VERSION,
            key: T::KEY,
            data,
        };
        let body = serde_json::to_vec_pretty(&envelope).map_err(|source| StorageError::Json {
            key: T::KEY.to_string(),
            source,
        })?;

        let target = self.path_for(T::KEY);
        let staging = self.path_for(&format!("{}.tmp", T::KEY));
        fs::write(&staging, body)
            .await
            .map_err(|source| io_error(T::KEY, source))?;
        fs::rename(&staging, &target)
            .await
            .map_err(|source| io_error(T::KEY, source))?;

        debug!(key = T::KEY, "Wrote storage document");
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> StorageResult<()> {
        match fs::remove_file(self.path_for(key)).await {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(io_error(key, err)),
            _ => Ok(()),
        }
    }
}

fn io_error(key: &str, source: std::io::Error) -> StorageError {
    StorageError::Io {
        key: key.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Paused {
        entry_id: String,
        paused: bool,
    }

    impl Storable for Paused {
        const KEY: &'static str = "aiembodied.paused";
        const VERSION: u32 = 1;
    }

    fn paused() -> Paused {
        Paused {
            entry_id: "robot1".to_string(),
            paused: true,
        }
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());

        storage.write(&paused()).await.unwrap();

        assert!(storage.path_for("aiembodied.paused").exists());
        assert!(!storage.path_for("aiembodied.paused.tmp").exists());
        assert_eq!(storage.read::<Paused>().await.unwrap(), Some(paused()));
    }

    #[tokio::test]
    async fn test_missing_document_reads_none() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        assert_eq!(storage.read::<Paused>().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_envelope_on_disk() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        storage.write(&paused()).await.unwrap();

        let raw = std::fs::read_to_string(storage.path_for("aiembodied.paused")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["version"], 1);
        assert_eq!(value["key"], "aiembodied.paused");
        assert_eq!(value["data"]["paused"], true);
    }

    #[tokio::test]
    async fn test_newer_major_version_is_refused() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        std::fs::create_dir_all(storage.root()).unwrap();
        std::fs::write(
            storage.path_for("aiembodied.paused"),
            r#"{"version": 2, "key": "aiembodied.paused", "data": {"entry_id": "x", "paused": false}}"#,
        )
        .unwrap();

        assert!(matches!(
            storage.read::<Paused>().await,
            Err(StorageError::VersionMismatch { expected: 1, found: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_garbage_is_a_json_error() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        std::fs::create_dir_all(storage.root()).unwrap();
        std::fs::write(storage.path_for("aiembodied.paused"), "not json").unwrap();

        assert!(matches!(
            storage.read::<Paused>().await,
            Err(StorageError::Json { .. })
        ));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        storage.write(&paused()).await.unwrap();

        storage.remove("aiembodied.paused").await.unwrap();
        storage.remove("aiembodied.paused").await.unwrap();
        assert_eq!(storage.read::<Paused>().await.unwrap(), None);
    }
}
