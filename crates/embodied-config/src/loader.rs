//! Server configuration file loading
//!
//! The server reads one YAML file:
//!
//! ```yaml
//! config_dir: ./data
//! log_level: info
//! aiembodied:
//!   title: Living room robot
//!   endpoint: https://ai.example/api
//!   auth_token: !secret ai_token
//!   exposure: [light, sensor.outdoor_temp]
//!   options:
//!     debug: true
//! ```
//!
//! `!secret key` is resolved from `secrets.yaml` next to the file and
//! `!env_var NAME` from the process environment.

use crate::error::{ConfigError, ConfigResult};
use crate::secrets::Secrets;
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use serde_yaml::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// The `aiembodied:` section of the server file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntrySection {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub options: Map<String, JsonValue>,
    /// Raw integration fields, validated later by
    /// [`normalize_config_data`](crate::normalize_config_data)
    #[serde(flatten)]
    pub data: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawServerConfig {
    #[serde(default)]
    config_dir: Option<PathBuf>,
    #[serde(default)]
    log_level: Option<String>,
    #[serde(default)]
    aiembodied: Option<EntrySection>,
}

/// Parsed server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory holding `.storage/`; relative paths resolve against the file
    pub config_dir: PathBuf,
    pub log_level: Option<String>,
    pub entry: Option<EntrySection>,
}

/// Resolves custom tags in a YAML document
pub struct YamlLoader {
    secrets: Secrets,
}

impl YamlLoader {
    pub fn new(config_dir: &Path) -> ConfigResult<Self> {
        Ok(Self {
            secrets: Secrets::load(config_dir)?,
        })
    }

    pub fn with_secrets(secrets: Secrets) -> Self {
        Self { secrets }
    }

    pub fn load_file(&self, path: &Path) -> ConfigResult<Value> {
        debug!("Loading YAML file: {:?}", path);
        let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        self.load_string(&content, path)
    }

    pub fn load_string(&self, content: &str, source_path: &Path) -> ConfigResult<Value> {
        let value: Value = serde_yaml::from_str(content).map_err(|e| ConfigError::ParseYaml {
            path: source_path.to_path_buf(),
            source: e,
        })?;
        self.process_value(value)
    }

    fn process_value(&self, value: Value) -> ConfigResult<Value> {
        match value {
            Value::Tagged(tagged) => self.process_tagged(*tagged),
            Value::Mapping(map) => {
                let mut result = serde_yaml::Mapping::new();
                for (k, v) in map {
                    result.insert(self.process_value(k)?, self.process_value(v)?);
                }
                Ok(Value::Mapping(result))
            }
            Value::Sequence(seq) => Ok(Value::Sequence(
                seq.into_iter()
                    .map(|v| self.process_value(v))
                    .collect::<ConfigResult<Vec<_>>>()?,
            )),
            other => Ok(other),
        }
    }

    fn process_tagged(&self, tagged: serde_yaml::value::TaggedValue) -> ConfigResult<Value> {
        let tag = tagged.tag.to_string();
        trace!("Processing tag '{}'", tag);

        match tag.as_str() {
            "!secret" => {
                let key = tag_argument(&tag, tagged.value)?;
                let secret = self.secrets.get(&key)?;
                debug!("Substituted secret: {}", key);
                Ok(Value::String(secret.to_string()))
            }
            "!env_var" => {
                let var = tag_argument(&tag, tagged.value)?;
                std::env::var(&var)
                    .map(Value::String)
                    .map_err(|_| ConfigError::EnvVarNotFound { var })
            }
            _ => {
                let value = self.process_value(tagged.value)?;
                Ok(Value::Tagged(Box::new(serde_yaml::value::TaggedValue {
                    tag: tagged.tag,
                    value,
                })))
            }
        }
    }
}

fn tag_argument(tag: &str, value: Value) -> ConfigResult<String> {
    match value {
        Value::String(s) => Ok(s),
        _ => Err(ConfigError::InvalidValue {
            key: tag.to_string(),
            reason: "tag argument must be a string".to_string(),
        }),
    }
}

/// Load the server configuration file at `path`
pub fn load_server_config(path: impl AsRef<Path>) -> ConfigResult<ServerConfig> {
    let path = path.as_ref();
    let base_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let loader = YamlLoader::new(&base_dir)?;
    let yaml = loader.load_file(path)?;

    let raw: RawServerConfig = if yaml.is_null() {
        RawServerConfig {
            config_dir: None,
            log_level: None,
            aiembodied: None,
        }
    } else {
        serde_yaml::from_value(yaml).map_err(|e| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            source: e,
        })?
    };

    let config_dir = match raw.config_dir {
        Some(dir) if dir.is_absolute() => dir,
        Some(dir) => base_dir.join(dir),
        None => base_dir,
    };

    Ok(ServerConfig {
        config_dir,
        log_level: raw.log_level,
        entry: raw.aiembodied,
    })
}
