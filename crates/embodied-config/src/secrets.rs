//! Values for `!secret` tags, read from `secrets.yaml`

use crate::error::{ConfigError, ConfigResult};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;
use tracing::debug;

const SECRETS_FILE: &str = "secrets.yaml";

#[derive(Debug, Clone, Default)]
pub struct Secrets {
    values: BTreeMap<String, String>,
}

/// Secrets are substituted as text; scalars keep their YAML spelling
fn as_text(value: Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::String(text) => text,
        nested => serde_yaml::to_string(&nested)
            .map(|text| text.trim_end().to_string())
            .unwrap_or_default(),
    }
}

impl Secrets {
    /// Read `secrets.yaml` in `config_dir`; no file means no secrets
    pub fn load(config_dir: &Path) -> ConfigResult<Self> {
        let path = config_dir.join(SECRETS_FILE);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "No secrets file");
                return Ok(Self::default());
            }
            Err(source) => return Err(ConfigError::ReadFile { path, source }),
        };

        let secrets = Self::parse(&content)
            .map_err(|source| ConfigError::ParseYaml { path: path.clone(), source })?;
        debug!(path = %path.display(), count = secrets.len(), "Loaded secrets");
        Ok(secrets)
    }

    pub fn parse(content: &str) -> Result<Self, serde_yaml::Error> {
        let raw: Option<BTreeMap<String, Value>> = serde_yaml::from_str(content)?;
        let values = raw
            .unwrap_or_default()
            .into_iter()
            .map(|(key, value)| (key, as_text(value)))
            .collect();
        Ok(Self { values })
    }

    pub fn get(&self, key: &str) -> ConfigResult<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| ConfigError::SecretNotFound { key: key.to_string() })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
