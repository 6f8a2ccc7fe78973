//! Server configuration
//!
//! Loaded from a YAML file; every field has a default so an empty file (or
//! no file at all) yields a working single-node server.

use crate::storage::{codec_for_name, StorageDestination, StorageDestinations, Store};
use crate::{ApiError, Result};
use apiplane_common::EXTENSIONS_GROUP;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Where one API group keeps its objects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub group: String,
    pub prefix: String,
    #[serde(default = "default_codec")]
    pub codec: String,
}

fn default_codec() -> String {
    "json".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    /// Root of the legacy ungrouped API
    pub api_prefix: String,
    /// Root of named API groups
    pub api_group_prefix: String,
    /// Floor for long-running requests such as watches
    pub min_request_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// `AlwaysAdmit` or `AlwaysDeny`
    pub admission_control: String,
    pub enable_metrics: bool,
    /// Group → version reported as preferred while installed
    pub preferred_versions: BTreeMap<String, String>,
    pub storage: Vec<StorageConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
            api_prefix: "/api".to_string(),
            api_group_prefix: "/apis".to_string(),
            min_request_timeout_secs: 1800,
            request_timeout_secs: 60,
            admission_control: "AlwaysAdmit".to_string(),
            enable_metrics: true,
            preferred_versions: BTreeMap::new(),
            storage: vec![StorageConfig {
                group: EXTENSIONS_GROUP.to_string(),
                prefix: "/registry".to_string(),
                codec: default_codec(),
            }],
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ServerConfig = serde_yaml::from_str(&content).map_err(|e| {
            ApiError::ConfigError(format!("failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| ApiError::ConfigError(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        for (field, prefix) in [
            ("api_prefix", &self.api_prefix),
            ("api_group_prefix", &self.api_group_prefix),
        ] {
            if !prefix.starts_with('/') || prefix.len() < 2 {
                return Err(ApiError::ConfigError(format!(
                    "{} must be an absolute path, got {:?}",
                    field, prefix
                )));
            }
        }
        if self.api_prefix == self.api_group_prefix {
            return Err(ApiError::ConfigError(
                "api_prefix and api_group_prefix must differ".to_string(),
            ));
        }
        if self.min_request_timeout_secs == 0 || self.request_timeout_secs == 0 {
            return Err(ApiError::ConfigError(
                "request timeouts must be greater than zero".to_string(),
            ));
        }

        let mut groups = BTreeSet::new();
        for storage in &self.storage {
            if !storage.prefix.starts_with('/') {
                return Err(ApiError::ConfigError(format!(
                    "storage prefix for group {:?} must start with '/', got {:?}",
                    storage.group, storage.prefix
                )));
            }
            if !groups.insert(storage.group.as_str()) {
                return Err(ApiError::ConfigError(format!(
                    "storage for group {:?} is configured twice",
                    storage.group
                )));
            }
            codec_for_name(&storage.codec)
                .map_err(|e| ApiError::ConfigError(e.to_string()))?;
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn min_request_timeout(&self) -> Duration {
        Duration::from_secs(self.min_request_timeout_secs)
    }

    /// Storage destinations for every configured group, all on `store`
    pub fn storage_destinations(&self, store: Arc<dyn Store>) -> Result<StorageDestinations> {
        let mut destinations = StorageDestinations::new();
        for storage in &self.storage {
            destinations.add_group(StorageDestination::new(
                storage.group.clone(),
                store.clone(),
                storage.prefix.clone(),
                codec_for_name(&storage.codec)
                    .map_err(|e| ApiError::ConfigError(e.to_string()))?,
            ))?;
        }
        Ok(destinations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = ServerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.min_request_timeout(), Duration::from_secs(1800));
        assert_eq!(config.storage[0].group, "extensions");
    }

    #[test]
    fn test_load_partial_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "bind_address: 0.0.0.0:9000\npreferred_versions:\n  company.com: v3\nstorage:\n  - group: extensions\n    prefix: /tpr\n    codec: yaml"
        )
        .unwrap();

        let config = ServerConfig::load(file.path()).unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:9000");
        assert_eq!(config.api_group_prefix, "/apis");
        assert_eq!(config.preferred_versions["company.com"], "v3");
        assert_eq!(config.storage[0].codec, "yaml");
    }

    #[test]
    fn test_validation_failures() {
        let mut config = ServerConfig::default();
        config.storage[0].prefix = "registry".into();
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.request_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.storage.push(config.storage[0].clone());
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.storage[0].codec = "protobuf".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_storage_destinations_share_one_store() {
        let mut config = ServerConfig::default();
        config.storage.push(StorageConfig {
            group: "company.com".into(),
            prefix: "/company".into(),
            codec: "yaml".into(),
        });
        let destinations = config
            .storage_destinations(Arc::new(MemoryStore::new()))
            .unwrap();
        assert_eq!(destinations.groups(), vec!["company.com", "extensions"]);
        assert_eq!(
            destinations.destination_for("company.com").unwrap().codec.name(),
            "yaml"
        );
    }

    #[test]
    fn test_yaml_round_trip() {
        let yaml = ServerConfig::default().to_yaml().unwrap();
        let parsed: ServerConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, ServerConfig::default());
    }
}
