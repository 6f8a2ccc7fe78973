//! API group → storage destination routing

use super::{Codec, Store};
use crate::{ApiError, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Where one API group keeps its objects
#[derive(Clone)]
pub struct StorageDestination {
    pub group: String,
    pub store: Arc<dyn Store>,
    pub prefix: String,
    pub codec: Arc<dyn Codec>,
}

impl StorageDestination {
    pub fn new(
        group: impl Into<String>,
        store: Arc<dyn Store>,
        prefix: impl Into<String>,
        codec: Arc<dyn Codec>,
    ) -> Self {
        Self {
            group: group.into(),
            store,
            prefix: normalize_prefix(&prefix.into()),
            codec,
        }
    }

    /// Absolute store key for a path relative to this destination
    pub fn key(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        if self.prefix.is_empty() {
            format!("/{}", path)
        } else {
            format!("{}/{}", self.prefix, path)
        }
    }

    fn same_as(&self, other: &StorageDestination) -> bool {
        Arc::ptr_eq(&self.store, &other.store)
            && self.prefix == other.prefix
            && self.codec.name() == other.codec.name()
    }

    fn shares_prefix_with(&self, other: &StorageDestination) -> bool {
        Arc::ptr_eq(&self.store, &other.store) && self.prefix == other.prefix
    }
}

impl fmt::Debug for StorageDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageDestination")
            .field("group", &self.group)
            .field("prefix", &self.prefix)
            .field("codec", &self.codec.name())
            .finish()
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Registered storage destinations, built once during startup
///
/// After startup the router is shared behind an `Arc` and only read.
#[derive(Default, Clone)]
pub struct StorageDestinations {
    groups: BTreeMap<String, StorageDestination>,
}

impl StorageDestinations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the destination for a group
    ///
    /// Registering an identical destination again is a no-op. A different
    /// destination for the same group, or a key prefix already used by
    /// another group on the same store, is a configuration error.
    pub fn add_group(&mut self, destination: StorageDestination) -> Result<()> {
        if let Some(existing) = self.groups.get(&destination.group) {
            if existing.same_as(&destination) {
                return Ok(());
            }
            return Err(ApiError::ConfigError(format!(
                "API group {:?} already has storage destination {:?}, refusing {:?}",
                destination.group, existing, destination
            )));
        }

        if let Some(clash) = self
            .groups
            .values()
            .find(|d| d.shares_prefix_with(&destination))
        {
            return Err(ApiError::ConfigError(format!(
                "key prefix {:?} is already used by API group {:?}",
                destination.prefix, clash.group
            )));
        }

        info!(
            "Storage destination for group {:?}: prefix={:?} codec={}",
            destination.group,
            destination.prefix,
            destination.codec.name()
        );
        self.groups.insert(destination.group.clone(), destination);
        Ok(())
    }

    pub fn destination_for(&self, group: &str) -> Result<&StorageDestination> {
        self.groups
            .get(group)
            .ok_or_else(|| ApiError::UnknownGroup(group.to_string()))
    }

    pub fn groups(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }
}
