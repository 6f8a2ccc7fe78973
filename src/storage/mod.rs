//! Storage backends, codecs and the group → destination router

pub mod codec;
pub mod memory;
pub mod router;

pub use codec::{codec_for_name, Codec, CodecError, JsonCodec, YamlCodec};
pub use memory::MemoryStore;
pub use router::{StorageDestination, StorageDestinations};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("key not found: {key}")]
    NotFound { key: String },

    #[error("key already exists: {key}")]
    AlreadyExists { key: String },

    #[error("revision conflict on {key}: expected {expected}, found {actual}")]
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A stored value together with the revision of its last modification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Bytes,
    pub mod_revision: u64,
}

/// Result of a range read, consistent as of `revision`
#[derive(Debug, Clone, Default)]
pub struct KeyValueList {
    pub revision: u64,
    pub items: Vec<KeyValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

impl WatchEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchEventType::Added => "ADDED",
            WatchEventType::Modified => "MODIFIED",
            WatchEventType::Deleted => "DELETED",
        }
    }
}

/// Change notification for one key. For deletions `kv` carries the last value
/// and the revision of the delete.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub event_type: WatchEventType,
    pub kv: KeyValue,
}

/// Consumed interface of the distributed key-value store
///
/// Every call may block on I/O; callers bound them with their own deadline.
/// Keys are absolute paths; `list` and `watch` match on a raw string prefix,
/// so callers pass a trailing `/` to scope to a directory.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<KeyValue>;

    /// Write only if `key` does not exist yet
    async fn create(&self, key: &str, value: Bytes, ttl: Option<Duration>)
        -> StoreResult<KeyValue>;

    /// Unconditional write
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> StoreResult<KeyValue>;

    /// Write only if the current modification revision equals `revision`
    async fn compare_and_swap(&self, key: &str, value: Bytes, revision: u64)
        -> StoreResult<KeyValue>;

    /// Remove `key`, returning the value it held
    async fn delete(&self, key: &str) -> StoreResult<KeyValue>;

    async fn list(&self, prefix: &str) -> StoreResult<KeyValueList>;

    /// Changes under `prefix` made after this call
    fn watch(&self, prefix: &str) -> StoreResult<BoxStream<'static, StoreEvent>>;
}
