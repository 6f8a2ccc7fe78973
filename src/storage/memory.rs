//! In-memory [`Store`] with etcd-like revisions, TTLs and prefix watches

use super::{KeyValue, KeyValueList, Store, StoreError, StoreEvent, StoreResult, WatchEventType};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

const WATCH_BUFFER: usize = 1024;

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    mod_revision: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|t| t > now).unwrap_or(true)
    }

    fn to_kv(&self, key: &str) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: self.value.clone(),
            mod_revision: self.mod_revision,
        }
    }
}

#[derive(Default)]
struct State {
    entries: BTreeMap<String, Entry>,
    /// `(deadline, key)` of every entry written with a TTL
    expiries: BTreeSet<(Instant, String)>,
    revision: u64,
    failing_keys: HashSet<String>,
}

impl State {
    fn live(&self, key: &str) -> Option<&Entry> {
        let now = Instant::now();
        self.entries.get(key).filter(|e| e.is_live(now))
    }

    /// Drop entries whose TTL has passed
    fn evict_expired(&mut self, now: Instant) {
        while let Some((deadline, key)) = self.expiries.pop_first() {
            if deadline > now {
                self.expiries.insert((deadline, key));
                break;
            }
            // Stale deadlines of since-rewritten keys are skipped
            if self.entries.get(&key).and_then(|e| e.expires_at) == Some(deadline) {
                self.entries.remove(&key);
            }
        }
    }

    fn put(&mut self, key: &str, value: Bytes, ttl: Option<Duration>) -> KeyValue {
        self.revision += 1;
        let expires_at = ttl.map(|t| Instant::now() + t);
        if let Some(deadline) = expires_at {
            self.expiries.insert((deadline, key.to_string()));
        }
        let entry = Entry {
            value,
            mod_revision: self.revision,
            expires_at,
        };
        let kv = entry.to_kv(key);
        self.entries.insert(key.to_string(), entry);
        kv
    }
}

/// Thread-safe in-memory store, cheap to clone
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
    events: broadcast::Sender<StoreEvent>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            state: Arc::new(RwLock::new(State::default())),
            events,
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make every call fail with [`StoreError::Unavailable`] until reset
    #[cfg(any(test, feature = "test-support"))]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make deletes of `key` fail with [`StoreError::Unavailable`]
    #[cfg(any(test, feature = "test-support"))]
    pub async fn fail_deletes_of(&self, key: impl Into<String>) {
        self.state.write().await.failing_keys.insert(key.into());
    }

    /// Number of live keys
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let state = self.state.read().await;
        state.entries.values().filter(|e| e.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked unavailable".into()));
        }
        Ok(())
    }

    fn notify(&self, event_type: WatchEventType, kv: &KeyValue) {
        // No receivers is not an error
        let _ = self.events.send(StoreEvent {
            event_type,
            kv: kv.clone(),
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<KeyValue> {
        self.check_available()?;
        let state = self.state.read().await;
        state
            .live(key)
            .map(|e| e.to_kv(key))
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })
    }

    async fn create(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> StoreResult<KeyValue> {
        self.check_available()?;
        let kv = {
            let mut state = self.state.write().await;
            state.evict_expired(Instant::now());
            if state.live(key).is_some() {
                return Err(StoreError::AlreadyExists {
                    key: key.to_string(),
                });
            }
            state.put(key, value, ttl)
        };
        debug!("created {} at revision {}", key, kv.mod_revision);
        self.notify(WatchEventType::Added, &kv);
        Ok(kv)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> StoreResult<KeyValue> {
        self.check_available()?;
        let (kv, existed) = {
            let mut state = self.state.write().await;
            state.evict_expired(Instant::now());
            let existed = state.live(key).is_some();
            (state.put(key, value, ttl), existed)
        };
        let event_type = if existed {
            WatchEventType::Modified
        } else {
            WatchEventType::Added
        };
        self.notify(event_type, &kv);
        Ok(kv)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: Bytes,
        revision: u64,
    ) -> StoreResult<KeyValue> {
        self.check_available()?;
        let kv = {
            let mut state = self.state.write().await;
            state.evict_expired(Instant::now());
            let (actual, ttl_left) = match state.live(key) {
                Some(entry) => (
                    entry.mod_revision,
                    entry
                        .expires_at
                        .map(|t| t.saturating_duration_since(Instant::now())),
                ),
                None => {
                    return Err(StoreError::NotFound {
                        key: key.to_string(),
                    })
                }
            };
            if actual != revision {
                return Err(StoreError::Conflict {
                    key: key.to_string(),
                    expected: revision,
                    actual,
                });
            }
            state.put(key, value, ttl_left)
        };
        self.notify(WatchEventType::Modified, &kv);
        Ok(kv)
    }

    async fn delete(&self, key: &str) -> StoreResult<KeyValue> {
        self.check_available()?;
        let kv = {
            let mut state = self.state.write().await;
            state.evict_expired(Instant::now());
            if state.failing_keys.contains(key) {
                return Err(StoreError::Unavailable(format!("delete of {} failed", key)));
            }
            let Some(entry) = state.entries.remove(key) else {
                return Err(StoreError::NotFound {
                    key: key.to_string(),
                });
            };
            state.revision += 1;
            KeyValue {
                key: key.to_string(),
                value: entry.value,
                mod_revision: state.revision,
            }
        };
        debug!("deleted {} at revision {}", key, kv.mod_revision);
        self.notify(WatchEventType::Deleted, &kv);
        Ok(kv)
    }

    async fn list(&self, prefix: &str) -> StoreResult<KeyValueList> {
        self.check_available()?;
        let now = Instant::now();
        let state = self.state.read().await;
        let items = state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, e)| e.is_live(now))
            .map(|(k, e)| e.to_kv(k))
            .collect();
        Ok(KeyValueList {
            revision: state.revision,
            items,
        })
    }

    fn watch(&self, prefix: &str) -> StoreResult<BoxStream<'static, StoreEvent>> {
        self.check_available()?;
        let prefix = prefix.to_string();
        let stream = BroadcastStream::new(self.events.subscribe()).filter_map(move |result| {
            let event = match result {
                Ok(event) if event.kv.key.starts_with(&prefix) => Some(event),
                Ok(_) => None,
                // Lagged receivers skip the missed events
                Err(_) => None,
            };
            futures::future::ready(event)
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_get_delete() {
        let store = MemoryStore::new();

        let created = store
            .create("/a/b", Bytes::from_static(b"one"), None)
            .await
            .unwrap();
        assert_eq!(created.mod_revision, 1);

        let err = store
            .create("/a/b", Bytes::from_static(b"two"), None)
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::AlreadyExists { key: "/a/b".into() });

        let got = store.get("/a/b").await.unwrap();
        assert_eq!(got.value, Bytes::from_static(b"one"));

        let deleted = store.delete("/a/b").await.unwrap();
        assert_eq!(deleted.value, Bytes::from_static(b"one"));
        assert!(store.get("/a/b").await.unwrap_err().is_not_found());
        assert!(store.delete("/a/b").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_respects_directory_prefix() {
        let store = MemoryStore::new();
        for key in ["/p/default/a", "/p/default/b", "/p/default2/c", "/q/x"] {
            store.set(key, Bytes::from_static(b"v"), None).await.unwrap();
        }

        let listed = store.list("/p/default/").await.unwrap();
        let keys: Vec<_> = listed.items.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["/p/default/a", "/p/default/b"]);
        assert_eq!(listed.revision, 4);

        assert_eq!(store.list("/p/").await.unwrap().items.len(), 3);
        assert!(store.list("/nothing/").await.unwrap().items.is_empty());
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let store = MemoryStore::new();
        let kv = store.set("/k", Bytes::from_static(b"1"), None).await.unwrap();

        let updated = store
            .compare_and_swap("/k", Bytes::from_static(b"2"), kv.mod_revision)
            .await
            .unwrap();
        assert!(updated.mod_revision > kv.mod_revision);

        let err = store
            .compare_and_swap("/k", Bytes::from_static(b"3"), kv.mod_revision)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();
        store
            .set("/ttl", Bytes::from_static(b"v"), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(store.get("/ttl").await.is_ok());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.get("/ttl").await.unwrap_err().is_not_found());
        assert!(store.list("/").await.unwrap().items.is_empty());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_expired_entries_are_evicted_on_write() {
        let store = MemoryStore::new();
        store
            .set("/ttl", Bytes::from_static(b"v"), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        store
            .set("/kept", Bytes::from_static(b"v"), Some(Duration::from_secs(60)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        store.set("/other", Bytes::from_static(b"v"), None).await.unwrap();

        let state = store.state.read().await;
        assert!(!state.entries.contains_key("/ttl"));
        assert!(state.entries.contains_key("/kept"));
        assert_eq!(state.expiries.len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_is_distinct_from_not_found() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let err = store.get("/missing").await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(!err.is_not_found());
    }

    #[tokio::test]
    async fn test_watch_filters_by_prefix() {
        let store = MemoryStore::new();
        let mut events = store.watch("/w/").unwrap();

        store.set("/other", Bytes::from_static(b"x"), None).await.unwrap();
        store.create("/w/a", Bytes::from_static(b"1"), None).await.unwrap();
        store.set("/w/a", Bytes::from_static(b"2"), None).await.unwrap();
        store.delete("/w/a").await.unwrap();

        let kinds: Vec<_> = [
            events.next().await.unwrap(),
            events.next().await.unwrap(),
            events.next().await.unwrap(),
        ]
        .iter()
        .map(|e| (e.event_type, e.kv.key.clone()))
        .collect();

        assert_eq!(
            kinds,
            vec![
                (WatchEventType::Added, "/w/a".to_string()),
                (WatchEventType::Modified, "/w/a".to_string()),
                (WatchEventType::Deleted, "/w/a".to_string()),
            ]
        );
    }
}
