use super::phase::{PhaseCell, ResourcePhase};
use crate::apiserver::group_version::{GroupVersionRegistrar, RestResource};
use crate::metrics::ApiMetrics;
use crate::registry::{RestStorage, ThirdPartyResourceDataRest};
use crate::storage::{StorageDestination, StorageDestinations};
use crate::{ApiError, Result};
use apiplane_common::{
    pluralize, third_party_key_prefix, GroupVersion, ResourceScope, ThirdPartyResource,
    EXTENSIONS_GROUP,
};
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// A third-party resource type currently served
#[derive(Debug)]
pub struct InstalledThirdPartyResource {
    pub declaration: ThirdPartyResource,
    pub identity: String,
    pub group: String,
    pub kind: String,
    pub plural: String,
    pub key_prefix: String,
    pub destination: StorageDestination,
    pub handlers: BTreeMap<String, Arc<ThirdPartyResourceDataRest>>,
    pub phase: PhaseCell,
}

impl InstalledThirdPartyResource {
    pub fn group_versions(&self) -> impl Iterator<Item = GroupVersion> + '_ {
        self.handlers
            .keys()
            .map(move |version| GroupVersion::new(&self.group, version))
    }
}

/// Owns every installed third-party resource type
///
/// Install and remove of one identity are serialized on a per-identity lock;
/// different identities proceed in parallel.
pub struct ThirdPartyManager {
    storage: Arc<StorageDestinations>,
    registrar: Arc<GroupVersionRegistrar>,
    resources: DashMap<String, Arc<InstalledThirdPartyResource>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    metrics: Option<ApiMetrics>,
}

impl ThirdPartyManager {
    pub fn new(
        storage: Arc<StorageDestinations>,
        registrar: Arc<GroupVersionRegistrar>,
        metrics: Option<ApiMetrics>,
    ) -> Self {
        Self {
            storage,
            registrar,
            resources: DashMap::new(),
            locks: DashMap::new(),
            metrics,
        }
    }

    fn lock_for(&self, identity: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Forget the lock of `identity` once no task holds or waits on it
    fn release_lock(&self, identity: &str) {
        self.locks
            .remove_if(identity, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn update_gauge(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.set_third_party_resources(self.resources.len());
        }
    }

    pub async fn install(
        &self,
        declaration: ThirdPartyResource,
    ) -> Result<Arc<InstalledThirdPartyResource>> {
        let (group, kind) = declaration.group_and_kind()?;
        validate_versions(&declaration)?;

        let plural = pluralize(&kind);
        let identity = format!("{}.{}", plural, group);

        let lock = self.lock_for(&identity);
        let guard = lock.lock().await;
        let result = self
            .install_locked(declaration, group, kind, plural, identity.clone())
            .await;
        drop(guard);
        drop(lock);
        self.release_lock(&identity);
        result
    }

    async fn install_locked(
        &self,
        declaration: ThirdPartyResource,
        group: String,
        kind: String,
        plural: String,
        identity: String,
    ) -> Result<Arc<InstalledThirdPartyResource>> {
        if self.resources.contains_key(&identity) {
            return Err(ApiError::already_exists(
                ThirdPartyResource::KIND,
                declaration.name(),
            ));
        }

        let destination = self.storage.destination_for(EXTENSIONS_GROUP)?.clone();
        let key_prefix = third_party_key_prefix(&group, &plural);
        let phase = PhaseCell::new(ResourcePhase::Installing);

        let mut handlers = BTreeMap::new();
        let mut registered: Vec<GroupVersion> = Vec::new();

        for version in &declaration.versions {
            let group_version = GroupVersion::new(&group, &version.name);
            let handler = Arc::new(ThirdPartyResourceDataRest::new(
                destination.clone(),
                key_prefix.clone(),
                group_version.clone(),
                kind.clone(),
                declaration.scope,
                identity.clone(),
                phase.clone(),
            ));
            let storage: Arc<dyn RestStorage> = handler.clone();
            let resource = RestResource {
                plural: plural.clone(),
                kind: kind.clone(),
                namespaced: declaration.scope == ResourceScope::Namespaced,
                storage,
            };

            if let Err(e) = self
                .registrar
                .add_resource(group_version.clone(), resource)
                .await
            {
                phase.set(ResourcePhase::Removed);
                for done in &registered {
                    if let Err(rollback) = self.registrar.remove_resource(done, &plural).await {
                        warn!("Rollback of {}/{} failed: {}", done, plural, rollback);
                    }
                }
                warn!("Install of {} failed at {}: {}", identity, group_version, e);
                return Err(e);
            }

            registered.push(group_version);
            handlers.insert(version.name.clone(), handler);
        }

        phase.set(ResourcePhase::Installed);
        let installed = Arc::new(InstalledThirdPartyResource {
            declaration,
            identity: identity.clone(),
            group,
            kind,
            plural,
            key_prefix,
            destination,
            handlers,
            phase,
        });
        self.resources.insert(identity.clone(), installed.clone());
        self.update_gauge();

        info!(
            "Installed third-party resource {} (versions: {})",
            identity,
            installed.handlers.keys().cloned().collect::<Vec<_>>().join(", ")
        );
        Ok(installed)
    }

    /// Remove one resource type and delete every stored instance
    ///
    /// Teardown runs in its own task and always completes, even if the
    /// caller is dropped. Keys that could not be deleted are reported as
    /// [`ApiError::PartialTeardownFailure`]; the type is forgotten either way.
    pub async fn remove_resource(self: &Arc<Self>, identity: &str) -> Result<()> {
        let manager = Arc::clone(self);
        let identity = identity.to_string();
        tokio::spawn(async move { manager.teardown(&identity).await })
            .await
            .map_err(|e| ApiError::Internal(format!("teardown task failed: {}", e)))?
    }

    /// Remove every resource type of a group domain
    pub async fn remove(self: &Arc<Self>, group: &str) -> Result<()> {
        let identities: Vec<String> = self
            .resources
            .iter()
            .filter(|entry| entry.value().group == group)
            .map(|entry| entry.key().clone())
            .collect();
        if identities.is_empty() {
            return Err(ApiError::not_found("API group", group));
        }

        let mut failures = Vec::new();
        for identity in identities {
            match self.remove_resource(&identity).await {
                Ok(()) => {}
                Err(ApiError::NotFound { .. }) => {}
                Err(ApiError::PartialTeardownFailure { failures: f, .. }) => failures.extend(f),
                Err(e) => failures.push(format!("{}: {}", identity, e)),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ApiError::PartialTeardownFailure {
                resource: group.to_string(),
                failures,
            })
        }
    }

    async fn teardown(&self, identity: &str) -> Result<()> {
        let lock = self.lock_for(identity);
        let guard = lock.lock().await;
        let result = self.teardown_locked(identity).await;
        drop(guard);
        drop(lock);
        self.release_lock(identity);
        result
    }

    async fn teardown_locked(&self, identity: &str) -> Result<()> {
        let installed = self
            .resources
            .get(identity)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ApiError::not_found(ThirdPartyResource::KIND, identity))?;

        installed.phase.set(ResourcePhase::Removing);
        let mut failures = Vec::new();

        for group_version in installed.group_versions() {
            if let Err(e) = self
                .registrar
                .remove_resource(&group_version, &installed.plural)
                .await
            {
                failures.push(format!("routes of {}: {}", group_version, e));
            }
        }

        let store = &installed.destination.store;
        let root = installed
            .destination
            .key(&format!("{}/", installed.key_prefix));
        match store.list(&root).await {
            Ok(listed) => {
                for kv in listed.items {
                    match store.delete(&kv.key).await {
                        Ok(_) => {}
                        Err(e) if e.is_not_found() => {}
                        Err(e) => failures.push(format!("{}: {}", kv.key, e)),
                    }
                }
            }
            Err(e) => failures.push(format!("listing {}: {}", root, e)),
        }

        self.resources.remove(identity);
        installed.phase.set(ResourcePhase::Removed);
        self.update_gauge();

        if failures.is_empty() {
            info!("Removed third-party resource {}", identity);
            return Ok(());
        }

        warn!(
            "Removed third-party resource {} with {} teardown failure(s): {}",
            identity,
            failures.len(),
            failures.join("; ")
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_teardown_failures(failures.len());
        }
        Err(ApiError::PartialTeardownFailure {
            resource: identity.to_string(),
            failures,
        })
    }

    /// Identities of every installed resource type, sorted
    pub fn installed(&self) -> Vec<String> {
        let mut identities: Vec<String> =
            self.resources.iter().map(|e| e.key().clone()).collect();
        identities.sort();
        identities
    }

    /// `<api group prefix>/<group>` for every group with an installed type
    pub fn installed_paths(&self) -> Vec<String> {
        let root = self.registrar.root().trim_end_matches('/');
        self.resources
            .iter()
            .map(|e| format!("{}/{}", root, e.value().group))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn get(&self, identity: &str) -> Option<Arc<InstalledThirdPartyResource>> {
        self.resources.get(identity).map(|e| e.value().clone())
    }

    pub fn has_group(&self, group: &str) -> bool {
        self.resources.iter().any(|e| e.value().group == group)
    }
}

fn validate_versions(declaration: &ThirdPartyResource) -> Result<()> {
    if declaration.versions.is_empty() {
        return Err(ApiError::Invalid(format!(
            "{} must declare at least one version",
            declaration.name()
        )));
    }
    let mut seen = BTreeSet::new();
    for version in &declaration.versions {
        if version.name.is_empty() || version.name.contains('/') {
            return Err(ApiError::Invalid(format!(
                "invalid version name {:?} in {}",
                version.name,
                declaration.name()
            )));
        }
        if !seen.insert(version.name.as_str()) {
            return Err(ApiError::Invalid(format!(
                "version {} is declared twice in {}",
                version.name,
                declaration.name()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apiserver::container::RouteContainer;
    use crate::apiserver::context::RequestContext;
    use crate::apiserver::group_version::testing::{defaults, descriptor, resource};
    use crate::storage::{JsonCodec, MemoryStore, Store};
    use bytes::Bytes;
    use kube::core::DynamicObject;
    use serde_json::json;

    struct Fixture {
        manager: Arc<ThirdPartyManager>,
        registrar: Arc<GroupVersionRegistrar>,
        store: MemoryStore,
        metrics: ApiMetrics,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let mut storage = StorageDestinations::new();
        storage
            .add_group(StorageDestination::new(
                EXTENSIONS_GROUP,
                Arc::new(store.clone()),
                "/registry",
                Arc::new(JsonCodec),
            ))
            .unwrap();
        let container = Arc::new(RouteContainer::new(BTreeMap::new()));
        let registrar = Arc::new(GroupVersionRegistrar::new(container, defaults()));
        let metrics = ApiMetrics::new().unwrap();
        let manager = Arc::new(ThirdPartyManager::new(
            Arc::new(storage),
            registrar.clone(),
            Some(metrics.clone()),
        ));
        Fixture {
            manager,
            registrar,
            store,
            metrics,
        }
    }

    fn foo(name: &str) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "company.com/v1",
            "kind": "Foo",
            "metadata": {"name": name},
            "someField": "test field"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_install_registers_every_version() {
        let f = fixture();
        let installed = f
            .manager
            .install(ThirdPartyResource::new("foo.company.com", &["v1", "v3"]))
            .await
            .unwrap();

        assert_eq!(installed.identity, "foos.company.com");
        assert_eq!(installed.kind, "Foo");
        assert_eq!(installed.key_prefix, "/ThirdPartyResourceData/company.com/foos");
        assert_eq!(installed.phase.get(), ResourcePhase::Installed);

        let roots = f.registrar.container().registered_roots().await;
        assert!(roots.contains(&"/apis/company.com/v1".to_string()));
        assert!(roots.contains(&"/apis/company.com/v3".to_string()));
        assert_eq!(f.manager.installed_paths(), vec!["/apis/company.com"]);
        assert_eq!(f.metrics.third_party_resources(), 1);

        let err = f
            .manager
            .install(ThirdPartyResource::new("foo.company.com", &["v1"]))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 409);
    }

    #[tokio::test]
    async fn test_invalid_declarations_are_rejected() {
        let f = fixture();
        for declaration in [
            ThirdPartyResource::new("foo.company", &["v1"]),
            ThirdPartyResource::new("foo.company.com", &[]),
            ThirdPartyResource::new("foo.company.com", &["v1", "v1"]),
        ] {
            let err = f.manager.install(declaration).await.unwrap_err();
            assert!(matches!(err, ApiError::Invalid(_)), "{}", err);
        }
        assert!(f.manager.installed().is_empty());
    }

    #[tokio::test]
    async fn test_failed_registration_rolls_back() {
        let f = fixture();
        f.registrar
            .install(descriptor("company.com", "v2", vec![resource("foos", true)]))
            .await
            .unwrap();

        let err = f
            .manager
            .install(ThirdPartyResource::new("foo.company.com", &["v1", "v2"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::AlreadyInstalled { .. }));

        assert!(f.manager.get("foos.company.com").is_none());
        let roots = f.registrar.container().registered_roots().await;
        assert_eq!(roots, vec!["/apis/company.com/v2".to_string()]);
    }

    #[tokio::test]
    async fn test_two_kinds_share_a_group() {
        let f = fixture();
        f.manager
            .install(ThirdPartyResource::new("foo.company.com", &["v1"]))
            .await
            .unwrap();
        f.manager
            .install(ThirdPartyResource::new("bar.company.com", &["v1"]))
            .await
            .unwrap();

        let service = f
            .registrar
            .container()
            .service("/apis/company.com/v1")
            .await
            .unwrap();
        assert_eq!(service.group_version.mapper.len(), 2);

        f.manager.remove_resource("foos.company.com").await.unwrap();
        let service = f
            .registrar
            .container()
            .service("/apis/company.com/v1")
            .await
            .unwrap();
        assert!(service.group_version.mapper.contains_key("bars"));
        assert!(f.manager.has_group("company.com"));
    }

    #[tokio::test]
    async fn test_remove_deletes_routes_and_data() {
        let f = fixture();
        let installed = f
            .manager
            .install(ThirdPartyResource::new("foo.company.com", &["v1"]))
            .await
            .unwrap();
        let handler = installed.handlers["v1"].clone();
        for ns in ["default", "other"] {
            handler
                .create(&RequestContext::with_namespace(ns), foo("test"))
                .await
                .unwrap();
        }
        f.store
            .set("/registry/ThirdPartyResourceData/company.com/foosball/x", Bytes::from_static(b"{}"), None)
            .await
            .unwrap();

        f.manager.remove_resource("foos.company.com").await.unwrap();

        assert_eq!(installed.phase.get(), ResourcePhase::Removed);
        assert!(f.registrar.container().registered_roots().await.is_empty());
        let left = f.store.list("/registry/ThirdPartyResourceData/").await.unwrap();
        assert_eq!(left.items.len(), 1);
        assert_eq!(f.metrics.third_party_resources(), 0);

        let err = f.manager.remove_resource("foos.company.com").await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_partial_teardown_reports_failures() {
        let f = fixture();
        let installed = f
            .manager
            .install(ThirdPartyResource::new("foo.company.com", &["v1"]))
            .await
            .unwrap();
        let ctx = RequestContext::with_namespace("default");
        for name in ["a", "b"] {
            installed.handlers["v1"].create(&ctx, foo(name)).await.unwrap();
        }
        f.store
            .fail_deletes_of("/registry/ThirdPartyResourceData/company.com/foos/default/a")
            .await;

        let err = f.manager.remove_resource("foos.company.com").await.unwrap_err();
        match err {
            ApiError::PartialTeardownFailure { failures, .. } => {
                assert_eq!(failures.len(), 1);
                assert!(failures[0].contains("default/a"));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(f.manager.get("foos.company.com").is_none());
        assert_eq!(f.metrics.teardown_failures(), 1);
    }

    #[tokio::test]
    async fn test_remove_group_removes_every_kind() {
        let f = fixture();
        for name in ["foo.company.com", "bar.company.com", "bar.other.org"] {
            f.manager
                .install(ThirdPartyResource::new(name, &["v1"]))
                .await
                .unwrap();
        }

        f.manager.remove("company.com").await.unwrap();
        assert_eq!(f.manager.installed(), vec!["bars.other.org"]);
        assert!(!f.manager.has_group("company.com"));
        assert!(f.manager.remove("company.com").await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_installs_of_one_identity() {
        let f = fixture();
        let attempts = (0..8).map(|_| {
            let manager = f.manager.clone();
            tokio::spawn(async move {
                manager
                    .install(ThirdPartyResource::new("foo.company.com", &["v1"]))
                    .await
            })
        });
        let results = futures::future::join_all(attempts).await;
        let succeeded = results
            .into_iter()
            .filter(|r| matches!(r, Ok(Ok(_))))
            .count();
        assert_eq!(succeeded, 1);
        assert_eq!(f.manager.installed(), vec!["foos.company.com"]);
        assert!(f.manager.locks.is_empty());
    }

    #[tokio::test]
    async fn test_identity_locks_do_not_accumulate() {
        let f = fixture();
        for round in 0..3 {
            let name = format!("kind{}.company.com", round);
            f.manager
                .install(ThirdPartyResource::new(name, &["v1"]))
                .await
                .unwrap();
            f.manager
                .remove_resource(&format!("kind{}s.company.com", round))
                .await
                .unwrap();
        }
        assert!(f.manager.installed().is_empty());
        assert!(f.manager.locks.is_empty());
    }
}
