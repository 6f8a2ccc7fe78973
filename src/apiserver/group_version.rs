//! Group/version descriptors and their installation into the route container

use super::admission::Admission;
use super::container::{RouteContainer, ServiceUpdate, WebService};
use super::context::{RequestContextMapper, SelfLinker};
use crate::registry::RestStorage;
use crate::storage::Codec;
use crate::{ApiError, Result};
use apiplane_common::GroupVersion;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// One plural resource served by a group/version
#[derive(Clone)]
pub struct RestResource {
    pub plural: String,
    pub kind: String,
    pub namespaced: bool,
    pub storage: Arc<dyn RestStorage>,
}

/// Plural resource name → resource, ordered by name
pub type RestMapper = BTreeMap<String, RestResource>;

/// Everything needed to serve one group/version
///
/// Immutable once installed; extending a group/version builds a new
/// descriptor and swaps the web service.
#[derive(Clone)]
pub struct APIGroupVersion {
    pub root: String,
    pub group_version: GroupVersion,
    pub mapper: RestMapper,
    pub codec: Arc<dyn Codec>,
    pub linker: Arc<dyn SelfLinker>,
    pub admit: Arc<dyn Admission>,
    pub context: Arc<dyn RequestContextMapper>,
    pub min_request_timeout: Duration,
}

impl APIGroupVersion {
    /// `<root>/<group>/<version>`, or `<root>/<version>` for the legacy group
    pub fn path(&self) -> String {
        let root = self.root.trim_end_matches('/');
        if self.group_version.group.is_empty() {
            format!("{}/{}", root, self.group_version.version)
        } else {
            format!(
                "{}/{}/{}",
                root, self.group_version.group, self.group_version.version
            )
        }
    }
}

/// Shared collaborators stamped onto every descriptor the registrar builds
#[derive(Clone)]
pub struct GroupVersionDefaults {
    pub root: String,
    pub codec: Arc<dyn Codec>,
    pub linker: Arc<dyn SelfLinker>,
    pub admit: Arc<dyn Admission>,
    pub context: Arc<dyn RequestContextMapper>,
    pub min_request_timeout: Duration,
}

pub struct GroupVersionRegistrar {
    container: Arc<RouteContainer>,
    defaults: GroupVersionDefaults,
}

impl GroupVersionRegistrar {
    pub fn new(container: Arc<RouteContainer>, defaults: GroupVersionDefaults) -> Self {
        Self {
            container,
            defaults,
        }
    }

    pub fn container(&self) -> &Arc<RouteContainer> {
        &self.container
    }

    pub fn root(&self) -> &str {
        &self.defaults.root
    }

    pub fn descriptor(&self, group_version: GroupVersion, mapper: RestMapper) -> APIGroupVersion {
        let d = &self.defaults;
        APIGroupVersion {
            root: d.root.clone(),
            group_version,
            mapper,
            codec: d.codec.clone(),
            linker: d.linker.clone(),
            admit: d.admit.clone(),
            context: d.context.clone(),
            min_request_timeout: d.min_request_timeout,
        }
    }

    fn path_of(&self, group_version: &GroupVersion) -> String {
        self.descriptor(group_version.clone(), RestMapper::new())
            .path()
    }

    /// Install a fixed group/version; fails if its path is already served
    pub async fn install(&self, descriptor: APIGroupVersion) -> Result<()> {
        let root = descriptor.path();
        let group_version = descriptor.group_version.to_string();
        self.container
            .update(&root, move |existing| match existing {
                Some(_) => Err(ApiError::AlreadyInstalled { group_version }),
                None => Ok(ServiceUpdate::Insert(WebService::new(descriptor, false))),
            })
            .await
    }

    pub async fn uninstall(&self, group_version: &GroupVersion) -> Result<()> {
        let root = self.path_of(group_version);
        self.container
            .update(&root, |existing| match existing {
                Some(_) => Ok(ServiceUpdate::Remove),
                None => Err(ApiError::not_found("group version", group_version.to_string())),
            })
            .await
    }

    /// Add one resource to an extensible group/version, creating it if needed
    pub async fn add_resource(
        &self,
        group_version: GroupVersion,
        resource: RestResource,
    ) -> Result<()> {
        let root = self.path_of(&group_version);
        let plural = resource.plural.clone();
        let label = format!("{}/{}", group_version, plural);

        self.container
            .update(&root, |existing| match existing {
                None => {
                    let mut mapper = RestMapper::new();
                    mapper.insert(resource.plural.clone(), resource);
                    Ok(ServiceUpdate::Insert(WebService::new(
                        self.descriptor(group_version, mapper),
                        true,
                    )))
                }
                Some(service)
                    if !service.extensible
                        || service.group_version.mapper.contains_key(&resource.plural) =>
                {
                    Err(ApiError::AlreadyInstalled {
                        group_version: label.clone(),
                    })
                }
                Some(service) => {
                    let mut descriptor = (*service.group_version).clone();
                    descriptor.mapper.insert(resource.plural.clone(), resource);
                    Ok(ServiceUpdate::Replace(WebService::new(descriptor, true)))
                }
            })
            .await?;

        info!("Registered {} at {}/{}", label, root, plural);
        Ok(())
    }

    /// Remove one resource; the group/version goes away with its last resource
    pub async fn remove_resource(&self, group_version: &GroupVersion, plural: &str) -> Result<()> {
        let root = self.path_of(group_version);
        let label = format!("{}/{}", group_version, plural);

        self.container
            .update(&root, |existing| {
                let service = existing
                    .filter(|s| s.group_version.mapper.contains_key(plural))
                    .ok_or_else(|| ApiError::not_found("resource", label.clone()))?;

                let mut descriptor = (*service.group_version).clone();
                descriptor.mapper.remove(plural);
                if descriptor.mapper.is_empty() {
                    Ok(ServiceUpdate::Remove)
                } else {
                    Ok(ServiceUpdate::Replace(WebService::new(
                        descriptor,
                        service.extensible,
                    )))
                }
            })
            .await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::apiserver::admission::AlwaysAdmit;
    use crate::apiserver::context::{DefaultContextMapper, DefaultSelfLinker, RequestContext};
    use crate::registry::DynamicList;
    use crate::storage::JsonCodec;
    use async_trait::async_trait;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
    use kube::core::DynamicObject;

    /// Storage that serves nothing; route tests only need its verbs
    pub struct NullStorage;

    #[async_trait]
    impl RestStorage for NullStorage {
        async fn list(&self, _ctx: &RequestContext) -> Result<DynamicList> {
            Ok(DynamicList::default())
        }

        async fn get(&self, _ctx: &RequestContext, name: &str) -> Result<DynamicObject> {
            Err(ApiError::not_found("Null", name))
        }

        async fn create(&self, _ctx: &RequestContext, object: DynamicObject) -> Result<DynamicObject> {
            Ok(object)
        }

        async fn delete(&self, _ctx: &RequestContext, name: &str) -> Result<Status> {
            Err(ApiError::not_found("Null", name))
        }
    }

    pub fn defaults() -> GroupVersionDefaults {
        GroupVersionDefaults {
            root: "/apis".into(),
            codec: Arc::new(JsonCodec),
            linker: Arc::new(DefaultSelfLinker),
            admit: Arc::new(AlwaysAdmit),
            context: Arc::new(DefaultContextMapper),
            min_request_timeout: Duration::from_secs(1800),
        }
    }

    pub fn resource(plural: &str, namespaced: bool) -> RestResource {
        RestResource {
            plural: plural.to_string(),
            kind: plural.trim_end_matches('s').to_string(),
            namespaced,
            storage: Arc::new(NullStorage),
        }
    }

    pub fn descriptor(group: &str, version: &str, resources: Vec<RestResource>) -> APIGroupVersion {
        let d = defaults();
        APIGroupVersion {
            root: d.root,
            group_version: GroupVersion::new(group, version),
            mapper: resources
                .into_iter()
                .map(|r| (r.plural.clone(), r))
                .collect(),
            codec: d.codec,
            linker: d.linker,
            admit: d.admit,
            context: d.context,
            min_request_timeout: d.min_request_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{defaults, descriptor, resource};
    use super::*;

    fn registrar() -> GroupVersionRegistrar {
        GroupVersionRegistrar::new(Arc::new(RouteContainer::new(BTreeMap::new())), defaults())
    }

    #[test]
    fn test_descriptor_paths() {
        assert_eq!(
            descriptor("company.com", "v1", vec![]).path(),
            "/apis/company.com/v1"
        );
        let mut legacy = descriptor("", "v1", vec![]);
        legacy.root = "/api".into();
        assert_eq!(legacy.path(), "/api/v1");
    }

    #[tokio::test]
    async fn test_install_twice_is_already_installed() {
        let registrar = registrar();
        registrar
            .install(descriptor("company.com", "v1", vec![resource("foos", true)]))
            .await
            .unwrap();
        let err = registrar
            .install(descriptor("company.com", "v1", vec![resource("bars", true)]))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 409);

        registrar
            .uninstall(&GroupVersion::new("company.com", "v1"))
            .await
            .unwrap();
        assert!(registrar
            .uninstall(&GroupVersion::new("company.com", "v1"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_extensible_group_version_gains_and_loses_resources() {
        let registrar = registrar();
        let gv = GroupVersion::new("company.com", "v1");
        registrar
            .add_resource(gv.clone(), resource("foos", true))
            .await
            .unwrap();
        registrar
            .add_resource(gv.clone(), resource("bars", true))
            .await
            .unwrap();
        assert!(registrar
            .add_resource(gv.clone(), resource("foos", true))
            .await
            .is_err());

        let service = registrar.container().service("/apis/company.com/v1").await.unwrap();
        assert_eq!(service.group_version.mapper.len(), 2);

        registrar.remove_resource(&gv, "foos").await.unwrap();
        assert!(registrar.container().installed_group("company.com").await.is_some());
        registrar.remove_resource(&gv, "bars").await.unwrap();
        assert!(registrar.container().installed_group("company.com").await.is_none());
        assert!(registrar.remove_resource(&gv, "bars").await.is_err());
    }

    #[tokio::test]
    async fn test_builtin_group_version_is_not_extensible() {
        let registrar = registrar();
        registrar
            .install(descriptor("extensions", "v1beta1", vec![resource("thirdpartyresources", false)]))
            .await
            .unwrap();
        let err = registrar
            .add_resource(GroupVersion::new("extensions", "v1beta1"), resource("foos", true))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::AlreadyInstalled { .. }));
    }
}
