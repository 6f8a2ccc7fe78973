//! Discovery documents built from the route container
//!
//! Each document is built from one read of the container, so a client never
//! sees a group whose versions are half installed.

use super::container::{InstalledGroup, RouteContainer, WebService};
use crate::registry::Verb;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    APIGroup, APIGroupList, APIResource, APIResourceList, GroupVersionForDiscovery,
};
use std::collections::BTreeSet;

fn discovery_version(group: &str, version: &str) -> GroupVersionForDiscovery {
    GroupVersionForDiscovery {
        group_version: format!("{}/{}", group, version),
        version: version.to_string(),
    }
}

fn api_group(group: &InstalledGroup) -> APIGroup {
    APIGroup {
        name: group.name.clone(),
        versions: group
            .versions
            .iter()
            .map(|v| discovery_version(&group.name, v))
            .collect(),
        preferred_version: Some(discovery_version(&group.name, &group.preferred)),
        server_address_by_client_cidrs: None,
    }
}

/// `GET /apis`: every installed named group, sorted by name
pub async fn list_groups(container: &RouteContainer) -> APIGroupList {
    let groups = container
        .installed_groups()
        .await
        .iter()
        .filter(|g| !g.name.is_empty())
        .map(api_group)
        .collect();
    APIGroupList { groups }
}

/// `GET /apis/<group>`
pub async fn group(container: &RouteContainer, name: &str) -> Option<APIGroup> {
    if name.is_empty() {
        return None;
    }
    container.installed_group(name).await.as_ref().map(api_group)
}

/// `GET /apis/<group>/<version>`: the resources one web service serves
pub fn resources(service: &WebService) -> APIResourceList {
    let gv = &service.group_version;
    let resources = gv
        .mapper
        .values()
        .map(|resource| {
            let verbs = resource.storage.verbs();
            APIResource {
                name: resource.plural.clone(),
                kind: resource.kind.clone(),
                namespaced: resource.namespaced,
                singular_name: String::new(),
                verbs: Verb::ALL
                    .iter()
                    .filter(|v| verbs.contains(v))
                    .map(|v| v.as_str().to_string())
                    .collect(),
                ..Default::default()
            }
        })
        .collect();

    APIResourceList {
        group_version: gv.group_version.to_string(),
        resources,
    }
}

/// `GET /`: every path a client can start from
pub async fn root_paths(container: &RouteContainer, static_paths: &[String]) -> Vec<String> {
    let mut paths: BTreeSet<String> = static_paths.iter().cloned().collect();
    paths.extend(container.registered_roots().await);
    paths.into_iter().collect()
}
