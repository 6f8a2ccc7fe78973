//! Shared dispatch table of installed group/versions

use super::group_version::{APIGroupVersion, RestResource};
use crate::registry::Verb;
use crate::{ApiError, Result};
use axum::http::Method;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Namespace,
    Name,
}

/// One method + path template served by a web service
#[derive(Debug, Clone)]
pub struct Route {
    pub method: Method,
    pub action: Verb,
    pub resource: String,
    segments: Vec<Segment>,
}

impl Route {
    fn new(method: Method, action: Verb, resource: &str, template: &[&str]) -> Self {
        let segments = template
            .iter()
            .map(|s| match *s {
                "{namespace}" => Segment::Namespace,
                "{name}" => Segment::Name,
                literal => Segment::Literal(literal.to_string()),
            })
            .collect();
        Self {
            method,
            action,
            resource: resource.to_string(),
            segments,
        }
    }

    /// Template relative to the service root, e.g. `namespaces/{namespace}/foos`
    pub fn template(&self) -> String {
        self.segments
            .iter()
            .map(|s| match s {
                Segment::Literal(l) => l.as_str(),
                Segment::Namespace => "{namespace}",
                Segment::Name => "{name}",
            })
            .collect::<Vec<_>>()
            .join("/")
    }

    fn matches<'a>(&self, parts: &[&'a str]) -> Option<(Option<&'a str>, Option<&'a str>)> {
        if parts.len() != self.segments.len() {
            return None;
        }
        let mut namespace = None;
        let mut name = None;
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(l) if l == part => {}
                Segment::Literal(_) => return None,
                // `namespaces//foos` must not widen into an all-namespaces read
                _ if part.is_empty() => return None,
                Segment::Namespace => namespace = Some(*part),
                Segment::Name => name = Some(*part),
            }
        }
        Some((namespace, name))
    }
}

fn routes_for(resource: &RestResource) -> Vec<Route> {
    let plural = resource.plural.as_str();
    let verbs = resource.storage.verbs();
    let serves = |verb: Verb| verbs.contains(&verb);

    let mut routes = Vec::new();
    let mut add = |method: Method, action: Verb, template: &[&str]| {
        if serves(action) {
            routes.push(Route::new(method, action, plural, template));
        }
    };

    if resource.namespaced {
        let collection = ["namespaces", "{namespace}", plural];
        let item = ["namespaces", "{namespace}", plural, "{name}"];
        add(Method::GET, Verb::List, &collection);
        add(Method::POST, Verb::Create, &collection);
        add(Method::GET, Verb::Get, &item);
        add(Method::PUT, Verb::Update, &item);
        add(Method::DELETE, Verb::Delete, &item);
        add(Method::GET, Verb::List, &[plural]);
        add(
            Method::GET,
            Verb::Watch,
            &["watch", "namespaces", "{namespace}", plural],
        );
        add(Method::GET, Verb::Watch, &["watch", plural]);
    } else {
        add(Method::GET, Verb::List, &[plural]);
        add(Method::POST, Verb::Create, &[plural]);
        add(Method::GET, Verb::Get, &[plural, "{name}"]);
        add(Method::PUT, Verb::Update, &[plural, "{name}"]);
        add(Method::DELETE, Verb::Delete, &[plural, "{name}"]);
        add(Method::GET, Verb::Watch, &["watch", plural]);
    }
    routes
}

/// Routes of one group/version, rooted at its path
pub struct WebService {
    pub group_version: Arc<APIGroupVersion>,
    /// Created by the third-party manager and able to gain more resources
    pub extensible: bool,
    routes: Vec<Route>,
}

impl WebService {
    pub fn new(group_version: APIGroupVersion, extensible: bool) -> Self {
        let routes = group_version.mapper.values().flat_map(routes_for).collect();
        Self {
            group_version: Arc::new(group_version),
            extensible,
            routes,
        }
    }

    pub fn root(&self) -> String {
        self.group_version.path()
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }
}

/// Outcome of resolving a request path
pub enum Resolution {
    Route(RouteMatch),
    /// The group/version path itself
    ServiceRoot(Arc<WebService>),
    MethodNotAllowed,
    NotFound,
}

pub struct RouteMatch {
    pub service: Arc<WebService>,
    pub action: Verb,
    pub resource: RestResource,
    pub namespace: Option<String>,
    pub name: Option<String>,
}

/// What [`RouteContainer::update`] should do with the service at a path
pub enum ServiceUpdate {
    Insert(WebService),
    Replace(WebService),
    Remove,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledGroup {
    pub name: String,
    /// In install order
    pub versions: Vec<String>,
    pub preferred: String,
}

#[derive(Default)]
struct ContainerState {
    services: BTreeMap<String, Arc<WebService>>,
    groups: BTreeMap<String, InstalledGroup>,
}

impl ContainerState {
    fn version_added(&mut self, group: &str, version: &str, overrides: &BTreeMap<String, String>) {
        let entry = self
            .groups
            .entry(group.to_string())
            .or_insert_with(|| InstalledGroup {
                name: group.to_string(),
                versions: Vec::new(),
                preferred: version.to_string(),
            });
        if !entry.versions.iter().any(|v| v == version) {
            entry.versions.push(version.to_string());
        }
        if overrides.get(group).map(String::as_str) == Some(version) {
            entry.preferred = version.to_string();
        }
    }

    fn version_removed(&mut self, group: &str, version: &str, overrides: &BTreeMap<String, String>) {
        let Some(entry) = self.groups.get_mut(group) else {
            return;
        };
        entry.versions.retain(|v| v != version);
        if entry.versions.is_empty() {
            self.groups.remove(group);
            return;
        }
        if entry.preferred == version {
            entry.preferred = match overrides.get(group) {
                Some(preferred) if entry.versions.contains(preferred) => preferred.clone(),
                _ => entry.versions.iter().min().cloned().unwrap_or_default(),
            };
        }
    }
}

/// Path → web service table plus the installed-groups view, under one lock
pub struct RouteContainer {
    state: RwLock<ContainerState>,
    preferred_overrides: BTreeMap<String, String>,
}

impl RouteContainer {
    pub fn new(preferred_overrides: BTreeMap<String, String>) -> Self {
        Self {
            state: RwLock::new(ContainerState::default()),
            preferred_overrides,
        }
    }

    /// Atomically read-modify-write the service rooted at `root`
    ///
    /// `f` sees the current service (if any) and decides what to do. The
    /// installed-groups view follows inserts and removals in the same
    /// critical section.
    pub async fn update<F>(&self, root: &str, f: F) -> Result<()>
    where
        F: FnOnce(Option<&Arc<WebService>>) -> Result<ServiceUpdate>,
    {
        let mut state = self.state.write().await;
        let decision = f(state.services.get(root))?;

        match decision {
            ServiceUpdate::Insert(service) => {
                if state.services.contains_key(root) {
                    return Err(ApiError::AlreadyInstalled {
                        group_version: service.group_version.group_version.to_string(),
                    });
                }
                let gv = service.group_version.group_version.clone();
                state.services.insert(root.to_string(), Arc::new(service));
                state.version_added(&gv.group, &gv.version, &self.preferred_overrides);
                info!("Installed routes for {} at {}", gv, root);
            }
            ServiceUpdate::Replace(service) => {
                state.services.insert(root.to_string(), Arc::new(service));
                debug!("Replaced routes at {}", root);
            }
            ServiceUpdate::Remove => {
                if let Some(removed) = state.services.remove(root) {
                    let gv = &removed.group_version.group_version;
                    state.version_removed(&gv.group, &gv.version, &self.preferred_overrides);
                    info!("Removed routes for {} at {}", gv, root);
                }
            }
            ServiceUpdate::Unchanged => {}
        }
        Ok(())
    }

    pub async fn service(&self, root: &str) -> Option<Arc<WebService>> {
        self.state.read().await.services.get(root).cloned()
    }

    pub async fn resolve(&self, method: &Method, path: &str) -> Resolution {
        let path = path.trim_end_matches('/');
        let state = self.state.read().await;

        let service = state
            .services
            .iter()
            .filter(|(root, _)| {
                path == root.as_str()
                    || (path.starts_with(root.as_str())
                        && path.as_bytes().get(root.len()) == Some(&b'/'))
            })
            .max_by_key(|(root, _)| root.len())
            .map(|(root, service)| (root.len(), service.clone()));

        let Some((root_len, service)) = service else {
            return Resolution::NotFound;
        };

        let rest = path[root_len..].trim_start_matches('/');
        if rest.is_empty() {
            return Resolution::ServiceRoot(service);
        }

        let parts: Vec<&str> = rest.split('/').collect();
        let mut path_matched = false;
        for route in service.routes() {
            let Some((namespace, name)) = route.matches(&parts) else {
                continue;
            };
            path_matched = true;
            if route.method != *method {
                continue;
            }
            let Some(resource) = service.group_version.mapper.get(&route.resource) else {
                continue;
            };
            return Resolution::Route(RouteMatch {
                service: service.clone(),
                action: route.action,
                resource: resource.clone(),
                namespace: namespace.map(str::to_string),
                name: name.map(str::to_string),
            });
        }

        if path_matched {
            Resolution::MethodNotAllowed
        } else {
            Resolution::NotFound
        }
    }

    /// Every full route path, e.g. `/apis/company.com/v1/namespaces/{namespace}/foos`
    pub async fn registered_paths(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut paths: Vec<String> = state
            .services
            .iter()
            .flat_map(|(root, service)| {
                service
                    .routes()
                    .iter()
                    .map(move |route| format!("{}/{}", root, route.template()))
            })
            .collect();
        paths.sort();
        paths.dedup();
        paths
    }

    /// Root path of every installed web service
    pub async fn registered_roots(&self) -> Vec<String> {
        self.state.read().await.services.keys().cloned().collect()
    }

    /// Consistent snapshot of installed groups, sorted by name
    pub async fn installed_groups(&self) -> Vec<InstalledGroup> {
        self.state.read().await.groups.values().cloned().collect()
    }

    pub async fn installed_group(&self, name: &str) -> Option<InstalledGroup> {
        self.state.read().await.groups.get(name).cloned()
    }
}
