//! Request-context mapping and self-link generation

use axum::http::HeaderMap;

/// Header carrying the authenticated user, set by the fronting authenticator
pub const REMOTE_USER_HEADER: &str = "x-remote-user";

/// Per-request information handed to REST storage
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub namespace: Option<String>,
    pub user: Option<String>,
    pub request_id: String,
}

impl RequestContext {
    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }
}

pub trait RequestContextMapper: Send + Sync {
    fn context_for(&self, headers: &HeaderMap, namespace: Option<&str>) -> RequestContext;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultContextMapper;

impl RequestContextMapper for DefaultContextMapper {
    fn context_for(&self, headers: &HeaderMap, namespace: Option<&str>) -> RequestContext {
        RequestContext {
            namespace: namespace.map(str::to_string),
            user: headers
                .get(REMOTE_USER_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

pub trait SelfLinker: Send + Sync {
    /// Link for a collection (`name` is `None`) or a single object
    fn self_link(
        &self,
        group_version_path: &str,
        resource: &str,
        namespace: Option<&str>,
        name: Option<&str>,
    ) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSelfLinker;

impl SelfLinker for DefaultSelfLinker {
    fn self_link(
        &self,
        group_version_path: &str,
        resource: &str,
        namespace: Option<&str>,
        name: Option<&str>,
    ) -> String {
        let mut link = group_version_path.to_string();
        if let Some(ns) = namespace.filter(|ns| !ns.is_empty()) {
            link.push_str("/namespaces/");
            link.push_str(ns);
        }
        link.push('/');
        link.push_str(resource);
        if let Some(name) = name {
            link.push('/');
            link.push_str(name);
        }
        link
    }
}
