//! REST storage handlers served by installed group/versions

pub mod thirdparty;
pub mod thirdparty_data;

pub use thirdparty::ThirdPartyResourceRest;
pub use thirdparty_data::ThirdPartyResourceDataRest;

use crate::apiserver::context::RequestContext;
use crate::storage::WatchEventType;
use crate::{ApiError, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ListMeta, Status, StatusDetails};
use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};

/// REST verbs a handler can serve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    List,
    Get,
    Create,
    Update,
    Delete,
    Watch,
}

impl Verb {
    pub const ALL: [Verb; 6] = [
        Verb::List,
        Verb::Get,
        Verb::Create,
        Verb::Update,
        Verb::Delete,
        Verb::Watch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::List => "list",
            Verb::Get => "get",
            Verb::Create => "create",
            Verb::Update => "update",
            Verb::Delete => "delete",
            Verb::Watch => "watch",
        }
    }
}

/// A list of schema-less objects, e.g. `FooList`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicList {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ListMeta,
    #[serde(default)]
    pub items: Vec<DynamicObject>,
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub event_type: WatchEventType,
    pub object: DynamicObject,
}

/// Storage-backed handler for one resource of a group/version
///
/// Handlers are data-driven: one implementation may serve any number of
/// kinds, parameterized at construction.
#[async_trait]
pub trait RestStorage: Send + Sync {
    /// Verbs this handler serves; routes are only installed for these
    fn verbs(&self) -> &'static [Verb] {
        &Verb::ALL
    }

    async fn list(&self, ctx: &RequestContext) -> Result<DynamicList>;

    async fn get(&self, ctx: &RequestContext, name: &str) -> Result<DynamicObject>;

    async fn create(&self, ctx: &RequestContext, object: DynamicObject) -> Result<DynamicObject>;

    async fn update(
        &self,
        _ctx: &RequestContext,
        name: &str,
        _object: DynamicObject,
    ) -> Result<DynamicObject> {
        Err(ApiError::MethodNotAllowed {
            method: "PUT".into(),
            path: name.to_string(),
        })
    }

    async fn delete(&self, ctx: &RequestContext, name: &str) -> Result<Status>;

    async fn watch(&self, _ctx: &RequestContext) -> Result<BoxStream<'static, WatchEvent>> {
        Err(ApiError::MethodNotAllowed {
            method: "GET".into(),
            path: "watch".into(),
        })
    }
}

/// `Status` document returned by a successful delete
pub fn success_status(kind: &str, group: &str, name: &str, uid: Option<String>) -> Status {
    Status {
        code: Some(200),
        status: Some("Success".to_string()),
        details: Some(StatusDetails {
            group: Some(group.to_string()),
            kind: Some(kind.to_string()),
            name: Some(name.to_string()),
            uid,
            ..Default::default()
        }),
        ..Default::default()
    }
}
