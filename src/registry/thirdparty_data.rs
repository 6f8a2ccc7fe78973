//! Generic opaque-blob storage for third-party resource instances
//!
//! One [`ThirdPartyResourceDataRest`] serves one version of one third-party
//! kind. Instances are persisted as [`ThirdPartyResourceData`] envelopes:
//! standard object metadata next to the caller's body, which is kept as an
//! uninterpreted JSON payload. Metadata is stripped from the body on write
//! and re-attached on read.

use super::{success_status, DynamicList, RestStorage, WatchEvent};
use crate::apiserver::context::RequestContext;
use crate::storage::{Codec, KeyValue, StorageDestination};
use crate::thirdparty::phase::PhaseCell;
use crate::{ApiError, Result};
use apiplane_common::{GroupVersion, ResourceScope, ThirdPartyResourceData};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ListMeta, ObjectMeta, Status, Time};
use k8s_openapi::chrono::Utc;
use kube::core::{DynamicObject, TypeMeta};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

const MAX_NAME_LEN: usize = 253;
const GENERATED_SUFFIX_LEN: usize = 5;

/// Translates between stored envelopes and typed wire objects
#[derive(Clone)]
struct EnvelopeCodec {
    codec: Arc<dyn Codec>,
    group_version: GroupVersion,
    kind: String,
}

impl std::fmt::Debug for EnvelopeCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeCodec")
            .field("group_version", &self.group_version)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl EnvelopeCodec {
    fn encode(&self, metadata: &ObjectMeta, object: &DynamicObject) -> Result<Bytes> {
        let mut stored = metadata.clone();
        stored.resource_version = None;
        stored.self_link = None;

        let envelope = ThirdPartyResourceData::new(stored, payload_of(object)?);
        Ok(self.codec.encode(&serde_json::to_value(&envelope)?)?)
    }

    fn decode(&self, kv: &KeyValue) -> Result<DynamicObject> {
        let raw = self.codec.decode(&kv.value)?;
        let envelope: ThirdPartyResourceData = serde_json::from_value(raw)
            .map_err(|e| ApiError::EncodingError(format!("envelope at {}: {}", kv.key, e)))?;

        let body: Value = serde_json::from_slice(&envelope.data.0)
            .map_err(|e| ApiError::EncodingError(format!("payload at {}: {}", kv.key, e)))?;
        let Value::Object(mut fields) = body else {
            return Err(ApiError::EncodingError(format!(
                "payload at {} is not an object",
                kv.key
            )));
        };
        fields.remove("apiVersion");
        fields.remove("kind");
        fields.remove("metadata");

        let mut metadata = envelope.metadata;
        metadata.resource_version = Some(kv.mod_revision.to_string());

        Ok(DynamicObject {
            types: Some(TypeMeta {
                api_version: self.group_version.to_string(),
                kind: self.kind.clone(),
            }),
            metadata,
            data: Value::Object(fields),
        })
    }
}

/// Caller body without metadata, serialized as the opaque payload
fn payload_of(object: &DynamicObject) -> Result<Vec<u8>> {
    let mut fields = match &object.data {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        _ => {
            return Err(ApiError::BadRequest(
                "object body must be a JSON object".to_string(),
            ))
        }
    };
    fields.remove("metadata");
    if let Some(types) = &object.types {
        fields.insert("apiVersion".into(), Value::String(types.api_version.clone()));
        fields.insert("kind".into(), Value::String(types.kind.clone()));
    }
    Ok(serde_json::to_vec(&Value::Object(fields))?)
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(ApiError::Invalid(format!("invalid object name {:?}", name)));
    }
    if name.contains('/') || name.contains('%') {
        return Err(ApiError::Invalid(format!(
            "object name {:?} may not contain '/' or '%'",
            name
        )));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ApiError::Invalid(format!(
            "object name must be at most {} characters",
            MAX_NAME_LEN
        )));
    }
    Ok(())
}

fn generated_name(base: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}{}", base, &suffix[..GENERATED_SUFFIX_LEN])
}

#[derive(Debug)]
pub struct ThirdPartyResourceDataRest {
    destination: StorageDestination,
    key_prefix: String,
    group_version: GroupVersion,
    kind: String,
    scope: ResourceScope,
    identity: String,
    phase: PhaseCell,
    envelope: EnvelopeCodec,
}

impl ThirdPartyResourceDataRest {
    pub fn new(
        destination: StorageDestination,
        key_prefix: impl Into<String>,
        group_version: GroupVersion,
        kind: impl Into<String>,
        scope: ResourceScope,
        identity: impl Into<String>,
        phase: PhaseCell,
    ) -> Self {
        let kind = kind.into();
        let envelope = EnvelopeCodec {
            codec: destination.codec.clone(),
            group_version: group_version.clone(),
            kind: kind.clone(),
        };
        Self {
            destination,
            key_prefix: key_prefix.into(),
            group_version,
            kind,
            scope,
            identity: identity.into(),
            phase,
            envelope,
        }
    }

    fn ensure_serving(&self) -> Result<()> {
        if self.phase.get().accepts_requests() {
            Ok(())
        } else {
            Err(ApiError::Removing(self.identity.clone()))
        }
    }

    /// Namespace a single-object request operates in
    fn request_namespace(&self, ctx: &RequestContext) -> Result<Option<String>> {
        match self.scope {
            ResourceScope::Cluster => Ok(None),
            ResourceScope::Namespaced => ctx
                .namespace
                .clone()
                .filter(|ns| !ns.is_empty())
                .map(Some)
                .ok_or_else(|| {
                    ApiError::BadRequest(format!("a namespace is required for {}", self.kind))
                }),
        }
    }

    /// Namespace a list or watch is confined to; `None` spans all of them
    fn collection_namespace<'a>(&self, ctx: &'a RequestContext) -> Result<Option<&'a str>> {
        match (self.scope, ctx.namespace.as_deref()) {
            (ResourceScope::Cluster, _) => Ok(None),
            (ResourceScope::Namespaced, Some("")) => Err(ApiError::BadRequest(format!(
                "empty namespace in request for {}",
                self.kind
            ))),
            (ResourceScope::Namespaced, namespace) => Ok(namespace),
        }
    }

    /// Namespace for a write, checked against the one in the body
    fn write_namespace(&self, ctx: &RequestContext, metadata: &ObjectMeta) -> Result<Option<String>> {
        let namespace = self.request_namespace(ctx)?;
        let body_namespace = metadata.namespace.as_deref().filter(|ns| !ns.is_empty());
        match (namespace.as_deref(), body_namespace) {
            (Some(ns), Some(body)) if ns != body => Err(ApiError::BadRequest(format!(
                "the namespace of the object ({}) does not match the namespace on the request ({})",
                body, ns
            ))),
            (None, Some(body)) => Err(ApiError::BadRequest(format!(
                "{} is cluster-scoped but the object names namespace {}",
                self.kind, body
            ))),
            _ => Ok(namespace),
        }
    }

    fn object_key(&self, namespace: Option<&str>, name: &str) -> String {
        match namespace {
            Some(ns) => self
                .destination
                .key(&format!("{}/{}/{}", self.key_prefix, ns, name)),
            None => self.destination.key(&format!("{}/{}", self.key_prefix, name)),
        }
    }

    fn collection_key(&self, namespace: Option<&str>) -> String {
        match namespace {
            Some(ns) => self.destination.key(&format!("{}/{}/", self.key_prefix, ns)),
            None => self.destination.key(&format!("{}/", self.key_prefix)),
        }
    }
}

#[async_trait]
impl RestStorage for ThirdPartyResourceDataRest {
    async fn list(&self, ctx: &RequestContext) -> Result<DynamicList> {
        self.ensure_serving()?;
        let namespace = self.collection_namespace(ctx)?;

        let listed = self
            .destination
            .store
            .list(&self.collection_key(namespace))
            .await?;

        let items = listed
            .items
            .iter()
            .map(|kv| self.envelope.decode(kv))
            .collect::<Result<Vec<_>>>()?;

        debug!(
            "listed {} {} object(s) in {:?}",
            items.len(),
            self.kind,
            namespace
        );

        Ok(DynamicList {
            api_version: self.group_version.to_string(),
            kind: format!("{}List", self.kind),
            metadata: ListMeta {
                resource_version: Some(listed.revision.to_string()),
                ..Default::default()
            },
            items,
        })
    }

    async fn get(&self, ctx: &RequestContext, name: &str) -> Result<DynamicObject> {
        self.ensure_serving()?;
        let namespace = self.request_namespace(ctx)?;
        let kv = self
            .destination
            .store
            .get(&self.object_key(namespace.as_deref(), name))
            .await
            .map_err(|e| ApiError::from_store(e, &self.kind, name))?;
        self.envelope.decode(&kv)
    }

    async fn create(&self, ctx: &RequestContext, object: DynamicObject) -> Result<DynamicObject> {
        self.ensure_serving()?;
        let namespace = self.write_namespace(ctx, &object.metadata)?;

        let mut metadata = object.metadata.clone();
        let name = match metadata.name.as_deref().filter(|n| !n.is_empty()) {
            Some(name) => name.to_string(),
            None => match metadata.generate_name.as_deref().filter(|g| !g.is_empty()) {
                Some(base) => generated_name(base),
                None => {
                    return Err(ApiError::Invalid(
                        "metadata.name or metadata.generateName is required".to_string(),
                    ))
                }
            },
        };
        validate_name(&name)?;

        metadata.name = Some(name.clone());
        metadata.namespace = namespace.clone();
        if metadata.uid.as_deref().map_or(true, str::is_empty) {
            metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        metadata.creation_timestamp = Some(Time(Utc::now()));

        let value = self.envelope.encode(&metadata, &object)?;
        let key = self.object_key(namespace.as_deref(), &name);
        let kv = self
            .destination
            .store
            .create(&key, value, None)
            .await
            .map_err(|e| ApiError::from_store(e, &self.kind, &name))?;

        debug!("created {} {} at revision {}", self.kind, key, kv.mod_revision);
        self.envelope.decode(&kv)
    }

    async fn update(
        &self,
        ctx: &RequestContext,
        name: &str,
        object: DynamicObject,
    ) -> Result<DynamicObject> {
        self.ensure_serving()?;
        let namespace = self.write_namespace(ctx, &object.metadata)?;
        if let Some(body_name) = object.metadata.name.as_deref().filter(|n| !n.is_empty()) {
            if body_name != name {
                return Err(ApiError::BadRequest(format!(
                    "the name of the object ({}) does not match the name on the URL ({})",
                    body_name, name
                )));
            }
        }

        let key = self.object_key(namespace.as_deref(), name);
        let store = &self.destination.store;
        let current_kv = store
            .get(&key)
            .await
            .map_err(|e| ApiError::from_store(e, &self.kind, name))?;
        let current = self.envelope.decode(&current_kv)?;

        let expected_revision = match object.metadata.resource_version.as_deref() {
            Some(rv) if !rv.is_empty() => rv.parse::<u64>().map_err(|_| {
                ApiError::BadRequest(format!("invalid resourceVersion {:?}", rv))
            })?,
            _ => current_kv.mod_revision,
        };

        let mut metadata = object.metadata.clone();
        metadata.name = Some(name.to_string());
        metadata.namespace = namespace;
        metadata.uid = current.metadata.uid;
        metadata.creation_timestamp = current.metadata.creation_timestamp;

        let value = self.envelope.encode(&metadata, &object)?;
        let kv = store
            .compare_and_swap(&key, value, expected_revision)
            .await
            .map_err(|e| ApiError::from_store(e, &self.kind, name))?;
        self.envelope.decode(&kv)
    }

    async fn delete(&self, ctx: &RequestContext, name: &str) -> Result<Status> {
        self.ensure_serving()?;
        let namespace = self.request_namespace(ctx)?;
        let kv = self
            .destination
            .store
            .delete(&self.object_key(namespace.as_deref(), name))
            .await
            .map_err(|e| ApiError::from_store(e, &self.kind, name))?;

        let uid = self
            .envelope
            .decode(&kv)
            .ok()
            .and_then(|obj| obj.metadata.uid);
        Ok(success_status(
            &self.kind,
            &self.group_version.group,
            name,
            uid,
        ))
    }

    async fn watch(&self, ctx: &RequestContext) -> Result<BoxStream<'static, WatchEvent>> {
        self.ensure_serving()?;
        let namespace = self.collection_namespace(ctx)?;

        let events = self
            .destination
            .store
            .watch(&self.collection_key(namespace))?;
        let envelope = self.envelope.clone();
        let phase = self.phase.clone();

        let stream = events
            .take_while(move |_| futures::future::ready(phase.get().accepts_requests()))
            .filter_map(move |event| {
                let decoded = match envelope.decode(&event.kv) {
                    Ok(object) => Some(WatchEvent {
                        event_type: event.event_type,
                        object,
                    }),
                    Err(e) => {
                        debug!("skipping undecodable watch event: {}", e);
                        None
                    }
                };
                futures::future::ready(decoded)
            });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{JsonCodec, MemoryStore, Store, YamlCodec};
    use crate::thirdparty::phase::ResourcePhase;
    use serde_json::json;

    fn handler_with(store: MemoryStore, codec: Arc<dyn Codec>) -> ThirdPartyResourceDataRest {
        let destination = StorageDestination::new("extensions", Arc::new(store), "/registry", codec);
        ThirdPartyResourceDataRest::new(
            destination,
            "/ThirdPartyResourceData/company.com/foos",
            GroupVersion::new("company.com", "v1"),
            "Foo",
            ResourceScope::Namespaced,
            "foos.company.com",
            PhaseCell::new(ResourcePhase::Installed),
        )
    }

    fn foo(name: &str) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "company.com/v1",
            "kind": "Foo",
            "metadata": {"name": name},
            "someField": "test field",
            "otherField": 10
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_injects_metadata_and_strips_it_from_payload() {
        let store = MemoryStore::new();
        let handler = handler_with(store.clone(), Arc::new(JsonCodec));
        let ctx = RequestContext::with_namespace("default");

        let created = handler.create(&ctx, foo("test")).await.unwrap();
        assert_eq!(created.metadata.name.as_deref(), Some("test"));
        assert_eq!(created.metadata.namespace.as_deref(), Some("default"));
        assert!(created.metadata.uid.is_some());
        assert!(created.metadata.creation_timestamp.is_some());
        assert!(created.metadata.resource_version.is_some());
        assert_eq!(created.data["someField"], "test field");

        let kv = store
            .get("/registry/ThirdPartyResourceData/company.com/foos/default/test")
            .await
            .unwrap();
        let envelope: ThirdPartyResourceData = serde_json::from_slice(&kv.value).unwrap();
        let payload: Value = serde_json::from_slice(&envelope.data.0).unwrap();
        assert_eq!(payload["otherField"], 10);
        assert_eq!(payload["kind"], "Foo");
        assert!(payload.get("metadata").is_none());
        assert!(envelope.metadata.resource_version.is_none());
    }

    #[tokio::test]
    async fn test_get_round_trips_through_yaml_destination() {
        let handler = handler_with(MemoryStore::new(), Arc::new(YamlCodec));
        let ctx = RequestContext::with_namespace("default");

        let created = handler.create(&ctx, foo("test")).await.unwrap();
        let fetched = handler.get(&ctx, "test").await.unwrap();
        assert_eq!(fetched.metadata, created.metadata);
        assert_eq!(fetched.data, created.data);

        let types = fetched.types.unwrap();
        assert_eq!(types.api_version, "company.com/v1");
        assert_eq!(types.kind, "Foo");
    }

    #[tokio::test]
    async fn test_duplicate_create_and_missing_get() {
        let handler = handler_with(MemoryStore::new(), Arc::new(JsonCodec));
        let ctx = RequestContext::with_namespace("default");

        handler.create(&ctx, foo("test")).await.unwrap();
        let err = handler.create(&ctx, foo("test")).await.unwrap_err();
        assert!(matches!(err, ApiError::AlreadyExists { .. }));

        let err = handler.get(&ctx, "missing").await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_generate_name_and_namespace_mismatch() {
        let handler = handler_with(MemoryStore::new(), Arc::new(JsonCodec));
        let ctx = RequestContext::with_namespace("default");

        let mut generated = foo("");
        generated.metadata.name = None;
        generated.metadata.generate_name = Some("foo-".into());
        let created = handler.create(&ctx, generated).await.unwrap();
        let name = created.metadata.name.unwrap();
        assert!(name.starts_with("foo-"));
        assert_eq!(name.len(), "foo-".len() + GENERATED_SUFFIX_LEN);

        let mut nameless = foo("");
        nameless.metadata.name = None;
        assert!(matches!(
            handler.create(&ctx, nameless).await,
            Err(ApiError::Invalid(_))
        ));

        let mut elsewhere = foo("x");
        elsewhere.metadata.namespace = Some("other".into());
        assert!(matches!(
            handler.create(&ctx, elsewhere).await,
            Err(ApiError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_list_is_scoped_to_namespace() {
        let handler = handler_with(MemoryStore::new(), Arc::new(JsonCodec));
        let default = RequestContext::with_namespace("default");
        let other = RequestContext::with_namespace("default2");

        handler.create(&default, foo("a")).await.unwrap();
        handler.create(&default, foo("b")).await.unwrap();
        handler.create(&other, foo("c")).await.unwrap();

        let list = handler.list(&default).await.unwrap();
        assert_eq!(list.kind, "FooList");
        let mut names: Vec<_> = list
            .items
            .iter()
            .filter_map(|o| o.metadata.name.clone())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);

        let all = handler.list(&RequestContext::default()).await.unwrap();
        assert_eq!(all.items.len(), 3);

        let empty = RequestContext::with_namespace("");
        assert_eq!(handler.list(&empty).await.unwrap_err().status_code(), 400);
        assert!(handler.watch(&empty).await.is_err());
    }

    #[tokio::test]
    async fn test_update_preserves_identity_and_checks_revision() {
        let handler = handler_with(MemoryStore::new(), Arc::new(JsonCodec));
        let ctx = RequestContext::with_namespace("default");
        let created = handler.create(&ctx, foo("test")).await.unwrap();

        let mut changed = foo("test");
        changed.data["otherField"] = json!(20);
        let updated = handler.update(&ctx, "test", changed).await.unwrap();
        assert_eq!(updated.data["otherField"], 20);
        assert_eq!(updated.metadata.uid, created.metadata.uid);
        assert_eq!(
            updated.metadata.creation_timestamp,
            created.metadata.creation_timestamp
        );
        assert_ne!(
            updated.metadata.resource_version,
            created.metadata.resource_version
        );

        let mut stale = foo("test");
        stale.metadata.resource_version = created.metadata.resource_version.clone();
        assert!(matches!(
            handler.update(&ctx, "test", stale).await,
            Err(ApiError::Conflict { .. })
        ));

        assert!(matches!(
            handler.update(&ctx, "other", foo("test")).await,
            Err(ApiError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_removes_from_store() {
        let store = MemoryStore::new();
        let handler = handler_with(store.clone(), Arc::new(JsonCodec));
        let ctx = RequestContext::with_namespace("default");
        handler.create(&ctx, foo("test")).await.unwrap();

        let status = handler.delete(&ctx, "test").await.unwrap();
        assert_eq!(status.status.as_deref(), Some("Success"));
        assert!(store.is_empty().await);
        assert_eq!(handler.delete(&ctx, "test").await.unwrap_err().status_code(), 404);
        assert!(handler.list(&ctx).await.unwrap().items.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_payload_is_an_encoding_error() {
        let store = MemoryStore::new();
        let handler = handler_with(store.clone(), Arc::new(JsonCodec));
        store
            .set(
                "/registry/ThirdPartyResourceData/company.com/foos/default/bad",
                Bytes::from_static(br#"{"metadata":{"name":"bad"},"data":"bm90IGpzb24="}"#),
                None,
            )
            .await
            .unwrap();

        let err = handler
            .get(&RequestContext::with_namespace("default"), "bad")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::EncodingError(_)));
    }

    #[tokio::test]
    async fn test_requests_fail_once_removal_starts() {
        let store = MemoryStore::new();
        let phase = PhaseCell::new(ResourcePhase::Installed);
        let destination =
            StorageDestination::new("extensions", Arc::new(store), "/registry", Arc::new(JsonCodec));
        let handler = ThirdPartyResourceDataRest::new(
            destination,
            "/ThirdPartyResourceData/company.com/foos",
            GroupVersion::new("company.com", "v1"),
            "Foo",
            ResourceScope::Namespaced,
            "foos.company.com",
            phase.clone(),
        );

        phase.set(ResourcePhase::Removing);
        let err = handler
            .list(&RequestContext::with_namespace("default"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Removing(id) if id == "foos.company.com"));
    }

    #[tokio::test]
    async fn test_watch_streams_decoded_objects() {
        let handler = handler_with(MemoryStore::new(), Arc::new(JsonCodec));
        let ctx = RequestContext::with_namespace("default");
        let mut events = handler.watch(&ctx).await.unwrap();

        handler.create(&ctx, foo("test")).await.unwrap();
        handler.delete(&ctx, "test").await.unwrap();

        let added = events.next().await.unwrap();
        assert_eq!(added.event_type.as_str(), "ADDED");
        assert_eq!(added.object.metadata.name.as_deref(), Some("test"));

        let deleted = events.next().await.unwrap();
        assert_eq!(deleted.event_type.as_str(), "DELETED");
    }
}
