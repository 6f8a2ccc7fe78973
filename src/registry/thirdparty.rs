//! `extensions/v1beta1/thirdpartyresources`: declarations of third-party types
//!
//! Creating a declaration installs the type through the manager and then
//! persists it so that it survives a restart; deleting one tears the type
//! down and removes every stored instance.

use super::{success_status, DynamicList, RestStorage, Verb};
use crate::apiserver::context::RequestContext;
use crate::storage::{KeyValue, StorageDestination};
use crate::thirdparty::ThirdPartyManager;
use crate::{ApiError, Result};
use apiplane_common::{ThirdPartyResource, EXTENSIONS_GROUP, EXTENSIONS_VERSION};
use async_trait::async_trait;
use bytes::Bytes;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ListMeta, Status, Time};
use k8s_openapi::chrono::Utc;
use kube::core::DynamicObject;
use std::sync::Arc;
use tracing::{info, warn};

const DECLARATION_ROOT: &str = "/thirdpartyresources";

pub struct ThirdPartyResourceRest {
    manager: Arc<ThirdPartyManager>,
    destination: StorageDestination,
}

impl ThirdPartyResourceRest {
    pub fn new(manager: Arc<ThirdPartyManager>, destination: StorageDestination) -> Self {
        Self {
            manager,
            destination,
        }
    }

    fn key(&self, name: &str) -> String {
        self.destination
            .key(&format!("{}/{}", DECLARATION_ROOT, name))
    }

    fn encode(&self, declaration: &ThirdPartyResource) -> Result<Bytes> {
        let mut stored = declaration.clone();
        stored.metadata.resource_version = None;
        stored.metadata.self_link = None;
        Ok(self.destination.codec.encode(&serde_json::to_value(&stored)?)?)
    }

    fn decode(&self, kv: &KeyValue) -> Result<ThirdPartyResource> {
        let raw = self.destination.codec.decode(&kv.value)?;
        let mut declaration: ThirdPartyResource = serde_json::from_value(raw)
            .map_err(|e| ApiError::EncodingError(format!("declaration at {}: {}", kv.key, e)))?;
        declaration.metadata.resource_version = Some(kv.mod_revision.to_string());
        Ok(declaration)
    }

    /// Re-install every persisted declaration; returns how many succeeded
    ///
    /// A declaration that fails to install is logged and skipped.
    pub async fn restore(&self) -> Result<usize> {
        let root = self.destination.key(&format!("{}/", DECLARATION_ROOT));
        let listed = self.destination.store.list(&root).await?;

        let mut restored = 0;
        for kv in &listed.items {
            let declaration = match self.decode(kv) {
                Ok(d) => d,
                Err(e) => {
                    warn!("Skipping unreadable declaration at {}: {}", kv.key, e);
                    continue;
                }
            };
            let name = declaration.name().to_string();
            match self.manager.install(declaration).await {
                Ok(_) => restored += 1,
                Err(e) => warn!("Skipping declaration {}: {}", name, e),
            }
        }

        if !listed.items.is_empty() {
            info!(
                "Restored {} of {} third-party resource declaration(s)",
                restored,
                listed.items.len()
            );
        }
        Ok(restored)
    }
}

fn to_object(declaration: &ThirdPartyResource) -> Result<DynamicObject> {
    Ok(serde_json::from_value(serde_json::to_value(declaration)?)?)
}

#[async_trait]
impl RestStorage for ThirdPartyResourceRest {
    fn verbs(&self) -> &'static [Verb] {
        &[Verb::List, Verb::Get, Verb::Create, Verb::Delete]
    }

    async fn list(&self, _ctx: &RequestContext) -> Result<DynamicList> {
        let root = self.destination.key(&format!("{}/", DECLARATION_ROOT));
        let listed = self.destination.store.list(&root).await?;
        let items = listed
            .items
            .iter()
            .map(|kv| self.decode(kv).and_then(|d| to_object(&d)))
            .collect::<Result<Vec<_>>>()?;

        Ok(DynamicList {
            api_version: format!("{}/{}", EXTENSIONS_GROUP, EXTENSIONS_VERSION),
            kind: format!("{}List", ThirdPartyResource::KIND),
            metadata: ListMeta {
                resource_version: Some(listed.revision.to_string()),
                ..Default::default()
            },
            items,
        })
    }

    async fn get(&self, _ctx: &RequestContext, name: &str) -> Result<DynamicObject> {
        let kv = self
            .destination
            .store
            .get(&self.key(name))
            .await
            .map_err(|e| ApiError::from_store(e, ThirdPartyResource::KIND, name))?;
        to_object(&self.decode(&kv)?)
    }

    async fn create(&self, _ctx: &RequestContext, object: DynamicObject) -> Result<DynamicObject> {
        let mut declaration: ThirdPartyResource = serde_json::from_value(
            serde_json::to_value(&object)?,
        )
        .map_err(|e| ApiError::BadRequest(format!("malformed declaration: {}", e)))?;

        let name = declaration.name().to_string();
        if name.is_empty() {
            return Err(ApiError::Invalid("metadata.name is required".to_string()));
        }
        declaration.api_version = Some(format!("{}/{}", EXTENSIONS_GROUP, EXTENSIONS_VERSION));
        declaration.kind = Some(ThirdPartyResource::KIND.to_string());
        declaration.metadata.namespace = None;
        if declaration.metadata.uid.as_deref().map_or(true, str::is_empty) {
            declaration.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        declaration.metadata.creation_timestamp = Some(Time(Utc::now()));

        let installed = self.manager.install(declaration.clone()).await?;

        let persisted = match self.encode(&declaration) {
            Ok(value) => self
                .destination
                .store
                .create(&self.key(&name), value, None)
                .await
                .map_err(|e| ApiError::from_store(e, ThirdPartyResource::KIND, &name)),
            Err(e) => Err(e),
        };

        match persisted {
            Ok(kv) => to_object(&self.decode(&kv)?),
            Err(e) => {
                warn!("Persisting declaration {} failed, rolling back: {}", name, e);
                if let Err(rollback) = self.manager.remove_resource(&installed.identity).await {
                    warn!("Rollback of {} failed: {}", installed.identity, rollback);
                }
                Err(e)
            }
        }
    }

    async fn delete(&self, _ctx: &RequestContext, name: &str) -> Result<Status> {
        let key = self.key(name);
        let kv = self
            .destination
            .store
            .get(&key)
            .await
            .map_err(|e| ApiError::from_store(e, ThirdPartyResource::KIND, name))?;
        let declaration = self.decode(&kv)?;

        match declaration.identity() {
            Ok(identity) => match self.manager.remove_resource(&identity).await {
                Ok(()) | Err(ApiError::NotFound { .. }) => {}
                Err(e @ ApiError::PartialTeardownFailure { .. }) => {
                    warn!("Deleting declaration {} despite: {}", name, e);
                }
                Err(e) => return Err(e),
            },
            Err(e) => warn!("Declaration {} has an invalid name: {}", name, e),
        }

        self.destination
            .store
            .delete(&key)
            .await
            .map_err(|e| ApiError::from_store(e, ThirdPartyResource::KIND, name))?;

        Ok(success_status(
            ThirdPartyResource::KIND,
            EXTENSIONS_GROUP,
            name,
            declaration.metadata.uid,
        ))
    }
}
