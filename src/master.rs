//! Wires configuration, storage, the built-in extensions group and the
//! third-party manager into a servable API server

use crate::apiserver::admission::admission_for_name;
use crate::apiserver::context::{DefaultContextMapper, DefaultSelfLinker};
use crate::apiserver::group_version::GroupVersionDefaults;
use crate::apiserver::handlers::{self, ApiServerState};
use crate::apiserver::{GroupVersionRegistrar, RestMapper, RestResource, RouteContainer};
use crate::config::ServerConfig;
use crate::metrics::{ApiMetrics, PrometheusExporter};
use crate::registry::ThirdPartyResourceRest;
use crate::storage::{JsonCodec, MemoryStore, StorageDestinations};
use crate::thirdparty::ThirdPartyManager;
use crate::{ApiError, Result};
use apiplane_common::{GroupVersion, ThirdPartyResource, EXTENSIONS_GROUP, EXTENSIONS_VERSION};
use axum::Router;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

const DECLARATION_RESOURCE: &str = "thirdpartyresources";

pub struct Master {
    config: ServerConfig,
    storage: Arc<StorageDestinations>,
    container: Arc<RouteContainer>,
    registrar: Arc<GroupVersionRegistrar>,
    manager: Arc<ThirdPartyManager>,
    metrics: Option<ApiMetrics>,
}

impl Master {
    /// Build the server and re-install every persisted declaration
    pub async fn new(config: ServerConfig, storage: StorageDestinations) -> Result<Self> {
        config.validate()?;
        let storage = Arc::new(storage);
        let metrics = if config.enable_metrics {
            Some(ApiMetrics::new()?)
        } else {
            None
        };

        let container = Arc::new(RouteContainer::new(config.preferred_versions.clone()));
        let registrar = Arc::new(GroupVersionRegistrar::new(
            container.clone(),
            GroupVersionDefaults {
                root: config.api_group_prefix.clone(),
                codec: Arc::new(JsonCodec),
                linker: Arc::new(DefaultSelfLinker),
                admit: admission_for_name(&config.admission_control)?,
                context: Arc::new(DefaultContextMapper),
                min_request_timeout: config.min_request_timeout(),
            },
        ));
        let manager = Arc::new(ThirdPartyManager::new(
            storage.clone(),
            registrar.clone(),
            metrics.clone(),
        ));

        let destination = storage.destination_for(EXTENSIONS_GROUP)?.clone();
        let declarations = Arc::new(ThirdPartyResourceRest::new(manager.clone(), destination));
        let mut mapper = RestMapper::new();
        mapper.insert(
            DECLARATION_RESOURCE.to_string(),
            RestResource {
                plural: DECLARATION_RESOURCE.to_string(),
                kind: ThirdPartyResource::KIND.to_string(),
                namespaced: false,
                storage: declarations.clone(),
            },
        );
        registrar
            .install(registrar.descriptor(
                GroupVersion::new(EXTENSIONS_GROUP, EXTENSIONS_VERSION),
                mapper,
            ))
            .await?;

        declarations.restore().await?;

        info!(
            "API server ready: groups under {}, storage groups {:?}",
            config.api_group_prefix,
            storage.groups()
        );

        Ok(Self {
            config,
            storage,
            container,
            registrar,
            manager,
            metrics,
        })
    }

    /// Server backed by a fresh in-memory store
    pub async fn with_memory_store(config: ServerConfig) -> Result<Self> {
        let storage = config.storage_destinations(Arc::new(MemoryStore::new()))?;
        Self::new(config, storage).await
    }

    pub fn router(&self) -> Router {
        let mut static_paths = vec![
            self.config.api_prefix.clone(),
            self.config.api_group_prefix.clone(),
            "/healthz".to_string(),
        ];
        if self.metrics.is_some() {
            static_paths.push("/metrics".to_string());
        }

        handlers::router(ApiServerState {
            container: self.container.clone(),
            api_prefix: self.config.api_prefix.clone(),
            api_group_prefix: self.config.api_group_prefix.clone(),
            request_timeout: self.config.request_timeout(),
            metrics: self.metrics.clone(),
            exporter: self.metrics.clone().map(PrometheusExporter::new),
            static_paths: Arc::new(static_paths),
        })
    }

    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!("Serving API on {}", listener.local_addr()?);
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        info!("API server stopped");
        Ok(())
    }

    pub async fn install_third_party_resource(&self, declaration: ThirdPartyResource) -> Result<()> {
        self.manager.install(declaration).await.map(|_| ())
    }

    pub fn has_third_party_resource(&self, declaration: &ThirdPartyResource) -> Result<bool> {
        Ok(self.manager.get(&declaration.identity()?).is_some())
    }

    /// `<api group prefix>/<group>` for every group with an installed type
    pub fn list_third_party_resources(&self) -> Vec<String> {
        self.manager.installed_paths()
    }

    /// Remove every third-party type of the group at `path`, e.g. `/apis/company.com`
    pub async fn remove_third_party_resource(&self, path: &str) -> Result<()> {
        let prefix = format!("{}/", self.config.api_group_prefix.trim_end_matches('/'));
        let group = path
            .trim_end_matches('/')
            .strip_prefix(&prefix)
            .filter(|g| !g.is_empty() && !g.contains('/'))
            .ok_or_else(|| {
                ApiError::BadRequest(format!("{:?} is not a third-party group path", path))
            })?;
        self.manager.remove(group).await
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<StorageDestinations> {
        &self.storage
    }

    pub fn container(&self) -> &Arc<RouteContainer> {
        &self.container
    }

    pub fn registrar(&self) -> &Arc<GroupVersionRegistrar> {
        &self.registrar
    }

    pub fn manager(&self) -> &Arc<ThirdPartyManager> {
        &self.manager
    }

    pub fn metrics(&self) -> Option<&ApiMetrics> {
        self.metrics.as_ref()
    }
}
