//! HTTP surface; API paths resolve through the route container at request time

use super::admission::{AdmissionAttributes, Operation};
use super::container::{Resolution, RouteContainer, RouteMatch};
use super::discovery;
use super::group_version::APIGroupVersion;
use crate::metrics::{ApiMetrics, PrometheusExporter};
use crate::registry::Verb;
use crate::storage::Codec;
use crate::{ApiError, Result};
use axum::body::{Body, Bytes};
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIVersions;
use kube::core::DynamicObject;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

const MAX_BODY_BYTES: usize = 3 * 1024 * 1024;

/// Shared state of the HTTP layer
#[derive(Clone)]
pub struct ApiServerState {
    pub container: Arc<RouteContainer>,
    pub api_prefix: String,
    pub api_group_prefix: String,
    pub request_timeout: Duration,
    pub metrics: Option<ApiMetrics>,
    pub exporter: Option<PrometheusExporter>,
    pub static_paths: Arc<Vec<String>>,
}

pub fn router(state: ApiServerState) -> Router {
    let mut router = Router::new()
        .route("/", get(root_paths))
        .route("/healthz", get(healthz))
        .route(&state.api_prefix, get(legacy_versions))
        .route(&state.api_group_prefix, get(group_list));
    if state.exporter.is_some() {
        router = router.route("/metrics", get(metrics));
    }
    router.fallback(dispatch).with_state(state)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestParams {
    #[serde(default, deserialize_with = "flag")]
    pub watch: Option<bool>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// Boolean query flag in any of the spellings clients send, e.g. `watch=1`
fn flag<'de, D>(deserializer: D) -> std::result::Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref() {
        None => Ok(None),
        Some("1" | "t" | "T" | "true" | "True" | "TRUE") => Ok(Some(true)),
        Some("0" | "f" | "F" | "false" | "False" | "FALSE") => Ok(Some(false)),
        Some(other) => Err(D::Error::custom(format!("invalid boolean {:?}", other))),
    }
}

#[derive(Serialize)]
struct RootPaths {
    paths: Vec<String>,
}

#[derive(Serialize)]
struct WatchEventBody<'a> {
    #[serde(rename = "type")]
    event_type: &'static str,
    object: &'a DynamicObject,
}

pub fn error_response(err: &ApiError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err.to_status())).into_response()
}

fn encoded<T: Serialize>(codec: &dyn Codec, status: StatusCode, value: &T) -> Result<Response> {
    let body = codec.encode(&serde_json::to_value(value)?)?;
    Ok((status, [(header::CONTENT_TYPE, codec.content_type())], body).into_response())
}

async fn with_timeout<T>(limit: Duration, call: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| ApiError::Timeout(limit.as_secs()))?
}

async fn healthz() -> &'static str {
    "ok"
}

async fn root_paths(State(state): State<ApiServerState>) -> Json<RootPaths> {
    Json(RootPaths {
        paths: discovery::root_paths(&state.container, &state.static_paths).await,
    })
}

async fn legacy_versions(State(state): State<ApiServerState>) -> Json<APIVersions> {
    let versions = state
        .container
        .installed_group("")
        .await
        .map(|g| g.versions)
        .unwrap_or_default();
    Json(APIVersions {
        versions,
        ..Default::default()
    })
}

async fn group_list(State(state): State<ApiServerState>) -> Response {
    Json(discovery::list_groups(&state.container).await).into_response()
}

async fn metrics(State(state): State<ApiServerState>) -> Response {
    let Some(exporter) = &state.exporter else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match exporter.render() {
        Ok(text) => ([(header::CONTENT_TYPE, exporter.content_type())], text).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn dispatch(
    State(state): State<ApiServerState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    params: std::result::Result<Query<RequestParams>, QueryRejection>,
    body: Body,
) -> Response {
    let started = Instant::now();
    let path = uri.path().to_string();

    let (verb, result) = match params {
        Ok(Query(params)) => serve(&state, &method, &path, &headers, params, body).await,
        Err(rejection) => (
            "unknown",
            Err(ApiError::BadRequest(rejection.body_text())),
        ),
    };
    let response = result.unwrap_or_else(|e| error_response(&e));

    debug!(
        "{} {} -> {} ({:?})",
        method,
        path,
        response.status(),
        started.elapsed()
    );
    if let Some(metrics) = &state.metrics {
        metrics.observe_request(verb, response.status().as_u16(), started.elapsed());
    }
    response
}

async fn serve(
    state: &ApiServerState,
    method: &Method,
    path: &str,
    headers: &HeaderMap,
    params: RequestParams,
    body: Body,
) -> (&'static str, Result<Response>) {
    match state.container.resolve(method, path).await {
        Resolution::Route(matched) => {
            let action = match matched.action {
                Verb::List if params.watch == Some(true) => Verb::Watch,
                other => other,
            };
            let result = serve_route(state, matched, action, headers, params, body).await;
            (action.as_str(), result)
        }
        Resolution::ServiceRoot(service) if method == Method::GET => (
            "discovery",
            Ok(Json(discovery::resources(&service)).into_response()),
        ),
        Resolution::ServiceRoot(_) | Resolution::MethodNotAllowed => (
            "unknown",
            Err(ApiError::MethodNotAllowed {
                method: method.to_string(),
                path: path.to_string(),
            }),
        ),
        Resolution::NotFound => {
            if method == Method::GET {
                if let Some(group) = group_path(&state.api_group_prefix, path) {
                    if let Some(doc) = discovery::group(&state.container, group).await {
                        return ("discovery", Ok(Json(doc).into_response()));
                    }
                }
            }
            ("unknown", Err(ApiError::not_found("path", path)))
        }
    }
}

/// `<prefix>/<group>` → `group`
fn group_path<'a>(prefix: &str, path: &'a str) -> Option<&'a str> {
    let rest = path
        .trim_end_matches('/')
        .strip_prefix(prefix.trim_end_matches('/'))?
        .strip_prefix('/')?;
    (!rest.is_empty() && !rest.contains('/')).then_some(rest)
}

fn self_link(gv: &APIGroupVersion, plural: &str, object: &mut DynamicObject) {
    let Some(name) = object.metadata.name.as_deref() else {
        return;
    };
    let link = gv.linker.self_link(
        &gv.path(),
        plural,
        object.metadata.namespace.as_deref(),
        Some(name),
    );
    object.metadata.self_link = Some(link);
}

async fn read_object(codec: &dyn Codec, body: Body, kind: &str) -> Result<DynamicObject> {
    let bytes: Bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| ApiError::BadRequest(format!("unable to read request body: {}", e)))?;
    if bytes.is_empty() {
        return Err(ApiError::BadRequest("request body is empty".to_string()));
    }
    let value = codec
        .decode(&bytes)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let object: DynamicObject = serde_json::from_value(value)
        .map_err(|e| ApiError::BadRequest(format!("malformed object: {}", e)))?;

    let body_kind = match &object.types {
        Some(types) => Some(types.kind.as_str()),
        None => object.data.get("kind").and_then(|k| k.as_str()),
    };
    if let Some(body_kind) = body_kind.filter(|k| !k.is_empty()) {
        if body_kind != kind {
            return Err(ApiError::BadRequest(format!(
                "object kind {} does not match resource kind {}",
                body_kind, kind
            )));
        }
    }
    Ok(object)
}

async fn serve_route(
    state: &ApiServerState,
    matched: RouteMatch,
    action: Verb,
    headers: &HeaderMap,
    params: RequestParams,
    body: Body,
) -> Result<Response> {
    let gv = matched.service.group_version.clone();
    let resource = matched.resource;
    let storage = resource.storage.clone();
    let ctx = gv.context.context_for(headers, matched.namespace.as_deref());
    let limit = state.request_timeout;
    let codec = gv.codec.as_ref();

    let attributes = |operation: Operation, name: Option<String>| AdmissionAttributes {
        operation,
        group_version: gv.group_version.clone(),
        resource: resource.plural.clone(),
        kind: resource.kind.clone(),
        namespace: ctx.namespace.clone(),
        name,
        user: ctx.user.clone(),
    };

    debug!(
        "{} {} in {} (request {})",
        action.as_str(),
        resource.plural,
        gv.group_version,
        ctx.request_id
    );

    match action {
        Verb::List => {
            let mut list = with_timeout(limit, storage.list(&ctx)).await?;
            for item in &mut list.items {
                self_link(&gv, &resource.plural, item);
            }
            list.metadata.self_link = Some(gv.linker.self_link(
                &gv.path(),
                &resource.plural,
                ctx.namespace.as_deref(),
                None,
            ));
            encoded(codec, StatusCode::OK, &list)
        }
        Verb::Get => {
            let name = matched.name.unwrap_or_default();
            let mut object = with_timeout(limit, storage.get(&ctx, &name)).await?;
            self_link(&gv, &resource.plural, &mut object);
            encoded(codec, StatusCode::OK, &object)
        }
        Verb::Create => {
            let object = read_object(codec, body, &resource.kind).await?;
            gv.admit
                .admit(&attributes(Operation::Create, object.metadata.name.clone()))
                .await?;
            let mut created = with_timeout(limit, storage.create(&ctx, object)).await?;
            self_link(&gv, &resource.plural, &mut created);
            encoded(codec, StatusCode::CREATED, &created)
        }
        Verb::Update => {
            let name = matched.name.unwrap_or_default();
            let object = read_object(codec, body, &resource.kind).await?;
            gv.admit
                .admit(&attributes(Operation::Update, Some(name.clone())))
                .await?;
            let mut updated = with_timeout(limit, storage.update(&ctx, &name, object)).await?;
            self_link(&gv, &resource.plural, &mut updated);
            encoded(codec, StatusCode::OK, &updated)
        }
        Verb::Delete => {
            let name = matched.name.unwrap_or_default();
            gv.admit
                .admit(&attributes(Operation::Delete, Some(name.clone())))
                .await?;
            let status = with_timeout(limit, storage.delete(&ctx, &name)).await?;
            encoded(codec, StatusCode::OK, &status)
        }
        Verb::Watch => {
            let open_for = params
                .timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(gv.min_request_timeout);
            let events = with_timeout(limit, storage.watch(&ctx)).await?;
            let plural = resource.plural.clone();
            let watched = gv.clone();

            let lines = events
                .map(move |mut event| {
                    self_link(&watched, &plural, &mut event.object);
                    let mut line = serde_json::to_vec(&WatchEventBody {
                        event_type: event.event_type.as_str(),
                        object: &event.object,
                    })
                    .map_err(std::io::Error::other)?;
                    line.push(b'\n');
                    Ok::<_, std::io::Error>(Bytes::from(line))
                })
                .take_until(tokio::time::sleep(open_for));

            Ok((
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                Body::from_stream(lines),
            )
                .into_response())
        }
    }
}
