//! Axum routes for page serving, on-demand revalidation and webhooks

use crate::engine::{IsrEngine, Served};
use crate::error::IsrError;
use crate::invalidation::{InvalidationEvent, InvalidationHandler};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

pub const CACHE_STATUS_HEADER: &str = "x-isr-cache";
pub const GENERATED_AT_HEADER: &str = "x-isr-generated-at";

pub const REVALIDATE_PATH: &str = "/api/revalidate";
pub const STATUS_PATH: &str = "/api/isr/status";

/// Check that `path` can be mounted as the webhook route.
///
/// It must be a literal absolute path that does not collide with the
/// other ISR routes.
pub fn check_webhook_path(path: &str) -> Result<(), String> {
    if !path.starts_with('/') {
        return Err(format!("webhook path must start with '/': {:?}", path));
    }
    if matches!(path, "/" | REVALIDATE_PATH | STATUS_PATH) {
        return Err(format!("webhook path {:?} is already routed", path));
    }
    if path.contains(|c: char| matches!(c, ':' | '*' | '{' | '}')) {
        return Err(format!("webhook path must be a literal path: {:?}", path));
    }
    Ok(())
}

/// HTTP-facing settings
#[derive(Debug, Clone)]
pub struct IsrHttpConfig {
    pub webhook_path: String,
    pub secret_header: String,
    /// Required for webhooks; without it every webhook is refused
    pub webhook_secret: Option<String>,
    /// When set, `POST /api/revalidate` requires it too
    pub api_secret: Option<String>,
}

impl Default for IsrHttpConfig {
    fn default() -> Self {
        Self {
            webhook_path: "/api/webhooks/invalidate".to_string(),
            secret_header: "x-webhook-secret".to_string(),
            webhook_secret: None,
            api_secret: None,
        }
    }
}

/// Router state
#[derive(Clone)]
pub struct IsrState {
    pub engine: IsrEngine,
    pub invalidation: Arc<InvalidationHandler>,
    pub config: Arc<IsrHttpConfig>,
}

impl IsrState {
    pub fn new(engine: IsrEngine, invalidation: InvalidationHandler, config: IsrHttpConfig) -> Self {
        Self {
            engine,
            invalidation: Arc::new(invalidation),
            config: Arc::new(config),
        }
    }
}

/// Build the ISR router. API routes win over the page catch-all.
pub fn router(state: IsrState) -> Router {
    let webhook_path = state.config.webhook_path.clone();

    Router::new()
        .route(REVALIDATE_PATH, post(revalidate_handler))
        .route(STATUS_PATH, get(status_handler))
        .route(&webhook_path, post(webhook_handler))
        .route("/", get(page_handler))
        .route("/*path", get(page_handler))
        .with_state(state)
}

impl IntoResponse for IsrError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        (
            status,
            Json(json!({
                "success": false,
                "error": self.to_string(),
            })),
        )
            .into_response()
    }
}

/// Compare a secret header against the expected value without early exit
fn secret_matches(headers: &HeaderMap, name: &str, expected: &str) -> bool {
    let Some(given) = headers.get(name).map(HeaderValue::as_bytes) else {
        return false;
    };
    let expected = expected.as_bytes();

    let mut diff = given.len() ^ expected.len();
    for (i, byte) in expected.iter().enumerate() {
        let other = given.get(i).copied().unwrap_or(0);
        diff |= usize::from(byte ^ other);
    }
    diff == 0
}

/// Handler for `GET /` and `GET /*path`
async fn page_handler(State(state): State<IsrState>, uri: Uri) -> Result<Response, IsrError> {
    let Served { entry, status } = state.engine.serve(uri.path()).await?;

    let mut response = (
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        entry.artifact.html,
    )
        .into_response();

    let headers = response.headers_mut();
    headers.insert(CACHE_STATUS_HEADER, HeaderValue::from_static(status.as_str()));
    if let Ok(value) = HeaderValue::from_str(&entry.created_at.to_rfc3339()) {
        headers.insert(GENERATED_AT_HEADER, value);
    }

    Ok(response)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RevalidateResult {
    generated_at: String,
    ttl_seconds: u64,
    bytes: usize,
}

/// Handler for `POST /api/revalidate`
async fn revalidate_handler(
    State(state): State<IsrState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, IsrError> {
    if let Some(secret) = state.config.api_secret.as_deref() {
        if !secret_matches(&headers, &state.config.secret_header, secret) {
            return Err(IsrError::Unauthorized);
        }
    }

    let body: Value = serde_json::from_slice(&body)
        .map_err(|e| IsrError::InvalidPayload(format!("body is not JSON: {}", e)))?;

    let route = body
        .get("route")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .ok_or_else(|| IsrError::InvalidPayload("missing `route`".to_string()))?;

    let entry = state.engine.revalidate(route).await?;
    let result = RevalidateResult {
        generated_at: entry.created_at.to_rfc3339(),
        ttl_seconds: entry.ttl_seconds,
        bytes: entry.artifact.html.len(),
    };

    Ok(Json(json!({
        "success": true,
        "route": entry.route,
        "result": result,
    })))
}

#[derive(Debug, Default, Deserialize)]
struct WebhookQuery {
    #[serde(default)]
    wait: bool,
}

/// Handler for the invalidation webhook
async fn webhook_handler(
    State(state): State<IsrState>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, IsrError> {
    let authorized = match state.config.webhook_secret.as_deref() {
        Some(secret) => secret_matches(&headers, &state.config.secret_header, secret),
        None => false,
    };
    if !authorized {
        warn!("rejected webhook with missing or invalid secret");
        return Err(IsrError::Unauthorized);
    }

    let event: InvalidationEvent = serde_json::from_slice(&body)
        .map_err(|e| IsrError::InvalidPayload(format!("body is not a valid event: {}", e)))?;

    let (routes, results) = if query.wait {
        let results = state.invalidation.revalidate_now(&event).await?;
        let routes: Vec<String> = results.iter().map(|r| r.route.clone()).collect();
        (routes, json!(results))
    } else {
        let results = state.invalidation.enqueue(&event)?;
        let routes: Vec<String> = results.iter().map(|r| r.route.clone()).collect();
        (routes, json!(results))
    };

    Ok(Json(json!({
        "success": true,
        "revalidated": routes,
        "results": results,
    })))
}

/// Handler for `GET /api/isr/status`
async fn status_handler(State(state): State<IsrState>) -> Result<Json<Value>, IsrError> {
    let store = state.engine.store();
    let cached_routes = store
        .keys()
        .await
        .map_err(|source| IsrError::CacheRead {
            route: "*".to_string(),
            source,
        })?
        .len();
    let queue = state.engine.queue().status();

    Ok(Json(json!({
        "store": store.name(),
        "cachedRoutes": cached_routes,
        "queued": queue.queued,
        "active": queue.active,
        "maxWorkers": queue.max_workers,
        "stats": state.engine.stats().await,
    })))
}
