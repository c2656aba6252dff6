use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, delete, get};
use axum::{Json, Router};
use serde::Serialize;

use warden_core::{PoolError, TenantId, TenantSpec};

use crate::proxy::RequestProxy;
use crate::registry::InstancePool;

#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<InstancePool>,
    pub proxy: RequestProxy,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

fn json_error(code: StatusCode, message: impl Into<String>) -> Response {
    (
        code,
        Json(ErrorBody {
            message: message.into(),
        }),
    )
        .into_response()
}

fn pool_error_response(err: PoolError) -> Response {
    let code = match &err {
        PoolError::NoPortsAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        PoolError::ProxyUnreachable(_) => StatusCode::BAD_GATEWAY,
        PoolError::HealthTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        PoolError::SpawnFailure(_) | PoolError::WorkerExited { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    json_error(code, err.to_string())
}

// Tenant ids double as directory names under the data root; reject
// anything that could traverse out of it. The auth layer normally
// guarantees this shape already.
fn tenant_is_valid(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 128
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/instances", get(list_instances))
        .route("/instances/:tenant", delete(destroy_instance))
        .route("/stats", get(stats))
        .route("/t/:tenant/*path", any(forward))
        .with_state(state)
}

async fn list_instances(State(state): State<AppState>) -> Response {
    Json(state.pool.list().await).into_response()
}

async fn stats(State(state): State<AppState>) -> Response {
    Json(state.pool.stats().await).into_response()
}

async fn destroy_instance(State(state): State<AppState>, Path(tenant): Path<String>) -> Response {
    if !tenant_is_valid(&tenant) {
        return json_error(StatusCode::BAD_REQUEST, "invalid tenant id");
    }
    state.pool.destroy(&TenantId(tenant)).await;
    StatusCode::NO_CONTENT.into_response()
}

async fn forward(
    State(state): State<AppState>,
    Path((tenant, path)): Path<(String, String)>,
    method: Method,
    body: Bytes,
) -> Response {
    if !tenant_is_valid(&tenant) {
        return json_error(StatusCode::BAD_REQUEST, "invalid tenant id");
    }

    let method = match reqwest::Method::from_bytes(method.as_str().as_bytes()) {
        Ok(m) => m,
        Err(_) => return json_error(StatusCode::METHOD_NOT_ALLOWED, "unsupported method"),
    };

    let spec = TenantSpec::default();
    match state
        .proxy
        .forward(&TenantId(tenant), &spec, method, &path, body.to_vec())
        .await
    {
        Ok(relayed) => {
            let status =
                StatusCode::from_u16(relayed.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let mut resp = (status, relayed.body).into_response();
            if let Some(ct) = relayed.content_type
                && let Ok(value) = HeaderValue::from_str(&ct)
            {
                resp.headers_mut().insert(CONTENT_TYPE, value);
            }
            resp
        }
        Err(err) => pool_error_response(err),
    }
}

#[cfg(test)]
mod tests {
    use super::tenant_is_valid;

    #[test]
    fn tenant_validation() {
        assert!(tenant_is_valid("acme"));
        assert!(tenant_is_valid("acme-prod_2"));
        assert!(!tenant_is_valid(""));
        assert!(!tenant_is_valid("../escape"));
        assert!(!tenant_is_valid("a/b"));
        assert!(!tenant_is_valid(&"x".repeat(200)));
    }
}
