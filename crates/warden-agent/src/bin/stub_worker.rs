//! Minimal worker satisfying the pool's worker protocol: binds the leased
//! port on loopback, enforces the injected Basic credential, and serves a
//! /health endpoint with an explicit healthy flag. Used by the integration
//! tests; real deployments point WARDEN_WORKER_CMD at an actual worker.

use std::net::SocketAddr;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{StatusCode, Uri, header::AUTHORIZATION};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

#[derive(Clone)]
struct WorkerState {
    expected_auth: String,
    healthy: bool,
    // While this file exists the worker reports itself unhealthy.
    unhealthy_marker: Option<std::path::PathBuf>,
    // First non-health request terminates the process with this code.
    exit_on_request: Option<i32>,
    tenant: String,
}

impl WorkerState {
    fn is_healthy(&self) -> bool {
        if !self.healthy {
            return false;
        }
        match &self.unhealthy_marker {
            Some(path) => !path.exists(),
            None => true,
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).is_ok_and(|v| {
        matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn authorized(state: &WorkerState, headers: &axum::http::HeaderMap) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == state.expected_auth)
}

async fn health(State(state): State<WorkerState>, headers: axum::http::HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(serde_json::json!({ "healthy": state.is_healthy() })).into_response()
}

async fn echo(
    State(state): State<WorkerState>,
    headers: axum::http::HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    if let Some(code) = state.exit_on_request {
        eprintln!("stub worker exiting with code {code} on request");
        std::process::exit(code);
    }
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(serde_json::json!({
        "tenant": state.tenant,
        "path": uri.path(),
        "body_len": body.len(),
    }))
    .into_response()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Simulates a worker that dies right after spawn.
    if let Ok(code) = std::env::var("WARDEN_STUB_EXIT_CODE") {
        let code: i32 = code.parse().unwrap_or(1);
        eprintln!("stub worker exiting immediately with code {code}");
        std::process::exit(code);
    }

    let port: u16 = std::env::var("WARDEN_WORKER_PORT")?.parse()?;
    let credential = std::env::var("WARDEN_WORKER_CREDENTIAL")?;
    let tenant = std::env::var("WARDEN_WORKER_TENANT").unwrap_or_default();

    // Simulates a worker stuck in graceful shutdown.
    #[cfg(unix)]
    {
        if env_flag("WARDEN_STUB_IGNORE_TERM") {
            use tokio::signal::unix::{SignalKind, signal};
            let mut term = signal(SignalKind::terminate())?;
            tokio::spawn(async move {
                loop {
                    term.recv().await;
                    eprintln!("stub worker ignoring SIGTERM");
                }
            });
        }
    }

    let state = WorkerState {
        expected_auth: format!(
            "Basic {}",
            STANDARD.encode(format!("warden:{credential}"))
        ),
        healthy: !env_flag("WARDEN_STUB_UNHEALTHY"),
        unhealthy_marker: std::env::var("WARDEN_STUB_UNHEALTHY_FILE")
            .ok()
            .map(std::path::PathBuf::from),
        exit_on_request: std::env::var("WARDEN_STUB_EXIT_ON_REQUEST")
            .ok()
            .and_then(|v| v.trim().parse().ok()),
        tenant,
    };

    let app = axum::Router::new()
        .route("/health", get(health))
        .route("/*path", any(echo))
        .with_state(state);

    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
