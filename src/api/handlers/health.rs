//! Component health check.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::time::Duration;

use crate::api::server::AppState;
use crate::comfy::normalize_server;

/// One component's verdict.
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    /// Whether the component is usable.
    pub ok: bool,
    /// Why not, when it isn't.
    pub reason: Option<String>,
}

impl ComponentHealth {
    fn ok() -> Self {
        Self {
            ok: true,
            reason: None,
        }
    }

    fn failed(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: Some(reason.into()),
        }
    }
}

/// The `/healthz` body.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall verdict over the hard components.
    pub ok: bool,
    /// Per-component details.
    pub components: Components,
}

/// The probed components.
#[derive(Debug, Serialize)]
pub struct Components {
    /// Upstream inference peer reachability.
    pub comfyui: ComponentHealth,
    /// Database write round trip.
    pub db: ComponentHealth,
    /// Free disk space under the output root.
    pub disk: ComponentHealth,
    /// Translation provider configuration (soft component).
    pub llm: ComponentHealth,
}

/// `GET /healthz` — 200 when the hard components (upstream, db, disk)
/// are all usable, 503 otherwise. The translation provider is reported
/// but never fails the check.
pub async fn healthz(State(state): State<AppState>) -> Response {
    let comfyui = probe_comfyui(&state).await;
    let db = match state.jobs.health_write_check().await {
        Ok(()) => ComponentHealth::ok(),
        Err(err) => ComponentHealth::failed(err.to_string()),
    };
    let disk = probe_disk(&state);
    let llm = if state.translator.configured() {
        ComponentHealth::ok()
    } else {
        ComponentHealth::failed("translation API key not set")
    };

    let ok = comfyui.ok && db.ok && disk.ok;
    let status = if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = HealthResponse {
        ok,
        components: Components {
            comfyui,
            db,
            disk,
            llm,
        },
    };
    (status, Json(body)).into_response()
}

async fn probe_comfyui(state: &AppState) -> ComponentHealth {
    let (scheme, hostport) = normalize_server(&state.config.comfy_server);
    let url = format!("{scheme}://{hostport}/");
    let client = match reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(3))
        .timeout(Duration::from_secs(5))
        .build()
    {
        Ok(client) => client,
        Err(err) => return ComponentHealth::failed(err.to_string()),
    };
    match client.get(&url).send().await {
        // Anything the server answers (even 4xx) proves it is alive.
        Ok(response) if response.status().as_u16() < 500 => ComponentHealth::ok(),
        Ok(response) => ComponentHealth::failed(format!("HTTP {}", response.status().as_u16())),
        Err(err) => ComponentHealth::failed(err.to_string()),
    }
}

fn probe_disk(state: &AppState) -> ComponentHealth {
    match fs2::available_space(&state.config.output_dir) {
        Ok(free_bytes) => {
            let free_mb = free_bytes / (1024 * 1024);
            let min_mb = state.config.healthz_disk_min_free_mb;
            if free_mb >= min_mb {
                ComponentHealth::ok()
            } else {
                ComponentHealth::failed(format!("free {free_mb}MB < min {min_mb}MB"))
            }
        }
        Err(err) => ComponentHealth::failed(err.to_string()),
    }
}
