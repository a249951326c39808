//! Probe and metrics endpoints.
//!
//! - `/healthz`: the process is up
//! - `/readyz`: every started controller has synced its caches
//! - `/metrics`: Prometheus text format

use crate::error::ControllerError;
use crate::metrics;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Cache-sync state of the started controllers.
#[derive(Debug, Clone, Default)]
pub struct Readiness {
    controllers: Arc<Mutex<BTreeMap<String, bool>>>,
}

impl Readiness {
    /// Track a controller that has not synced yet.
    pub fn register(&self, controller: &str) {
        self.controllers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(controller.to_string(), false);
    }

    /// Mark a controller's caches as synced.
    pub fn mark_synced(&self, controller: &str) {
        self.controllers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(controller.to_string(), true);
    }

    /// Controllers still waiting for their caches.
    #[must_use]
    pub fn pending(&self) -> Vec<String> {
        self.controllers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, synced)| !**synced)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Ready once at least one controller is tracked and all have synced.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        let controllers = self.controllers.lock().unwrap_or_else(PoisonError::into_inner);
        !controllers.is_empty() && controllers.values().all(|synced| *synced)
    }
}

/// Probe response body.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ProbeResponse {
    /// "ok" or "syncing"
    pub status: String,
    pub service: String,
    pub version: String,
    /// Current timestamp (RFC 3339)
    pub timestamp: String,
    /// Controllers whose caches are not synced yet
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending: Vec<String>,
}

impl ProbeResponse {
    fn new(status: &str, pending: Vec<String>) -> Self {
        Self {
            status: status.to_string(),
            service: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now().to_rfc3339(),
            pending,
        }
    }
}

/// Router serving the probes and metrics.
pub fn router(readiness: Readiness) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_text))
        .layer(TraceLayer::new_for_http())
        .with_state(readiness)
}

/// Serve [`router`] on `addr` until the process exits.
pub async fn serve(addr: SocketAddr, readiness: Readiness) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        ControllerError::InvalidConfig(format!("cannot bind metrics address {addr}: {e}"))
    })?;
    info!("Serving probes and metrics on {}", addr);
    axum::serve(listener, router(readiness))
        .await
        .map_err(|e| ControllerError::Watch(format!("metrics server failed: {e}")))
}

async fn healthz() -> impl IntoResponse {
    Json(ProbeResponse::new("ok", Vec::new()))
}

async fn readyz(State(readiness): State<Readiness>) -> impl IntoResponse {
    if readiness.is_ready() {
        (StatusCode::OK, Json(ProbeResponse::new("ok", Vec::new())))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ProbeResponse::new("syncing", readiness.pending())),
        )
    }
}

async fn metrics_text() -> impl IntoResponse {
    match metrics::render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain")],
            e.to_string(),
        ),
    }
}
