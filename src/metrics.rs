//! Prometheus exposition on its own listener, and per-request counters for
//! the main router.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::{
    encoding::{EncodeLabelSet, text::encode},
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use tokio::task::JoinSet;
use tracing::info;

use crate::state::RegistryState;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct HttpLabels {
    method: String,
    status: String,
}

#[derive(Clone)]
pub(crate) struct HttpMetrics {
    requests: Family<HttpLabels, Counter>,
}

impl HttpMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let requests = Family::<HttpLabels, Counter>::default();
        registry.register(
            "http_requests",
            "Requests served, by method and status",
            requests.clone(),
        );

        Self { requests }
    }
}

/// Counts every response the main router produces.
pub(crate) async fn track_requests(
    State(state): State<Arc<RegistryState>>,
    req: Request,
    next: Next,
) -> Response {
    let method = req.method().to_string();
    let response = next.run(req).await;

    state
        .http
        .requests
        .get_or_create(&HttpLabels {
            method,
            status: response.status().as_u16().to_string(),
        })
        .inc();

    response
}

async fn metrics_handler(State(registry): State<Arc<RegistryState>>) -> Response {
    let mut buffer = String::new();

    if let Err(err) = encode(&mut buffer, &registry.registry) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {err}"),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        [(
            "Content-Type",
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buffer,
    )
        .into_response()
}

pub(crate) fn metrics_router(state: Arc<RegistryState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

pub(crate) async fn start_metrics(
    tasks: &mut JoinSet<Result<()>>,
    state: Arc<RegistryState>,
) -> Result<()> {
    let listen_addr = format!(
        "{}:{}",
        state.config.prometheus.address, state.config.prometheus.port
    );

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Unable to bind metrics listener on {listen_addr}"))?;
    info!("Serving metrics on {listen_addr}");

    let app = metrics_router(state);
    tasks.spawn(async move {
        axum::serve(listener, app).await?;
        Ok(())
    });

    Ok(())
}
