use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    Router, ServiceExt,
    body::Body,
    http::Request,
    middleware::from_fn_with_state,
};
use tokio::{net::TcpListener, task::JoinSet};
use tower::{Layer, ServiceBuilder};
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{info, info_span};

use crate::{
    config::Configuration,
    registry::RewriteUriLayer,
    state::RegistryState,
};

mod api;
mod audit;
mod auth;
pub mod config;
pub mod digest;
pub mod error;
mod extractor;
mod garbage;
mod manifests;
mod metrics;
mod notify;
mod registry;
pub mod state;
mod stats;
mod store;
mod uploads;
mod webhook;

#[cfg(test)]
mod tests;

/// The registry and management routes with request ids, tracing and
/// request metrics applied.
pub(crate) fn app(state: Arc<RegistryState>) -> Router {
    registry::router(state.clone())
        .merge(api::router(state.clone()))
        .layer(from_fn_with_state(state, metrics::track_requests))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(
                    TraceLayer::new_for_http().make_span_with(|req: &Request<Body>| {
                        let request_id = req
                            .headers()
                            .get("x-request-id")
                            .and_then(|id| id.to_str().ok())
                            .unwrap_or_default();

                        info_span!(
                            "request",
                            method = %req.method(),
                            uri = %req.uri(),
                            request_id,
                        )
                    }),
                )
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
}

/// Opens the registry and serves it. Every long running piece ends up on
/// the returned set, so shutting it down stops the registry.
pub async fn start(config: Configuration) -> Result<JoinSet<Result<()>>> {
    let mut tasks = JoinSet::new();

    let state = RegistryState::open(config, &mut tasks).await?;

    metrics::start_metrics(&mut tasks, state.clone()).await?;

    let address = state.config.registry.address.clone();
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("Unable to bind registry listener on {address}"))?;
    info!("Serving registry on {address} as {}", state.config.url);

    // Rewriting has to happen before routing, so it wraps the whole router
    let service = RewriteUriLayer.layer(app(state));

    tasks.spawn(async move {
        axum::serve(
            listener,
            ServiceExt::<Request<Body>>::into_make_service_with_connect_info::<SocketAddr>(
                service,
            ),
        )
        .await?;
        Ok(())
    });

    Ok(tasks)
}
