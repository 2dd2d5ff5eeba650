//! JSON management endpoints under `/api/v1`.

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};

use crate::state::RegistryState;

mod events;
mod projects;
mod system;
mod webhooks;

pub fn router(state: Arc<RegistryState>) -> Router {
    let api = Router::new()
        .route(
            "/projects/{project}/webhooks",
            get(webhooks::list).post(webhooks::create),
        )
        .route(
            "/projects/{project}/webhooks/{id}",
            get(webhooks::get)
                .put(webhooks::update)
                .delete(webhooks::delete),
        )
        .route(
            "/projects/{project}/webhooks/{id}/test",
            post(webhooks::test),
        )
        .route(
            "/projects/{project}/webhooks/{id}/events",
            get(webhooks::events),
        )
        .route("/events/{id}/deliveries", get(webhooks::deliveries))
        .route("/projects/{project}", get(projects::stats))
        .route(
            "/projects/{project}/repositories/{repository}/tags",
            get(projects::tags),
        )
        .route("/events", get(events::stream))
        .route("/system/gc", post(system::gc));

    Router::new().nest("/api/v1", api).with_state(state)
}
