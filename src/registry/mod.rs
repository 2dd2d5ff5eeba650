use std::sync::Arc;

use axum::{
    Router,
    routing::{get, head, post},
};

use crate::state::RegistryState;

pub(crate) use middleware::{RewriteUriLayer, RewriteUriService};

mod blobs;
mod content_range;
mod manifests;
mod middleware;
mod referrers;
mod root;
mod tags;

pub const API_VERSION_HEADER: &str = "Docker-Distribution-Api-Version";
pub const CONTENT_DIGEST_HEADER: &str = "Docker-Content-Digest";
pub const UPLOAD_UUID_HEADER: &str = "Docker-Upload-UUID";

pub fn router(state: Arc<RegistryState>) -> Router {
    Router::new()
        .route("/v2/", get(root::get).head(root::get))
        .route(
            "/v2/{repository}/blobs/uploads/{upload_id}",
            get(blobs::uploads::get::get)
                .patch(blobs::uploads::patch::patch)
                .put(blobs::uploads::put::put)
                .delete(blobs::uploads::delete::delete),
        )
        .route(
            "/v2/{repository}/blobs/uploads/",
            post(blobs::uploads::post::post),
        )
        .route(
            "/v2/{repository}/blobs/{digest}",
            head(blobs::head::head)
                .get(blobs::get::get)
                .delete(blobs::delete::delete),
        )
        .route(
            "/v2/{repository}/manifests/{reference}",
            head(manifests::head::head)
                .get(manifests::get::get)
                .delete(manifests::delete::delete)
                .put(manifests::put::put),
        )
        .route(
            "/v2/{repository}/manifests/{digest}/referrers",
            get(referrers::get),
        )
        .route("/v2/{repository}/referrers/{digest}", get(referrers::get))
        .route("/v2/{repository}/tags/list", get(tags::get::get))
        .with_state(state)
}
