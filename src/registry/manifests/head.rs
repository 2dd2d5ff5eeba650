use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{StatusCode, header},
    response::Response,
};
use serde::Deserialize;

use crate::{
    auth::{RequestContext, scope::Scope},
    error::RegistryError,
    registry::{CONTENT_DIGEST_HEADER, manifests::lookup_reference},
    state::RegistryState,
};

#[derive(Debug, Deserialize)]
pub struct ManifestHeadRequest {
    repository: String,
    reference: String,
}

pub(crate) async fn head(
    Path(ManifestHeadRequest {
        repository,
        reference,
    }): Path<ManifestHeadRequest>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
) -> Result<Response, RegistryError> {
    context.authorize(&repository, Scope::Read)?;

    let reference = lookup_reference(&reference)?;
    let manifest = registry
        .manifests
        .stat_manifest(&repository, &reference)
        .await?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_DIGEST_HEADER, manifest.digest.to_string())
        .header(header::CONTENT_TYPE, manifest.media_type)
        .header(header::CONTENT_LENGTH, manifest.size)
        .body(Body::empty())?)
}
