use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::StatusCode,
    response::Response,
};
use serde::Deserialize;

use crate::{
    auth::{RequestContext, scope::Scope},
    error::RegistryError,
    registry::manifests::lookup_reference,
    state::RegistryState,
};

#[derive(Debug, Deserialize)]
pub struct ManifestDeleteRequest {
    repository: String,
    reference: String,
}

pub(crate) async fn delete(
    Path(ManifestDeleteRequest {
        repository,
        reference,
    }): Path<ManifestDeleteRequest>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
) -> Result<Response, RegistryError> {
    context.authorize(&repository, Scope::Delete)?;

    let reference = lookup_reference(&reference)?;
    registry
        .manifests
        .delete_manifest(&repository, &reference, &context)
        .await?;

    Ok(Response::builder()
        .status(StatusCode::ACCEPTED)
        .body(Body::empty())?)
}
