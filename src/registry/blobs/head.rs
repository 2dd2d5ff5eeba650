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
    digest::Digest,
    error::RegistryError,
    registry::CONTENT_DIGEST_HEADER,
    state::RegistryState,
};

#[derive(Debug, Deserialize)]
pub struct BlobRequest {
    repository: String,
    digest: Digest,
}

pub(crate) async fn head(
    Path(BlobRequest { repository, digest }): Path<BlobRequest>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
) -> Result<Response, RegistryError> {
    context.authorize(&repository, Scope::Read)?;

    let size = registry.blobs.check_blob(&repository, &digest).await?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, size)
        .header(CONTENT_DIGEST_HEADER, digest.to_string())
        .body(Body::empty())?)
}
