use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Response,
};
use serde::Deserialize;

use crate::{
    auth::{RequestContext, scope::Scope},
    error::RegistryError,
    registry::blobs::uploads::{session_id, session_response},
    state::RegistryState,
};

#[derive(Debug, Deserialize)]
pub struct BlobUploadRequest {
    repository: String,
    upload_id: String,
}

pub(crate) async fn get(
    Path(BlobUploadRequest {
        repository,
        upload_id,
    }): Path<BlobUploadRequest>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
) -> Result<Response, RegistryError> {
    context.authorize(&repository, Scope::Read)?;

    let id = session_id(&upload_id)?;
    let offset = registry.uploads.status(&id, &repository).await?;

    session_response(StatusCode::NO_CONTENT, &repository, &id, offset)
}
