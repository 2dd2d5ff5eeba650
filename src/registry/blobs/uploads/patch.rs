use std::sync::Arc;

use axum::{
    extract::{Path, Request, State},
    http::StatusCode,
    response::Response,
};
use axum_extra::TypedHeader;
use serde::Deserialize;

use crate::{
    auth::{RequestContext, scope::Scope},
    error::{Error, RegistryError},
    registry::{
        blobs::uploads::{session_id, session_response},
        content_range::ContentRange,
    },
    state::RegistryState,
};

#[derive(Debug, Deserialize)]
pub struct BlobUploadRequest {
    repository: String,
    upload_id: String,
}

pub(crate) async fn patch(
    Path(BlobUploadRequest {
        repository,
        upload_id,
    }): Path<BlobUploadRequest>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
    content_range: Option<TypedHeader<ContentRange>>,
    body: Request,
) -> Result<Response, RegistryError> {
    context.authorize(&repository, Scope::Write)?;

    let id = session_id(&upload_id)?;
    let range = content_range.map(|TypedHeader(range)| (range.first_byte, range.last_byte));

    let stream = body.into_body().into_data_stream();
    let size = match registry
        .uploads
        .append(&id, &repository, range, stream)
        .await
    {
        Ok(size) => size,
        Err(Error::RangeMismatch { offset }) => {
            return Err(RegistryError::RangeNotSatisfiable {
                repository,
                upload_id,
                size: offset,
            });
        }
        Err(err) => return Err(err.into()),
    };

    session_response(StatusCode::ACCEPTED, &repository, &id, size)
}
