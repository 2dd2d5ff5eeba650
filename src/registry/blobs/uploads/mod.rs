use axum::{body::Body, http::StatusCode, response::Response};
use uuid::Uuid;

use crate::{
    error::RegistryError,
    registry::{CONTENT_DIGEST_HEADER, UPLOAD_UUID_HEADER},
};

pub(crate) mod delete;
pub(crate) mod get;
pub(crate) mod patch;
pub(crate) mod post;
pub(crate) mod put;

/// Upload ids are uuids; anything else can't name a session.
fn session_id(upload_id: &str) -> Result<Uuid, RegistryError> {
    upload_id
        .parse()
        .map_err(|_| RegistryError::UploadNotFound {})
}

/*
202 Accepted / 204 No Content
Location: /v2/<name>/blobs/uploads/<uuid>
Range: 0-<offset>
Content-Length: 0
Docker-Upload-UUID: <uuid>
*/
fn session_response(
    status: StatusCode,
    repository: &str,
    id: &Uuid,
    offset: u64,
) -> Result<Response, RegistryError> {
    let range_end = offset.saturating_sub(1);

    Ok(Response::builder()
        .status(status)
        .header("Location", format!("/v2/{repository}/blobs/uploads/{id}"))
        .header("Range", format!("0-{range_end}"))
        .header("Content-Length", "0")
        .header(UPLOAD_UUID_HEADER, id.to_string())
        .body(Body::empty())?)
}

/*
201 Created
Location: /v2/<name>/blobs/<digest>
Content-Length: 0
Docker-Content-Digest: <digest>
*/
fn created_response(repository: &str, digest: &str) -> Result<Response, RegistryError> {
    Ok(Response::builder()
        .status(StatusCode::CREATED)
        .header("Location", format!("/v2/{repository}/blobs/{digest}"))
        .header("Content-Length", "0")
        .header(CONTENT_DIGEST_HEADER, digest)
        .body(Body::empty())?)
}
