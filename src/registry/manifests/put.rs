use std::sync::Arc;

use axum::{
    body::{Body, to_bytes},
    extract::{Path, Request, State},
    http::{StatusCode, header},
    response::Response,
};
use serde::Deserialize;

use crate::{
    auth::{RequestContext, scope::Scope},
    error::RegistryError,
    extractor::MAX_MANIFEST_SIZE,
    manifests::Reference,
    registry::CONTENT_DIGEST_HEADER,
    state::RegistryState,
};

#[derive(Debug, Deserialize)]
pub struct ManifestPutRequest {
    repository: String,
    reference: String,
}

/*
201 Created
Location: /v2/<name>/manifests/<digest>
Docker-Content-Digest: <digest>
OCI-Subject: <subject digest>
*/

pub(crate) async fn put(
    Path(ManifestPutRequest {
        repository,
        reference,
    }): Path<ManifestPutRequest>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
    body: Request,
) -> Result<Response, RegistryError> {
    context.authorize(&repository, Scope::Write)?;

    let reference: Reference = reference.parse()?;

    let content_type = body
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string());

    let bytes = to_bytes(body.into_body(), MAX_MANIFEST_SIZE)
        .await
        .map_err(|err| RegistryError::ManifestInvalid {
            detail: format!("unable to read manifest: {err}"),
        })?;

    let pushed = registry
        .manifests
        .put_manifest(
            &repository,
            &reference,
            content_type.as_deref(),
            &bytes,
            &context,
        )
        .await?;

    let builder = Response::builder()
        .status(StatusCode::CREATED)
        .header(
            header::LOCATION,
            format!("/v2/{repository}/manifests/{}", pushed.digest),
        )
        .header(header::CONTENT_LENGTH, "0")
        .header(CONTENT_DIGEST_HEADER, pushed.digest.to_string());

    let builder = match &pushed.subject {
        Some(subject) => builder.header("OCI-Subject", subject.to_string()),
        None => builder,
    };

    Ok(builder.body(Body::empty())?)
}
