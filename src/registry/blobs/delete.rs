use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::StatusCode,
    response::Response,
};
use serde::Deserialize;
use serde_json::json;

use crate::{
    audit::AuditEntry,
    auth::{RequestContext, scope::Scope},
    digest::Digest,
    error::RegistryError,
    state::RegistryState,
    store::catalog::project_of,
};

#[derive(Debug, Deserialize)]
pub struct BlobRequest {
    repository: String,
    digest: Digest,
}

/// Unlinks a blob from the repository. Blobs still listed by a manifest
/// stay where they are and the request still succeeds.
pub(crate) async fn delete(
    Path(BlobRequest { repository, digest }): Path<BlobRequest>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
) -> Result<Response, RegistryError> {
    context.authorize(&repository, Scope::Delete)?;

    let entry = |details| {
        AuditEntry::new(
            &context,
            "blob.delete",
            format!("{repository}@{digest}"),
            details,
        )
    };

    let outcome = match registry.blobs.delete_blob(&repository, &digest).await {
        Ok(outcome) => outcome,
        Err(err) => {
            registry
                .audit
                .record_error(entry(serde_json::Value::Null), &err.to_string());
            return Err(err.into());
        }
    };

    registry
        .audit
        .record(entry(json!({ "outcome": format!("{outcome:?}") })));
    registry
        .manifests
        .refresh_stats(project_of(&repository))
        .await;

    Ok(Response::builder()
        .status(StatusCode::ACCEPTED)
        .body(Body::empty())?)
}
