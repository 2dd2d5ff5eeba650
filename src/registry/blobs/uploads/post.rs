use std::sync::Arc;

use axum::{
    extract::{Path, Query, Request, State},
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
    registry::blobs::uploads::{created_response, session_response},
    state::RegistryState,
    uploads::Initiated,
};

#[derive(Debug, Deserialize)]
pub struct BlobUploadRequest {
    repository: String,
}

#[derive(Debug, Deserialize)]
pub struct BlobUploadPostQuery {
    mount: Option<Digest>,
    from: Option<String>,
    digest: Option<Digest>,
}

/// Starts an upload. Three flavours: a cross-repository mount, a
/// monolithic upload when `digest` is given, or an empty resumable session.
pub(crate) async fn post(
    Path(BlobUploadRequest { repository }): Path<BlobUploadRequest>,
    Query(BlobUploadPostQuery { mount, from, digest }): Query<BlobUploadPostQuery>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
    body: Request,
) -> Result<Response, RegistryError> {
    context.authorize(&repository, Scope::Write)?;

    if let Some(digest) = digest {
        let stream = body.into_body().into_data_stream();
        let size = registry
            .blobs
            .put_blob(&repository, &digest, stream, &context.actor())
            .await
            .inspect_err(|err| {
                registry.audit.record_error(
                    AuditEntry::new(
                        &context,
                        "blob.upload",
                        format!("{repository}@{digest}"),
                        serde_json::Value::Null,
                    ),
                    &err.to_string(),
                )
            })?;

        registry.audit.record(AuditEntry::new(
            &context,
            "blob.upload",
            format!("{repository}@{digest}"),
            json!({ "size": size, "monolithic": true }),
        ));

        return created_response(&repository, &digest.to_string());
    }

    let source = match (&mount, &from) {
        (Some(digest), Some(from)) => {
            context.authorize(from, Scope::Read)?;
            Some((digest, from.as_str()))
        }
        _ => None,
    };

    match registry.uploads.initiate(&repository, source).await? {
        Initiated::Mounted { digest, size } => {
            registry.audit.record(AuditEntry::new(
                &context,
                "blob.mount",
                format!("{repository}@{digest}"),
                json!({ "from": from, "size": size }),
            ));

            created_response(&repository, &digest.to_string())
        }
        Initiated::Session { id } => session_response(StatusCode::ACCEPTED, &repository, &id, 0),
    }
}
