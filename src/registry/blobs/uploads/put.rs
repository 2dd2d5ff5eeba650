use std::sync::Arc;

use axum::{
    extract::{Path, Query, Request, State},
    response::Response,
};
use serde::Deserialize;
use serde_json::json;

use crate::{
    audit::AuditEntry,
    auth::{RequestContext, scope::Scope},
    digest::Digest,
    error::RegistryError,
    registry::blobs::uploads::{created_response, session_id},
    state::RegistryState,
};

#[derive(Debug, Deserialize)]
pub struct BlobUploadRequest {
    repository: String,
    upload_id: String,
}

#[derive(Debug, Deserialize)]
pub struct BlobUploadPutQuery {
    digest: Option<Digest>,
}

/// Closes an upload session, appending whatever is in the body first.
pub(crate) async fn put(
    Path(BlobUploadRequest {
        repository,
        upload_id,
    }): Path<BlobUploadRequest>,
    Query(BlobUploadPutQuery { digest }): Query<BlobUploadPutQuery>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
    body: Request,
) -> Result<Response, RegistryError> {
    context.authorize(&repository, Scope::Write)?;

    let id = session_id(&upload_id)?;
    let Some(digest) = digest else {
        return Err(RegistryError::UploadInvalid {
            detail: "the digest query parameter is required".into(),
        });
    };

    let entry = |details| {
        AuditEntry::new(
            &context,
            "blob.upload",
            format!("{repository}@{digest}"),
            details,
        )
    };

    let stream = body.into_body().into_data_stream();
    let size = match registry
        .uploads
        .complete(&id, &repository, &digest, stream, &context.actor())
        .await
    {
        Ok(size) => size,
        Err(err) => {
            registry
                .audit
                .record_error(entry(serde_json::Value::Null), &err.to_string());
            return Err(err.into());
        }
    };

    registry
        .audit
        .record(entry(json!({ "size": size, "upload_id": id })));

    created_response(&repository, &digest.to_string())
}

#[cfg(test)]
mod test {
    use anyhow::{Context, Result};
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use test_log::test;

    use crate::tests::RegistryFixture;

    use super::*;

    #[test(tokio::test)]
    pub async fn put_completes_session() -> Result<()> {
        let fixture = RegistryFixture::new().await?;
        let location = fixture.start_upload("foo").await?;

        let res = fixture
            .request(
                Request::builder()
                    .method("PATCH")
                    .uri(&location)
                    .body(Body::from("hello "))?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::ACCEPTED);

        let digest = Digest::of(b"hello world");
        let res = fixture
            .request(
                Request::builder()
                    .method("PUT")
                    .uri(format!("{location}?digest={digest}"))
                    .body(Body::from("world"))?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::CREATED);
        assert_eq!(
            res.headers().get("Location").context("Missing header")?,
            format!("/v2/foo/blobs/{digest}").as_str()
        );
        assert_eq!(fixture.blobs.check_blob("foo", &digest).await?, 11);

        fixture.teardown().await
    }

    #[test(tokio::test)]
    pub async fn put_wrong_digest_can_be_retried() -> Result<()> {
        let fixture = RegistryFixture::new().await?;
        let location = fixture.start_upload("foo").await?;

        let wrong = Digest::of(b"nope");
        let res = fixture
            .request(
                Request::builder()
                    .method("PUT")
                    .uri(format!("{location}?digest={wrong}"))
                    .body(Body::from("payload"))?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let digest = Digest::of(b"payload");
        let res = fixture
            .request(
                Request::builder()
                    .method("PUT")
                    .uri(format!("{location}?digest={digest}"))
                    .body(Body::from("payload"))?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::CREATED);

        fixture.teardown().await
    }

    #[test(tokio::test)]
    pub async fn put_needs_digest() -> Result<()> {
        let fixture = RegistryFixture::new().await?;
        let location = fixture.start_upload("foo").await?;

        let res = fixture
            .request(
                Request::builder()
                    .method("PUT")
                    .uri(&location)
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        fixture.teardown().await
    }
}
