use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{StatusCode, header},
    response::Response,
};
use axum_extra::TypedHeader;
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::{
    auth::{RequestContext, scope::Scope},
    digest::Digest,
    error::RegistryError,
    registry::{CONTENT_DIGEST_HEADER, content_range::ByteRange},
    state::RegistryState,
};

/*
200 OK
Docker-Content-Digest: <digest>
Content-Type: application/octet-stream

...

206 Partial Content
Content-Range: bytes <start>-<end>/<size>
*/

#[derive(Debug, Deserialize)]
pub struct BlobRequest {
    repository: String,
    digest: Digest,
}

pub(crate) async fn get(
    Path(BlobRequest { repository, digest }): Path<BlobRequest>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
    range: Option<TypedHeader<ByteRange>>,
) -> Result<Response, RegistryError> {
    context.authorize(&repository, Scope::Read)?;

    let range = match range {
        Some(TypedHeader(range)) => {
            let size = registry.blobs.check_blob(&repository, &digest).await?;
            match range.resolve(size) {
                Some(span) => Some(span),
                None => return Err(RegistryError::BlobRangeNotSatisfiable { size }),
            }
        }
        None => None,
    };

    let blob = registry.blobs.get_blob(&repository, &digest, range).await?;

    debug!(%digest, size = blob.size, ?range, "Starting blob stream");

    let builder = Response::builder()
        .header(CONTENT_DIGEST_HEADER, digest.to_string())
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::ACCEPT_RANGES, "bytes");

    let builder = match blob.range {
        Some((first, last)) => builder
            .status(StatusCode::PARTIAL_CONTENT)
            .header(
                header::CONTENT_RANGE,
                format!("bytes {first}-{last}/{}", blob.size),
            )
            .header(header::CONTENT_LENGTH, last - first + 1),
        None => builder
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, blob.size),
    };

    Ok(builder.body(Body::from_stream(ReaderStream::new(blob.reader)))?)
}

#[cfg(test)]
mod test {
    use anyhow::{Context, Result};
    use axum::http::Request;
    use http_body_util::BodyExt;
    use test_log::test;

    use crate::tests::{FixtureBuilder, RegistryFixture};

    use super::*;

    #[test(tokio::test)]
    pub async fn get_blob_please_auth() -> Result<()> {
        let fixture =
            RegistryFixture::with_state(FixtureBuilder::new().authenticated(true).build().await?)?;

        let res = fixture
            .request(
                Request::builder()
                    .uri(format!("/v2/bar/blobs/{}", Digest::of(b"x")))
                    .body(Body::empty())?,
            )
            .await?;

        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            res.headers()
                .get("Www-Authenticate")
                .context("Missing header")?,
            "Basic realm=\"wharf\",scope=\"read\""
        );

        fixture.teardown().await
    }

    #[test(tokio::test)]
    pub async fn get_blob_not_linked() -> Result<()> {
        let fixture = RegistryFixture::new().await?;
        let digest = fixture.upload_blob("foo", b"hello world").await?;

        let res = fixture
            .request(
                Request::builder()
                    .uri(format!("/v2/bar/blobs/{digest}"))
                    .body(Body::empty())?,
            )
            .await?;

        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        fixture.teardown().await
    }

    #[test(tokio::test)]
    pub async fn get_blob_ranges() -> Result<()> {
        let fixture = RegistryFixture::new().await?;
        let digest = fixture.upload_blob("foo/bar", b"hello world").await?;

        let res = fixture
            .request(
                Request::builder()
                    .uri(format!("/v2/foo/bar/blobs/{digest}"))
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            res.headers()
                .get(CONTENT_DIGEST_HEADER)
                .context("Missing header")?,
            digest.to_string().as_str()
        );
        let body = res.into_body().collect().await?.to_bytes();
        assert_eq!(&body[..], b"hello world");

        let res = fixture
            .request(
                Request::builder()
                    .uri(format!("/v2/foo/bar/blobs/{digest}"))
                    .header("Range", "bytes=6-")
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            res.headers()
                .get(header::CONTENT_RANGE)
                .context("Missing header")?,
            "bytes 6-10/11"
        );
        let body = res.into_body().collect().await?.to_bytes();
        assert_eq!(&body[..], b"world");

        let res = fixture
            .request(
                Request::builder()
                    .uri(format!("/v2/foo/bar/blobs/{digest}"))
                    .header("Range", "bytes=-5")
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::PARTIAL_CONTENT);
        let body = res.into_body().collect().await?.to_bytes();
        assert_eq!(&body[..], b"world");

        let res = fixture
            .request(
                Request::builder()
                    .uri(format!("/v2/foo/bar/blobs/{digest}"))
                    .header("Range", "bytes=20-30")
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(
            res.headers()
                .get(header::CONTENT_RANGE)
                .context("Missing header")?,
            "bytes */11"
        );

        fixture.teardown().await
    }
}
