use std::{
    sync::LazyLock,
    task::{Context, Poll},
};

use axum::http::{Request, Response, Uri};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use regex::{Captures, Regex};
use tower::Service;
use tracing::warn;

/// Matches the repository part of a registry path. Non-greedy so a
/// repository that itself contains `/blobs` is split at the first endpoint
/// segment.
static REPOSITORY_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(^/v2/)(.+?)(/(manifests|blobs|tags|referrers)(/.*)?$)").unwrap()
});

/// Percent-encodes repository names so that names containing slashes fit
/// into a single path segment for routing.
pub(crate) fn rewrite_path(path: &str) -> String {
    REPOSITORY_PATH
        .replace(path, |caps: &Captures| {
            let prefix = &caps[1];
            let encoded = utf8_percent_encode(&caps[2], NON_ALPHANUMERIC).to_string();
            let suffix = &caps[3];

            format!("{prefix}{encoded}{suffix}")
        })
        .into_owned()
}

#[derive(Clone)]
pub(crate) struct RewriteUriLayer;

impl<S> tower::Layer<S> for RewriteUriLayer {
    type Service = RewriteUriService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RewriteUriService { inner }
    }
}

#[derive(Clone)]
pub(crate) struct RewriteUriService<S> {
    inner: S,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RewriteUriService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    #[inline]
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        let uri = req.uri();
        let path = rewrite_path(uri.path());

        if path != uri.path() {
            let rewritten = match uri.query() {
                Some(query) => format!("{path}?{query}"),
                None => path,
            };

            match rewritten.parse::<Uri>() {
                Ok(new_uri) => *req.uri_mut() = new_uri,
                Err(err) => warn!("Unable to rewrite {uri}: {err}"),
            }
        }

        self.inner.call(req)
    }
}

#[cfg(test)]
mod tests {
    use crate::error::RegistryError;

    use super::*;
    use axum::{
        Router,
        body::Body,
        extract::{Path, Query},
        http::{Request, StatusCode},
        response::Response,
    };
    use http_body_util::BodyExt;
    use serde::Deserialize;
    use tower::ServiceExt;

    #[derive(Debug, Deserialize)]
    pub struct ManifestGetRequest {
        repository: String,
        reference: String,
    }

    #[derive(Debug, Deserialize)]
    pub struct QueryRequest {
        bob: Option<String>,
    }

    pub(crate) async fn echo_path(
        Path(ManifestGetRequest {
            repository,
            reference,
        }): Path<ManifestGetRequest>,
        Query(QueryRequest { bob }): Query<QueryRequest>,
    ) -> Result<Response, RegistryError> {
        let resp = format!("{repository}:{reference}\n{bob:?}");
        Ok(Response::builder()
            .status(StatusCode::OK)
            .body(Body::from(resp))?)
    }

    async fn echo(uri: &str) -> String {
        let app = Router::new().route(
            "/v2/{repository}/manifests/{reference}",
            axum::routing::get(echo_path),
        );

        let app = tower::ServiceBuilder::new()
            .layer(RewriteUriLayer)
            .service(app);

        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();

        let res = app.oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let body = res.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_uri_rewriting() {
        assert_eq!(
            echo("/v2/some/repo/manifests/latest").await,
            "some/repo:latest\nNone"
        );
    }

    #[tokio::test]
    async fn test_uri_rewriting_with_query() {
        assert_eq!(
            echo("/v2/some/repo/manifests/latest?bob=uncertain").await,
            "some/repo:latest\nSome(\"uncertain\")"
        );
    }

    #[test]
    fn rewrites() {
        assert_eq!(rewrite_path("/"), "/");
        assert_eq!(rewrite_path("/v2/"), "/v2/");
        assert_eq!(rewrite_path("/v2/foo/tags/list"), "/v2/foo/tags/list");
        assert_eq!(
            rewrite_path("/v2/foo/bar/blobs/uploads/"),
            "/v2/foo%2Fbar/blobs/uploads/"
        );
        assert_eq!(
            rewrite_path("/v2/a/b/c/referrers/sha256:abc"),
            "/v2/a%2Fb%2Fc/referrers/sha256:abc"
        );
        assert_eq!(
            rewrite_path("/v2/a/manifests/sha256:abc/referrers"),
            "/v2/a/manifests/sha256:abc/referrers"
        );
        assert_eq!(rewrite_path("/api/v1/events"), "/api/v1/events");
    }
}
