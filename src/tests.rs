use std::{ops::Deref, sync::Arc};

use anyhow::{Context, Result, ensure};
use axum::{
    Router,
    body::{Body, Bytes},
    http::{Request, StatusCode, header},
    response::Response,
};
use data_encoding::BASE64;
use futures::stream;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::{TempDir, tempdir};
use tokio::task::JoinSet;
use tower::{Layer, ServiceExt};

use crate::{
    auth::{
        accounts::tests::{SECRET, token, user},
        scope::Scope,
    },
    config::{AuthenticationConfig, Configuration, GarbageConfig},
    digest::Digest,
    extractor::OCI_MANIFEST,
    manifests::{Reference, tests::image},
    registry::{CONTENT_DIGEST_HEADER, RewriteUriLayer, RewriteUriService},
    state::RegistryState,
};

#[derive(Default)]
pub(crate) struct FixtureBuilder {
    authenticated: bool,
}

impl FixtureBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires credentials: `bob` may write to `library`, `alice` is an
    /// administrator. Both use the password `hunter2`.
    pub fn authenticated(mut self, authenticated: bool) -> Self {
        self.authenticated = authenticated;
        self
    }

    pub async fn build(self) -> Result<StateFixture> {
        let dir = tempdir()?;

        let authentication = self.authenticated.then(|| {
            let mut alice = user(2, "alice", &[]);
            alice.admin = true;

            AuthenticationConfig {
                realm: "wharf".into(),
                session_secret: SECRET.into(),
                users: vec![user(1, "bob", &[("library", Scope::Write)]), alice],
                tokens: vec![
                    token("readonly", 1, "wpat_readonly", &["read"]),
                    token("admin", 2, "wpat_admin", &["admin"]),
                ],
            }
        });

        let config = Configuration {
            storage: dir.path().to_path_buf().into(),
            authentication,
            gc: GarbageConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        };

        let mut tasks = JoinSet::new();
        let state = RegistryState::open(config, &mut tasks).await?;

        Ok(StateFixture {
            _dir: dir,
            state,
            tasks,
        })
    }
}

#[must_use = "Fixture must be used and `.teardown().await` must be called to ensure proper cleanup."]
pub(crate) struct StateFixture {
    _dir: TempDir,
    pub state: Arc<RegistryState>,
    tasks: JoinSet<Result<()>>,
}

impl StateFixture {
    pub(crate) async fn new() -> Result<Self> {
        FixtureBuilder::new().build().await
    }

    pub(crate) async fn teardown(mut self) -> Result<()> {
        self.tasks.shutdown().await;
        Ok(())
    }
}

impl Deref for StateFixture {
    type Target = RegistryState;

    fn deref(&self) -> &Self::Target {
        &self.state
    }
}

pub(crate) struct RegistryFixture {
    state: StateFixture,
    pub router: RewriteUriService<Router>,
}

impl RegistryFixture {
    pub async fn new() -> Result<RegistryFixture> {
        Self::with_state(StateFixture::new().await?)
    }

    pub fn with_state(state: StateFixture) -> Result<RegistryFixture> {
        let router = RewriteUriLayer.layer(crate::app(state.state.clone()));

        Ok(RegistryFixture { state, router })
    }

    pub fn state(&self) -> Arc<RegistryState> {
        self.state.state.clone()
    }

    pub async fn request(&self, req: Request<Body>) -> Result<Response> {
        self.router
            .clone()
            .oneshot(req)
            .await
            .context("Failed to make test request")
    }

    pub async fn json(&self, res: Response) -> Result<Value> {
        let body = res.into_body().collect().await?.to_bytes();
        serde_json::from_slice(&body).context("Response was not JSON")
    }

    pub fn basic_header(&self, username: &str, password: &str) -> String {
        format!(
            "Basic {}",
            BASE64.encode(format!("{username}:{password}").as_bytes())
        )
    }

    pub fn bearer_header(&self, token: &str) -> String {
        format!("Bearer {token}")
    }

    /// Stores a blob directly, bypassing the upload endpoints.
    pub async fn upload_blob(&self, repository: &str, data: &[u8]) -> Result<Digest> {
        let digest = Digest::of(data);
        let body = stream::iter(vec![Ok::<_, std::io::Error>(Bytes::copy_from_slice(
            data,
        ))]);
        self.blobs
            .put_blob(repository, &digest, body, "anonymous")
            .await?;
        Ok(digest)
    }

    /// Opens an upload session and returns its location.
    pub async fn start_upload(&self, repository: &str) -> Result<String> {
        let res = self
            .request(
                Request::builder()
                    .method("POST")
                    .uri(format!("/v2/{repository}/blobs/uploads/"))
                    .body(Body::empty())?,
            )
            .await?;
        ensure!(
            res.status() == StatusCode::ACCEPTED,
            "upload not started: {}",
            res.status()
        );

        Ok(res
            .headers()
            .get(header::LOCATION)
            .context("Missing header")?
            .to_str()?
            .to_string())
    }

    /// Pushes a small image with two layers under `tag`. Returns the
    /// manifest digest and the layer digests.
    pub async fn push_image(&self, repository: &str, tag: &str) -> Result<(Digest, Vec<Digest>)> {
        let config = self.upload_blob(repository, b"{}").await?;

        let mut layers = vec![];
        for idx in 0..2 {
            let content = format!("{repository}:{tag} layer {idx}");
            let digest = self.upload_blob(repository, content.as_bytes()).await?;
            layers.push((digest, content.len() as u64));
        }

        let descriptors: Vec<(&Digest, u64)> =
            layers.iter().map(|(digest, size)| (digest, *size)).collect();
        let manifest = image(&config, &descriptors, None);

        let res = self
            .request(
                Request::builder()
                    .method("PUT")
                    .header(header::CONTENT_TYPE, OCI_MANIFEST)
                    .uri(format!("/v2/{repository}/manifests/{tag}"))
                    .body(Body::from(manifest.clone()))?,
            )
            .await?;
        ensure!(
            res.status() == StatusCode::CREATED,
            "push failed: {}",
            res.status()
        );

        Ok((
            Digest::of(&manifest),
            layers.into_iter().map(|(digest, _)| digest).collect(),
        ))
    }

    /// Points another tag at an existing manifest.
    pub async fn tag(&self, repository: &str, tag: &str, digest: &Digest) -> Result<()> {
        let (manifest, bytes) = self
            .manifests
            .get_manifest(repository, &Reference::Digest(digest.clone()))
            .await?;

        let res = self
            .request(
                Request::builder()
                    .method("PUT")
                    .header(header::CONTENT_TYPE, manifest.media_type)
                    .uri(format!("/v2/{repository}/manifests/{tag}"))
                    .body(Body::from(bytes))?,
            )
            .await?;
        ensure!(
            res.status() == StatusCode::CREATED,
            "tag failed: {}",
            res.status()
        );

        Ok(())
    }

    pub async fn teardown(self) -> Result<()> {
        self.state.teardown().await
    }
}

impl Deref for RegistryFixture {
    type Target = RegistryState;

    fn deref(&self) -> &Self::Target {
        &self.state.state
    }
}

mod end_to_end {
    use serde_json::json;
    use test_log::test;

    use super::*;

    async fn upload_chunked(fixture: &RegistryFixture, repository: &str, data: &[u8]) -> Result<Digest> {
        let location = fixture.start_upload(repository).await?;
        let (first, second) = data.split_at(data.len() / 2);

        let res = fixture
            .request(
                Request::builder()
                    .method("PATCH")
                    .uri(&location)
                    .header(header::CONTENT_RANGE, format!("0-{}", first.len() - 1))
                    .body(Body::from(first.to_vec()))?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::ACCEPTED);

        let digest = Digest::of(data);
        let res = fixture
            .request(
                Request::builder()
                    .method("PUT")
                    .uri(format!("{location}?digest={digest}"))
                    .body(Body::from(second.to_vec()))?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::CREATED);

        Ok(digest)
    }

    async fn tags(fixture: &RegistryFixture, repository: &str) -> Result<Value> {
        let res = fixture
            .request(
                Request::builder()
                    .uri(format!("/v2/{repository}/tags/list"))
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::OK);
        Ok(fixture.json(res).await?["tags"].clone())
    }

    #[test(tokio::test)]
    async fn push_list_delete() -> Result<()> {
        let fixture = RegistryFixture::new().await?;

        let config = upload_chunked(&fixture, "myrepo", b"{}").await?;
        let first = upload_chunked(&fixture, "myrepo", b"first layer of the image").await?;
        let second = upload_chunked(&fixture, "myrepo", b"second layer of the image").await?;
        let manifest = image(&config, &[(&first, 24), (&second, 25)], None);

        let res = fixture
            .request(
                Request::builder()
                    .method("PUT")
                    .header(header::CONTENT_TYPE, OCI_MANIFEST)
                    .uri("/v2/myrepo/manifests/v1")
                    .body(Body::from(manifest.clone()))?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::CREATED);
        assert_eq!(
            res.headers()
                .get(CONTENT_DIGEST_HEADER)
                .context("Missing header")?,
            Digest::of(&manifest).to_string().as_str()
        );

        assert_eq!(tags(&fixture, "myrepo").await?, json!(["v1"]));

        let res = fixture
            .request(
                Request::builder()
                    .method("DELETE")
                    .uri("/v2/myrepo/manifests/v1")
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::ACCEPTED);

        assert_eq!(tags(&fixture, "myrepo").await?, json!([]));
        assert!(!fixture.blobs.blob_path(&first).exists());
        assert!(!fixture.blobs.blob_path(&second).exists());

        let res = fixture
            .request(
                Request::builder()
                    .uri(format!("/v2/myrepo/blobs/{first}"))
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        fixture.teardown().await
    }

    #[test(tokio::test)]
    async fn nested_repository_names() -> Result<()> {
        let fixture = RegistryFixture::new().await?;
        let (digest, layers) = fixture.push_image("library/tools/app", "stable").await?;

        let res = fixture
            .request(
                Request::builder()
                    .method("HEAD")
                    .uri(format!("/v2/library/tools/app/blobs/{}", layers[0]))
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::OK);

        let res = fixture
            .request(
                Request::builder()
                    .uri("/v2/library/tools/app/manifests/stable")
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
        assert!(res.headers().contains_key("x-request-id"));

        fixture.teardown().await
    }
}
