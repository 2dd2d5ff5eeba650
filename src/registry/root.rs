use axum::{
    body::Body,
    http::{Response, StatusCode},
};

use crate::{
    auth::{RequestContext, credential::Credential},
    error::RegistryError,
    registry::API_VERSION_HEADER,
};

/// Version check. With authentication enabled, anonymous callers get a
/// challenge so clients know to log in.
pub async fn get(context: RequestContext) -> Result<Response<Body>, RegistryError> {
    if matches!(context.credential, Credential::Anonymous) {
        return Err(RegistryError::MustAuthenticate {
            challenge: context.challenge(None),
        });
    }

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(API_VERSION_HEADER, "registry/2.0")
        .body(Body::empty())?)
}

#[cfg(test)]
mod test {
    use anyhow::{Context, Result};
    use axum::http::Request;
    use test_log::test;

    use crate::tests::{FixtureBuilder, RegistryFixture};

    use super::*;

    #[test(tokio::test)]
    pub async fn get() -> Result<()> {
        let fixture = RegistryFixture::new().await?;

        let res = fixture
            .request(Request::builder().uri("/v2/").body(Body::empty())?)
            .await?;

        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            res.headers().get(API_VERSION_HEADER).context("Missing header")?,
            "registry/2.0"
        );

        fixture.teardown().await
    }

    #[test(tokio::test)]
    pub async fn get_please_auth() -> Result<()> {
        let fixture =
            RegistryFixture::with_state(FixtureBuilder::new().authenticated(true).build().await?)?;

        let res = fixture
            .request(Request::builder().uri("/v2/").body(Body::empty())?)
            .await?;

        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            res.headers()
                .get("Www-Authenticate")
                .context("Missing header")?,
            "Basic realm=\"wharf\""
        );

        let res = fixture
            .request(
                Request::builder()
                    .uri("/v2/")
                    .header("Authorization", fixture.basic_header("bob", "hunter2"))
                    .body(Body::empty())?,
            )
            .await?;

        assert_eq!(res.status(), StatusCode::OK);

        fixture.teardown().await
    }
}
