use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, StreamExt};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::{auth::RequestContext, error::RegistryError, state::RegistryState};

/// Live feed of push and delete events as server-sent events. Each event
/// is named after its kind and carries the JSON encoded event as data.
pub(crate) async fn stream(
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, RegistryError> {
    context.authorize_admin()?;

    let receiver = registry.broker.subscribe().await?;
    debug!(actor = context.actor(), "Event stream subscribed");

    let events = ReceiverStream::new(receiver).filter_map(|event| async move {
        match Event::default()
            .event(event.kind.to_string())
            .id(event.id.to_string())
            .json_data(&event)
        {
            Ok(sse) => Some(Ok(sse)),
            Err(err) => {
                warn!(event = %event.id, "Unable to encode event: {err}");
                None
            }
        }
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use anyhow::{Context, Result};
    use axum::{
        body::Body,
        http::{Request, StatusCode, header},
    };
    use test_log::test;
    use tokio::time::timeout;

    use crate::tests::{FixtureBuilder, RegistryFixture};

    use super::*;

    #[test(tokio::test)]
    pub async fn streams_pushes() -> Result<()> {
        let fixture = RegistryFixture::new().await?;

        let res = fixture
            .request(Request::builder().uri("/api/v1/events").body(Body::empty())?)
            .await?;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            res.headers()
                .get(header::CONTENT_TYPE)
                .context("Missing header")?,
            "text/event-stream"
        );

        let (digest, _) = fixture.push_image("library/app", "v1").await?;

        let mut body = res.into_body().into_data_stream();
        let frame = timeout(Duration::from_secs(5), body.next())
            .await?
            .context("Stream ended")??;
        let frame = String::from_utf8(frame.to_vec())?;

        assert!(frame.contains("event: push"));
        assert!(frame.contains(&digest.to_string()));
        assert!(frame.contains("\"repository\":\"library/app\""));

        fixture.teardown().await
    }

    #[test(tokio::test)]
    pub async fn stream_needs_admin() -> Result<()> {
        let fixture =
            RegistryFixture::with_state(FixtureBuilder::new().authenticated(true).build().await?)?;

        let res = fixture
            .request(
                Request::builder()
                    .uri("/api/v1/events")
                    .header("Authorization", fixture.basic_header("bob", "hunter2"))
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);

        let res = fixture
            .request(
                Request::builder()
                    .uri("/api/v1/events")
                    .header("Authorization", fixture.bearer_header("wpat_admin"))
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::OK);

        fixture.teardown().await
    }
}
