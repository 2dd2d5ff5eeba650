use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::Response,
};
use serde::Deserialize;
use serde_json::json;

use crate::{
    auth::{RequestContext, scope::Scope},
    error::RegistryError,
    state::RegistryState,
};

#[derive(Debug, Deserialize)]
pub struct TagList {
    repository: String,
}

#[derive(Debug, Deserialize)]
pub struct TagQuery {
    last: Option<String>,
    n: Option<usize>,
}

pub(crate) async fn get(
    Path(TagList { repository }): Path<TagList>,
    Query(TagQuery { last, n }): Query<TagQuery>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
) -> Result<Response, RegistryError> {
    context.authorize(&repository, Scope::Read)?;

    let (tags, more) = registry
        .manifests
        .list_tags(&repository, n, last.as_deref())
        .await?;

    let body = json!(
        {
            "name": repository.clone(),
            "tags": tags,
        }
    )
    .to_string();

    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json");

    let builder = match (more, tags.last()) {
        (true, Some(tag)) => {
            let mut fragments = vec![format!("last={tag}")];
            if let Some(n) = n {
                fragments.push(format!("n={n}"));
            }

            builder.header(
                header::LINK,
                format!(
                    "</v2/{repository}/tags/list?{}>; rel=\"next\"",
                    fragments.join("&")
                ),
            )
        }
        _ => builder,
    };

    Ok(builder.body(Body::from(body))?)
}
