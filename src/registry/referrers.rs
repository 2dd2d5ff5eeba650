use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::Response,
};
use serde::Deserialize;

use crate::{
    auth::{RequestContext, scope::Scope},
    digest::Digest,
    error::{Error, RegistryError},
    extractor::OCI_INDEX,
    state::RegistryState,
};

#[derive(Debug, Deserialize)]
pub struct ReferrersRequest {
    repository: String,
    digest: String,
}

#[derive(Debug, Deserialize)]
pub struct ReferrersQuery {
    #[serde(rename = "artifactType")]
    artifact_type: Option<String>,
}

/// Lists the manifests whose subject is `digest`. An unknown subject is an
/// empty index rather than a 404.
pub(crate) async fn get(
    Path(ReferrersRequest { repository, digest }): Path<ReferrersRequest>,
    Query(ReferrersQuery { artifact_type }): Query<ReferrersQuery>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
) -> Result<Response, RegistryError> {
    context.authorize(&repository, Scope::Read)?;

    let digest: Digest = digest.parse().map_err(Error::from)?;
    let (index, filtered) = registry
        .manifests
        .referrers(&repository, &digest, artifact_type.as_deref())
        .await;

    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, OCI_INDEX);

    let builder = if filtered {
        builder.header("OCI-Filters-Applied", "artifactType")
    } else {
        builder
    };

    Ok(builder.body(Body::from(index.to_string()))?)
}
