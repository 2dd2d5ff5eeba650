use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{
    auth::{RequestContext, scope::Scope},
    error::{Error, RegistryError, Resource},
    state::RegistryState,
    store::catalog::project_of,
};

#[derive(Debug, Deserialize)]
pub struct ProjectPath {
    project: String,
}

#[derive(Debug, Deserialize)]
pub struct RepositoryPath {
    project: String,
    repository: String,
}

pub(crate) async fn stats(
    Path(ProjectPath { project }): Path<ProjectPath>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
) -> Result<Json<Value>, RegistryError> {
    context.authorize_project(&project, Scope::Read)?;

    let usage = registry
        .stats
        .get_stats(&project)
        .await?
        .ok_or(Error::NotFound(Resource::Project))?;

    Ok(Json(json!({
        "project": project,
        "image_count": usage.image_count,
        "storage_used": usage.storage_used,
    })))
}

/// Tags with the digest, size and pusher they currently point at.
/// `repository` is the full repository name, percent-encoded when it
/// contains slashes.
pub(crate) async fn tags(
    Path(RepositoryPath {
        project,
        repository,
    }): Path<RepositoryPath>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
) -> Result<Json<Value>, RegistryError> {
    context.authorize_project(&project, Scope::Read)?;

    if project_of(&repository) != project {
        return Err(RegistryError::RepositoryNotFound {});
    }

    let tags = registry.manifests.tag_details(&repository).await?;

    Ok(Json(json!({
        "name": repository,
        "tags": tags,
    })))
}
