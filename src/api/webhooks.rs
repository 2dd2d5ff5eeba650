use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::{
    audit::AuditEntry,
    auth::{RequestContext, credential::Credential, scope::Scope},
    error::RegistryError,
    state::RegistryState,
    webhook::{WebhookSpec, model::Webhook},
};

#[derive(Debug, Deserialize)]
pub struct ProjectPath {
    project: String,
}

#[derive(Debug, Deserialize)]
pub struct WebhookPath {
    project: String,
    id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct EventPath {
    id: Uuid,
}

/// Secrets are write-only.
fn view(webhook: &Webhook) -> Value {
    json!({
        "id": webhook.id,
        "project": webhook.project,
        "name": webhook.name,
        "url": webhook.url,
        "has_secret": webhook.secret.is_some(),
        "events": webhook.events,
        "retry": webhook.retry,
        "active": webhook.active,
        "created_at": webhook.created_at,
        "updated_at": webhook.updated_at,
    })
}

pub(crate) async fn list(
    Path(ProjectPath { project }): Path<ProjectPath>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
) -> Result<Json<Value>, RegistryError> {
    context.authorize_project(&project, Scope::Admin)?;

    let webhooks = registry.webhooks.list_webhooks(&project).await;

    Ok(Json(Value::Array(webhooks.iter().map(view).collect())))
}

pub(crate) async fn create(
    Path(ProjectPath { project }): Path<ProjectPath>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
    Json(spec): Json<WebhookSpec>,
) -> Result<Response, RegistryError> {
    context.authorize_project(&project, Scope::Admin)?;

    let webhook = registry.webhooks.create_webhook(&project, spec).await?;

    registry.audit.record(AuditEntry::new(
        &context,
        "webhook.create",
        format!("{project}/webhooks/{}", webhook.id),
        json!({"name": webhook.name, "url": webhook.url}),
    ));

    Ok((StatusCode::CREATED, Json(view(&webhook))).into_response())
}

pub(crate) async fn get(
    Path(WebhookPath { project, id }): Path<WebhookPath>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
) -> Result<Json<Value>, RegistryError> {
    context.authorize_project(&project, Scope::Admin)?;

    let webhook = registry.webhooks.get_webhook(&project, &id).await?;

    Ok(Json(view(&webhook)))
}

pub(crate) async fn update(
    Path(WebhookPath { project, id }): Path<WebhookPath>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
    Json(spec): Json<WebhookSpec>,
) -> Result<Json<Value>, RegistryError> {
    context.authorize_project(&project, Scope::Admin)?;

    let webhook = registry.webhooks.update_webhook(&project, &id, spec).await?;

    registry.audit.record(AuditEntry::new(
        &context,
        "webhook.update",
        format!("{project}/webhooks/{id}"),
        json!({"name": webhook.name, "url": webhook.url, "active": webhook.active}),
    ));

    Ok(Json(view(&webhook)))
}

pub(crate) async fn delete(
    Path(WebhookPath { project, id }): Path<WebhookPath>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
) -> Result<StatusCode, RegistryError> {
    context.authorize_project(&project, Scope::Admin)?;

    registry.webhooks.delete_webhook(&project, &id).await?;

    registry.audit.record(AuditEntry::new(
        &context,
        "webhook.delete",
        format!("{project}/webhooks/{id}"),
        Value::Null,
    ));

    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn test(
    Path(WebhookPath { project, id }): Path<WebhookPath>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
) -> Result<Json<Value>, RegistryError> {
    context.authorize_project(&project, Scope::Admin)?;

    let (event, delivery) = registry.webhooks.test_webhook(&project, &id).await?;

    Ok(Json(json!({
        "event": event,
        "delivery": delivery,
    })))
}

pub(crate) async fn events(
    Path(WebhookPath { project, id }): Path<WebhookPath>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
) -> Result<Json<Value>, RegistryError> {
    context.authorize_project(&project, Scope::Admin)?;

    let events = registry.webhooks.list_events(&project, &id).await?;

    Ok(Json(json!(events)))
}

pub(crate) async fn deliveries(
    Path(EventPath { id }): Path<EventPath>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
) -> Result<Json<Value>, RegistryError> {
    // Challenge before revealing whether the event exists
    if matches!(context.credential, Credential::Anonymous) {
        return Err(RegistryError::MustAuthenticate {
            challenge: context.challenge(Some(Scope::Admin)),
        });
    }

    let (project, deliveries) = registry.webhooks.list_deliveries(&id).await?;
    context.authorize_project(&project, Scope::Admin)?;

    Ok(Json(json!(deliveries)))
}
