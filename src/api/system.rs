use std::sync::Arc;

use axum::{Json, extract::State};
use serde_json::json;

use crate::{
    audit::AuditEntry,
    auth::RequestContext,
    error::RegistryError,
    garbage::GarbageReport,
    state::RegistryState,
};

/// Runs a collection pass now and reports what it reclaimed.
pub(crate) async fn gc(
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
) -> Result<Json<GarbageReport>, RegistryError> {
    context.authorize_admin()?;

    let report = registry.garbage.collect().await?;

    registry.audit.record(AuditEntry::new(
        &context,
        "system.gc",
        "system".to_string(),
        json!(report),
    ));

    Ok(Json(report))
}
