// rest/routes/onboarding.rs — the confirmation webhook and the operator
// repair/stats tooling.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::error;

use crate::onboarding::{ConfirmationEvent, ProvisioningResult, RepairOutcome};
use crate::AppContext;

use super::{onboarding_error_response, require_admin};

/// Identity-provider webhook. Explicitly idempotent: redeliveries and
/// operator replays with the same body return the same result.
pub async fn confirm(
    State(ctx): State<Arc<AppContext>>,
    Json(event): Json<ConfirmationEvent>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match ctx.handler.handle(&event).await {
        Ok(result) => Ok(Json(result_json(&result))),
        Err(err) => Err(onboarding_error_response(&err)),
    }
}

#[derive(Deserialize)]
pub struct RepairRequest {
    pub invitation_id: String,
}

pub async fn repair(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(body): Json<RepairRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    require_admin(&ctx, &headers)?;
    match ctx.handler.repair(&body.invitation_id).await {
        Ok(RepairOutcome::Repaired(result)) => {
            let mut value = result_json(&result);
            value["repaired"] = json!(true);
            Ok(Json(value))
        }
        Ok(RepairOutcome::AlreadyComplete(result)) => {
            let mut value = result_json(&result);
            value["repaired"] = json!(false);
            Ok(Json(value))
        }
        Ok(RepairOutcome::NotAccepted(status)) => Err((
            StatusCode::CONFLICT,
            Json(json!({ "error": "not_provisioned", "status": status.as_str() })),
        )),
        Ok(RepairOutcome::NotFound) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "invitation_not_found" })),
        )),
        Err(err) => Err(onboarding_error_response(&err)),
    }
}

pub async fn stats(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    require_admin(&ctx, &headers)?;
    match ctx.storage.onboarding_stats().await {
        Ok(stats) => Ok(Json(json!({
            "invitations": {
                "pending": stats.invitations_pending,
                "accepted": stats.invitations_accepted,
                "expired": stats.invitations_expired,
                "revoked": stats.invitations_revoked,
            },
            "tenants": stats.tenants,
            "profiles": stats.profiles,
            "employees": stats.employees,
            "partial_provisions": stats.partial_provisions,
        }))),
        Err(err) => {
            error!(error = %err, "stats query failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal" })),
            ))
        }
    }
}

fn result_json(result: &ProvisioningResult) -> Value {
    json!({
        "invitation_id": result.invitation_id,
        "tenant_id": result.tenant_id,
        "user_id": result.user_id,
        "role_id": result.role_id,
        "role": result.role,
        "employee_code": result.employee_code,
        "status": result.status.as_str(),
    })
}
