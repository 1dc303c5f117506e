// rest/routes/invitations.rs — invitation administration and the public
// token validation used by the acceptance form.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::error;

use crate::invitations::{
    CreateInvitationError, Invitation, InvitationStatus, InvitationType, NewInvitation,
    RevokeOutcome,
};
use crate::AppContext;

use super::{onboarding_error_response, require_admin};

#[derive(Deserialize)]
pub struct CreateInvitationRequest {
    pub email: String,
    pub full_name: String,
    pub invitation_type: String,
    pub tenant_id: Option<String>,
    pub issued_by: Option<String>,
    pub metadata: Option<Value>,
}

pub async fn create_invitation(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(body): Json<CreateInvitationRequest>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    require_admin(&ctx, &headers)?;
    let Some(invitation_type) = InvitationType::parse(&body.invitation_type) else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid_invitation_type" })),
        ));
    };

    match ctx
        .invitations
        .create(NewInvitation {
            email: body.email,
            full_name: body.full_name,
            invitation_type,
            tenant_id: body.tenant_id,
            issued_by: body.issued_by,
            metadata: body.metadata,
        })
        .await
    {
        Ok(invitation) => Ok((
            StatusCode::CREATED,
            Json(json!({
                "invitation_id": invitation.id,
                "token": invitation.token,
                "expires_at": invitation.expires_at.to_rfc3339(),
            })),
        )),
        Err(err @ CreateInvitationError::DuplicateActive) => Err((
            StatusCode::CONFLICT,
            Json(json!({ "error": err.code() })),
        )),
        Err(err @ (CreateInvitationError::MissingTenant | CreateInvitationError::InvalidEmail)) => {
            Err((StatusCode::BAD_REQUEST, Json(json!({ "error": err.code() }))))
        }
        Err(CreateInvitationError::Internal(err)) => {
            error!(error = %err, "invitation creation failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal" })),
            ))
        }
    }
}

#[derive(Deserialize)]
pub struct ValidateQuery {
    pub token: String,
    /// When present, must match the invitation's email.
    pub email: Option<String>,
}

pub async fn validate_invitation(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<ValidateQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match ctx.handler.validate(&query.token, query.email.as_deref()).await {
        Ok(invitation) => Ok(Json(json!({
            "email": invitation.email,
            "full_name": invitation.full_name,
            "tenant_id": invitation.tenant_id,
            "invitation_type": invitation.invitation_type.as_str(),
        }))),
        Err(err) => Err(onboarding_error_response(&err)),
    }
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

pub async fn list_invitations(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    require_admin(&ctx, &headers)?;
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => match InvitationStatus::parse(raw) {
            Some(status) => Some(status),
            None => {
                return Err((
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": "invalid_status" })),
                ))
            }
        },
    };

    match ctx.invitations.list(status).await {
        Ok(invitations) => {
            let list: Vec<Value> = invitations.iter().map(invitation_summary).collect();
            Ok(Json(json!({ "invitations": list })))
        }
        Err(err) => {
            error!(error = %err, "invitation listing failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal" })),
            ))
        }
    }
}

pub async fn revoke_invitation(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    require_admin(&ctx, &headers)?;
    match ctx.invitations.revoke(&id).await {
        Ok(RevokeOutcome::Revoked) => Ok(Json(json!({
            "invitation_id": id,
            "status": "revoked",
        }))),
        Ok(RevokeOutcome::NotPending(status)) => Err((
            StatusCode::CONFLICT,
            Json(json!({ "error": "not_pending", "status": status.as_str() })),
        )),
        Ok(RevokeOutcome::NotFound) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "invitation_not_found" })),
        )),
        Err(err) => {
            error!(error = %err, invitation_id = %id, "invitation revoke failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal" })),
            ))
        }
    }
}

/// Administrative listing entry. The token is deliberately omitted: it is
/// shown once at creation and otherwise lives only in the invitation email.
fn invitation_summary(invitation: &Invitation) -> Value {
    json!({
        "id": invitation.id,
        "email": invitation.email,
        "full_name": invitation.full_name,
        "tenant_id": invitation.tenant_id,
        "invitation_type": invitation.invitation_type.as_str(),
        "status": invitation.status.as_str(),
        "issued_by": invitation.issued_by,
        "expires_at": invitation.expires_at.to_rfc3339(),
        "accepted_at": invitation.accepted_at.map(|t| t.to_rfc3339()),
        "created_at": invitation.created_at.to_rfc3339(),
    })
}
