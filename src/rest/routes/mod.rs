// rest/routes/mod.rs — route handlers plus the helpers they share.

pub mod health;
pub mod invitations;
pub mod onboarding;

use axum::http::{header, HeaderMap, StatusCode};
use axum::Json;
use serde_json::{json, Value};
use tracing::error;

use crate::onboarding::OnboardingError;
use crate::AppContext;

/// Enforce the bearer token on administrative routes. A daemon without a
/// configured token runs open, for trusted loopback setups.
pub(crate) fn require_admin(
    ctx: &AppContext,
    headers: &HeaderMap,
) -> Result<(), (StatusCode, Json<Value>)> {
    let Some(expected) = ctx.config.admin_token.as_deref() else {
        return Ok(());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    if presented == Some(expected) {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "unauthorized" })),
        ))
    }
}

/// Map the onboarding error taxonomy onto HTTP statuses: user mistakes are
/// 400, transient contention is 409, broken platform state is 500.
pub(crate) fn onboarding_error_response(err: &OnboardingError) -> (StatusCode, Json<Value>) {
    match err {
        OnboardingError::Validation(e) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": e.code() })))
        }
        OnboardingError::Concurrency(e) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": e.code(), "retriable": true })),
        ),
        OnboardingError::Fatal(e) => {
            error!(error = %e, "fatal provisioning failure");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.code() })),
            )
        }
        OnboardingError::Internal(e) => {
            error!(error = %e, "onboarding request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal" })),
            )
        }
    }
}
