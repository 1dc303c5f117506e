use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::invitations::{Invitation, InvitationStatus, InvitationStore};

use super::error::{OnboardingError, ValidationError};

/// Validates presented invitation tokens. Checks run in a fixed order so
/// callers always see the most specific rejection: unknown token, then
/// expiry, then prior settlement, then email mismatch.
pub struct TokenValidator {
    store: Arc<InvitationStore>,
}

impl TokenValidator {
    pub fn new(store: Arc<InvitationStore>) -> Self {
        Self { store }
    }

    /// Validate a token and, when given, the email presenting it. Expiry is
    /// judged against the deadline at the moment of the call, so a pending
    /// row past its deadline is rejected (and flipped to `expired`) even
    /// before the sweeper has seen it.
    pub async fn validate(
        &self,
        token: &str,
        presented_email: Option<&str>,
    ) -> Result<Invitation, OnboardingError> {
        let Some(invitation) = self.store.find_by_token(token).await? else {
            return Err(ValidationError::InvalidToken.into());
        };

        if invitation.is_expired(Utc::now()) {
            if invitation.status == InvitationStatus::Pending {
                match self.store.mark_expired(&invitation.id).await {
                    Ok(true) => {
                        debug!(invitation_id = %invitation.id, "expired invitation observed, status updated")
                    }
                    Ok(false) => {}
                    Err(err) => {
                        warn!(invitation_id = %invitation.id, error = %err,
                              "failed to record observed expiry")
                    }
                }
            }
            return Err(ValidationError::Expired.into());
        }

        if invitation.status != InvitationStatus::Pending {
            return Err(ValidationError::AlreadyUsed.into());
        }

        if let Some(email) = presented_email {
            if !email.eq_ignore_ascii_case(&invitation.email) {
                debug!(invitation_id = %invitation.id, "presented email does not match invitation");
                return Err(ValidationError::EmailMismatch.into());
            }
        }

        Ok(invitation)
    }
}
