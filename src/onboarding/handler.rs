use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::config::ServiceConfig;
use crate::invitations::{Invitation, InvitationStore};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::storage::Storage;

use super::employee_codes::EmployeeCodeAllocator;
use super::error::{OnboardingError, ValidationError};
use super::guard::OnboardingGuard;
use super::provisioner::{ProvisioningResult, ProvisioningTransaction, RepairOutcome};
use super::roles::RoleResolver;
use super::validator::TokenValidator;

/// Identity-confirmed event as delivered by the identity provider's
/// webhook or replayed by an operator. Delivery is at-least-once; the same
/// logical event can arrive any number of times.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmationEvent {
    pub user_id: String,
    pub email: String,
    pub token: String,
}

/// The one entry point for confirmation handling: validate the token, then
/// provision under the invitation lock. Manual operator replays go through
/// the same path as webhook deliveries.
pub struct ConfirmationEventHandler {
    store: Arc<InvitationStore>,
    validator: TokenValidator,
    guard: OnboardingGuard,
    provisioner: ProvisioningTransaction,
    retry: RetryConfig,
}

impl ConfirmationEventHandler {
    pub fn new(storage: Arc<Storage>, store: Arc<InvitationStore>, config: &ServiceConfig) -> Self {
        let pool = storage.pool();
        let provisioning = &config.provisioning;
        let validator = TokenValidator::new(store.clone());
        let guard = OnboardingGuard::new(
            store.clone(),
            storage.clone(),
            Duration::from_millis(provisioning.lock_wait_ms),
        );
        let roles = RoleResolver::new(pool.clone(), &config.roles);
        let allocator = EmployeeCodeAllocator::new(
            pool,
            &provisioning.employee_code_prefix,
            provisioning.employee_code_width,
            provisioning.allocator_max_attempts,
        );
        let provisioner = ProvisioningTransaction::new(storage, store.clone(), roles, allocator);
        let retry = RetryConfig {
            max_attempts: provisioning.confirm_max_attempts,
            initial_delay: Duration::from_millis(provisioning.confirm_retry_delay_ms),
            ..RetryConfig::default()
        };
        Self {
            store,
            validator,
            guard,
            provisioner,
            retry,
        }
    }

    /// Handle one delivery of a confirmation event. Safe to call any number
    /// of times for the same logical event: the first delivery provisions,
    /// every later one returns the same persisted result. Transient
    /// contention (lock wait exhausted) is retried in place before it is
    /// surfaced to the caller.
    pub async fn handle(
        &self,
        event: &ConfirmationEvent,
    ) -> Result<ProvisioningResult, OnboardingError> {
        debug!(user_id = %event.user_id, "confirmation event received");
        retry_with_backoff(
            &self.retry,
            |err: &OnboardingError| err.is_transient(),
            || async {
                let invitation = match self
                    .validator
                    .validate(&event.token, Some(&event.email))
                    .await
                {
                    Ok(inv) => inv,
                    // A settled invitation is not a rejection on this path:
                    // at-least-once delivery means the provider resends
                    // events we have already handled, and the guard resolves
                    // those to the persisted result. The email still has to
                    // match; a used token in the wrong hands stays rejected.
                    Err(OnboardingError::Validation(ValidationError::AlreadyUsed)) => {
                        let inv = self
                            .store
                            .find_by_token(&event.token)
                            .await?
                            .ok_or(ValidationError::InvalidToken)?;
                        if !inv.email.eq_ignore_ascii_case(&event.email) {
                            return Err(ValidationError::EmailMismatch.into());
                        }
                        inv
                    }
                    Err(err) => return Err(err),
                };
                self.guard
                    .with_lock(&invitation.id, || {
                        self.provisioner.provision(&invitation, &event.user_id)
                    })
                    .await
            },
        )
        .await
    }

    /// Validate a token without consuming anything. Used by the acceptance
    /// form to render the invitation before the user sets a password.
    pub async fn validate(
        &self,
        token: &str,
        presented_email: Option<&str>,
    ) -> Result<Invitation, OnboardingError> {
        self.validator.validate(token, presented_email).await
    }

    /// Re-run the employee step for an accepted invitation whose result is
    /// partial.
    pub async fn repair(&self, invitation_id: &str) -> Result<RepairOutcome, OnboardingError> {
        self.provisioner.repair(invitation_id).await
    }
}
