use thiserror::Error;

/// Token rejection reasons, in the order validation checks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invitation token is not recognized")]
    InvalidToken,
    #[error("invitation has expired")]
    Expired,
    #[error("invitation has already been used or withdrawn")]
    AlreadyUsed,
    #[error("email does not match the invitation")]
    EmailMismatch,
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidToken => "invalid_token",
            Self::Expired => "expired",
            Self::AlreadyUsed => "already_used",
            Self::EmailMismatch => "email_mismatch",
        }
    }
}

/// Contention that a redelivery of the same event is expected to clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConcurrencyError {
    #[error("could not acquire the invitation lock within {waited_ms}ms")]
    LockTimeout { waited_ms: u64 },
    #[error("employee code allocation still contended after {attempts} attempts")]
    AllocationContention { attempts: u32 },
}

impl ConcurrencyError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::LockTimeout { .. } => "lock_timeout",
            Self::AllocationContention { .. } => "allocation_contention",
        }
    }
}

/// Failures that indicate broken platform state. Retrying the event will
/// not help until an operator intervenes.
#[derive(Debug, Error)]
pub enum FatalProvisioningError {
    #[error("role '{role}' is missing from the role catalog")]
    RoleMissing { role: String },
    #[error("tenant {tenant_id} could not be created: {reason}")]
    TenantCreateFailed { tenant_id: String, reason: String },
}

impl FatalProvisioningError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::RoleMissing { .. } => "role_missing",
            Self::TenantCreateFailed { .. } => "tenant_create_failed",
        }
    }
}

#[derive(Debug, Error)]
pub enum OnboardingError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),
    #[error(transparent)]
    Fatal(#[from] FatalProvisioningError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl OnboardingError {
    /// Stable machine-readable code for API responses and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(e) => e.code(),
            Self::Concurrency(e) => e.code(),
            Self::Fatal(e) => e.code(),
            Self::Internal(_) => "internal",
        }
    }

    /// Whether a redelivery of the triggering event may succeed without
    /// operator intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Concurrency(_))
    }
}

impl From<sqlx::Error> for OnboardingError {
    fn from(err: sqlx::Error) -> Self {
        Self::Internal(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ValidationError::InvalidToken.code(), "invalid_token");
        assert_eq!(ValidationError::Expired.code(), "expired");
        assert_eq!(ValidationError::AlreadyUsed.code(), "already_used");
        assert_eq!(ValidationError::EmailMismatch.code(), "email_mismatch");
        assert_eq!(
            ConcurrencyError::LockTimeout { waited_ms: 2000 }.code(),
            "lock_timeout"
        );
        assert_eq!(
            ConcurrencyError::AllocationContention { attempts: 5 }.code(),
            "allocation_contention"
        );
        assert_eq!(
            FatalProvisioningError::RoleMissing {
                role: "employee".to_string()
            }
            .code(),
            "role_missing"
        );
    }

    #[test]
    fn only_concurrency_is_transient() {
        assert!(OnboardingError::Concurrency(ConcurrencyError::LockTimeout { waited_ms: 1 })
            .is_transient());
        assert!(!OnboardingError::Validation(ValidationError::Expired).is_transient());
        assert!(!OnboardingError::Fatal(FatalProvisioningError::RoleMissing {
            role: "employee".to_string()
        })
        .is_transient());
        assert!(!OnboardingError::Internal(anyhow::anyhow!("boom")).is_transient());
    }
}
