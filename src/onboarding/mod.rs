//! The provisioning core: everything between a confirmed identity and a
//! fully set up tenant member.
//!
//! `ConfirmationEventHandler` is the only entry point. It validates the
//! presented token, serializes work per invitation through
//! `OnboardingGuard`, and runs `ProvisioningTransaction` exactly once per
//! invitation no matter how often the confirmation event is delivered.

pub mod employee_codes;
pub mod error;
pub mod guard;
pub mod handler;
pub mod provisioner;
pub mod roles;
pub mod validator;

pub use employee_codes::EmployeeCodeAllocator;
pub use error::{ConcurrencyError, FatalProvisioningError, OnboardingError, ValidationError};
pub use guard::OnboardingGuard;
pub use handler::{ConfirmationEvent, ConfirmationEventHandler};
pub use provisioner::{
    ProvisioningResult, ProvisioningStatus, ProvisioningTransaction, RepairOutcome,
};
pub use roles::{RoleRef, RoleResolver};
pub use validator::TokenValidator;
