//! Invitation records and their lifecycle: issuance, lookup, and the
//! single-shot transitions out of `pending`.

pub mod model;
pub mod store;
pub mod token;

pub use model::{
    is_valid_email, Invitation, InvitationStatus, InvitationType, NewInvitation,
};
pub use store::{CreateInvitationError, InvitationStore, RevokeOutcome};
pub use token::generate_invitation_token;
