use anyhow::{anyhow, Context as _, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use super::model::{
    is_valid_email, Invitation, InvitationRow, InvitationStatus, InvitationType, NewInvitation,
};
use super::token::generate_invitation_token;

#[derive(Debug, Error)]
pub enum CreateInvitationError {
    #[error("an active invitation already exists for this email and type")]
    DuplicateActive,
    #[error("collaborator invitations require a tenant_id")]
    MissingTenant,
    #[error("invalid email address")]
    InvalidEmail,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CreateInvitationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::DuplicateActive => "duplicate_active_invitation",
            Self::MissingTenant => "missing_tenant_id",
            Self::InvalidEmail => "invalid_email",
            Self::Internal(_) => "internal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeOutcome {
    Revoked,
    /// Invitation exists but already left `pending`; carries the observed state.
    NotPending(InvitationStatus),
    NotFound,
}

/// Issues and settles invitations. All writes to the `invitations` table
/// go through here; the status column only ever moves away from `pending`.
pub struct InvitationStore {
    pool: SqlitePool,
    ttl: Duration,
}

impl InvitationStore {
    pub fn new(pool: SqlitePool, ttl_days: u32) -> Self {
        Self {
            pool,
            ttl: Duration::days(i64::from(ttl_days)),
        }
    }

    // ─── Issuance ───

    pub async fn create(&self, new: NewInvitation) -> Result<Invitation, CreateInvitationError> {
        if !is_valid_email(&new.email) {
            return Err(CreateInvitationError::InvalidEmail);
        }
        if new.invitation_type == InvitationType::Collaborator && new.tenant_id.is_none() {
            return Err(CreateInvitationError::MissingTenant);
        }

        let now = Utc::now();
        // One live invitation per (email, type). Checked here rather than
        // enforced by a constraint so expired rows never block reissue.
        let active: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM invitations
             WHERE lower(email) = lower(?) AND invitation_type = ?
               AND status = 'pending' AND expires_at > ?",
        )
        .bind(&new.email)
        .bind(new.invitation_type.as_str())
        .bind(now.to_rfc3339())
        .fetch_optional(&self.pool)
        .await
        .context("failed to check for active invitations")?;
        if let Some((existing_id,)) = active {
            debug!(invitation_id = %existing_id, email = %new.email, "active invitation already exists");
            return Err(CreateInvitationError::DuplicateActive);
        }

        let id = Uuid::new_v4().to_string();
        let token = generate_invitation_token();
        let tenant_id = new
            .tenant_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let expires_at = now + self.ttl;
        let metadata = new
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("failed to serialize invitation metadata")?;

        sqlx::query(
            "INSERT INTO invitations
               (id, token, email, full_name, tenant_id, invitation_type,
                status, issued_by, metadata, expires_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&token)
        .bind(&new.email)
        .bind(&new.full_name)
        .bind(&tenant_id)
        .bind(new.invitation_type.as_str())
        .bind(&new.issued_by)
        .bind(&metadata)
        .bind(expires_at.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to insert invitation")?;

        let invitation = self
            .find_by_id(&id)
            .await?
            .ok_or_else(|| anyhow!("failed to retrieve created invitation"))?;
        debug!(invitation_id = %invitation.id, invitation_type = %invitation.invitation_type,
               "invitation created");
        Ok(invitation)
    }

    // ─── Lookups ───

    pub async fn find_by_token(&self, token: &str) -> Result<Option<Invitation>> {
        let row: Option<InvitationRow> =
            sqlx::query_as("SELECT * FROM invitations WHERE token = ?")
                .bind(token)
                .fetch_optional(&self.pool)
                .await
                .context("failed to look up invitation by token")?;
        row.map(Invitation::try_from).transpose()
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<Invitation>> {
        let row: Option<InvitationRow> = sqlx::query_as("SELECT * FROM invitations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to look up invitation by id")?;
        row.map(Invitation::try_from).transpose()
    }

    pub async fn list(&self, status: Option<InvitationStatus>) -> Result<Vec<Invitation>> {
        let rows: Vec<InvitationRow> = match status {
            Some(status) => {
                sqlx::query_as(
                    "SELECT * FROM invitations WHERE status = ? ORDER BY created_at DESC",
                )
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as("SELECT * FROM invitations ORDER BY created_at DESC")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .context("failed to list invitations")?;
        rows.into_iter().map(Invitation::try_from).collect()
    }

    // ─── Settlement ───

    /// Accept an invitation if it is still pending. Returns the status the
    /// row held before this call: `Pending` means this caller won the
    /// transition, anything else means the row had already settled.
    pub async fn mark_accepted(&self, id: &str) -> Result<InvitationStatus> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE invitations SET status = 'accepted', accepted_at = ?, updated_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to accept invitation")?;
        if result.rows_affected() > 0 {
            return Ok(InvitationStatus::Pending);
        }
        self.current_status(id)
            .await?
            .ok_or_else(|| anyhow!("invitation not found: {id}"))
    }

    /// Flip an overdue pending invitation to `expired`. Returns false when
    /// the row was not pending anymore.
    pub async fn mark_expired(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE invitations SET status = 'expired', updated_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to expire invitation")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn revoke(&self, id: &str) -> Result<RevokeOutcome> {
        let result = sqlx::query(
            "UPDATE invitations SET status = 'revoked', updated_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to revoke invitation")?;
        if result.rows_affected() > 0 {
            debug!(invitation_id = %id, "invitation revoked");
            return Ok(RevokeOutcome::Revoked);
        }
        match self.current_status(id).await? {
            Some(status) => Ok(RevokeOutcome::NotPending(status)),
            None => Ok(RevokeOutcome::NotFound),
        }
    }

    /// Expire every pending invitation whose deadline has passed. Returns
    /// the number of rows flipped.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE invitations SET status = 'expired', updated_at = ?
             WHERE status = 'pending' AND expires_at < ?",
        )
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to sweep expired invitations")?;
        Ok(result.rows_affected())
    }

    async fn current_status(&self, id: &str) -> Result<Option<InvitationStatus>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT status FROM invitations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to read invitation status")?;
        match row {
            Some((raw,)) => InvitationStatus::parse(&raw)
                .map(Some)
                .ok_or_else(|| anyhow!("unknown invitation status in row {id}: {raw}")),
            None => Ok(None),
        }
    }
}
