use std::sync::Arc;

use anyhow::{anyhow, Context as _};
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, error, info, warn};

use crate::invitations::{Invitation, InvitationStatus, InvitationStore};
use crate::storage::{ProvisioningResultRow, Storage};

use super::employee_codes::EmployeeCodeAllocator;
use super::error::{FatalProvisioningError, OnboardingError, ValidationError};
use super::roles::RoleResolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningStatus {
    /// All entities exist, including the employee record.
    Provisioned,
    /// Mandatory entities exist; the employee step failed and is owed to
    /// the repair job.
    ProvisionedPartial,
}

impl ProvisioningStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioned => "provisioned",
            Self::ProvisionedPartial => "provisioned_partial",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "provisioned" => Some(Self::Provisioned),
            "provisioned_partial" => Some(Self::ProvisionedPartial),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProvisioningStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one provisioning run. Persisted keyed by invitation and
/// returned unchanged for every redelivery of the same confirmation.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisioningResult {
    pub invitation_id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub role_id: String,
    pub role: String,
    pub employee_code: Option<String>,
    pub status: ProvisioningStatus,
}

impl ProvisioningResult {
    pub(crate) fn from_row(row: ProvisioningResultRow) -> anyhow::Result<Self> {
        let status = ProvisioningStatus::parse(&row.status).ok_or_else(|| {
            anyhow!(
                "unknown provisioning status for invitation {}: {}",
                row.invitation_id,
                row.status
            )
        })?;
        Ok(Self {
            invitation_id: row.invitation_id,
            tenant_id: row.tenant_id,
            user_id: row.user_id,
            role_id: row.role_id,
            role: row.role,
            employee_code: row.employee_code,
            status,
        })
    }

    fn to_row(&self) -> ProvisioningResultRow {
        let now = Utc::now().to_rfc3339();
        ProvisioningResultRow {
            invitation_id: self.invitation_id.clone(),
            user_id: self.user_id.clone(),
            tenant_id: self.tenant_id.clone(),
            role_id: self.role_id.clone(),
            role: self.role.clone(),
            employee_code: self.employee_code.clone(),
            status: self.status.as_str().to_string(),
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

#[derive(Debug)]
pub enum RepairOutcome {
    /// Employee step re-run and the persisted result upgraded.
    Repaired(ProvisioningResult),
    /// Nothing to do, the persisted result was already complete.
    AlreadyComplete(ProvisioningResult),
    /// Invitation exists but was never provisioned.
    NotAccepted(InvitationStatus),
    NotFound,
}

/// Runs the multi-entity provisioning for one confirmed invitation.
///
/// Steps 1 through 4 (tenant, profile, role resolution, role assignment)
/// share one database transaction. The employee record is created outside
/// it so an exhausted code allocation cannot roll back the entities that
/// matter; its absence is recorded as a partial result instead.
pub struct ProvisioningTransaction {
    pool: SqlitePool,
    storage: Arc<Storage>,
    store: Arc<InvitationStore>,
    roles: RoleResolver,
    allocator: EmployeeCodeAllocator,
}

impl ProvisioningTransaction {
    pub fn new(
        storage: Arc<Storage>,
        store: Arc<InvitationStore>,
        roles: RoleResolver,
        allocator: EmployeeCodeAllocator,
    ) -> Self {
        Self {
            pool: storage.pool(),
            storage,
            store,
            roles,
            allocator,
        }
    }

    /// Provision all entities for `invitation` and settle it. Callers hold
    /// the invitation lock and have validated the token; the checks here
    /// only catch direct misuse.
    pub async fn provision(
        &self,
        invitation: &Invitation,
        user_id: &str,
    ) -> Result<ProvisioningResult, OnboardingError> {
        if invitation.is_expired(Utc::now()) {
            return Err(ValidationError::Expired.into());
        }
        if invitation.status != InvitationStatus::Pending {
            return Err(ValidationError::AlreadyUsed.into());
        }

        let now = Utc::now().to_rfc3339();
        let role_label = self.roles.role_name(invitation.invitation_type).to_string();
        let tenant_name = invitation
            .metadata_str("company_name")
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}'s organization", invitation.full_name));

        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin provisioning transaction")?;

        sqlx::query(
            "INSERT INTO tenants (id, name, status, created_at) VALUES (?, ?, 'active', ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(&invitation.tenant_id)
        .bind(&tenant_name)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(|err| {
            error!(tenant_id = %invitation.tenant_id, error = %err, "tenant creation failed");
            OnboardingError::Fatal(FatalProvisioningError::TenantCreateFailed {
                tenant_id: invitation.tenant_id.clone(),
                reason: err.to_string(),
            })
        })?;

        sqlx::query(
            "INSERT INTO profiles (user_id, email, full_name, tenant_id, role, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
               email = excluded.email,
               full_name = excluded.full_name,
               tenant_id = excluded.tenant_id,
               role = excluded.role,
               updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(&invitation.email)
        .bind(&invitation.full_name)
        .bind(&invitation.tenant_id)
        .bind(&role_label)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .context("failed to upsert profile")?;

        let role = match self.roles.resolve(invitation.invitation_type).await {
            Ok(role) => role,
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback after role resolution failure also failed");
                }
                return Err(err);
            }
        };

        sqlx::query(
            "INSERT INTO user_roles (user_id, tenant_id, role_id, created_at) VALUES (?, ?, ?, ?)
             ON CONFLICT DO NOTHING",
        )
        .bind(user_id)
        .bind(&invitation.tenant_id)
        .bind(&role.id)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .context("failed to record role assignment")?;

        tx.commit()
            .await
            .context("failed to commit provisioning transaction")?;

        let employee_code = match self
            .allocator
            .ensure_employee(
                &invitation.tenant_id,
                user_id,
                &invitation.full_name,
                invitation.metadata_str("job_position"),
            )
            .await
        {
            Ok(code) => Some(code),
            Err(err) => {
                warn!(invitation_id = %invitation.id, user_id = %user_id, error = %err,
                      "employee record not created, provisioning is partial");
                None
            }
        };

        let status = if employee_code.is_some() {
            ProvisioningStatus::Provisioned
        } else {
            ProvisioningStatus::ProvisionedPartial
        };
        let result = ProvisioningResult {
            invitation_id: invitation.id.clone(),
            tenant_id: invitation.tenant_id.clone(),
            user_id: user_id.to_string(),
            role_id: role.id,
            role: role.name,
            employee_code,
            status,
        };

        // Persist the outcome before the status flip so any observer of an
        // accepted invitation can read the result back.
        self.storage.save_result(&result.to_row()).await?;
        let previous = self.store.mark_accepted(&invitation.id).await?;
        match previous {
            InvitationStatus::Pending => {
                info!(invitation_id = %invitation.id, tenant_id = %invitation.tenant_id,
                      user_id = %user_id, status = %result.status, "invitation provisioned");
            }
            InvitationStatus::Accepted => {
                debug!(invitation_id = %invitation.id, "invitation was accepted concurrently");
            }
            other => {
                warn!(invitation_id = %invitation.id, status = %other,
                      "invitation settled out from under a provisioning run");
            }
        }
        Ok(result)
    }

    /// Finish the employee step for an accepted invitation whose result is
    /// partial. Steps 1 through 4 are never re-run here.
    pub async fn repair(&self, invitation_id: &str) -> Result<RepairOutcome, OnboardingError> {
        let Some(invitation) = self.store.find_by_id(invitation_id).await? else {
            return Ok(RepairOutcome::NotFound);
        };
        if invitation.status != InvitationStatus::Accepted {
            return Ok(RepairOutcome::NotAccepted(invitation.status));
        }

        let (mut result, rebuilt) = match self.storage.load_result(invitation_id).await? {
            Some(row) => (ProvisioningResult::from_row(row)?, false),
            None => (rebuild_result(&self.storage, &invitation).await?, true),
        };
        if result.status == ProvisioningStatus::Provisioned && result.employee_code.is_some() {
            if rebuilt {
                self.storage.save_result(&result.to_row()).await?;
            }
            return Ok(RepairOutcome::AlreadyComplete(result));
        }

        let full_name = match self.storage.get_profile(&result.user_id).await? {
            Some(profile) => profile.full_name,
            None => invitation.full_name.clone(),
        };
        let code = self
            .allocator
            .ensure_employee(
                &result.tenant_id,
                &result.user_id,
                &full_name,
                invitation.metadata_str("job_position"),
            )
            .await?;

        result.employee_code = Some(code);
        result.status = ProvisioningStatus::Provisioned;
        self.storage.save_result(&result.to_row()).await?;
        info!(invitation_id = %invitation_id, employee_code = ?result.employee_code,
              "partial provisioning repaired");
        Ok(RepairOutcome::Repaired(result))
    }
}

/// Reconstruct the outcome for an accepted invitation that has no persisted
/// result row, from the provisioned rows themselves.
pub(crate) async fn rebuild_result(
    storage: &Storage,
    invitation: &Invitation,
) -> Result<ProvisioningResult, OnboardingError> {
    let profile = storage
        .find_profile_by_email(&invitation.tenant_id, &invitation.email)
        .await?
        .ok_or_else(|| {
            anyhow!(
                "accepted invitation {} has no provisioned profile",
                invitation.id
            )
        })?;
    let role_id = storage
        .find_assignment(&profile.user_id, &invitation.tenant_id, &profile.role)
        .await?
        .ok_or_else(|| {
            anyhow!(
                "accepted invitation {} has no role assignment",
                invitation.id
            )
        })?;
    let employee_code = storage
        .find_employee(&invitation.tenant_id, &profile.user_id)
        .await?
        .map(|e| e.employee_code);
    let status = if employee_code.is_some() {
        ProvisioningStatus::Provisioned
    } else {
        ProvisioningStatus::ProvisionedPartial
    };
    Ok(ProvisioningResult {
        invitation_id: invitation.id.clone(),
        tenant_id: invitation.tenant_id.clone(),
        user_id: profile.user_id,
        role_id,
        role: profile.role,
        employee_code,
        status,
    })
}
