use anyhow::{bail, Context as _, Result};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

/// Minimal shape check for invitation emails. Full deliverability is the
/// email sender's problem; this only rejects obviously malformed input.
static EMAIL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap());

pub fn is_valid_email(email: &str) -> bool {
    EMAIL_PATTERN.is_match(email)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvitationType {
    TenantOwner,
    Collaborator,
}

impl InvitationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TenantOwner => "tenant_owner",
            Self::Collaborator => "collaborator",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tenant_owner" => Some(Self::TenantOwner),
            "collaborator" => Some(Self::Collaborator),
            _ => None,
        }
    }
}

impl std::fmt::Display for InvitationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Invitation lifecycle state. `pending` is the only non-terminal state:
/// it moves to exactly one of the other three and never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Expired,
    Revoked,
}

impl InvitationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "accepted" => Some(Self::Accepted),
            "expired" => Some(Self::Expired),
            "revoked" => Some(Self::Revoked),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for InvitationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters for issuing a new invitation.
#[derive(Debug, Clone)]
pub struct NewInvitation {
    pub email: String,
    pub full_name: String,
    pub invitation_type: InvitationType,
    /// Target tenant. Required for collaborator invitations; allocated
    /// fresh for tenant owners when absent.
    pub tenant_id: Option<String>,
    pub issued_by: Option<String>,
    /// Free-form extras carried through to provisioning
    /// (e.g. `company_name`, `job_position`).
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct Invitation {
    pub id: String,
    pub token: String,
    pub email: String,
    pub full_name: String,
    pub tenant_id: String,
    pub invitation_type: InvitationType,
    pub status: InvitationStatus,
    pub issued_by: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub expires_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Invitation {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// String value from the metadata object, if present.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.as_ref()?.get(key)?.as_str()
    }
}

/// Raw invitation row as stored (RFC3339 TEXT timestamps, string enums).
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct InvitationRow {
    pub id: String,
    pub token: String,
    pub email: String,
    pub full_name: String,
    pub tenant_id: String,
    pub invitation_type: String,
    pub status: String,
    pub issued_by: Option<String>,
    pub metadata: Option<String>,
    pub expires_at: String,
    pub accepted_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

fn parse_ts(value: &str, field: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("invalid {field} timestamp: {value}"))?
        .with_timezone(&Utc))
}

impl TryFrom<InvitationRow> for Invitation {
    type Error = anyhow::Error;

    fn try_from(row: InvitationRow) -> Result<Self> {
        let Some(invitation_type) = InvitationType::parse(&row.invitation_type) else {
            bail!("unknown invitation_type in row {}: {}", row.id, row.invitation_type);
        };
        let Some(status) = InvitationStatus::parse(&row.status) else {
            bail!("unknown invitation status in row {}: {}", row.id, row.status);
        };
        let metadata = match row.metadata.as_deref() {
            Some(raw) => Some(
                serde_json::from_str(raw)
                    .with_context(|| format!("invalid metadata JSON in row {}", row.id))?,
            ),
            None => None,
        };
        Ok(Self {
            expires_at: parse_ts(&row.expires_at, "expires_at")?,
            accepted_at: row
                .accepted_at
                .as_deref()
                .map(|v| parse_ts(v, "accepted_at"))
                .transpose()?,
            created_at: parse_ts(&row.created_at, "created_at")?,
            updated_at: parse_ts(&row.updated_at, "updated_at")?,
            id: row.id,
            token: row.token,
            email: row.email,
            full_name: row.full_name,
            tenant_id: row.tenant_id,
            invitation_type,
            status,
            issued_by: row.issued_by,
            metadata,
        })
    }
}
