use std::collections::HashMap;

use anyhow::Context as _;
use sqlx::SqlitePool;
use tracing::{error, warn};

use crate::invitations::InvitationType;

use super::error::{FatalProvisioningError, OnboardingError};

#[derive(Debug, Clone)]
pub struct RoleRef {
    pub id: String,
    pub name: String,
}

/// Maps invitation types to canonical roles and resolves them against the
/// `roles` catalog. The mapping is fixed at startup; the catalog lookup
/// happens per provisioning run so a repaired catalog takes effect on the
/// next delivery without a restart.
pub struct RoleResolver {
    pool: SqlitePool,
    mapping: HashMap<InvitationType, String>,
}

impl RoleResolver {
    pub fn new(pool: SqlitePool, overrides: &HashMap<String, String>) -> Self {
        let mut mapping = HashMap::from([
            (InvitationType::TenantOwner, "tenant_admin".to_string()),
            (InvitationType::Collaborator, "employee".to_string()),
        ]);
        for (key, role) in overrides {
            match InvitationType::parse(key) {
                Some(invitation_type) => {
                    mapping.insert(invitation_type, role.clone());
                }
                None => {
                    warn!(invitation_type = %key, "ignoring role mapping for unknown invitation type");
                }
            }
        }
        Self { pool, mapping }
    }

    /// Canonical role name granted by this invitation type.
    pub fn role_name(&self, invitation_type: InvitationType) -> &str {
        match self.mapping.get(&invitation_type) {
            Some(name) => name,
            None => match invitation_type {
                InvitationType::TenantOwner => "tenant_admin",
                InvitationType::Collaborator => "employee",
            },
        }
    }

    /// Look the granted role up in the catalog. A missing row is a broken
    /// deployment, not a user error.
    pub async fn resolve(
        &self,
        invitation_type: InvitationType,
    ) -> Result<RoleRef, OnboardingError> {
        let name = self.role_name(invitation_type);
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT id, name FROM roles WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await
                .context("failed to query role catalog")?;
        match row {
            Some((id, name)) => Ok(RoleRef { id, name }),
            None => {
                error!(role = %name, "role catalog is missing a canonical role");
                Err(FatalProvisioningError::RoleMissing {
                    role: name.to_string(),
                }
                .into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    async fn test_pool() -> SqlitePool {
        let dir = tempfile::tempdir().unwrap().keep();
        Storage::new(&dir).await.unwrap().pool()
    }

    #[tokio::test]
    async fn resolves_seeded_roles() {
        let pool = test_pool().await;
        let resolver = RoleResolver::new(pool, &HashMap::new());

        let admin = resolver.resolve(InvitationType::TenantOwner).await.unwrap();
        assert_eq!(admin.name, "tenant_admin");
        assert!(!admin.id.is_empty());

        let employee = resolver
            .resolve(InvitationType::Collaborator)
            .await
            .unwrap();
        assert_eq!(employee.name, "employee");
        assert_ne!(employee.id, admin.id);
    }

    #[tokio::test]
    async fn overrides_replace_defaults_and_unknown_keys_are_ignored() {
        let pool = test_pool().await;
        let overrides = HashMap::from([
            ("collaborator".to_string(), "tenant_admin".to_string()),
            ("contractor".to_string(), "employee".to_string()),
        ]);
        let resolver = RoleResolver::new(pool, &overrides);

        assert_eq!(resolver.role_name(InvitationType::Collaborator), "tenant_admin");
        assert_eq!(resolver.role_name(InvitationType::TenantOwner), "tenant_admin");
    }

    #[tokio::test]
    async fn missing_catalog_row_is_fatal() {
        let pool = test_pool().await;
        sqlx::query("DELETE FROM roles WHERE name = 'employee'")
            .execute(&pool)
            .await
            .unwrap();
        let resolver = RoleResolver::new(pool, &HashMap::new());

        let err = resolver
            .resolve(InvitationType::Collaborator)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "role_missing");
        assert!(!err.is_transient());
    }
}
