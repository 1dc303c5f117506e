use anyhow::{Context as _, Result};
use sqlx::{sqlite::SqliteConnectOptions, ConnectOptions, SqlitePool};
use std::{path::Path, str::FromStr};

/// Default timeout for individual SQLite queries.
/// Prevents hung queries from blocking the service indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Execute a future with the standard query timeout.
/// Returns an error if the operation takes longer than `QUERY_TIMEOUT`.
async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct TenantRow {
    pub id: String,
    pub name: String,
    pub status: String,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct ProfileRow {
    pub user_id: String,
    pub email: String,
    pub full_name: String,
    pub tenant_id: String,
    /// Denormalized role label (canonical role name, e.g. "tenant_admin").
    pub role: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RoleRow {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct EmployeeRow {
    pub id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub employee_code: String,
    pub full_name: String,
    pub job_title: Option<String>,
    pub created_at: String,
}

/// Persisted outcome of a completed provisioning run, keyed by invitation.
/// Read back by the idempotency short-circuit and the repair path.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProvisioningResultRow {
    pub invitation_id: String,
    pub user_id: String,
    pub tenant_id: String,
    pub role_id: String,
    pub role: String,
    pub employee_code: Option<String>,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct OnboardingStats {
    pub invitations_pending: i64,
    pub invitations_accepted: i64,
    pub invitations_expired: i64,
    pub invitations_revoked: i64,
    pub tenants: i64,
    pub profiles: i64,
    pub employees: i64,
    /// Accepted invitations whose employee step still needs the repair job.
    pub partial_provisions: i64,
}

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        Self::new_with_slow_query(data_dir, 0).await
    }

    /// Create storage with slow-query logging enabled.
    ///
    /// `slow_query_ms` is the threshold in milliseconds; queries exceeding it
    /// are logged at WARN level. Set to 0 to disable slow-query logging.
    pub async fn new_with_slow_query(data_dir: &Path, slow_query_ms: u64) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("tenantd.db");
        let mut opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        if slow_query_ms > 0 {
            opts = opts.log_slow_statements(
                log::LevelFilter::Warn,
                std::time::Duration::from_millis(slow_query_ms),
            );
        }

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Return a clone of the connection pool (cheap, Arc-backed).
    /// Used by the invitation store and the provisioning components that
    /// share the same SQLite database.
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::migrate!("src/storage/migrations")
            .run(pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(())
    }

    // ─── Tenants / profiles / employees (read side) ─────────────────────────

    pub async fn get_tenant(&self, id: &str) -> Result<Option<TenantRow>> {
        Ok(sqlx::query_as("SELECT * FROM tenants WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn get_profile(&self, user_id: &str) -> Result<Option<ProfileRow>> {
        Ok(sqlx::query_as("SELECT * FROM profiles WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Profile within a tenant by invitation email. Used when an accepted
    /// invitation has to be tied back to the user it provisioned.
    pub async fn find_profile_by_email(
        &self,
        tenant_id: &str,
        email: &str,
    ) -> Result<Option<ProfileRow>> {
        Ok(sqlx::query_as(
            "SELECT * FROM profiles WHERE tenant_id = ? AND lower(email) = lower(?)",
        )
        .bind(tenant_id)
        .bind(email)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn find_employee(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> Result<Option<EmployeeRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM employees WHERE tenant_id = ? AND user_id = ?")
                .bind(tenant_id)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    /// Role assignment id for a user within a tenant, narrowed to the named
    /// role. Used when rebuilding a provisioning result from the rows.
    pub async fn find_assignment(
        &self,
        user_id: &str,
        tenant_id: &str,
        role_name: &str,
    ) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT ur.role_id FROM user_roles ur \
             JOIN roles r ON r.id = ur.role_id \
             WHERE ur.user_id = ? AND ur.tenant_id = ? AND r.name = ?",
        )
        .bind(user_id)
        .bind(tenant_id)
        .bind(role_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id,)| id))
    }

    // ─── Provisioning results ───────────────────────────────────────────────

    /// Upsert the persisted outcome for an invitation. The repair path
    /// rewrites `employee_code` and `status` on the existing row.
    pub async fn save_result(&self, row: &ProvisioningResultRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO provisioning_results \
             (invitation_id, user_id, tenant_id, role_id, role, employee_code, status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(invitation_id) DO UPDATE SET \
               employee_code = excluded.employee_code, \
               status = excluded.status, \
               updated_at = excluded.updated_at",
        )
        .bind(&row.invitation_id)
        .bind(&row.user_id)
        .bind(&row.tenant_id)
        .bind(&row.role_id)
        .bind(&row.role)
        .bind(&row.employee_code)
        .bind(&row.status)
        .bind(&row.created_at)
        .bind(&row.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_result(&self, invitation_id: &str) -> Result<Option<ProvisioningResultRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM provisioning_results WHERE invitation_id = ?")
                .bind(invitation_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    // ─── Stats ──────────────────────────────────────────────────────────────

    pub async fn onboarding_stats(&self) -> Result<OnboardingStats> {
        with_timeout(async {
            let by_status: Vec<(String, i64)> =
                sqlx::query_as("SELECT status, COUNT(*) FROM invitations GROUP BY status")
                    .fetch_all(&self.pool)
                    .await?;
            let mut stats = OnboardingStats {
                invitations_pending: 0,
                invitations_accepted: 0,
                invitations_expired: 0,
                invitations_revoked: 0,
                tenants: 0,
                profiles: 0,
                employees: 0,
                partial_provisions: 0,
            };
            for (status, count) in by_status {
                match status.as_str() {
                    "pending" => stats.invitations_pending = count,
                    "accepted" => stats.invitations_accepted = count,
                    "expired" => stats.invitations_expired = count,
                    "revoked" => stats.invitations_revoked = count,
                    _ => {}
                }
            }

            let (tenants,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tenants")
                .fetch_one(&self.pool)
                .await?;
            let (profiles,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM profiles")
                .fetch_one(&self.pool)
                .await?;
            let (employees,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM employees")
                .fetch_one(&self.pool)
                .await?;
            let (partial,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM provisioning_results WHERE status = 'provisioned_partial'",
            )
            .fetch_one(&self.pool)
            .await?;

            stats.tenants = tenants;
            stats.profiles = profiles;
            stats.employees = employees;
            stats.partial_provisions = partial;
            Ok(stats)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    async fn test_storage() -> Storage {
        let dir = tempfile::tempdir().unwrap().keep();
        Storage::new(&dir).await.unwrap()
    }

    #[tokio::test]
    async fn migrations_create_schema_and_seed_roles() {
        let storage = test_storage().await;
        let roles: Vec<(String,)> = sqlx::query_as("SELECT name FROM roles ORDER BY name")
            .fetch_all(&storage.pool())
            .await
            .unwrap();
        let names: Vec<&str> = roles.iter().map(|(n,)| n.as_str()).collect();
        assert_eq!(names, vec!["employee", "tenant_admin"]);
    }

    #[tokio::test]
    async fn save_result_upserts_on_conflict() {
        let storage = test_storage().await;
        let now = Utc::now().to_rfc3339();
        let mut row = ProvisioningResultRow {
            invitation_id: "inv-1".into(),
            user_id: "user-1".into(),
            tenant_id: "tenant-1".into(),
            role_id: "role-1".into(),
            role: "tenant_admin".into(),
            employee_code: None,
            status: "provisioned_partial".into(),
            created_at: now.clone(),
            updated_at: now.clone(),
        };
        storage.save_result(&row).await.unwrap();

        row.employee_code = Some("EMP001".into());
        row.status = "provisioned".into();
        storage.save_result(&row).await.unwrap();

        let loaded = storage.load_result("inv-1").await.unwrap().unwrap();
        assert_eq!(loaded.employee_code.as_deref(), Some("EMP001"));
        assert_eq!(loaded.status, "provisioned");

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM provisioning_results")
            .fetch_one(&storage.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn stats_start_empty() {
        let storage = test_storage().await;
        let stats = storage.onboarding_stats().await.unwrap();
        assert_eq!(stats.invitations_pending, 0);
        assert_eq!(stats.tenants, 0);
        assert_eq!(stats.partial_provisions, 0);
    }
}
