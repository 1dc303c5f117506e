use anyhow::Context as _;
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use super::error::{ConcurrencyError, OnboardingError};

/// Allocates human-readable employee codes, one sequence per tenant.
///
/// Codes are `<prefix><number>` with the number zero-padded to at least
/// `width` digits (`EMP001`, and `EMP1000` once the padding overflows).
/// The next number is always max(existing) + 1, so codes keep increasing
/// even when earlier employees have been removed.
///
/// Allocation is optimistic: propose from a scan, insert, and rely on the
/// `UNIQUE(tenant_id, employee_code)` constraint to reject the loser of a
/// race, who rescans and tries again.
pub struct EmployeeCodeAllocator {
    pool: SqlitePool,
    prefix: String,
    width: usize,
    max_attempts: u32,
}

impl EmployeeCodeAllocator {
    pub fn new(pool: SqlitePool, prefix: &str, width: usize, max_attempts: u32) -> Self {
        Self {
            pool,
            prefix: prefix.to_string(),
            width,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn format_code(&self, n: u64) -> String {
        format!("{}{:0width$}", self.prefix, n, width = self.width)
    }

    /// Numeric part of a code carrying this allocator's prefix. Codes with
    /// a different prefix or stray characters are ignored by the scan.
    pub fn parse_code(&self, code: &str) -> Option<u64> {
        let digits = code.strip_prefix(&self.prefix)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    /// Next code for a tenant given the codes it already has.
    pub fn propose(&self, existing: &[String]) -> String {
        let max = existing
            .iter()
            .filter_map(|code| self.parse_code(code))
            .max()
            .unwrap_or(0);
        self.format_code(max + 1)
    }

    /// Create the employee record for `user_id` in `tenant_id`, allocating
    /// a fresh code, and return the code. If the user already has an
    /// employee record in this tenant its existing code is returned and
    /// nothing is written.
    pub async fn ensure_employee(
        &self,
        tenant_id: &str,
        user_id: &str,
        full_name: &str,
        job_title: Option<&str>,
    ) -> Result<String, OnboardingError> {
        if let Some(code) = self.existing_code(tenant_id, user_id).await? {
            debug!(tenant_id = %tenant_id, user_id = %user_id, employee_code = %code,
                   "employee record already exists");
            return Ok(code);
        }

        for attempt in 1..=self.max_attempts {
            let codes = self.scan_codes(tenant_id).await?;
            let code = self.propose(&codes);
            let insert = sqlx::query(
                "INSERT INTO employees
                   (id, tenant_id, user_id, employee_code, full_name, job_title, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(tenant_id)
            .bind(user_id)
            .bind(&code)
            .bind(full_name)
            .bind(job_title)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await;

            match insert {
                Ok(_) => {
                    debug!(tenant_id = %tenant_id, user_id = %user_id, employee_code = %code,
                           attempt, "employee code allocated");
                    return Ok(code);
                }
                Err(err) if is_unique_violation(&err) => {
                    // Either another allocation claimed this code, or a
                    // concurrent run of the same user inserted the row.
                    if let Some(code) = self.existing_code(tenant_id, user_id).await? {
                        return Ok(code);
                    }
                    debug!(tenant_id = %tenant_id, employee_code = %code, attempt,
                           "employee code taken, rescanning");
                }
                Err(err) => {
                    return Err(anyhow::Error::from(err)
                        .context("failed to insert employee record")
                        .into());
                }
            }
        }

        Err(ConcurrencyError::AllocationContention {
            attempts: self.max_attempts,
        }
        .into())
    }

    async fn existing_code(&self, tenant_id: &str, user_id: &str) -> Result<Option<String>, OnboardingError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT employee_code FROM employees WHERE tenant_id = ? AND user_id = ?",
        )
        .bind(tenant_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to look up employee record")?;
        Ok(row.map(|(code,)| code))
    }

    async fn scan_codes(&self, tenant_id: &str) -> Result<Vec<String>, OnboardingError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT employee_code FROM employees WHERE tenant_id = ?")
                .bind(tenant_id)
                .fetch_all(&self.pool)
                .await
                .context("failed to scan employee codes")?;
        Ok(rows.into_iter().map(|(code,)| code).collect())
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}
