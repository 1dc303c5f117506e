use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::invitations::{InvitationStatus, InvitationStore};
use crate::storage::Storage;

use super::error::{ConcurrencyError, OnboardingError, ValidationError};
use super::provisioner::{rebuild_result, ProvisioningResult};

/// Serializes confirmation handling per invitation.
///
/// Each invitation id gets its own async mutex; whoever holds it is the
/// only writer for that invitation in this process. Duplicate rows under a
/// lock failure are still ruled out by the unique constraints on profiles,
/// role assignments, and employee codes.
pub struct OnboardingGuard {
    store: Arc<InvitationStore>,
    storage: Arc<Storage>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    wait: Duration,
}

impl OnboardingGuard {
    pub fn new(store: Arc<InvitationStore>, storage: Arc<Storage>, wait: Duration) -> Self {
        Self {
            store,
            storage,
            locks: Mutex::new(HashMap::new()),
            wait,
        }
    }

    /// Run `f` while holding the invitation's lock. The invitation status
    /// is re-read inside the lock: an already-accepted invitation
    /// short-circuits to the persisted outcome without invoking `f`, and a
    /// settled or overdue one is rejected before `f` can touch anything.
    ///
    /// Waiting longer than the bounded wait yields `LockTimeout`, which the
    /// caller treats as retriable.
    pub async fn with_lock<F, Fut>(
        &self,
        invitation_id: &str,
        f: F,
    ) -> Result<ProvisioningResult, OnboardingError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ProvisioningResult, OnboardingError>>,
    {
        let entry = self.entry(invitation_id).await;
        let outcome = match tokio::time::timeout(self.wait, entry.lock()).await {
            Ok(_guard) => Some(self.run_guarded(invitation_id, f).await),
            Err(_) => None,
        };
        drop(entry);
        self.discard_if_unused(invitation_id).await;
        match outcome {
            Some(result) => result,
            None => Err(ConcurrencyError::LockTimeout {
                waited_ms: self.wait.as_millis() as u64,
            }
            .into()),
        }
    }

    async fn run_guarded<F, Fut>(
        &self,
        invitation_id: &str,
        f: F,
    ) -> Result<ProvisioningResult, OnboardingError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ProvisioningResult, OnboardingError>>,
    {
        let Some(current) = self.store.find_by_id(invitation_id).await? else {
            return Err(ValidationError::InvalidToken.into());
        };

        match current.status {
            InvitationStatus::Accepted => {
                debug!(invitation_id = %invitation_id,
                       "invitation already accepted, returning persisted result");
                match self.storage.load_result(invitation_id).await? {
                    Some(row) => Ok(ProvisioningResult::from_row(row)?),
                    None => rebuild_result(&self.storage, &current).await,
                }
            }
            InvitationStatus::Pending if current.is_expired(Utc::now()) => {
                if let Err(err) = self.store.mark_expired(invitation_id).await {
                    warn!(invitation_id = %invitation_id, error = %err,
                          "failed to record observed expiry");
                }
                Err(ValidationError::Expired.into())
            }
            InvitationStatus::Pending => f().await,
            InvitationStatus::Expired => Err(ValidationError::Expired.into()),
            InvitationStatus::Revoked => Err(ValidationError::AlreadyUsed.into()),
        }
    }

    async fn entry(&self, invitation_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(invitation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the registry entry once nothing else holds it. Removal and
    /// lookup both run under the registry lock, so a waiter's clone always
    /// keeps the entry alive.
    async fn discard_if_unused(&self, invitation_id: &str) {
        let mut locks = self.locks.lock().await;
        if let Some(entry) = locks.get(invitation_id) {
            if Arc::strong_count(entry) == 1 {
                locks.remove(invitation_id);
            }
        }
    }

    #[cfg(test)]
    async fn tracked_locks(&self) -> usize {
        self.locks.lock().await.len()
    }
}
