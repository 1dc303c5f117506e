//! End-to-end tests for the onboarding pipeline against a real SQLite
//! database: issuance, confirmation under concurrent delivery, expiry,
//! revocation, and repair.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tenantd::config::ServiceConfig;
use tenantd::invitations::{
    CreateInvitationError, InvitationStatus, InvitationStore, InvitationType, NewInvitation,
    RevokeOutcome,
};
use tenantd::onboarding::{
    ConfirmationEvent, ConfirmationEventHandler, ProvisioningStatus, RepairOutcome,
};
use tenantd::storage::Storage;

struct TestEnv {
    storage: Arc<Storage>,
    store: Arc<InvitationStore>,
    handler: Arc<ConfirmationEventHandler>,
}

async fn setup() -> TestEnv {
    setup_with_config(|_| {}).await
}

async fn setup_with_config(tune: impl FnOnce(&mut ServiceConfig)) -> TestEnv {
    let data_dir = tempfile::tempdir().unwrap().keep();
    let mut config = ServiceConfig::new(None, Some(data_dir), Some("error".to_string()), None);
    tune(&mut config);
    let storage = Arc::new(Storage::new(&config.data_dir).await.unwrap());
    let store = Arc::new(InvitationStore::new(
        storage.pool(),
        config.invitations.ttl_days,
    ));
    let handler = Arc::new(ConfirmationEventHandler::new(
        storage.clone(),
        store.clone(),
        &config,
    ));
    TestEnv {
        storage,
        store,
        handler,
    }
}

fn owner(email: &str, full_name: &str) -> NewInvitation {
    NewInvitation {
        email: email.to_string(),
        full_name: full_name.to_string(),
        invitation_type: InvitationType::TenantOwner,
        tenant_id: None,
        issued_by: None,
        metadata: Some(json!({"company_name": "Acme Rockets", "job_position": "Founder"})),
    }
}

fn collaborator(email: &str, full_name: &str, tenant_id: &str) -> NewInvitation {
    NewInvitation {
        email: email.to_string(),
        full_name: full_name.to_string(),
        invitation_type: InvitationType::Collaborator,
        tenant_id: Some(tenant_id.to_string()),
        issued_by: Some("u-founder".to_string()),
        metadata: None,
    }
}

fn event(user_id: &str, email: &str, token: &str) -> ConfirmationEvent {
    ConfirmationEvent {
        user_id: user_id.to_string(),
        email: email.to_string(),
        token: token.to_string(),
    }
}

async fn backdate(storage: &Storage, invitation_id: &str) {
    sqlx::query("UPDATE invitations SET expires_at = ? WHERE id = ?")
        .bind((Utc::now() - chrono::Duration::hours(1)).to_rfc3339())
        .bind(invitation_id)
        .execute(&storage.pool())
        .await
        .unwrap();
}

#[tokio::test]
async fn tenant_owner_onboarding_creates_every_entity() {
    let env = setup().await;
    let inv = env
        .store
        .create(owner("founder@acme.example", "Alex Chen"))
        .await
        .unwrap();

    let result = env
        .handler
        .handle(&event("u-founder", "founder@acme.example", &inv.token))
        .await
        .unwrap();

    assert_eq!(result.status, ProvisioningStatus::Provisioned);
    assert_eq!(result.tenant_id, inv.tenant_id);
    assert_eq!(result.role, "tenant_admin");
    assert_eq!(result.employee_code.as_deref(), Some("EMP001"));

    let tenant = env.storage.get_tenant(&inv.tenant_id).await.unwrap().unwrap();
    assert_eq!(tenant.name, "Acme Rockets");
    let profile = env.storage.get_profile("u-founder").await.unwrap().unwrap();
    assert_eq!(profile.tenant_id, inv.tenant_id);
    assert_eq!(profile.role, "tenant_admin");
    let employee = env
        .storage
        .find_employee(&inv.tenant_id, "u-founder")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(employee.employee_code, "EMP001");
    assert_eq!(employee.job_title.as_deref(), Some("Founder"));
    assert_eq!(
        env.store.find_by_id(&inv.id).await.unwrap().unwrap().status,
        InvitationStatus::Accepted
    );

    let stats = env.storage.onboarding_stats().await.unwrap();
    assert_eq!(stats.invitations_accepted, 1);
    assert_eq!(stats.tenants, 1);
    assert_eq!(stats.profiles, 1);
    assert_eq!(stats.employees, 1);
    assert_eq!(stats.partial_provisions, 0);
}

#[tokio::test]
async fn concurrent_confirmations_provision_exactly_once() {
    let env = setup().await;
    let inv = env
        .store
        .create(owner("race@acme.example", "Alex Chen"))
        .await
        .unwrap();

    let mut joins = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let handler = env.handler.clone();
        let ev = event("u-race", "race@acme.example", &inv.token);
        joins.spawn(async move { handler.handle(&ev).await });
    }

    let mut results = Vec::new();
    while let Some(joined) = joins.join_next().await {
        results.push(joined.unwrap().unwrap());
    }
    assert_eq!(results.len(), 8);

    // Every delivery observed the one persisted outcome.
    let first = &results[0];
    for result in &results {
        assert_eq!(result.tenant_id, first.tenant_id);
        assert_eq!(result.role_id, first.role_id);
        assert_eq!(result.employee_code, first.employee_code);
        assert_eq!(result.status, ProvisioningStatus::Provisioned);
    }

    let stats = env.storage.onboarding_stats().await.unwrap();
    assert_eq!(stats.tenants, 1);
    assert_eq!(stats.profiles, 1);
    assert_eq!(stats.employees, 1);
    let employee = env
        .storage
        .find_employee(&inv.tenant_id, "u-race")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.employee_code.as_deref(), Some(employee.employee_code.as_str()));
}

#[tokio::test]
async fn late_redelivery_returns_the_persisted_result() {
    let env = setup().await;
    let inv = env
        .store
        .create(owner("replay@acme.example", "Alex Chen"))
        .await
        .unwrap();
    let ev = event("u-replay", "replay@acme.example", &inv.token);

    let first = env.handler.handle(&ev).await.unwrap();
    // The provider redelivers long after settlement; same arguments, same
    // answer, no second provisioning.
    let second = env.handler.handle(&ev).await.unwrap();
    assert_eq!(second.tenant_id, first.tenant_id);
    assert_eq!(second.user_id, first.user_id);
    assert_eq!(second.role_id, first.role_id);
    assert_eq!(second.employee_code, first.employee_code);

    let stats = env.storage.onboarding_stats().await.unwrap();
    assert_eq!(stats.employees, 1);
}

#[tokio::test]
async fn collaborators_join_the_owners_tenant_with_sequential_codes() {
    let env = setup().await;
    let inv = env
        .store
        .create(owner("boss@acme.example", "Alex Chen"))
        .await
        .unwrap();
    env.handler
        .handle(&event("u-boss", "boss@acme.example", &inv.token))
        .await
        .unwrap();

    let hire = env
        .store
        .create(collaborator("dev@acme.example", "Jordan Reyes", &inv.tenant_id))
        .await
        .unwrap();
    let result = env
        .handler
        .handle(&event("u-dev", "dev@acme.example", &hire.token))
        .await
        .unwrap();

    assert_eq!(result.tenant_id, inv.tenant_id);
    assert_eq!(result.role, "employee");
    assert_eq!(result.employee_code.as_deref(), Some("EMP002"));

    let stats = env.storage.onboarding_stats().await.unwrap();
    assert_eq!(stats.tenants, 1);
    assert_eq!(stats.profiles, 2);
    assert_eq!(stats.employees, 2);
}

#[tokio::test]
async fn parallel_collaborators_get_distinct_contiguous_codes() {
    let env = setup_with_config(|config| {
        config.provisioning.allocator_max_attempts = 20;
    })
    .await;
    let inv = env
        .store
        .create(owner("ceo@acme.example", "Alex Chen"))
        .await
        .unwrap();
    env.handler
        .handle(&event("u-ceo", "ceo@acme.example", &inv.token))
        .await
        .unwrap();

    let mut invitations = Vec::new();
    for i in 0..5 {
        let email = format!("hire{i}@acme.example");
        let hire = env
            .store
            .create(collaborator(&email, "New Hire", &inv.tenant_id))
            .await
            .unwrap();
        invitations.push((format!("u-hire{i}"), email, hire.token));
    }

    let mut joins = tokio::task::JoinSet::new();
    for (user_id, email, token) in invitations {
        let handler = env.handler.clone();
        joins.spawn(async move { handler.handle(&event(&user_id, &email, &token)).await });
    }
    let mut codes = HashSet::new();
    while let Some(joined) = joins.join_next().await {
        let result = joined.unwrap().unwrap();
        assert_eq!(result.status, ProvisioningStatus::Provisioned);
        codes.insert(result.employee_code.unwrap());
    }

    // Max-plus-one allocation with rescans never leaves a gap.
    let expected: HashSet<String> =
        (2..=6).map(|n| format!("EMP{n:03}")).collect();
    assert_eq!(codes, expected);
    let stats = env.storage.onboarding_stats().await.unwrap();
    assert_eq!(stats.employees, 6);
}

#[tokio::test]
async fn overdue_invitation_expires_when_confirmed() {
    let env = setup().await;
    let inv = env
        .store
        .create(owner("slow@acme.example", "Alex Chen"))
        .await
        .unwrap();
    backdate(&env.storage, &inv.id).await;

    let err = env
        .handler
        .handle(&event("u-slow", "slow@acme.example", &inv.token))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "expired");

    // The observed expiry is recorded; nothing was provisioned.
    assert_eq!(
        env.store.find_by_id(&inv.id).await.unwrap().unwrap().status,
        InvitationStatus::Expired
    );
    assert!(env.storage.get_tenant(&inv.tenant_id).await.unwrap().is_none());

    // Expired is terminal: a fresh invitation for the same email is allowed.
    env.store
        .create(owner("slow@acme.example", "Alex Chen"))
        .await
        .unwrap();
}

#[tokio::test]
async fn sweep_expires_only_overdue_pending_rows() {
    let env = setup().await;

    let overdue = env
        .store
        .create(owner("overdue@acme.example", "Alex Chen"))
        .await
        .unwrap();
    backdate(&env.storage, &overdue.id).await;

    let accepted = env
        .store
        .create(owner("done@acme.example", "Sam Okafor"))
        .await
        .unwrap();
    env.handler
        .handle(&event("u-done", "done@acme.example", &accepted.token))
        .await
        .unwrap();
    backdate(&env.storage, &accepted.id).await;

    let fresh = env
        .store
        .create(owner("fresh@acme.example", "Jordan Reyes"))
        .await
        .unwrap();

    let swept = env.store.sweep_expired(Utc::now()).await.unwrap();
    assert_eq!(swept, 1);

    assert_eq!(
        env.store.find_by_id(&overdue.id).await.unwrap().unwrap().status,
        InvitationStatus::Expired
    );
    assert_eq!(
        env.store.find_by_id(&accepted.id).await.unwrap().unwrap().status,
        InvitationStatus::Accepted
    );
    assert_eq!(
        env.store.find_by_id(&fresh.id).await.unwrap().unwrap().status,
        InvitationStatus::Pending
    );
}

#[tokio::test]
async fn failed_validation_consumes_nothing() {
    let env = setup().await;
    let inv = env
        .store
        .create(owner("careful@acme.example", "Alex Chen"))
        .await
        .unwrap();

    let err = env
        .handler
        .handle(&event("u-wrong", "wrong@else.example", &inv.token))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "email_mismatch");
    let err = env
        .handler
        .handle(&event("u-none", "careful@acme.example", "not-a-token"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_token");

    // The invitation survives both rejections untouched.
    assert_eq!(
        env.store.find_by_id(&inv.id).await.unwrap().unwrap().status,
        InvitationStatus::Pending
    );
    let result = env
        .handler
        .handle(&event("u-right", "careful@acme.example", &inv.token))
        .await
        .unwrap();
    assert_eq!(result.status, ProvisioningStatus::Provisioned);
}

#[tokio::test]
async fn email_comparison_is_case_insensitive() {
    let env = setup().await;
    let inv = env
        .store
        .create(owner("Taylor@Corp.Example", "Taylor Brook"))
        .await
        .unwrap();

    // Reissue for the same mailbox in a different case is a duplicate.
    let err = env
        .store
        .create(owner("taylor@corp.example", "Taylor Brook"))
        .await
        .unwrap_err();
    assert!(matches!(err, CreateInvitationError::DuplicateActive));

    let result = env
        .handler
        .handle(&event("u-taylor", "TAYLOR@CORP.EXAMPLE", &inv.token))
        .await
        .unwrap();
    assert_eq!(result.status, ProvisioningStatus::Provisioned);
}

#[tokio::test]
async fn revoked_invitation_rejects_confirmation() {
    let env = setup().await;
    let inv = env
        .store
        .create(owner("gone@acme.example", "Alex Chen"))
        .await
        .unwrap();

    let outcome = env.store.revoke(&inv.id).await.unwrap();
    assert!(matches!(outcome, RevokeOutcome::Revoked));

    let err = env
        .handler
        .handle(&event("u-gone", "gone@acme.example", &inv.token))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "already_used");
    assert!(env.storage.get_tenant(&inv.tenant_id).await.unwrap().is_none());

    // Revocation is single-shot.
    let outcome = env.store.revoke(&inv.id).await.unwrap();
    assert!(matches!(
        outcome,
        RevokeOutcome::NotPending(InvitationStatus::Revoked)
    ));

    // Revoked is terminal, so the seat can be reoffered.
    env.store
        .create(owner("gone@acme.example", "Alex Chen"))
        .await
        .unwrap();
}

#[tokio::test]
async fn accepted_invitation_cannot_be_revoked() {
    let env = setup().await;
    let inv = env
        .store
        .create(owner("keep@acme.example", "Alex Chen"))
        .await
        .unwrap();
    env.handler
        .handle(&event("u-keep", "keep@acme.example", &inv.token))
        .await
        .unwrap();

    let outcome = env.store.revoke(&inv.id).await.unwrap();
    assert!(matches!(
        outcome,
        RevokeOutcome::NotPending(InvitationStatus::Accepted)
    ));
    assert!(matches!(
        env.store.revoke("missing").await.unwrap(),
        RevokeOutcome::NotFound
    ));
}

#[tokio::test]
async fn one_active_invitation_per_email_and_type() {
    let env = setup().await;
    env.store
        .create(owner("mixed@acme.example", "Alex Chen"))
        .await
        .unwrap();

    let err = env
        .store
        .create(owner("mixed@acme.example", "Alex Chen"))
        .await
        .unwrap_err();
    assert!(matches!(err, CreateInvitationError::DuplicateActive));

    // A different type for the same email is a separate offer.
    env.store
        .create(collaborator("mixed@acme.example", "Alex Chen", "t-other"))
        .await
        .unwrap();
}

#[tokio::test]
async fn role_catalog_outage_leaves_the_invitation_retriable() {
    let env = setup().await;
    sqlx::query("DELETE FROM roles")
        .execute(&env.storage.pool())
        .await
        .unwrap();
    let inv = env
        .store
        .create(owner("blocked@acme.example", "Alex Chen"))
        .await
        .unwrap();
    let ev = event("u-blocked", "blocked@acme.example", &inv.token);

    let err = env.handler.handle(&ev).await.unwrap_err();
    assert_eq!(err.code(), "role_missing");
    assert!(!err.is_transient());
    assert_eq!(
        env.store.find_by_id(&inv.id).await.unwrap().unwrap().status,
        InvitationStatus::Pending
    );

    // Once the catalog is reseeded the very same event goes through.
    sqlx::query("INSERT INTO roles (id, name) VALUES ('r-admin', 'tenant_admin')")
        .execute(&env.storage.pool())
        .await
        .unwrap();
    let result = env.handler.handle(&ev).await.unwrap();
    assert_eq!(result.role_id, "r-admin");
    assert_eq!(result.status, ProvisioningStatus::Provisioned);
}

#[tokio::test]
async fn stats_track_partial_provisions_until_repair() {
    let env = setup().await;
    let inv = env
        .store
        .create(owner("partial@acme.example", "Alex Chen"))
        .await
        .unwrap();
    env.handler
        .handle(&event("u-partial", "partial@acme.example", &inv.token))
        .await
        .unwrap();

    // Rewind the employee step as if allocation had failed mid-flight.
    sqlx::query("DELETE FROM employees")
        .execute(&env.storage.pool())
        .await
        .unwrap();
    sqlx::query(
        "UPDATE provisioning_results SET employee_code = NULL, status = 'provisioned_partial'",
    )
    .execute(&env.storage.pool())
    .await
    .unwrap();

    let stats = env.storage.onboarding_stats().await.unwrap();
    assert_eq!(stats.partial_provisions, 1);
    assert_eq!(stats.employees, 0);

    let outcome = env.handler.repair(&inv.id).await.unwrap();
    let RepairOutcome::Repaired(result) = outcome else {
        panic!("expected Repaired, got {outcome:?}");
    };
    assert_eq!(result.status, ProvisioningStatus::Provisioned);
    assert_eq!(result.employee_code.as_deref(), Some("EMP001"));

    let stats = env.storage.onboarding_stats().await.unwrap();
    assert_eq!(stats.partial_provisions, 0);
    assert_eq!(stats.employees, 1);
}
