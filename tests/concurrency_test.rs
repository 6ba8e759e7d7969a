mod common;

use std::time::Duration;

use anyhow::Result;
use common::{account_with_balance, test_config, test_services};
use sqlx::{Connection, SqliteConnection};
use tempfile::TempDir;
use usage_ledger::application::{AppError, InviteService, LedgerService};
use usage_ledger::config::LedgerConfig;
use usage_ledger::domain::{LedgerEntry, NewAccount, PageRequest};

/// A connection outside the service's pool holding the database write lock
async fn hold_write_lock(config: &LedgerConfig) -> Result<SqliteConnection> {
    let mut conn = SqliteConnection::connect(&config.database.url).await?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut conn).await?;
    Ok(conn)
}

/// Services over a fresh database, with connection settings overridden
async fn services_with(
    max_connections: u32,
    lock_timeout_ms: u64,
) -> Result<(LedgerService, InviteService, LedgerConfig, TempDir)> {
    let temp = TempDir::new()?;
    let mut config = test_config(&temp);
    config.database.max_connections = max_connections;
    config.database.lock_timeout_ms = lock_timeout_ms;
    let ledger = LedgerService::init(config.clone()).await?;
    let invites = InviteService::from_ledger(&ledger);
    Ok((ledger, invites, config, temp))
}

/// Decrement, retrying only on lock conflicts
async fn decrement_with_retry(
    service: &LedgerService,
    account_id: &str,
    reference: &str,
) -> Result<LedgerEntry, AppError> {
    loop {
        match service.decrement(account_id, reference).await {
            Err(e) if e.is_retryable() => tokio::task::yield_now().await,
            other => return other,
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_decrements_never_overdraw() -> Result<()> {
    let (ledger, _invites, _temp) = test_services().await?;
    account_with_balance(&ledger, "acc", 5).await?;
    let entries_before = ledger.history("acc", PageRequest::default()).await?.total;

    let mut handles = Vec::new();
    for i in 0..12 {
        let service = ledger.clone();
        handles.push(tokio::spawn(async move {
            decrement_with_retry(&service, "acc", &format!("gen-{}", i)).await
        }));
    }

    let mut successes = Vec::new();
    let mut insufficient = 0;
    for handle in handles {
        match handle.await? {
            Ok(entry) => successes.push(entry.balance_after),
            Err(AppError::InsufficientBalance { .. }) => insufficient += 1,
            Err(other) => panic!("unexpected error: {:?}", other),
        }
    }

    assert_eq!(successes.len(), 5);
    assert_eq!(insufficient, 7);

    // Every success observed a distinct pre-decrement balance
    successes.sort_unstable();
    assert_eq!(successes, vec![0, 1, 2, 3, 4]);

    assert_eq!(ledger.check_balance("acc").await?.balance, 0);
    let entries_after = ledger.history("acc", PageRequest::default()).await?.total;
    assert_eq!(entries_after - entries_before, 5);

    let report = ledger.check_integrity().await?;
    assert!(report.is_healthy(), "issues: {:?}", report.issues);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_mutations_on_distinct_accounts() -> Result<()> {
    let (ledger, _invites, _temp) = test_services().await?;
    for i in 0..4 {
        ledger
            .open_account(NewAccount::new(format!("acc-{}", i)))
            .await?;
    }

    let mut handles = Vec::new();
    for i in 0..4 {
        for j in 0..3 {
            let service = ledger.clone();
            handles.push(tokio::spawn(async move {
                decrement_with_retry(&service, &format!("acc-{}", i), &format!("gen-{}", j)).await
            }));
        }
    }
    for handle in handles {
        handle.await??;
    }

    for i in 0..4 {
        assert_eq!(
            ledger.check_balance(&format!("acc-{}", i)).await?.balance,
            0
        );
    }

    Ok(())
}

/// Register, retrying only on lock conflicts
async fn register_with_retry(
    invites: &InviteService,
    code: &str,
    new_id: &str,
    external_id: &str,
) -> Result<(), AppError> {
    loop {
        match invites.register_via_invite(code, new_id, external_id).await {
            Err(e) if e.is_retryable() => tokio::task::yield_now().await,
            other => return other.map(|_| ()),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_invites_credit_inviter_once_each() -> Result<()> {
    let (ledger, invites, _temp) = test_services().await?;
    ledger.open_account(NewAccount::new("inviter")).await?;
    let code = invites.generate_code("inviter").await?;

    let mut handles = Vec::new();
    for i in 0..6 {
        let invites = invites.clone();
        let code = code.clone();
        handles.push(tokio::spawn(async move {
            register_with_retry(
                &invites,
                &code,
                &format!("invitee-{}", i),
                &format!("openid-{}", i),
            )
            .await
        }));
    }
    for handle in handles {
        handle.await??;
    }

    assert_eq!(ledger.check_balance("inviter").await?.balance, 9);
    let stats = invites.get_stats("inviter").await?;
    assert_eq!(stats.successful_invites, 6);
    assert_eq!(stats.total_rewards, 6);

    let report = ledger.check_integrity().await?;
    assert!(report.is_healthy(), "issues: {:?}", report.issues);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_invitee_registered_concurrently_once() -> Result<()> {
    let (ledger, invites, _temp) = test_services().await?;
    let mut codes = Vec::new();
    for i in 0..4 {
        let id = format!("inviter-{}", i);
        ledger.open_account(NewAccount::new(id.clone())).await?;
        codes.push(invites.generate_code(&id).await?);
    }

    let mut handles = Vec::new();
    for code in codes {
        let invites = invites.clone();
        handles.push(tokio::spawn(async move {
            register_with_retry(&invites, &code, "contested", "openid-contested").await
        }));
    }

    let mut succeeded = 0;
    for handle in handles {
        match handle.await? {
            Ok(()) => succeeded += 1,
            Err(AppError::AccountAlreadyExists(_)) => {}
            Err(other) => panic!("unexpected error: {:?}", other),
        }
    }
    assert_eq!(succeeded, 1);

    let report = ledger.check_integrity().await?;
    assert!(report.is_healthy(), "issues: {:?}", report.issues);
    assert_eq!(report.invite_record_count, 1);

    // Exactly one inviter was rewarded
    let mut rewarded = 0;
    for i in 0..4 {
        if ledger.check_balance(&format!("inviter-{}", i)).await?.balance == 4 {
            rewarded += 1;
        }
    }
    assert_eq!(rewarded, 1);

    Ok(())
}

#[tokio::test]
async fn test_held_write_lock_is_a_retryable_conflict() -> Result<()> {
    let (ledger, _invites, config, _temp) = services_with(4, 200).await?;
    ledger.open_account(NewAccount::new("acc")).await?;

    let mut holder = hold_write_lock(&config).await?;
    let err = ledger.decrement("acc", "gen-1").await.unwrap_err();
    assert!(matches!(err, AppError::LockConflict(_)), "got {:?}", err);
    assert!(err.is_retryable());
    assert_eq!(err.status_code(), 409);
    sqlx::query("ROLLBACK").execute(&mut holder).await?;

    // The failed attempt left nothing behind
    assert_eq!(ledger.check_balance("acc").await?.balance, 3);
    let entry = ledger.decrement("acc", "gen-1").await?;
    assert_eq!(entry.balance_after, 2);
    assert_eq!(ledger.history("acc", PageRequest::default()).await?.total, 1);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_mutation_rolls_back_and_frees_the_connection() -> Result<()> {
    // One pooled connection, so follow-up calls reuse the cancelled one
    let (ledger, _invites, config, _temp) = services_with(1, 5000).await?;
    ledger.open_account(NewAccount::new("acc")).await?;

    let mut holder = hold_write_lock(&config).await?;
    let cancelled =
        tokio::time::timeout(Duration::from_millis(200), ledger.decrement("acc", "gen-1")).await;
    assert!(cancelled.is_err());
    sqlx::query("COMMIT").execute(&mut holder).await?;

    let entry = ledger.restore("acc", "gen-1").await?;
    assert_eq!(entry.balance_after, 4);
    let entry = ledger.decrement("acc", "gen-2").await?;
    assert_eq!(entry.balance_after, 3);

    // Independent writers are not locked out
    let mut other = hold_write_lock(&config).await?;
    sqlx::query("COMMIT").execute(&mut other).await?;

    assert_eq!(ledger.history("acc", PageRequest::default()).await?.total, 2);
    let report = ledger.check_integrity().await?;
    assert!(report.is_healthy(), "issues: {:?}", report.issues);

    Ok(())
}

#[tokio::test]
async fn test_taken_identity_is_rejected_while_store_is_busy() -> Result<()> {
    let (ledger, invites, config, _temp) = services_with(4, 200).await?;
    ledger.open_account(NewAccount::new("inviter")).await?;
    ledger
        .open_account(NewAccount::new("old").with_external_id("openid-old"))
        .await?;
    let code = invites.generate_code("inviter").await?;

    let mut holder = hold_write_lock(&config).await?;
    let result = invites
        .register_via_invite(&code, "fresh", "openid-old")
        .await;
    sqlx::query("ROLLBACK").execute(&mut holder).await?;

    match result {
        Err(AppError::AccountAlreadyExists(id)) => assert_eq!(id, "openid-old"),
        other => panic!("unexpected result: {:?}", other.map(|o| o.invitee_id)),
    }
    assert!(ledger.get_account("fresh").await.is_err());
    assert_eq!(invites.get_stats("inviter").await?.successful_invites, 0);

    Ok(())
}

#[tokio::test]
async fn test_postgres_backend_when_configured() -> Result<()> {
    let Ok(url) = std::env::var("LEDGER_TEST_POSTGRES_URL") else {
        return Ok(());
    };

    let config = usage_ledger::config::LedgerConfig::default().with_database_url(url);
    let ledger = LedgerService::init(config).await?;
    let invites = InviteService::from_ledger(&ledger);

    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let inviter = format!("pg-inviter-{}", suffix);
    account_with_balance(&ledger, &inviter, 1).await?;

    ledger.decrement(&inviter, "gen-1").await?;
    assert!(matches!(
        ledger.decrement(&inviter, "gen-2").await,
        Err(AppError::InsufficientBalance { .. })
    ));

    let code = invites.generate_code(&inviter).await?;
    let invitee = format!("pg-invitee-{}", suffix);
    let outcome = invites
        .register_via_invite(&code, &invitee, &format!("openid-{}", suffix))
        .await?;
    assert_eq!(outcome.inviter_balance, 1);
    assert_eq!(invites.get_stats(&inviter).await?.successful_invites, 1);

    Ok(())
}
