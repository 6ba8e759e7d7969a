mod common;

use anyhow::Result;
use common::{account_with_balance, test_service};
use usage_ledger::application::AppError;
use usage_ledger::domain::{AccountClass, ActionType, NewAccount, PageRequest, Reason};

#[tokio::test]
async fn test_open_account_starts_with_configured_balance() -> Result<()> {
    let (service, _temp) = test_service().await?;

    let account = service
        .open_account(
            NewAccount::new("u-1")
                .with_external_id("openid-1")
                .with_nickname("Ada"),
        )
        .await?;
    assert_eq!(account.balance, 3);
    assert!(account.invite_code.is_none());

    let snapshot = service.check_balance("u-1").await?;
    assert_eq!(snapshot.balance, 3);
    assert_eq!(snapshot.usage_limit, 3);
    assert!(snapshot.can_consume);
    assert_eq!(snapshot.account_class, AccountClass::Free);

    // Opening an account writes no ledger entry
    let history = service.history("u-1", PageRequest::default()).await?;
    assert_eq!(history.total, 0);

    Ok(())
}

#[tokio::test]
async fn test_open_account_rejects_taken_ids() -> Result<()> {
    let (service, _temp) = test_service().await?;
    service
        .open_account(NewAccount::new("u-1").with_external_id("openid-1"))
        .await?;

    let result = service.open_account(NewAccount::new("u-1")).await;
    assert!(matches!(result, Err(AppError::AccountAlreadyExists(_))));

    let result = service
        .open_account(NewAccount::new("u-2").with_external_id("openid-1"))
        .await;
    assert!(matches!(result, Err(AppError::AccountAlreadyExists(_))));

    Ok(())
}

#[tokio::test]
async fn test_check_unknown_account() -> Result<()> {
    let (service, _temp) = test_service().await?;

    let err = service.check_balance("missing").await.unwrap_err();
    assert!(matches!(err, AppError::AccountNotFound(_)));
    assert_eq!(err.status_code(), 404);

    Ok(())
}

#[tokio::test]
async fn test_decrement_records_entry() -> Result<()> {
    let (service, _temp) = test_service().await?;
    account_with_balance(&service, "acc", 5).await?;
    let before = service.history("acc", PageRequest::default()).await?.total;

    let entry = service.decrement("acc", "gen-1").await?;
    assert_eq!(entry.balance_after, 4);
    assert_eq!(entry.amount, -1);
    assert_eq!(entry.action, ActionType::Decrement);
    assert_eq!(entry.reason, Reason::Generation);

    let history = service.history("acc", PageRequest::new(1, 20)).await?;
    assert_eq!(history.total, before + 1);
    let latest = &history.items[0];
    assert_eq!(latest.id, entry.id);
    assert_eq!(latest.balance_after, 4);
    assert_eq!(latest.reference_id.as_deref(), Some("gen-1"));

    Ok(())
}

#[tokio::test]
async fn test_decrement_at_zero_is_rejected_without_writes() -> Result<()> {
    let (service, _temp) = test_service().await?;
    account_with_balance(&service, "acc", 0).await?;
    let before = service.history("acc", PageRequest::default()).await?.total;

    let err = service.decrement("acc", "gen-1").await.unwrap_err();
    match &err {
        AppError::InsufficientBalance {
            account_id,
            balance,
            required,
        } => {
            assert_eq!(account_id, "acc");
            assert_eq!(*balance, 0);
            assert_eq!(*required, 1);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(err.status_code(), 403);

    assert_eq!(service.check_balance("acc").await?.balance, 0);
    assert!(!service.check_balance("acc").await?.can_consume);
    let after = service.history("acc", PageRequest::default()).await?.total;
    assert_eq!(after, before);

    Ok(())
}

#[tokio::test]
async fn test_decrement_unknown_account() -> Result<()> {
    let (service, _temp) = test_service().await?;

    let result = service.decrement("missing", "gen-1").await;
    assert!(matches!(result, Err(AppError::AccountNotFound(_))));

    Ok(())
}

#[tokio::test]
async fn test_restore_compensates_decrement() -> Result<()> {
    let (service, _temp) = test_service().await?;
    service.open_account(NewAccount::new("acc")).await?;

    let dec = service.decrement("acc", "gen-1").await?;
    let res = service.restore("acc", "gen-1").await?;

    assert_eq!(res.balance_after, 3);
    assert_eq!(res.action, ActionType::Restore);
    assert_eq!(res.reason, Reason::Restore);
    assert_eq!(dec.amount + res.amount, 0);

    Ok(())
}

#[tokio::test]
async fn test_restore_is_not_idempotent() -> Result<()> {
    let (service, _temp) = test_service().await?;
    service.open_account(NewAccount::new("acc")).await?;

    service.decrement("acc", "gen-1").await?;
    service.restore("acc", "gen-1").await?;
    let second = service.restore("acc", "gen-1").await?;

    // Each restore adds a credit, even for the same reference
    assert_eq!(second.balance_after, 4);
    assert_eq!(
        service.history("acc", PageRequest::default()).await?.total,
        3
    );

    Ok(())
}

#[tokio::test]
async fn test_add_validates_amount_and_reason() -> Result<()> {
    let (service, _temp) = test_service().await?;
    service.open_account(NewAccount::new("acc")).await?;

    let err = service.add("acc", 0, "payment", None).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidAmount(_)));
    assert_eq!(err.status_code(), 400);

    let err = service.add("acc", -2, "payment", None).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidAmount(_)));

    // The amount is checked before the reason
    let err = service.add("acc", 0, "bonus", None).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidAmount(_)));

    let err = service.add("acc", 1, "generation", None).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidReason(_)));

    let err = service.add("acc", 1, "bonus", None).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidReason(_)));

    let err = service.add("missing", 1, "payment", None).await.unwrap_err();
    assert!(matches!(err, AppError::AccountNotFound(_)));

    // Nothing was written by the rejected credits
    assert_eq!(service.check_balance("acc").await?.balance, 3);
    assert_eq!(
        service.history("acc", PageRequest::default()).await?.total,
        0
    );

    Ok(())
}

#[tokio::test]
async fn test_payment_marks_account_paid() -> Result<()> {
    let (service, _temp) = test_service().await?;
    service.open_account(NewAccount::new("acc")).await?;

    let entry = service
        .add("acc", 10, "admin_grant", Some("support-ticket-7"))
        .await?;
    assert_eq!(entry.balance_after, 13);
    assert_eq!(
        service.check_balance("acc").await?.account_class,
        AccountClass::Free
    );

    let entry = service.add("acc", 20, "payment", Some("order-1")).await?;
    assert_eq!(entry.balance_after, 33);
    assert_eq!(entry.action, ActionType::Increment);
    assert_eq!(entry.reference_id.as_deref(), Some("order-1"));

    let snapshot = service.check_balance("acc").await?;
    assert_eq!(snapshot.account_class, AccountClass::Paid);
    assert_eq!(snapshot.usage_limit, 3);

    Ok(())
}

#[tokio::test]
async fn test_history_pagination() -> Result<()> {
    let (service, _temp) = test_service().await?;
    service.open_account(NewAccount::new("acc")).await?;
    service.add("acc", 30, "admin_grant", None).await?;
    for i in 0..24 {
        service.decrement("acc", &format!("gen-{}", i)).await?;
    }

    let first = service.history("acc", PageRequest::new(1, 10)).await?;
    assert_eq!(first.total, 25);
    assert_eq!(first.total_pages, 3);
    assert_eq!(first.items.len(), 10);
    assert_eq!(first.items[0].reference_id.as_deref(), Some("gen-23"));
    assert!(first
        .items
        .windows(2)
        .all(|w| w[0].sequence > w[1].sequence));

    let last = service.history("acc", PageRequest::new(3, 10)).await?;
    assert_eq!(last.items.len(), 5);
    assert_eq!(last.items[4].action, ActionType::Increment);

    // Out-of-range requests are clamped, not rejected
    let clamped = service.history("acc", PageRequest::new(-1, 0)).await?;
    assert_eq!(clamped.page, 1);
    assert_eq!(clamped.page_size, 20);
    assert_eq!(clamped.items.len(), 20);

    let parsed = service
        .history("acc", PageRequest::parse(Some("x"), Some("500")))
        .await?;
    assert_eq!(parsed.page_size, 100);
    assert_eq!(parsed.items.len(), 25);

    let beyond = service.history("acc", PageRequest::new(9, 10)).await?;
    assert!(beyond.is_empty());
    assert_eq!(beyond.total, 25);

    Ok(())
}

#[tokio::test]
async fn test_history_of_unknown_account_is_empty() -> Result<()> {
    let (service, _temp) = test_service().await?;

    let history = service.history("nobody", PageRequest::default()).await?;
    assert_eq!(history.total, 0);
    assert_eq!(history.total_pages, 0);

    Ok(())
}

#[tokio::test]
async fn test_full_history_is_oldest_first() -> Result<()> {
    let (service, _temp) = test_service().await?;
    service.open_account(NewAccount::new("acc")).await?;
    service.add("acc", 200, "admin_grant", None).await?;
    for i in 0..150 {
        service.decrement("acc", &format!("gen-{}", i)).await?;
    }

    let entries = service.full_history("acc").await?;
    assert_eq!(entries.len(), 151);
    assert_eq!(entries[0].action, ActionType::Increment);
    assert_eq!(entries[150].balance_after, 53);

    Ok(())
}

#[tokio::test]
async fn test_integrity_after_mixed_operations() -> Result<()> {
    let (service, _temp) = test_service().await?;
    service.open_account(NewAccount::new("a")).await?;
    service.open_account(NewAccount::new("b")).await?;

    service.decrement("a", "gen-1").await?;
    service.decrement("a", "gen-2").await?;
    service.restore("a", "gen-2").await?;
    service.add("b", 5, "payment", Some("order-1")).await?;
    let _ = service.decrement("missing", "gen-3").await;

    let report = service.check_integrity().await?;
    assert!(report.is_healthy(), "issues: {:?}", report.issues);
    assert_eq!(report.account_count, 2);
    assert_eq!(report.entry_count, 4);

    Ok(())
}
