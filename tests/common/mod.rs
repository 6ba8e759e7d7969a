// Allow dead_code because these helpers are used across different test files
// which are compiled separately
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tempfile::TempDir;
use usage_ledger::application::{InviteService, LedgerService};
use usage_ledger::config::LedgerConfig;
use usage_ledger::domain::{InviteCodeSource, NewAccount, RandomCodeSource};

/// Config pointing at a fresh SQLite file inside `dir`
pub fn test_config(dir: &TempDir) -> LedgerConfig {
    let db_path = dir.path().join("test.db");
    LedgerConfig::default().with_database_url(format!("sqlite:{}?mode=rwc", db_path.display()))
}

/// Helper to create a test service with a temporary database
pub async fn test_service() -> Result<(LedgerService, TempDir)> {
    let temp_dir = TempDir::new()?;
    let service = LedgerService::init(test_config(&temp_dir)).await?;
    Ok((service, temp_dir))
}

/// Ledger and invite services sharing one temporary database
pub async fn test_services() -> Result<(LedgerService, InviteService, TempDir)> {
    let (ledger, temp_dir) = test_service().await?;
    let invites = InviteService::from_ledger(&ledger);
    Ok((ledger, invites, temp_dir))
}

/// Open an account and give it exactly `balance` credits
pub async fn account_with_balance(
    service: &LedgerService,
    id: &str,
    balance: i64,
) -> Result<()> {
    let account = service.open_account(NewAccount::new(id)).await?;
    let start = account.balance;
    if balance > start {
        service
            .add(id, balance - start, "admin_grant", Some("test-setup"))
            .await?;
    }
    for i in balance..start {
        service.decrement(id, &format!("setup-{}", i)).await?;
    }
    Ok(())
}

/// Yields scripted codes first, then random ones, counting every call
#[derive(Default)]
pub struct ScriptedCodes {
    queue: Mutex<VecDeque<String>>,
    calls: AtomicUsize,
}

impl ScriptedCodes {
    pub fn new<I, S>(codes: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Arc::new(Self {
            queue: Mutex::new(codes.into_iter().map(Into::into).collect()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl InviteCodeSource for ScriptedCodes {
    fn next_code(&self) -> String {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| RandomCodeSource.next_code())
    }
}

/// Always yields the same code
pub struct FixedCode(pub &'static str, pub AtomicUsize);

impl FixedCode {
    pub fn new(code: &'static str) -> Arc<Self> {
        Arc::new(Self(code, AtomicUsize::new(0)))
    }

    pub fn calls(&self) -> usize {
        self.1.load(Ordering::SeqCst)
    }
}

impl InviteCodeSource for FixedCode {
    fn next_code(&self) -> String {
        self.1.fetch_add(1, Ordering::SeqCst);
        self.0.to_string()
    }
}
