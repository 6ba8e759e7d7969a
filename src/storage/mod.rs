//! Persistence for accounts, the ledger audit log and invite bookkeeping.
//!
//! Every method of [`LedgerStore`] is one complete unit of work: it either
//! commits all of its writes or none of them. Mutations lock the target
//! account for the whole transaction; reads never lock.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::error::DatabaseError;
use thiserror::Error;
use tracing::info;

use crate::config::LedgerConfig;
use crate::domain::{
    Account, AccountId, AuditSnapshot, BalanceMutation, Credits, InviteRecordView,
    InviteRegistration, InviteStats, LedgerEntry, MutationError, Page, PageRequest,
};

mod postgres;
mod sqlite;

pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

/// SQL migration for the SQLite schema
pub const SQLITE_MIGRATION_001_INITIAL: &str = include_str!("migrations/sqlite/001_initial.sql");

/// SQL migration for the PostgreSQL schema
pub const POSTGRES_MIGRATION_001_INITIAL: &str =
    include_str!("migrations/postgres/001_initial.sql");

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("Account already exists: {0}")]
    AccountAlreadyExists(String),

    #[error("Insufficient balance in account {account_id}: balance {balance}, required {required}")]
    InsufficientBalance {
        account_id: AccountId,
        balance: Credits,
        required: Credits,
    },

    #[error("Rejected mutation: {0}")]
    Rejected(MutationError),

    #[error("Invite code already in use: {0}")]
    DuplicateInviteCode(String),

    #[error("Lock conflict: {0}")]
    LockConflict(#[source] sqlx::Error),

    #[error("Unsupported database url: {0}")]
    UnsupportedBackend(String),

    #[error("Database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("Corrupt row: {0}")]
    Corrupt(#[from] anyhow::Error),
}

impl StoreError {
    /// Transient failures that may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::LockConflict(_))
    }

    fn rejected(account_id: &str, err: MutationError) -> Self {
        match err {
            MutationError::InsufficientBalance { balance, required } => {
                StoreError::InsufficientBalance {
                    account_id: account_id.to_string(),
                    balance,
                    required,
                }
            }
            other => StoreError::Rejected(other),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if is_lock_conflict(&err) {
            StoreError::LockConflict(err)
        } else {
            StoreError::Database(err)
        }
    }
}

/// Lock waits, deadlocks and serialization failures, on either backend.
fn is_lock_conflict(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => {
            if let Some(sqlite) = db.try_downcast_ref::<sqlx::sqlite::SqliteError>() {
                // Extended result codes keep the primary code in the low byte
                sqlite
                    .code()
                    .and_then(|code| code.parse::<i32>().ok())
                    .is_some_and(|code| matches!(code & 0xff, 5 | 6))
            } else if let Some(pg) = db.try_downcast_ref::<sqlx::postgres::PgDatabaseError>() {
                matches!(pg.code(), "40P01" | "55P03" | "40001")
            } else {
                false
            }
        }
        _ => false,
    }
}

/// True when `err` is a unique violation on a constraint mentioning `column`.
fn is_unique_violation_on(err: &sqlx::Error, column: &str) -> bool {
    match err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            db.constraint().is_some_and(|c| c.contains(column)) || db.message().contains(column)
        }
        _ => false,
    }
}

/// Map a failed account insert to the business error it represents.
fn account_insert_error(err: sqlx::Error, account: &Account) -> StoreError {
    if is_unique_violation_on(&err, "invite_code") {
        StoreError::DuplicateInviteCode(account.invite_code.clone().unwrap_or_default())
    } else if is_unique_violation_on(&err, "external_id") {
        StoreError::AccountAlreadyExists(account.external_id.clone().unwrap_or_default())
    } else if is_unique_violation_on(&err, "id") || is_unique_violation_on(&err, "pkey") {
        StoreError::AccountAlreadyExists(account.id.clone())
    } else {
        err.into()
    }
}

/// The `AccountAlreadyExists` error for an invitee whose id or external id
/// belongs to the account `taken_id`.
fn taken_by(invitee: &Account, taken_id: &str) -> StoreError {
    match &invitee.external_id {
        Some(external_id) if taken_id != invitee.id => {
            StoreError::AccountAlreadyExists(external_id.clone())
        }
        _ => StoreError::AccountAlreadyExists(invitee.id.clone()),
    }
}

/// Storage operations needed by the ledger and invite services.
///
/// Implementations:
/// - `SqliteStore`: single-file SQLite database
/// - `PostgresStore`: PostgreSQL with row-level locks
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    /// Create tables and indexes if missing.
    async fn migrate(&self) -> Result<()>;

    /// Insert a new account. Fails `AccountAlreadyExists` when the id or
    /// external id is taken.
    async fn create_account(&self, account: &Account) -> Result<()>;

    async fn get_account(&self, id: &str) -> Result<Option<Account>>;

    async fn find_account_by_external_id(&self, external_id: &str) -> Result<Option<Account>>;

    async fn find_account_by_invite_code(&self, code: &str) -> Result<Option<Account>>;

    async fn invite_code_exists(&self, code: &str) -> Result<bool>;

    /// Give the account `code` unless it already has one. Returns the code
    /// the account holds afterwards.
    async fn assign_invite_code(&self, id: &str, code: &str) -> Result<String>;

    /// Lock the account, apply the mutation and append its ledger entry.
    async fn apply_mutation(&self, mutation: &BalanceMutation) -> Result<LedgerEntry>;

    /// Ledger entries for an account, newest first.
    async fn list_entries(&self, id: &str, request: PageRequest) -> Result<Page<LedgerEntry>>;

    /// Create the invitee, the invite record, the inviter's reward entry and
    /// the stats update in one transaction. Returns the reward entry.
    async fn register_invitee(&self, registration: &InviteRegistration) -> Result<LedgerEntry>;

    async fn get_invite_stats(&self, id: &str) -> Result<Option<InviteStats>>;

    /// Invite records where `id` is the inviter, newest first.
    async fn list_invite_records(
        &self,
        id: &str,
        request: PageRequest,
    ) -> Result<Page<InviteRecordView>>;

    /// Figures needed to verify the ledger invariants.
    async fn audit_snapshot(&self) -> Result<AuditSnapshot>;
}

/// Open the store selected by the configured database url. Call `migrate` before first use.
pub async fn connect(config: &LedgerConfig) -> Result<Arc<dyn LedgerStore>> {
    let url = config.database.url.as_str();
    let lock_timeout = Duration::from_millis(config.database.lock_timeout_ms);
    let max_connections = config.database.max_connections;

    let store: Arc<dyn LedgerStore> = if url.starts_with("sqlite:") {
        Arc::new(SqliteStore::connect(url, max_connections, lock_timeout).await?)
    } else if url.starts_with("postgres:") || url.starts_with("postgresql:") {
        Arc::new(PostgresStore::connect(url, max_connections, lock_timeout).await?)
    } else {
        return Err(StoreError::UnsupportedBackend(redact(url)));
    };

    info!(backend = store.backend(), "connected to ledger store");
    Ok(store)
}

/// Strip credentials from a database url before it reaches logs or errors.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}
