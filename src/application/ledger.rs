use std::sync::Arc;

use tracing::{info, warn};

use crate::config::LedgerConfig;
use crate::domain::{
    build_integrity_report, Account, BalanceMutation, BalanceSnapshot, Credits, IntegrityReport,
    LedgerEntry, MutationError, NewAccount, Page, PageRequest, Reason, MAX_PAGE_SIZE,
};
use crate::storage::{self, LedgerStore};

use super::AppError;

/// Balance operations against one ledger store.
/// This is the primary interface for any client (CLI, API layer, tests).
#[derive(Clone)]
pub struct LedgerService {
    store: Arc<dyn LedgerStore>,
    config: LedgerConfig,
}

impl LedgerService {
    pub fn new(store: Arc<dyn LedgerStore>, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    /// Open the configured store and create its schema if missing.
    pub async fn init(config: LedgerConfig) -> Result<Self, AppError> {
        let service = Self::connect(config).await?;
        service.store.migrate().await?;
        Ok(service)
    }

    /// Open the configured store without touching its schema.
    pub async fn connect(config: LedgerConfig) -> Result<Self, AppError> {
        config.validate()?;
        let store = storage::connect(&config).await?;
        Ok(Self::new(store, config))
    }

    pub fn store(&self) -> Arc<dyn LedgerStore> {
        Arc::clone(&self.store)
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    // ========================
    // Account operations
    // ========================

    /// Create an account holding the configured starting balance.
    pub async fn open_account(&self, new: NewAccount) -> Result<Account, AppError> {
        let mut account = Account::new(new.id, self.config.starting_balance);
        account.external_id = new.external_id;
        account.nickname = new.nickname;

        self.store.create_account(&account).await?;
        info!(account_id = %account.id, balance = account.balance, "opened account");
        Ok(account)
    }

    pub async fn get_account(&self, account_id: &str) -> Result<Account, AppError> {
        self.store
            .get_account(account_id)
            .await?
            .ok_or_else(|| AppError::AccountNotFound(account_id.to_string()))
    }

    /// Current balance without taking any lock. May be stale relative to an
    /// in-flight mutation and must not gate one.
    pub async fn check_balance(&self, account_id: &str) -> Result<BalanceSnapshot, AppError> {
        Ok(self.get_account(account_id).await?.snapshot())
    }

    // ========================
    // Balance mutations
    // ========================

    /// Consume one credit for a generation. Returns the recorded entry, whose
    /// `balance_after` is the remaining balance.
    pub async fn decrement(
        &self,
        account_id: &str,
        reference_id: &str,
    ) -> Result<LedgerEntry, AppError> {
        self.apply(BalanceMutation::decrement(account_id, reference_id))
            .await
    }

    /// Give back one credit for a generation that failed downstream.
    /// Every call adds a credit, even for a reference already restored.
    pub async fn restore(
        &self,
        account_id: &str,
        reference_id: &str,
    ) -> Result<LedgerEntry, AppError> {
        self.apply(BalanceMutation::restore(account_id, reference_id))
            .await
    }

    /// Credit `amount` for `payment`, `invite_reward` or `admin_grant`.
    pub async fn add(
        &self,
        account_id: &str,
        amount: Credits,
        reason: &str,
        reference_id: Option<&str>,
    ) -> Result<LedgerEntry, AppError> {
        if amount <= 0 {
            return Err(MutationError::InvalidAmount(amount).into());
        }
        let reason = Reason::from_str(reason)
            .ok_or_else(|| AppError::InvalidReason(format!("unknown reason '{}'", reason)))?;
        let mutation = BalanceMutation::credit(
            account_id,
            amount,
            reason,
            reference_id.map(str::to_string),
        )?;
        self.apply(mutation).await
    }

    async fn apply(&self, mutation: BalanceMutation) -> Result<LedgerEntry, AppError> {
        match self.store.apply_mutation(&mutation).await {
            Ok(entry) => {
                info!(
                    account_id = %entry.account_id,
                    action = %entry.action,
                    amount = entry.amount,
                    balance_after = entry.balance_after,
                    reason = %entry.reason,
                    "balance updated"
                );
                Ok(entry)
            }
            Err(err) => {
                let err = AppError::from(err);
                warn!(
                    account_id = %mutation.account_id,
                    action = %mutation.action,
                    retryable = err.is_retryable(),
                    error = %err,
                    "balance update rejected"
                );
                Err(err)
            }
        }
    }

    // ========================
    // Queries
    // ========================

    /// Ledger entries for an account, newest first. An unknown account has
    /// an empty history.
    pub async fn history(
        &self,
        account_id: &str,
        request: PageRequest,
    ) -> Result<Page<LedgerEntry>, AppError> {
        Ok(self.store.list_entries(account_id, request).await?)
    }

    /// Every ledger entry for an account, oldest first.
    pub async fn full_history(&self, account_id: &str) -> Result<Vec<LedgerEntry>, AppError> {
        let mut entries = Vec::new();
        let mut page = 1;
        loop {
            let batch = self
                .store
                .list_entries(account_id, PageRequest::new(page, MAX_PAGE_SIZE))
                .await?;
            let done = page >= batch.total_pages;
            entries.extend(batch.items);
            if done {
                break;
            }
            page += 1;
        }
        // Entries appended while paging shift later pages by one row
        entries.sort_by_key(|e| e.sequence);
        entries.dedup_by_key(|e| e.sequence);
        Ok(entries)
    }

    // ========================
    // Integrity
    // ========================

    /// Verify the ledger invariants across every account and invite record.
    pub async fn check_integrity(&self) -> Result<IntegrityReport, AppError> {
        let snapshot = self.store.audit_snapshot().await?;
        let report = build_integrity_report(&snapshot);
        if !report.is_healthy() {
            warn!(issues = report.issues.len(), "ledger integrity check found issues");
        }
        Ok(report)
    }
}
