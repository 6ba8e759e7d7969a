use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::domain::{
    next_balance, Account, AccountAudit, ActionType, AuditSnapshot, BalanceMutation,
    InviteRecordView, InviteRegistration, InviteStats, LedgerEntry, Page, PageRequest, Reason,
    RewardAudit,
};

use super::{
    account_insert_error, is_unique_violation_on, taken_by, LedgerStore, Result, StoreError,
    SQLITE_MIGRATION_001_INITIAL,
};

const ACCOUNT_COLUMNS: &str = "id, external_id, nickname, balance, initial_balance, has_ever_paid, invite_code, created_at, updated_at";

const ENTRY_COLUMNS: &str =
    "sequence, id, account_id, action_type, amount, balance_after, reason, reference_id, created_at";

/// Ledger store backed by a single SQLite database file.
///
/// SQLite has no row locks, so every mutation runs in a `BEGIN IMMEDIATE`
/// transaction holding the database write lock. Waiting writers block for
/// up to the busy timeout before failing with a lock conflict.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a SQLite database url, creating the file if missing.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        lock_timeout: Duration,
    ) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(lock_timeout)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(lock_timeout * 2)
            .connect_with(options)
            .await?;

        Ok(Self::new(pool))
    }

    // ========================
    // Transactions
    // ========================

    /// Open a transaction holding the database write lock. Dropping it
    /// before commit rolls back, including while the lock is still awaited.
    async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }

    // ========================
    // Account operations
    // ========================

    async fn insert_account(conn: &mut SqliteConnection, account: &Account) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO accounts (id, external_id, nickname, balance, initial_balance, has_ever_paid, invite_code, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&account.id)
        .bind(&account.external_id)
        .bind(&account.nickname)
        .bind(account.balance)
        .bind(account.initial_balance)
        .bind(account.has_ever_paid)
        .bind(&account.invite_code)
        .bind(timestamp(&account.created_at))
        .bind(timestamp(&account.updated_at))
        .execute(&mut *conn)
        .await
        .map_err(|e| account_insert_error(e, account))?;
        Ok(())
    }

    async fn assign_code_in(conn: &mut SqliteConnection, id: &str, code: &str) -> Result<String> {
        let existing: Option<Option<String>> =
            sqlx::query_scalar("SELECT invite_code FROM accounts WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?;

        match existing {
            None => Err(StoreError::AccountNotFound(id.to_string())),
            Some(Some(current)) => Ok(current),
            Some(None) => {
                sqlx::query("UPDATE accounts SET invite_code = ?, updated_at = ? WHERE id = ?")
                    .bind(code)
                    .bind(timestamp(&Utc::now()))
                    .bind(id)
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| {
                        if is_unique_violation_on(&e, "invite_code") {
                            StoreError::DuplicateInviteCode(code.to_string())
                        } else {
                            e.into()
                        }
                    })?;
                Ok(code.to_string())
            }
        }
    }

    fn row_to_account(row: &SqliteRow) -> anyhow::Result<Account> {
        let created_at: String = row.get("created_at");
        let updated_at: String = row.get("updated_at");

        Ok(Account {
            id: row.get("id"),
            external_id: row.get("external_id"),
            nickname: row.get("nickname"),
            balance: row.get("balance"),
            initial_balance: row.get("initial_balance"),
            has_ever_paid: row.get::<i32, _>("has_ever_paid") != 0,
            invite_code: row.get("invite_code"),
            created_at: parse_timestamp(&created_at).context("Invalid account created_at")?,
            updated_at: parse_timestamp(&updated_at).context("Invalid account updated_at")?,
        })
    }

    // ========================
    // Ledger operations
    // ========================

    /// Apply one mutation inside an open transaction.
    async fn apply_in(
        conn: &mut SqliteConnection,
        mutation: &BalanceMutation,
    ) -> Result<LedgerEntry> {
        let balance: Option<i64> = sqlx::query_scalar("SELECT balance FROM accounts WHERE id = ?")
            .bind(&mutation.account_id)
            .fetch_optional(&mut *conn)
            .await?;
        let balance =
            balance.ok_or_else(|| StoreError::AccountNotFound(mutation.account_id.clone()))?;

        let next = next_balance(balance, mutation.amount)
            .map_err(|e| StoreError::rejected(&mutation.account_id, e))?;
        let mut entry = LedgerEntry::record(mutation, next);

        sqlx::query(
            r#"
            UPDATE accounts
            SET balance = ?, has_ever_paid = MAX(has_ever_paid, ?), updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(next)
        .bind(mutation.marks_paid())
        .bind(timestamp(&entry.created_at))
        .bind(&mutation.account_id)
        .execute(&mut *conn)
        .await?;

        entry.sequence = sqlx::query_scalar(
            r#"
            INSERT INTO ledger_entries (id, account_id, action_type, amount, balance_after, reason, reference_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING sequence
            "#,
        )
        .bind(entry.id.to_string())
        .bind(&entry.account_id)
        .bind(entry.action.as_str())
        .bind(entry.amount)
        .bind(entry.balance_after)
        .bind(entry.reason.as_str())
        .bind(&entry.reference_id)
        .bind(timestamp(&entry.created_at))
        .fetch_one(&mut *conn)
        .await?;

        debug!(
            account_id = %entry.account_id,
            action = %entry.action,
            amount = entry.amount,
            balance_after = entry.balance_after,
            "applied balance mutation"
        );
        Ok(entry)
    }

    fn row_to_entry(row: &SqliteRow) -> anyhow::Result<LedgerEntry> {
        let id: String = row.get("id");
        let action: String = row.get("action_type");
        let reason: String = row.get("reason");
        let created_at: String = row.get("created_at");

        Ok(LedgerEntry {
            id: Uuid::parse_str(&id).context("Invalid ledger entry ID")?,
            sequence: row.get("sequence"),
            account_id: row.get("account_id"),
            action: ActionType::from_str(&action)
                .ok_or_else(|| anyhow::anyhow!("Invalid action type: {}", action))?,
            amount: row.get("amount"),
            balance_after: row.get("balance_after"),
            reason: Reason::from_str(&reason)
                .ok_or_else(|| anyhow::anyhow!("Invalid reason: {}", reason))?,
            reference_id: row.get("reference_id"),
            created_at: parse_timestamp(&created_at).context("Invalid entry created_at")?,
        })
    }

    // ========================
    // Invite operations
    // ========================

    async fn register_in(
        conn: &mut SqliteConnection,
        registration: &InviteRegistration,
    ) -> Result<LedgerEntry> {
        let inviter_id = registration.inviter_id();
        let inviter: Option<String> = sqlx::query_scalar("SELECT id FROM accounts WHERE id = ?")
            .bind(inviter_id)
            .fetch_optional(&mut *conn)
            .await?;
        if inviter.is_none() {
            return Err(StoreError::AccountNotFound(inviter_id.to_string()));
        }

        let invitee = &registration.invitee;
        let taken: Option<String> =
            sqlx::query_scalar("SELECT id FROM accounts WHERE id = ? OR external_id = ? LIMIT 1")
                .bind(&invitee.id)
                .bind(&invitee.external_id)
                .fetch_optional(&mut *conn)
                .await?;
        if let Some(taken_id) = taken {
            return Err(taken_by(invitee, &taken_id));
        }

        Self::insert_account(conn, invitee).await?;

        let record = &registration.record;
        sqlx::query(
            r#"
            INSERT INTO invite_records (id, inviter_id, invitee_id, invite_code, reward_granted, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(&record.inviter_id)
        .bind(&record.invitee_id)
        .bind(&record.invite_code)
        .bind(record.reward_granted)
        .bind(timestamp(&record.created_at))
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            if is_unique_violation_on(&e, "invitee_id") {
                StoreError::AccountAlreadyExists(record.invitee_id.clone())
            } else {
                e.into()
            }
        })?;

        let entry = Self::apply_in(conn, &registration.reward).await?;

        let now = timestamp(&Utc::now());
        sqlx::query(
            r#"
            INSERT INTO invite_stats (account_id, total_invites, successful_invites, total_rewards, last_invite_at, updated_at)
            VALUES (?, 1, 1, ?, ?, ?)
            ON CONFLICT(account_id) DO UPDATE SET
                total_invites = invite_stats.total_invites + 1,
                successful_invites = invite_stats.successful_invites + 1,
                total_rewards = invite_stats.total_rewards + excluded.total_rewards,
                last_invite_at = excluded.last_invite_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(inviter_id)
        .bind(registration.reward.amount)
        .bind(timestamp(&record.created_at))
        .bind(&now)
        .execute(&mut *conn)
        .await?;

        Ok(entry)
    }

    fn row_to_stats(row: &SqliteRow) -> anyhow::Result<InviteStats> {
        let last_invite_at: Option<String> = row.get("last_invite_at");

        Ok(InviteStats {
            account_id: row.get("account_id"),
            total_invites: row.get("total_invites"),
            successful_invites: row.get("successful_invites"),
            total_rewards: row.get("total_rewards"),
            last_invite_at: last_invite_at
                .map(|s| parse_timestamp(&s))
                .transpose()
                .context("Invalid last_invite_at")?,
        })
    }

    fn row_to_record_view(row: &SqliteRow) -> anyhow::Result<InviteRecordView> {
        let id: String = row.get("id");
        let created_at: String = row.get("created_at");

        Ok(InviteRecordView {
            id: Uuid::parse_str(&id).context("Invalid invite record ID")?,
            invitee_id: row.get("invitee_id"),
            invitee_nickname: row.get("invitee_nickname"),
            created_at: parse_timestamp(&created_at).context("Invalid invite created_at")?,
            reward_granted: row.get::<i32, _>("reward_granted") != 0,
        })
    }
}

#[async_trait]
impl LedgerStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SQLITE_MIGRATION_001_INITIAL)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_account(&self, account: &Account) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        Self::insert_account(&mut conn, account).await
    }

    async fn find_account_by_external_id(&self, external_id: &str) -> Result<Option<Account>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM accounts WHERE external_id = ?",
            ACCOUNT_COLUMNS
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(Self::row_to_account(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_account(&self, id: &str) -> Result<Option<Account>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM accounts WHERE id = ?",
            ACCOUNT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(Self::row_to_account(&row)?)),
            None => Ok(None),
        }
    }

    async fn find_account_by_invite_code(&self, code: &str) -> Result<Option<Account>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM accounts WHERE invite_code = ?",
            ACCOUNT_COLUMNS
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(Self::row_to_account(&row)?)),
            None => Ok(None),
        }
    }

    async fn invite_code_exists(&self, code: &str) -> Result<bool> {
        let exists: i64 =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM accounts WHERE invite_code = ?)")
                .bind(code)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists != 0)
    }

    async fn assign_invite_code(&self, id: &str, code: &str) -> Result<String> {
        let mut tx = self.begin().await?;
        let value = Self::assign_code_in(&mut tx, id, code).await?;
        tx.commit().await?;
        Ok(value)
    }

    async fn apply_mutation(&self, mutation: &BalanceMutation) -> Result<LedgerEntry> {
        let mut tx = self.begin().await?;
        let value = Self::apply_in(&mut tx, mutation).await?;
        tx.commit().await?;
        Ok(value)
    }

    async fn list_entries(&self, id: &str, request: PageRequest) -> Result<Page<LedgerEntry>> {
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM ledger_entries WHERE account_id = ?")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;

        let rows = sqlx::query(&format!(
            "SELECT {} FROM ledger_entries WHERE account_id = ? ORDER BY sequence DESC LIMIT ? OFFSET ?",
            ENTRY_COLUMNS
        ))
        .bind(id)
        .bind(request.page_size())
        .bind(request.offset())
        .fetch_all(&self.pool)
        .await?;

        let items = rows
            .iter()
            .map(Self::row_to_entry)
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Page::new(items, total, request))
    }

    async fn register_invitee(&self, registration: &InviteRegistration) -> Result<LedgerEntry> {
        let mut tx = self.begin().await?;
        let value = Self::register_in(&mut tx, registration).await?;
        tx.commit().await?;
        Ok(value)
    }

    async fn get_invite_stats(&self, id: &str) -> Result<Option<InviteStats>> {
        let row = sqlx::query(
            r#"
            SELECT account_id, total_invites, successful_invites, total_rewards, last_invite_at
            FROM invite_stats
            WHERE account_id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(Self::row_to_stats(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_invite_records(
        &self,
        id: &str,
        request: PageRequest,
    ) -> Result<Page<InviteRecordView>> {
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM invite_records WHERE inviter_id = ?")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;

        let rows = sqlx::query(
            r#"
            SELECT r.id, r.invitee_id, a.nickname AS invitee_nickname, r.created_at, r.reward_granted
            FROM invite_records r
            LEFT JOIN accounts a ON a.id = r.invitee_id
            WHERE r.inviter_id = ?
            ORDER BY r.created_at DESC, r.rowid DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(id)
        .bind(request.page_size())
        .bind(request.offset())
        .fetch_all(&self.pool)
        .await?;

        let items = rows
            .iter()
            .map(Self::row_to_record_view)
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Page::new(items, total, request))
    }

    async fn audit_snapshot(&self) -> Result<AuditSnapshot> {
        // One read transaction so every figure comes from the same snapshot
        let mut tx = self.pool.begin().await?;

        let accounts = sqlx::query(
            r#"
            SELECT a.id, a.balance, a.initial_balance, COALESCE(SUM(e.amount), 0) AS ledger_sum
            FROM accounts a
            LEFT JOIN ledger_entries e ON e.account_id = a.id
            GROUP BY a.id, a.balance, a.initial_balance
            ORDER BY a.id
            "#,
        )
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(|row| AccountAudit {
            account_id: row.get("id"),
            balance: row.get("balance"),
            initial_balance: row.get("initial_balance"),
            ledger_sum: row.get("ledger_sum"),
        })
        .collect();

        let rewards = sqlx::query(
            r#"
            SELECT r.id, r.inviter_id, COUNT(e.id) AS reward_entries
            FROM invite_records r
            LEFT JOIN ledger_entries e
                ON e.reference_id = r.id
                AND e.account_id = r.inviter_id
                AND e.reason = 'invite_reward'
            GROUP BY r.id, r.inviter_id
            ORDER BY r.id
            "#,
        )
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(|row| RewardAudit {
            record_id: row.get("id"),
            inviter_id: row.get("inviter_id"),
            reward_entries: row.get("reward_entries"),
        })
        .collect();

        let invite_counts = sqlx::query(
            "SELECT inviter_id, COUNT(*) AS records FROM invite_records GROUP BY inviter_id",
        )
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(|row| (row.get("inviter_id"), row.get("records")))
        .collect();

        let stats_successful = sqlx::query("SELECT account_id, successful_invites FROM invite_stats")
            .fetch_all(&mut *tx)
            .await?
            .iter()
            .map(|row| (row.get("account_id"), row.get("successful_invites")))
            .collect();

        let entry_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ledger_entries")
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(AuditSnapshot {
            accounts,
            rewards,
            invite_counts,
            stats_successful,
            entry_count,
        })
    }
}

/// Fixed-width UTC timestamps so text ordering matches time ordering.
fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}
