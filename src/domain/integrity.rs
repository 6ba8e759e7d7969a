use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use super::{AccountId, Credits};

/// Per-account balance and the aggregate of its ledger entries.
#[derive(Debug, Clone)]
pub struct AccountAudit {
    pub account_id: AccountId,
    pub balance: Credits,
    pub initial_balance: Credits,
    pub ledger_sum: Credits,
}

/// Number of `invite_reward` entries referencing one invite record.
#[derive(Debug, Clone)]
pub struct RewardAudit {
    pub record_id: String,
    pub inviter_id: AccountId,
    pub reward_entries: i64,
}

/// Raw figures collected by the store for an integrity check.
#[derive(Debug, Clone, Default)]
pub struct AuditSnapshot {
    pub accounts: Vec<AccountAudit>,
    pub rewards: Vec<RewardAudit>,
    /// Invite record count per inviter
    pub invite_counts: HashMap<AccountId, i64>,
    /// `successful_invites` per inviter, as stored
    pub stats_successful: HashMap<AccountId, i64>,
    pub entry_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntegrityIssue {
    NegativeBalance {
        account_id: AccountId,
        balance: Credits,
    },
    LedgerDrift {
        account_id: AccountId,
        balance: Credits,
        initial_balance: Credits,
        ledger_sum: Credits,
    },
    RewardMismatch {
        record_id: String,
        inviter_id: AccountId,
        reward_entries: i64,
    },
    StatsMismatch {
        account_id: AccountId,
        successful_invites: i64,
        invite_records: i64,
    },
}

impl std::fmt::Display for IntegrityIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntegrityIssue::NegativeBalance {
                account_id,
                balance,
            } => write!(f, "account {} has negative balance {}", account_id, balance),
            IntegrityIssue::LedgerDrift {
                account_id,
                balance,
                initial_balance,
                ledger_sum,
            } => write!(
                f,
                "account {} balance {} does not match initial {} plus ledger sum {}",
                account_id, balance, initial_balance, ledger_sum
            ),
            IntegrityIssue::RewardMismatch {
                record_id,
                inviter_id,
                reward_entries,
            } => write!(
                f,
                "invite record {} (inviter {}) has {} reward entries, expected 1",
                record_id, inviter_id, reward_entries
            ),
            IntegrityIssue::StatsMismatch {
                account_id,
                successful_invites,
                invite_records,
            } => write!(
                f,
                "inviter {} stats report {} successful invites but {} records exist",
                account_id, successful_invites, invite_records
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub account_count: usize,
    pub entry_count: i64,
    pub invite_record_count: usize,
    pub issues: Vec<IntegrityIssue>,
}

impl IntegrityReport {
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }
}

pub fn build_integrity_report(snapshot: &AuditSnapshot) -> IntegrityReport {
    let mut issues = Vec::new();

    for account in &snapshot.accounts {
        if account.balance < 0 {
            issues.push(IntegrityIssue::NegativeBalance {
                account_id: account.account_id.clone(),
                balance: account.balance,
            });
        }
        if account.balance - account.initial_balance != account.ledger_sum {
            issues.push(IntegrityIssue::LedgerDrift {
                account_id: account.account_id.clone(),
                balance: account.balance,
                initial_balance: account.initial_balance,
                ledger_sum: account.ledger_sum,
            });
        }
    }

    for reward in &snapshot.rewards {
        if reward.reward_entries != 1 {
            issues.push(IntegrityIssue::RewardMismatch {
                record_id: reward.record_id.clone(),
                inviter_id: reward.inviter_id.clone(),
                reward_entries: reward.reward_entries,
            });
        }
    }

    // Sorted so reports are stable across runs
    let inviters: BTreeSet<&AccountId> = snapshot
        .invite_counts
        .keys()
        .chain(snapshot.stats_successful.keys())
        .collect();
    for inviter in inviters {
        let records = snapshot.invite_counts.get(inviter).copied().unwrap_or(0);
        let successful = snapshot.stats_successful.get(inviter).copied().unwrap_or(0);
        if records != successful {
            issues.push(IntegrityIssue::StatsMismatch {
                account_id: inviter.clone(),
                successful_invites: successful,
                invite_records: records,
            });
        }
    }

    IntegrityReport {
        account_count: snapshot.accounts.len(),
        entry_count: snapshot.entry_count,
        invite_record_count: snapshot.rewards.len(),
        issues,
    }
}
