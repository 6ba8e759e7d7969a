use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{AccountId, Credits};

pub type EntryId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Decrement,
    Restore,
    Increment,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Decrement => "decrement",
            ActionType::Restore => "restore",
            ActionType::Increment => "increment",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "decrement" => Some(ActionType::Decrement),
            "restore" => Some(ActionType::Restore),
            "increment" => Some(ActionType::Increment),
            _ => None,
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a balance moved. Only the creditable reasons may be passed to `add`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    Generation,
    Restore,
    Payment,
    InviteReward,
    AdminGrant,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::Generation => "generation",
            Reason::Restore => "restore",
            Reason::Payment => "payment",
            Reason::InviteReward => "invite_reward",
            Reason::AdminGrant => "admin_grant",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "generation" => Some(Reason::Generation),
            "restore" => Some(Reason::Restore),
            "payment" => Some(Reason::Payment),
            "invite_reward" => Some(Reason::InviteReward),
            "admin_grant" => Some(Reason::AdminGrant),
            _ => None,
        }
    }

    /// Reasons accepted by an explicit credit.
    pub fn is_creditable(&self) -> bool {
        matches!(
            self,
            Reason::Payment | Reason::InviteReward | Reason::AdminGrant
        )
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Audit record of one balance mutation. Never updated after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    /// Store-assigned, monotonically increasing; breaks timestamp ties
    pub sequence: i64,
    pub account_id: AccountId,
    pub action: ActionType,
    /// Signed change applied to the balance
    pub amount: Credits,
    pub balance_after: Credits,
    pub reason: Reason,
    pub reference_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Build the entry recording `mutation`. Sequence is assigned by the store.
    pub fn record(mutation: &BalanceMutation, balance_after: Credits) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence: 0,
            account_id: mutation.account_id.clone(),
            action: mutation.action,
            amount: mutation.amount,
            balance_after,
            reason: mutation.reason,
            reference_id: mutation.reference_id.clone(),
            created_at: Utc::now(),
        }
    }
}

/// A validated request to move one account's balance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceMutation {
    pub account_id: AccountId,
    pub action: ActionType,
    pub amount: Credits,
    pub reason: Reason,
    pub reference_id: Option<String>,
}

impl BalanceMutation {
    /// Consume one credit for a generation.
    pub fn decrement(account_id: impl Into<AccountId>, reference_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            action: ActionType::Decrement,
            amount: -1,
            reason: Reason::Generation,
            reference_id: Some(reference_id.into()),
        }
    }

    /// Give back one credit after a failed generation.
    pub fn restore(account_id: impl Into<AccountId>, reference_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            action: ActionType::Restore,
            amount: 1,
            reason: Reason::Restore,
            reference_id: Some(reference_id.into()),
        }
    }

    /// Credit `amount` for a creditable reason.
    pub fn credit(
        account_id: impl Into<AccountId>,
        amount: Credits,
        reason: Reason,
        reference_id: Option<String>,
    ) -> Result<Self, MutationError> {
        if amount <= 0 {
            return Err(MutationError::InvalidAmount(amount));
        }
        if !reason.is_creditable() {
            return Err(MutationError::InvalidReason(reason));
        }
        Ok(Self {
            account_id: account_id.into(),
            action: ActionType::Increment,
            amount,
            reason,
            reference_id,
        })
    }

    /// A payment credit also marks the account as paid.
    pub fn marks_paid(&self) -> bool {
        self.reason == Reason::Payment
    }
}

/// Compute the balance after applying `delta`, rejecting negative results.
pub fn next_balance(current: Credits, delta: Credits) -> Result<Credits, MutationError> {
    let next = current
        .checked_add(delta)
        .ok_or(MutationError::InvalidAmount(delta))?;
    if next < 0 {
        return Err(MutationError::InsufficientBalance {
            balance: current,
            required: -delta,
        });
    }
    Ok(next)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationError {
    InvalidAmount(Credits),
    InvalidReason(Reason),
    InsufficientBalance { balance: Credits, required: Credits },
}

impl std::fmt::Display for MutationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MutationError::InvalidAmount(amount) => {
                write!(f, "amount must be a positive credit count, got {}", amount)
            }
            MutationError::InvalidReason(reason) => {
                write!(f, "reason '{}' cannot be used for a credit", reason)
            }
            MutationError::InsufficientBalance { balance, required } => {
                write!(f, "balance {} cannot cover {}", balance, required)
            }
        }
    }
}

impl std::error::Error for MutationError {}
