use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Account, AccountId, BalanceMutation, Credits, MutationError, Reason};

pub type InviteRecordId = Uuid;

pub const INVITE_CODE_LENGTH: usize = 8;

/// Shown in place of an inviter that never set a nickname
pub const UNKNOWN_NICKNAME: &str = "unknown user";

const CODE_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Supplies candidate invite codes. Uniqueness is checked by the caller.
pub trait InviteCodeSource: Send + Sync {
    fn next_code(&self) -> String;
}

/// Uniformly random 8-character uppercase alphanumeric codes.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomCodeSource;

impl InviteCodeSource for RandomCodeSource {
    fn next_code(&self) -> String {
        let mut rng = rand::thread_rng();
        (0..INVITE_CODE_LENGTH)
            .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
            .collect()
    }
}

/// Why an invite code was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidCodeReason {
    /// No code supplied
    Missing,
    /// Not exactly [`INVITE_CODE_LENGTH`] characters
    WrongLength,
    /// Well-formed, but no account owns it
    NotFound,
}

impl std::fmt::Display for InvalidCodeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidCodeReason::Missing => write!(f, "invite code is missing"),
            InvalidCodeReason::WrongLength => {
                write!(f, "invite code must be {} characters", INVITE_CODE_LENGTH)
            }
            InvalidCodeReason::NotFound => write!(f, "invite code does not exist"),
        }
    }
}

/// Format check performed before any lookup.
pub fn check_code_format(code: &str) -> Result<&str, InvalidCodeReason> {
    if code.is_empty() {
        return Err(InvalidCodeReason::Missing);
    }
    if code.chars().count() != INVITE_CODE_LENGTH {
        return Err(InvalidCodeReason::WrongLength);
    }
    Ok(code)
}

/// Result of validating an invite code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CodeValidation {
    Valid {
        inviter_id: AccountId,
        inviter_nickname: String,
    },
    Invalid {
        error: InvalidCodeReason,
    },
}

impl CodeValidation {
    /// Validation result naming the code's owner.
    pub fn owned_by(inviter: &Account) -> Self {
        CodeValidation::Valid {
            inviter_id: inviter.id.clone(),
            inviter_nickname: inviter
                .nickname
                .clone()
                .unwrap_or_else(|| UNKNOWN_NICKNAME.to_string()),
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, CodeValidation::Valid { .. })
    }
}

/// Proof that an inviter's code was consumed by a new account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteRecord {
    pub id: InviteRecordId,
    pub inviter_id: AccountId,
    pub invitee_id: AccountId,
    pub invite_code: String,
    pub reward_granted: bool,
    pub created_at: DateTime<Utc>,
}

impl InviteRecord {
    pub fn new(
        inviter_id: impl Into<AccountId>,
        invitee_id: impl Into<AccountId>,
        invite_code: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            inviter_id: inviter_id.into(),
            invitee_id: invitee_id.into(),
            invite_code: invite_code.into(),
            reward_granted: true,
            created_at: Utc::now(),
        }
    }
}

/// Invite record as listed to the inviter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteRecordView {
    pub id: InviteRecordId,
    pub invitee_id: AccountId,
    pub invitee_nickname: Option<String>,
    pub created_at: DateTime<Utc>,
    pub reward_granted: bool,
}

/// Running totals per inviter. Never decremented.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteStats {
    pub account_id: AccountId,
    pub total_invites: i64,
    pub successful_invites: i64,
    pub total_rewards: Credits,
    pub last_invite_at: Option<DateTime<Utc>>,
}

impl InviteStats {
    /// Stats for an inviter with no recorded invites.
    pub fn empty(account_id: impl Into<AccountId>) -> Self {
        Self {
            account_id: account_id.into(),
            total_invites: 0,
            successful_invites: 0,
            total_rewards: 0,
            last_invite_at: None,
        }
    }
}

/// Everything written by one invite registration, prepared before the
/// transaction opens.
#[derive(Debug, Clone)]
pub struct InviteRegistration {
    pub invitee: Account,
    pub record: InviteRecord,
    /// Credit for the inviter, referencing `record.id`
    pub reward: BalanceMutation,
}

impl InviteRegistration {
    pub fn new(
        inviter_id: &str,
        invite_code: &str,
        invitee: Account,
        reward_amount: Credits,
    ) -> Result<Self, MutationError> {
        let record = InviteRecord::new(inviter_id, invitee.id.clone(), invite_code);
        let reward = BalanceMutation::credit(
            inviter_id,
            reward_amount,
            Reason::InviteReward,
            Some(record.id.to_string()),
        )?;
        Ok(Self {
            invitee,
            record,
            reward,
        })
    }

    pub fn inviter_id(&self) -> &str {
        &self.record.inviter_id
    }
}

/// Outcome returned to the caller of a successful invite registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteOutcome {
    pub inviter_id: AccountId,
    pub invitee_id: AccountId,
    pub record_id: InviteRecordId,
    pub reward_granted: bool,
    pub inviter_balance: Credits,
}
