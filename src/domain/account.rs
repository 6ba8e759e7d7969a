use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type AccountId = String;

/// Credit count. Balances are whole generations, never fractional.
pub type Credits = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountClass {
    /// Never completed a payment
    Free,
    /// Completed at least one payment
    Paid,
}

impl AccountClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountClass::Free => "free",
            AccountClass::Paid => "paid",
        }
    }

    pub fn from_has_ever_paid(has_ever_paid: bool) -> Self {
        if has_ever_paid {
            AccountClass::Paid
        } else {
            AccountClass::Free
        }
    }
}

impl std::fmt::Display for AccountClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    /// External identity (e.g. a WeChat openid), unique when present
    pub external_id: Option<String>,
    pub nickname: Option<String>,
    pub balance: Credits,
    /// Balance the account was opened with; reported as the usage limit
    pub initial_balance: Credits,
    pub has_ever_paid: bool,
    pub invite_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(id: impl Into<AccountId>, starting_balance: Credits) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            external_id: None,
            nickname: None,
            balance: starting_balance,
            initial_balance: starting_balance,
            has_ever_paid: false,
            invite_code: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    pub fn with_nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = Some(nickname.into());
        self
    }

    pub fn with_invite_code(mut self, code: impl Into<String>) -> Self {
        self.invite_code = Some(code.into());
        self
    }

    pub fn class(&self) -> AccountClass {
        AccountClass::from_has_ever_paid(self.has_ever_paid)
    }

    pub fn can_consume(&self) -> bool {
        self.balance > 0
    }

    pub fn snapshot(&self) -> BalanceSnapshot {
        BalanceSnapshot {
            balance: self.balance,
            usage_limit: self.initial_balance,
            can_consume: self.can_consume(),
            account_class: self.class(),
        }
    }
}

/// Read-only view of an account's balance, as returned by a balance check.
/// May be stale relative to an in-flight mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    #[serde(rename = "usage_count")]
    pub balance: Credits,
    pub usage_limit: Credits,
    #[serde(rename = "can_generate")]
    pub can_consume: bool,
    #[serde(rename = "user_type")]
    pub account_class: AccountClass,
}

/// Parameters for opening an account outside of an invite registration.
#[derive(Debug, Clone, Default)]
pub struct NewAccount {
    pub id: AccountId,
    pub external_id: Option<String>,
    pub nickname: Option<String>,
}

impl NewAccount {
    pub fn new(id: impl Into<AccountId>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    pub fn with_nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = Some(nickname.into());
        self
    }
}
