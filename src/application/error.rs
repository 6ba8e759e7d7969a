use thiserror::Error;

use crate::domain::{Credits, InvalidCodeReason, MutationError};
use crate::storage::StoreError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Account already exists: {0}")]
    AccountAlreadyExists(String),

    #[error("Insufficient balance in account {account_id}: balance {balance}, required {required}")]
    InsufficientBalance {
        account_id: String,
        balance: Credits,
        required: Credits,
    },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid reason: {0}")]
    InvalidReason(String),

    #[error("Invalid invite code: {0}")]
    InvalidInviteCode(InvalidCodeReason),

    #[error("An account cannot register with its own invite code")]
    SelfInviteNotAllowed,

    #[error("No unique invite code found after {attempts} attempts")]
    CodeGenerationExhausted { attempts: u32 },

    #[error("Lock conflict, retry later: {0}")]
    LockConflict(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[source] StoreError),
}

impl AppError {
    /// HTTP status an API layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::InvalidAmount(_)
            | AppError::InvalidReason(_)
            | AppError::InvalidInviteCode(_)
            | AppError::SelfInviteNotAllowed
            | AppError::AccountAlreadyExists(_) => 400,
            AppError::InsufficientBalance { .. } => 403,
            AppError::AccountNotFound(_) => 404,
            AppError::LockConflict(_) => 409,
            AppError::CodeGenerationExhausted { .. } | AppError::Config(_) | AppError::Storage(_) => {
                500
            }
        }
    }

    /// True for transient failures worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::LockConflict(_))
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AccountNotFound(id) => AppError::AccountNotFound(id),
            StoreError::AccountAlreadyExists(id) => AppError::AccountAlreadyExists(id),
            StoreError::InsufficientBalance {
                account_id,
                balance,
                required,
            } => AppError::InsufficientBalance {
                account_id,
                balance,
                required,
            },
            StoreError::Rejected(e) => e.into(),
            StoreError::LockConflict(e) => AppError::LockConflict(e.to_string()),
            StoreError::UnsupportedBackend(url) => {
                AppError::Config(format!("unsupported database url: {}", url))
            }
            other => AppError::Storage(other),
        }
    }
}

impl From<MutationError> for AppError {
    fn from(err: MutationError) -> Self {
        match err {
            MutationError::InvalidAmount(_) => AppError::InvalidAmount(err.to_string()),
            MutationError::InvalidReason(_) => AppError::InvalidReason(err.to_string()),
            MutationError::InsufficientBalance { balance, required } => {
                AppError::InsufficientBalance {
                    account_id: String::new(),
                    balance,
                    required,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(AppError::AccountNotFound("u".into()).status_code(), 404);
        assert_eq!(
            AppError::InsufficientBalance {
                account_id: "u".into(),
                balance: 0,
                required: 1
            }
            .status_code(),
            403
        );
        assert_eq!(AppError::SelfInviteNotAllowed.status_code(), 400);
        assert_eq!(
            AppError::InvalidInviteCode(InvalidCodeReason::NotFound).status_code(),
            400
        );
        assert_eq!(AppError::LockConflict("busy".into()).status_code(), 409);
    }

    #[test]
    fn test_store_errors_are_classified() {
        let err: AppError = StoreError::from(sqlx::Error::PoolTimedOut).into();
        assert!(err.is_retryable());

        let err: AppError = StoreError::DuplicateInviteCode("AAAA1111".into()).into();
        assert!(matches!(err, AppError::Storage(_)));
        assert!(!err.is_retryable());

        let err: AppError = StoreError::Rejected(MutationError::InvalidAmount(1)).into();
        assert!(matches!(err, AppError::InvalidAmount(_)));
    }
}
