//! Configuration for the usage ledger

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::application::AppError;
use crate::domain::Credits;

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// `sqlite:` or `postgres:` url
    pub url: String,
    pub max_connections: u32,
    /// Longest a mutation waits for an account lock
    pub lock_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    pub database: DatabaseConfig,
    /// Balance granted to every new account
    pub starting_balance: Credits,
    /// Credits the inviter earns per successful invite
    pub invite_reward: Credits,
    /// Collision retries before invite code generation gives up
    pub max_code_attempts: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite:usage-ledger.db?mode=rwc".to_string(),
                max_connections: 8,
                lock_timeout_ms: 5000,
            },
            starting_balance: 3,
            invite_reward: 1,
            max_code_attempts: 10,
        }
    }
}

impl LedgerConfig {
    /// Create config from `LEDGER_*` environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, AppError> {
        let defaults = Self::default();

        let config = Self {
            database: DatabaseConfig {
                url: std::env::var("LEDGER_DATABASE_URL").unwrap_or(defaults.database.url),
                max_connections: env_or("LEDGER_MAX_CONNECTIONS", defaults.database.max_connections)?,
                lock_timeout_ms: env_or("LEDGER_LOCK_TIMEOUT_MS", defaults.database.lock_timeout_ms)?,
            },
            starting_balance: env_or("LEDGER_STARTING_BALANCE", defaults.starting_balance)?,
            invite_reward: env_or("LEDGER_INVITE_REWARD", defaults.invite_reward)?,
            max_code_attempts: env_or("LEDGER_MAX_CODE_ATTEMPTS", defaults.max_code_attempts)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database.url = url.into();
        self
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.database.url.trim().is_empty() {
            return Err(AppError::Config("database url is empty".to_string()));
        }
        if self.database.max_connections == 0 {
            return Err(AppError::Config("max_connections must be at least 1".to_string()));
        }
        if self.starting_balance < 0 {
            return Err(AppError::Config(format!(
                "starting_balance must not be negative, got {}",
                self.starting_balance
            )));
        }
        if self.invite_reward <= 0 {
            return Err(AppError::Config(format!(
                "invite_reward must be positive, got {}",
                self.invite_reward
            )));
        }
        if self.max_code_attempts == 0 {
            return Err(AppError::Config("max_code_attempts must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, AppError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::Config(format!("Invalid {}: {:?}", key, raw))),
        Err(_) => Ok(default),
    }
}
