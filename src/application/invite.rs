use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::LedgerConfig;
use crate::domain::{
    check_code_format, Account, CodeValidation, InvalidCodeReason, InviteCodeSource, InviteOutcome,
    InviteRecordView, InviteRegistration, InviteStats, Page, PageRequest, RandomCodeSource,
};
use crate::storage::{LedgerStore, StoreError};

use super::{AppError, LedgerService};

/// Invite codes, invite registration and referral bookkeeping.
#[derive(Clone)]
pub struct InviteService {
    store: Arc<dyn LedgerStore>,
    config: LedgerConfig,
    codes: Arc<dyn InviteCodeSource>,
}

impl InviteService {
    pub fn new(store: Arc<dyn LedgerStore>, config: LedgerConfig) -> Self {
        Self {
            store,
            config,
            codes: Arc::new(RandomCodeSource),
        }
    }

    /// Share the ledger service's store and configuration.
    pub fn from_ledger(ledger: &LedgerService) -> Self {
        Self::new(ledger.store(), ledger.config().clone())
    }

    /// Replace the random code generator, e.g. with a deterministic one.
    pub fn with_code_source(mut self, codes: Arc<dyn InviteCodeSource>) -> Self {
        self.codes = codes;
        self
    }

    /// Return the account's invite code, minting one on first use.
    pub async fn generate_code(&self, account_id: &str) -> Result<String, AppError> {
        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or_else(|| AppError::AccountNotFound(account_id.to_string()))?;
        if let Some(code) = account.invite_code {
            return Ok(code);
        }

        let attempts = self.config.max_code_attempts;
        for attempt in 1..=attempts {
            let candidate = self.codes.next_code();
            if self.store.invite_code_exists(&candidate).await? {
                debug!(attempt, "invite code collision");
                continue;
            }
            match self.store.assign_invite_code(account_id, &candidate).await {
                Ok(code) => {
                    info!(account_id, attempt, "assigned invite code");
                    return Ok(code);
                }
                // Taken between the check and the write
                Err(StoreError::DuplicateInviteCode(_)) => {
                    debug!(attempt, "invite code collision on write");
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(account_id, attempts, "invite code generation exhausted");
        Err(AppError::CodeGenerationExhausted { attempts })
    }

    /// Check a code's format, then look up its owner. Malformed codes are
    /// rejected without touching storage.
    pub async fn validate_code(&self, code: &str) -> Result<CodeValidation, AppError> {
        let code = match check_code_format(code) {
            Ok(code) => code,
            Err(error) => return Ok(CodeValidation::Invalid { error }),
        };

        Ok(match self.store.find_account_by_invite_code(code).await? {
            Some(inviter) => CodeValidation::owned_by(&inviter),
            None => CodeValidation::Invalid {
                error: InvalidCodeReason::NotFound,
            },
        })
    }

    /// Open `new_account_id` through an inviter's code and reward the inviter.
    ///
    /// Code validation, the self-invite check and the existing-account check
    /// all run before any write. Account creation, the invite record, the
    /// inviter's credit and the stats update then commit together.
    pub async fn register_via_invite(
        &self,
        code: &str,
        new_account_id: &str,
        external_id: &str,
    ) -> Result<InviteOutcome, AppError> {
        let inviter_id = match self.validate_code(code).await? {
            CodeValidation::Valid { inviter_id, .. } => inviter_id,
            CodeValidation::Invalid { error } => {
                warn!(code, %error, "invite registration with invalid code");
                return Err(AppError::InvalidInviteCode(error));
            }
        };

        if inviter_id == new_account_id {
            warn!(account_id = new_account_id, "self invite rejected");
            return Err(AppError::SelfInviteNotAllowed);
        }

        if self.store.get_account(new_account_id).await?.is_some() {
            warn!(account_id = new_account_id, "invitee already registered");
            return Err(AppError::AccountAlreadyExists(new_account_id.to_string()));
        }
        if self
            .store
            .find_account_by_external_id(external_id)
            .await?
            .is_some()
        {
            warn!(external_id, "invitee identity already registered");
            return Err(AppError::AccountAlreadyExists(external_id.to_string()));
        }

        let attempts = self.config.max_code_attempts;
        for attempt in 1..=attempts {
            let invitee_code = self.codes.next_code();
            if self.store.invite_code_exists(&invitee_code).await? {
                debug!(attempt, "invite code collision");
                continue;
            }

            let invitee = Account::new(new_account_id, self.config.starting_balance)
                .with_external_id(external_id)
                .with_invite_code(invitee_code);
            let registration =
                InviteRegistration::new(&inviter_id, code, invitee, self.config.invite_reward)?;

            match self.store.register_invitee(&registration).await {
                Ok(reward) => {
                    info!(
                        inviter_id = %inviter_id,
                        invitee_id = new_account_id,
                        record_id = %registration.record.id,
                        inviter_balance = reward.balance_after,
                        "invite registered"
                    );
                    return Ok(InviteOutcome {
                        inviter_id,
                        invitee_id: new_account_id.to_string(),
                        record_id: registration.record.id,
                        reward_granted: registration.record.reward_granted,
                        inviter_balance: reward.balance_after,
                    });
                }
                Err(StoreError::DuplicateInviteCode(_)) => {
                    debug!(attempt, "invitee code taken during registration");
                }
                Err(e) => {
                    let err = AppError::from(e);
                    warn!(
                        inviter_id = %inviter_id,
                        invitee_id = new_account_id,
                        retryable = err.is_retryable(),
                        error = %err,
                        "invite registration failed"
                    );
                    return Err(err);
                }
            }
        }

        warn!(invitee_id = new_account_id, attempts, "invite code generation exhausted");
        Err(AppError::CodeGenerationExhausted { attempts })
    }

    /// Invite totals for an inviter; all zero when none are recorded.
    pub async fn get_stats(&self, account_id: &str) -> Result<InviteStats, AppError> {
        Ok(self
            .store
            .get_invite_stats(account_id)
            .await?
            .unwrap_or_else(|| InviteStats::empty(account_id)))
    }

    /// Accounts registered with this inviter's code, newest first.
    pub async fn get_records(
        &self,
        account_id: &str,
        request: PageRequest,
    ) -> Result<Page<InviteRecordView>, AppError> {
        Ok(self.store.list_invite_records(account_id, request).await?)
    }
}
