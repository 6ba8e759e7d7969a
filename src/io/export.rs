use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;

use crate::application::LedgerService;
use crate::domain::{BalanceSnapshot, LedgerEntry};

/// Complete ledger history of one account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistorySnapshot {
    pub version: String,
    pub exported_at: DateTime<Utc>,
    pub account_id: String,
    pub balance: BalanceSnapshot,
    pub entries: Vec<LedgerEntry>,
}

/// Exporter for writing ledger history to various formats
pub struct Exporter<'a> {
    service: &'a LedgerService,
}

impl<'a> Exporter<'a> {
    pub fn new(service: &'a LedgerService) -> Self {
        Self { service }
    }

    /// Export an account's ledger entries to CSV, oldest first
    pub async fn export_history_csv<W: Write>(&self, account_id: &str, writer: W) -> Result<usize> {
        // Fails for unknown accounts instead of writing an empty file
        self.service.get_account(account_id).await?;
        let entries = self.service.full_history(account_id).await?;
        let mut csv_writer = csv::Writer::from_writer(writer);

        csv_writer.write_record([
            "id",
            "sequence",
            "created_at",
            "action",
            "amount",
            "balance_after",
            "reason",
            "reference_id",
        ])?;

        for entry in &entries {
            csv_writer.write_record(&[
                entry.id.to_string(),
                entry.sequence.to_string(),
                entry.created_at.to_rfc3339(),
                entry.action.to_string(),
                entry.amount.to_string(),
                entry.balance_after.to_string(),
                entry.reason.to_string(),
                entry.reference_id.clone().unwrap_or_default(),
            ])?;
        }

        csv_writer.flush()?;
        Ok(entries.len())
    }

    /// Export an account's balance and ledger entries as a JSON snapshot
    pub async fn export_history_json<W: Write>(
        &self,
        account_id: &str,
        mut writer: W,
    ) -> Result<HistorySnapshot> {
        let balance = self.service.check_balance(account_id).await?;
        let entries = self.service.full_history(account_id).await?;

        let snapshot = HistorySnapshot {
            version: env!("CARGO_PKG_VERSION").to_string(),
            exported_at: Utc::now(),
            account_id: account_id.to_string(),
            balance,
            entries,
        };

        let json = serde_json::to_string_pretty(&snapshot)?;
        writer.write_all(json.as_bytes())?;
        writer.flush()?;

        Ok(snapshot)
    }
}
