use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use crate::application::{InviteService, LedgerService};
use crate::config::LedgerConfig;
use crate::domain::{CodeValidation, LedgerEntry, NewAccount, Page, PageRequest};

/// Usage Ledger - credit balances and invite rewards
#[derive(Parser)]
#[command(name = "usage-ledger")]
#[command(about = "Administer usage credit balances, their audit ledger and invite rewards")]
#[command(version)]
pub struct Cli {
    /// Database url (sqlite:PATH or postgres://...)
    #[arg(short, long, env = "LEDGER_DATABASE_URL")]
    pub database: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the database schema
    Init,

    /// Open a new account with the starting balance
    Open {
        /// Account ID
        id: String,

        /// External identity, unique across accounts
        #[arg(long)]
        external_id: Option<String>,

        /// Display name
        #[arg(long)]
        nickname: Option<String>,
    },

    /// Show an account's balance
    Check {
        /// Account ID
        id: String,
    },

    /// Consume one credit for a generation
    Consume {
        /// Account ID
        id: String,

        /// Generation the credit pays for
        #[arg(short, long)]
        reference: String,
    },

    /// Give back one credit after a failed generation
    Restore {
        /// Account ID
        id: String,

        /// Generation being compensated
        #[arg(short, long)]
        reference: String,
    },

    /// Credit an account
    Grant {
        /// Account ID
        id: String,

        /// Credits to add
        #[arg(allow_hyphen_values = true)]
        amount: i64,

        /// Reason: payment, invite_reward, admin_grant
        #[arg(long, default_value = "admin_grant")]
        reason: String,

        /// Order or record the credit relates to
        #[arg(long)]
        reference: Option<String>,
    },

    /// List ledger entries, newest first
    History {
        /// Account ID
        id: String,

        /// Page number, starting at 1
        #[arg(long)]
        page: Option<String>,

        /// Entries per page (1-100, default 20)
        #[arg(long)]
        page_size: Option<String>,
    },

    /// Invite code and referral commands
    #[command(subcommand)]
    Invite(InviteCommands),

    /// Verify ledger integrity
    Verify,

    /// Export an account's ledger history
    Export {
        /// Account ID
        id: String,

        /// Output format
        #[arg(short, long, value_enum, default_value = "csv")]
        format: ExportFormat,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum InviteCommands {
    /// Show an account's invite code, creating it if needed
    Code {
        /// Account ID
        id: String,
    },

    /// Check whether an invite code can be used
    Validate {
        /// Invite code
        code: String,
    },

    /// Register a new account through an invite code
    Register {
        /// Inviter's code
        code: String,

        /// ID of the account to create
        new_id: String,

        /// External identity of the new account
        external_id: String,
    },

    /// Show an inviter's totals
    Stats {
        /// Account ID
        id: String,
    },

    /// List accounts registered with an inviter's code
    Records {
        /// Account ID
        id: String,

        /// Page number, starting at 1
        #[arg(long)]
        page: Option<String>,

        /// Records per page (1-100, default 20)
        #[arg(long)]
        page_size: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ExportFormat {
    Csv,
    Json,
}

impl Cli {
    fn config(&self) -> Result<LedgerConfig> {
        let mut config = LedgerConfig::from_env()?;
        if let Some(url) = &self.database {
            config = config.with_database_url(url.clone());
        }
        Ok(config)
    }

    pub async fn run(self) -> Result<()> {
        let config = self.config()?;

        let service = if matches!(self.command, Commands::Init) {
            LedgerService::init(config).await?;
            println!("Database initialized");
            return Ok(());
        } else {
            LedgerService::connect(config).await?
        };

        match self.command {
            Commands::Init => {}

            Commands::Open {
                id,
                external_id,
                nickname,
            } => {
                let mut new = NewAccount::new(id);
                new.external_id = external_id;
                new.nickname = nickname;
                let account = service.open_account(new).await?;
                println!(
                    "Opened account {} with {} credits",
                    account.id, account.balance
                );
            }

            Commands::Check { id } => {
                let snapshot = service.check_balance(&id).await?;
                println!("Account:      {}", id);
                println!("Balance:      {}", snapshot.balance);
                println!("Usage limit:  {}", snapshot.usage_limit);
                println!("Class:        {}", snapshot.account_class);
                println!(
                    "Can generate: {}",
                    if snapshot.can_consume { "yes" } else { "no" }
                );
            }

            Commands::Consume { id, reference } => {
                let entry = service.decrement(&id, &reference).await?;
                println!("Consumed 1 credit, remaining {}", entry.balance_after);
            }

            Commands::Restore { id, reference } => {
                let entry = service.restore(&id, &reference).await?;
                println!("Restored 1 credit, remaining {}", entry.balance_after);
            }

            Commands::Grant {
                id,
                amount,
                reason,
                reference,
            } => {
                let entry = service
                    .add(&id, amount, &reason, reference.as_deref())
                    .await?;
                println!(
                    "Granted {} credits ({}), balance {}",
                    entry.amount, entry.reason, entry.balance_after
                );
            }

            Commands::History {
                id,
                page,
                page_size,
            } => {
                let request = PageRequest::parse(page.as_deref(), page_size.as_deref());
                let history = service.history(&id, request).await?;
                print_history(&history);
            }

            Commands::Invite(invite_cmd) => {
                let invites = InviteService::from_ledger(&service);
                run_invite_command(&invites, invite_cmd).await?;
            }

            Commands::Verify => {
                run_verify_command(&service).await?;
            }

            Commands::Export { id, format, output } => {
                run_export_command(&service, &id, format, output.as_deref()).await?;
            }
        }

        Ok(())
    }
}

fn print_history(history: &Page<LedgerEntry>) {
    if history.is_empty() {
        println!("No ledger entries found.");
        return;
    }

    println!(
        "{:<20} {:<10} {:>6} {:>8} {:<14} {}",
        "DATE", "ACTION", "AMOUNT", "BALANCE", "REASON", "REFERENCE"
    );
    println!("{}", "-".repeat(76));
    for entry in &history.items {
        println!(
            "{:<20} {:<10} {:>+6} {:>8} {:<14} {}",
            entry.created_at.format("%Y-%m-%d %H:%M:%S"),
            entry.action,
            entry.amount,
            entry.balance_after,
            entry.reason,
            entry.reference_id.as_deref().unwrap_or("-")
        );
    }
    println!(
        "\nPage {} of {} ({} entries)",
        history.page,
        history.total_pages.max(1),
        history.total
    );
}

async fn run_invite_command(invites: &InviteService, cmd: InviteCommands) -> Result<()> {
    match cmd {
        InviteCommands::Code { id } => {
            let code = invites.generate_code(&id).await?;
            println!("{}", code);
        }

        InviteCommands::Validate { code } => match invites.validate_code(&code).await? {
            CodeValidation::Valid {
                inviter_id,
                inviter_nickname,
            } => {
                println!("Valid code of {} ({})", inviter_id, inviter_nickname);
            }
            CodeValidation::Invalid { error } => {
                anyhow::bail!("Invalid code: {}", error);
            }
        },

        InviteCommands::Register {
            code,
            new_id,
            external_id,
        } => {
            let outcome = invites
                .register_via_invite(&code, &new_id, &external_id)
                .await?;
            println!(
                "Registered {} via {}; inviter rewarded, balance {}",
                outcome.invitee_id, outcome.inviter_id, outcome.inviter_balance
            );
        }

        InviteCommands::Stats { id } => {
            let stats = invites.get_stats(&id).await?;
            println!("Inviter:            {}", stats.account_id);
            println!("Total invites:      {}", stats.total_invites);
            println!("Successful invites: {}", stats.successful_invites);
            println!("Total rewards:      {}", stats.total_rewards);
            match stats.last_invite_at {
                Some(at) => println!("Last invite:        {}", at.format("%Y-%m-%d %H:%M:%S")),
                None => println!("Last invite:        never"),
            }
        }

        InviteCommands::Records {
            id,
            page,
            page_size,
        } => {
            let request = PageRequest::parse(page.as_deref(), page_size.as_deref());
            let records = invites.get_records(&id, request).await?;
            if records.is_empty() {
                println!("No invite records found.");
                return Ok(());
            }

            println!("{:<20} {:<24} {:<20} {}", "DATE", "INVITEE", "NICKNAME", "REWARDED");
            println!("{}", "-".repeat(74));
            for record in &records.items {
                println!(
                    "{:<20} {:<24} {:<20} {}",
                    record.created_at.format("%Y-%m-%d %H:%M:%S"),
                    record.invitee_id,
                    record.invitee_nickname.as_deref().unwrap_or("-"),
                    if record.reward_granted { "yes" } else { "no" }
                );
            }
            println!(
                "\nPage {} of {} ({} records)",
                records.page,
                records.total_pages.max(1),
                records.total
            );
        }
    }
    Ok(())
}

async fn run_verify_command(service: &LedgerService) -> Result<()> {
    println!("Checking ledger integrity...\n");

    let report = service.check_integrity().await?;

    println!("Accounts:       {}", report.account_count);
    println!("Ledger entries: {}", report.entry_count);
    println!("Invite records: {}", report.invite_record_count);
    println!();

    if report.is_healthy() {
        println!("Ledger is consistent.");
    } else {
        println!("Issues found:");
        for issue in &report.issues {
            println!("  - {}", issue);
        }
        anyhow::bail!("Ledger integrity check failed");
    }

    Ok(())
}

async fn run_export_command(
    service: &LedgerService,
    account_id: &str,
    format: ExportFormat,
    output: Option<&str>,
) -> Result<()> {
    use crate::io::Exporter;
    use std::fs::File;
    use std::io::{stdout, Write};

    let exporter = Exporter::new(service);

    let writer: Box<dyn Write> = match output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create output file: {}", path))?;
            Box::new(file)
        }
        None => Box::new(stdout()),
    };

    match format {
        ExportFormat::Csv => {
            let count = exporter.export_history_csv(account_id, writer).await?;
            if output.is_some() {
                eprintln!("Exported {} ledger entries", count);
            }
        }
        ExportFormat::Json => {
            let snapshot = exporter.export_history_json(account_id, writer).await?;
            if output.is_some() {
                eprintln!(
                    "Exported {} ledger entries, balance {}",
                    snapshot.entries.len(),
                    snapshot.balance.balance
                );
            }
        }
    }

    Ok(())
}
