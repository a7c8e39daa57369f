//! Provisioning tool: accounts, keys, plans, subscriptions and top-ups.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use gateway::billing::BillingEngine;
use gateway::context::Context;
use gateway::credentials::CredentialVerifier;
use gateway::model::{AccountId, Identity, Plan, Role};
use gateway::store::SqliteStore;
use gateway::usage::UsageRecorder;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "gateway-admin", about = "Administer the gateway database")]
struct Cli {
    /// SQLite database file.
    #[arg(short, long, default_value = "gateway.sqlite")]
    database: PathBuf,

    /// Key prefix, must match the gateway configuration.
    #[arg(long, default_value = "sk")]
    key_prefix: String,

    /// Deployment id bound into key digests, must match the gateway.
    #[arg(long)]
    key_context: Option<Uuid>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the schema.
    Init,
    /// Find or create the account for an external identity.
    CreateAccount {
        #[arg(long)]
        external_id: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        admin: bool,
    },
    /// Issue a new API key, revoking the previous one.
    IssueKey {
        #[arg(long)]
        account: AccountId,
    },
    /// Add funds.
    Credit {
        #[arg(long)]
        account: AccountId,
        #[arg(long)]
        amount: i64,
        /// Reusing a key makes the credit a no-op.
        #[arg(long)]
        idempotency_key: Option<String>,
        #[arg(long, default_value = "manual top-up")]
        reason: String,
    },
    Lock {
        #[arg(long)]
        account: AccountId,
    },
    Unlock {
        #[arg(long)]
        account: AccountId,
    },
    /// Create or update a plan and its per-request price.
    Plan {
        #[arg(long)]
        code: String,
        #[arg(long)]
        name: String,
        /// Requests per window; omit or 0 for unlimited.
        #[arg(long)]
        rate_limit: Option<u32>,
        /// Price per request; omit for free.
        #[arg(long)]
        price: Option<i64>,
    },
    /// Subscribe an account to a plan.
    Subscribe {
        #[arg(long)]
        account: AccountId,
        #[arg(long)]
        plan: String,
        /// Expire after this many days; omit for no expiry.
        #[arg(long)]
        days: Option<i64>,
    },
    /// Show the usage report.
    Usage {
        #[arg(long)]
        account: AccountId,
    },
    /// List ledger entries.
    Ledger {
        #[arg(long)]
        account: AccountId,
    },
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let store = SqliteStore::new(&cli.database);
    store.init().await?;

    let mut ctx = Context::new(store.clone());
    ctx.minter = api_key::KeyMinter::new(cli.key_prefix);
    if let Some(context) = cli.key_context {
        ctx.minter = ctx.minter.with_context(context);
    }
    let now = ctx.clock.unix_secs();

    match cli.command {
        Command::Init => println!("initialized {}", cli.database.display()),
        Command::CreateAccount {
            external_id,
            email,
            name,
            admin,
        } => {
            let account = store
                .get_or_create_account(
                    Identity {
                        external_id,
                        email,
                        display_name: name,
                    },
                    now,
                )
                .await?;
            if admin {
                store.set_role(account.account_id, Role::Admin).await?;
            }
            let account = store.account(account.account_id).await?;
            println!("{}", serde_json::to_string_pretty(&account)?);
        }
        Command::IssueKey { account } => {
            let issued = CredentialVerifier::new(&ctx).rotate(account).await?;
            println!("{}", issued.reveal());
            eprintln!("Save this key securely. It cannot be shown again.");
        }
        Command::Credit {
            account,
            amount,
            idempotency_key,
            reason,
        } => {
            let key = idempotency_key.unwrap_or_else(|| format!("topup-{}", Uuid::now_v7()));
            let applied = BillingEngine::new(&ctx)
                .credit(account, amount, &key, &reason)
                .await?;
            if applied {
                println!("credited {amount} to account {account} ({key})");
            } else {
                println!("{key} was already applied");
            }
        }
        Command::Lock { account } => {
            store.set_locked(account, true).await?;
            println!("account {account} locked");
        }
        Command::Unlock { account } => {
            store.set_locked(account, false).await?;
            println!("account {account} unlocked");
        }
        Command::Plan {
            code,
            name,
            rate_limit,
            price,
        } => {
            store
                .upsert_plan(
                    Plan {
                        code: code.clone(),
                        name,
                        rate_limit,
                        price,
                    },
                    now,
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&store.plan(&code).await?)?);
        }
        Command::Subscribe {
            account,
            plan,
            days,
        } => {
            let expires_at = days.map(|d| now + d * 86_400);
            let subscription = store.subscribe(account, &plan, now, expires_at).await?;
            println!("{}", serde_json::to_string_pretty(&subscription)?);
        }
        Command::Usage { account } => {
            let record = store
                .account(account)
                .await?
                .ok_or(gateway::error::StoreError::UnknownAccount(account))?;
            let report = UsageRecorder::new(&ctx).report(&record).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Ledger { account } => {
            let entries = store.ledger_entries(account).await?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::init();

    if let Err(e) = run(Cli::parse()).await {
        log::error!("{e}");
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
