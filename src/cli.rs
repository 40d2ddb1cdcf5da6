use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::app::{connect_backends, Core};
use crate::config::Config;
use crate::domain::TransactionStatus;
use crate::services::StatusUpdate;

#[derive(Parser)]
#[command(name = "payflow-core")]
#[command(about = "Payflow Core - transaction processing and saga orchestration", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server and listeners (default)
    Serve,

    /// Transaction management commands
    #[command(subcommand)]
    Tx(TxCommands),

    /// Database management commands
    #[command(subcommand)]
    Db(DbCommands),

    /// Print the effective configuration and check dependencies
    Config,
}

#[derive(Subcommand)]
pub enum TxCommands {
    /// Show a transaction by ID
    Show {
        /// Transaction UUID
        #[arg(value_name = "TX_ID")]
        tx_id: Uuid,
    },

    /// Move a pending transaction to SUCCESS or FAILED
    ForceStatus {
        /// Transaction UUID
        #[arg(value_name = "TX_ID")]
        tx_id: Uuid,

        /// Target status
        #[arg(value_name = "STATUS")]
        status: TransactionStatus,
    },
}

#[derive(Subcommand)]
pub enum DbCommands {
    /// Run database migrations
    Migrate,
}

async fn core_for_admin(config: &Config) -> anyhow::Result<Core> {
    if config.database_url.is_none() {
        anyhow::bail!("DATABASE_URL must be set for transaction commands");
    }
    let backends = connect_backends(config).await?;
    Core::new(config, backends)
}

pub async fn handle_tx_show(config: &Config, tx_id: Uuid) -> anyhow::Result<()> {
    let core = core_for_admin(config).await?;
    let tx = core.state.processor.get_transaction(tx_id).await?;
    println!("{}", serde_json::to_string_pretty(&tx)?);
    Ok(())
}

pub async fn handle_tx_force_status(
    config: &Config,
    tx_id: Uuid,
    status: TransactionStatus,
) -> anyhow::Result<()> {
    let core = core_for_admin(config).await?;

    match core.state.processor.update_status(tx_id, status).await? {
        StatusUpdate::Applied(tx) => {
            tracing::info!(transaction_id = %tx_id, status = %tx.status, "Transaction status forced");
            println!("✓ Transaction {} marked as {}", tx_id, tx.status);
        }
        StatusUpdate::Unchanged(tx) => {
            tracing::warn!(transaction_id = %tx_id, status = %tx.status, "Transaction already terminal");
            println!("Transaction {} is already {}; nothing changed", tx_id, tx.status);
        }
    }
    Ok(())
}

pub async fn handle_db_migrate(config: &Config) -> anyhow::Result<()> {
    let url = config
        .database_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL must be set to run migrations"))?;

    let pool = crate::db::create_pool(url).await?;
    tracing::info!("Running database migrations...");
    crate::db::run_migrations(&pool).await?;

    println!("✓ Database migrations completed");
    Ok(())
}

pub async fn handle_config_validate(config: &Config) -> anyhow::Result<()> {
    tracing::info!("Validating configuration...");

    println!("Configuration:");
    println!("{}", serde_json::to_string_pretty(&config.redacted())?);

    let backends = connect_backends(config).await?;
    let report = crate::startup::validate_environment(
        config,
        backends.store.as_ref(),
        backends.bus.as_ref(),
    )
    .await;
    report.print();

    if !report.is_valid() {
        anyhow::bail!("Configuration is invalid");
    }

    tracing::info!("Configuration is valid");
    println!("✓ Configuration is valid");
    Ok(())
}
