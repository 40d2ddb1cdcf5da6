use clap::Parser;
use std::net::SocketAddr;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use payflow_core::app::{connect_backends, Core};
use payflow_core::cli::{self, Cli, Commands, DbCommands, TxCommands};
use payflow_core::config::{Config, LogFormat};
use payflow_core::create_app;

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;

    init_tracing(config.log_format);

    match cli.command {
        None | Some(Commands::Serve) => serve(config).await,
        Some(Commands::Tx(TxCommands::Show { tx_id })) => cli::handle_tx_show(&config, tx_id).await,
        Some(Commands::Tx(TxCommands::ForceStatus { tx_id, status })) => {
            cli::handle_tx_force_status(&config, tx_id, status).await
        }
        Some(Commands::Db(DbCommands::Migrate)) => cli::handle_db_migrate(&config).await,
        Some(Commands::Config) => cli::handle_config_validate(&config).await,
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let backends = connect_backends(&config).await?;
    let core = Core::new(&config, backends)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listeners = core.spawn_listeners(shutdown_rx);

    let app = create_app(core.state.clone(), &config.cors_allowed_origins);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    tracing::info!("listening on {}", addr);

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    for listener in listeners {
        if let Err(e) = listener.await {
            tracing::error!(error = %e, "Listener task failed");
        }
    }

    Ok(())
}
