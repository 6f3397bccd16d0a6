//! Wallet ledger service binary

use std::error::Error;
use wallet_ledger::{Config, WalletLedger};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Config from an explicit path, else the environment
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    init_tracing(&config);

    tracing::info!(
        data_dir = ?config.store.data_dir,
        "Starting wallet ledger"
    );

    let ledger = WalletLedger::open(config).await?;
    let stats = ledger.stats().await?;
    tracing::info!(
        wallets = stats.total_wallets,
        transactions = stats.total_transactions,
        users = stats.total_users,
        "Ledger opened successfully"
    );

    // The HTTP layer embeds the library; standalone we idle until signalled
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down wallet ledger");
    ledger.shutdown().await?;
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.filter));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .init();
    }
}
