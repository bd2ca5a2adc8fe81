// src/main.rs
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use dotenvy::dotenv;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use truck_checkout::config::Config;
use truck_checkout::database;
use truck_checkout::services::alias::{AliasResolver, AliasTable};
use truck_checkout::services::invoice_directory::{HttpInvoiceDirectory, InvoiceDirectoryClient};
use truck_checkout::services::ledger::CheckoutLedger;
use truck_checkout::services::stock_adjustment::StockAdjustmentProcessor;
use truck_checkout::state::AppState;
use truck_checkout::store::postgres::{load_aliases, PgCheckoutStore, PgInventory};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging; RUST_LOG overrides the default level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::from_env()?;

    // Create database pool
    let db_pool = database::create_pool(&config.database_url)
        .await
        .context("Failed to create database pool")?;
    database::run_migrations(&db_pool)
        .await
        .context("Failed to run migrations")?;

    let aliases = AliasTable::from_pairs(load_aliases(&db_pool).await?);
    tracing::info!(aliases = aliases.len(), "item alias map loaded");
    let aliases: Arc<dyn AliasResolver> = Arc::new(aliases);

    let directory = HttpInvoiceDirectory::new(&config.invoice_directory_url, config.invoice_fetch_timeout)?;

    // Create application state
    let ledger = CheckoutLedger::new(
        Arc::new(PgCheckoutStore::new(db_pool.clone())),
        Arc::clone(&aliases),
        InvoiceDirectoryClient::new(Arc::new(directory), aliases),
        StockAdjustmentProcessor::new(Arc::new(PgInventory::new(db_pool))),
    );
    let app_state = AppState::new(ledger, &config.jwt_secret);
    let app = truck_checkout::build_app(app_state);

    // Try port..port+20 to avoid crash when address is in use
    let listener = {
        let mut bound = None;
        for offset in 0u16..=20 {
            let port = config.port.saturating_add(offset);
            let addr = SocketAddr::from((config.host, port));
            match TcpListener::bind(addr).await {
                Ok(l) => { bound = Some((l, addr)); break; }
                Err(e) => {
                    if offset == 0 { tracing::warn!(%addr, error=%e, "Port in use, trying next"); }
                }
            }
        }
        match bound {
            Some((l, addr)) => {
                tracing::info!("Server running on {}", addr);
                l
            }
            None => {
                anyhow::bail!("Failed to bind to any port starting at {} on {}", config.port, config.host);
            }
        }
    };

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
