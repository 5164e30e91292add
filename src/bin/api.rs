use std::sync::Arc;

use tracing::info;

use stock_trading_agent::api::start_server;
use stock_trading_agent::ledger::{JsonFileBackend, LedgerStore};
use stock_trading_agent::settings::Settings;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stock_trading_agent=info".into()),
        )
        .init();

    dotenv::dotenv().ok();
    let settings = Settings::from_env()?;

    info!("📊 Trading Ledger Reporting API");
    info!("📍 Port: {}", settings.api_port);

    let ledger = Arc::new(LedgerStore::new(Arc::new(JsonFileBackend::new(
        &settings.data_dir,
    ))));

    start_server(ledger, settings.api_port).await?;

    Ok(())
}
