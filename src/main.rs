use signal_relay::api::{run_server, AppState};
use signal_relay::config::AppConfig;
use signal_relay::data::channel::ExecutionChannel;
use signal_relay::data::store::{FileStore, KeyValueStore};
use signal_relay::parser::InstrumentTable;
use signal_relay::services::dedup::Deduplicator;
use signal_relay::services::journal::TradeJournal;
use signal_relay::services::maintenance::MaintenanceService;
use signal_relay::services::pipeline::SignalPipeline;
use signal_relay::services::stealth::StealthEngine;
use signal_relay::terminal::PaperTerminal;
use signal_relay::EventBus;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();

    // Setup Logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Signal Relay...");

    // Load Configuration
    let config = AppConfig::load()?;
    info!(
        "Loaded Configuration: {} accounts, {} rules, data dir {}",
        config.accounts.len(),
        config.rules.len(),
        config.data_dir.display()
    );

    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(config.data_dir.join("store"))?);
    let event_bus = EventBus::new(1000);

    // Start Trade Journal (JSONL + summary under the data dir)
    let journal = TradeJournal::new(config.data_dir.join("journal.jsonl"));
    journal.start(event_bus.clone()).await;

    let pipeline = Arc::new(SignalPipeline::from_config(&config, store.clone(), event_bus.clone()));

    let dedup = Arc::new(Deduplicator::new(store.clone(), config.dedup.window_hours));
    let maintenance = MaintenanceService::new(dedup, config.dedup.sweep_cron.clone());
    let _scheduler = maintenance.start().await?;

    // One execution engine per account, each on its own paper terminal.
    let instruments = InstrumentTable::with_overrides(&config.instruments);
    let mut accounts: Vec<&String> = config.accounts.keys().collect();
    accounts.sort();
    let mut paper_terminals = Vec::new();
    for account in accounts {
        let terminal = PaperTerminal::from_instruments(&instruments);
        paper_terminals.push(terminal.clone());
        let engine = StealthEngine::new(
            account.clone(),
            ExecutionChannel::new(store.clone()),
            Arc::new(terminal),
            config.stealth.clone(),
            event_bus.clone(),
        );
        tokio::spawn(engine.run());
    }
    if paper_terminals.is_empty() {
        warn!("⚠️ No accounts configured - alerts will be parsed and journaled only");
    } else {
        info!("🕵️ {} execution engines on paper terminals (feed quotes via POST /quotes)", paper_terminals.len());
    }

    // Start API Server
    info!("Initializing API Server...");
    let app_state = Arc::new(AppState {
        pipeline,
        journal,
        paper_terminals,
        config,
    });
    run_server(app_state).await?;

    Ok(())
}
