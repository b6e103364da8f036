use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;

use slotbook::clock::SystemClock;
use slotbook::config::ServiceConfig;
use slotbook::engine::{Collaborators, Engine};
use slotbook::ledger::InMemoryLedger;
use slotbook::model::Provider;
use slotbook::notify::{self, NotifyHub};
use slotbook::store::BookingStore;
use slotbook::{compactor, handler, observability};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let config = ServiceConfig::from_env();
    observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let store = Arc::new(BookingStore::open(&config.journal_path())?);
    if let Some(path) = &config.providers_file {
        load_providers(&store, path).await?;
    }

    let hub = Arc::new(NotifyHub::new());
    let outbox = hub.subscribe_outbox();
    tokio::spawn(async move {
        let delivered = notify::drain_outbox(outbox, |notice| {
            info!(
                "confirmation dispatched: booking {} provider {} {} {}",
                notice.booking_id, notice.provider, notice.date, notice.window
            );
        })
        .await;
        info!("outbox closed after {delivered} confirmations");
    });

    let engine = Engine::new(
        Collaborators::with_store(
            store.clone(),
            hub,
            Arc::new(InMemoryLedger::new()),
            Arc::new(SystemClock),
        ),
        config.engine.clone(),
    );

    let compactor_store = store.clone();
    let threshold = config.compact_threshold;
    tokio::spawn(async move {
        compactor::run_compactor(compactor_store, threshold).await;
    });

    info!("slotbook ready");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  providers: {}", store.provider_count());
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("stdin closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let response = handler::dispatch(&engine, &line).await;
                let mut out = serde_json::to_vec(&response)?;
                out.push(b'\n');
                stdout.write_all(&out).await?;
                stdout.flush().await?;
            }
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    if let Err(e) = store.compact().await {
        tracing::warn!("final compaction failed: {e}");
    }
    info!("slotbook stopped");
    Ok(())
}

async fn load_providers(
    store: &BookingStore,
    path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let raw = tokio::fs::read_to_string(path).await?;
    let providers: Vec<Provider> = serde_json::from_str(&raw)?;
    let count = providers.len();
    for provider in providers {
        store.upsert_provider(provider).await?;
    }
    info!("loaded {count} providers from {}", path.display());
    Ok(())
}
