//! CLI for subqueue
//!
//! Subcommands:
//! - `serve`: run the delivery engine for the configured subscriptions
//! - `inspect`: print the durable messages waiting for one subscription

use std::sync::Arc;

use clap::Parser;
use subqueue::broker::{Coordinator, ServerIdentity};
use subqueue::client::{Client, Delivery};
use subqueue::config::{Settings, load_config};
use subqueue::persistence::SledStore;
use tokio::sync::mpsc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "subqueue")]
enum Command {
    /// Start delivering messages for the configured subscriptions
    Serve,
    /// Print durable messages pending for a subscription as JSON
    Inspect {
        #[arg(long)]
        sub_key: String,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            subqueue::utils::logging::init("info");
            error!("Failed to load configuration: {}", e);
            return;
        }
    };
    subqueue::utils::logging::init(&settings.logging.level);

    let result = match Command::parse() {
        Command::Serve => run_server(settings).await,
        Command::Inspect { sub_key } => run_inspect(&settings, &sub_key),
    };

    if let Err(e) = result {
        error!("subqueue failed: {}", e);
    }
}

async fn run_server(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(SledStore::open(&settings.store.path, settings.store.ttl_secs)?);

    let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
    let client = Client::new(tx);
    info!(client_id = %client.id, store = %settings.store.path, "Starting delivery engine");

    let coordinator = Coordinator::new(
        store,
        Arc::new(client),
        settings.engine,
        ServerIdentity::new(&settings.server.name),
    );
    for entry in &settings.subscriptions {
        coordinator
            .add_subscription(entry.to_config(&settings.subscription))
            .await;
    }

    let consumer = tokio::spawn(async move {
        while let Some(delivery) = rx.recv().await {
            match serde_json::to_string(&delivery.payload) {
                Ok(json) => info!(sub_key = %delivery.sub_key, payload = %json, "Delivered"),
                Err(e) => error!("Failed to serialize delivery: {}", e),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Exiting gracefully.");

    coordinator.shutdown().await;
    consumer.abort();
    Ok(())
}

fn run_inspect(settings: &Settings, sub_key: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = SledStore::open(&settings.store.path, settings.store.ttl_secs)?;
    let rows = store.load_messages(sub_key)?;
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}
