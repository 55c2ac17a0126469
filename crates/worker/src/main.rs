//! Outlet event worker.
//!
//! Wires an event bus, an optional NATS bridge, the webhook store and the
//! webhook dispatcher together, then runs until SIGINT/SIGTERM.

mod config;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use outlet_core::topics::{
    ContactEvent, EmailEvent, CONTACT_CREATED, CONTACT_UNSUBSCRIBED, EMAIL_BOUNCED,
    EMAIL_CLICKED, EMAIL_OPENED, EMAIL_SENT,
};
use outlet_core::webhook::WebhookEndpoint;
use outlet_events::{BusConfig, DispatcherConfig, EventBus, MemoryWebhookStore, WebhookDispatcher};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "outlet_worker=debug,outlet_events=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = WorkerConfig::from_env()?;
    tracing::info!(?config, "Worker starting");

    // --- Event bus ---
    let mut bus_config = BusConfig::default()
        .with_name("worker")
        .with_queue_capacity(config.queue_capacity)
        .with_replay(config.replay_capacity);
    if let Some(bridge) = bridge_config(&config).await {
        bus_config = bus_config.with_bridge(bridge);
    }
    let bus = EventBus::start(bus_config).await;

    for topic in [CONTACT_CREATED, CONTACT_UNSUBSCRIBED] {
        bus.register_json_type::<ContactEvent>(topic);
    }
    for topic in [EMAIL_SENT, EMAIL_BOUNCED, EMAIL_OPENED, EMAIL_CLICKED] {
        bus.register_json_type::<EmailEvent>(topic);
    }

    // --- Webhooks ---
    let endpoints = match &config.webhooks_file {
        Some(path) => load_endpoints(path)?,
        None => Vec::new(),
    };
    tracing::info!(count = endpoints.len(), "Webhook endpoints loaded");
    let store = Arc::new(MemoryWebhookStore::with_endpoints(endpoints));

    let dispatcher = WebhookDispatcher::new(Arc::clone(&bus), store, DispatcherConfig::default())
        .context("Failed to build webhook dispatcher")?;
    dispatcher.start().await;

    shutdown_signal().await;

    // --- Shutdown ---
    // Stop taking new webhook work first, then drain the bus.
    dispatcher.stop().await;
    bus.shutdown().await;

    let stats = bus.stats();
    tracing::info!(
        dispatched = stats.events_dispatched,
        remote_injected = stats.remote_injected,
        remote_dropped = stats.remote_dropped,
        handler_failures = stats.handler_failures,
        "Worker stopped"
    );
    Ok(())
}

#[cfg(feature = "nats")]
async fn bridge_config(config: &WorkerConfig) -> Option<outlet_events::BridgeConfig> {
    use outlet_events::{BridgeConfig, NatsBroker};

    let url = config.nats_url.as_deref()?;
    match NatsBroker::connect(url).await {
        Ok(broker) => {
            let mut bridge = BridgeConfig::new(Arc::new(broker)).with_prefix(&config.nats_prefix);
            if let Some(stream) = &config.nats_stream {
                bridge = bridge.with_stream(stream);
            }
            Some(bridge)
        }
        Err(e) => {
            tracing::warn!(url, error = %e, "NATS unavailable, running without bridge");
            None
        }
    }
}

#[cfg(not(feature = "nats"))]
async fn bridge_config(config: &WorkerConfig) -> Option<outlet_events::BridgeConfig> {
    if config.nats_url.is_some() {
        tracing::warn!("NATS_URL is set but the worker was built without the `nats` feature");
    }
    None
}

fn load_endpoints(path: &Path) -> anyhow::Result<Vec<WebhookEndpoint>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid webhook list in {}", path.display()))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
