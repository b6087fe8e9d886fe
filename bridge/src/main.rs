mod batching;
mod channel;
mod config;
mod correlator;
mod db;
mod errors;
mod matcher;
mod metrics;
mod model;
mod mqtt;
mod rest;
mod store;
mod sweeper;
mod topics;
mod validate;

#[cfg(test)]
mod testing;

use axum::{routing::get, Router};
use channel::{LinkState, MqttChannel};
use config::Config;
use correlator::Correlator;
use db::{PgRepository, Repository};
use matcher::ResponseMatcher;
use mqtt::MessageRouter;
use rumqttc::AsyncClient;
use std::sync::Arc;
use store::CommandStore;
use tokio::sync::mpsc;
use topics::Topics;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    if let Err(e) = run(config).await {
        error!("Bridge failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    info!("Starting AirSense bridge");
    info!("MQTT broker: {}:{}", config.mqtt_broker, config.mqtt_port);
    info!("HTTP server: {}", config.http_addr);
    info!(
        "Database: {}",
        config.database_url.split('@').last().unwrap_or("***")
    );

    metrics::init_metrics()?;

    let pool = db::make_pool(&config.database_url).await?;
    let repo: Arc<dyn Repository> = Arc::new(PgRepository::new(pool));

    info!("Channel capacity: {}", config.channel_capacity);
    let (tx, rx) = mpsc::channel(config.channel_capacity);

    let topics = Topics::new(config.topic_prefix.clone());
    let (client, eventloop) = AsyncClient::new(mqtt::mqtt_options(&config), 10000);
    let link = LinkState::default();

    let store = Arc::new(CommandStore::new());
    let correlator = Arc::new(Correlator::new(
        store.clone(),
        repo.clone(),
        Arc::new(MqttChannel::new(
            client.clone(),
            topics.clone(),
            link.clone(),
            config.publish_timeout,
        )),
        config.command_ttl()?,
    ));

    let router = MessageRouter::new(topics, tx, ResponseMatcher::new(correlator.clone()));
    let mqtt_handle = tokio::spawn(async move {
        if let Err(e) = mqtt::run_mqtt(client, eventloop, link, router).await {
            error!("MQTT task failed: {}", e);
        }
    });

    let batcher_repo = repo.clone();
    let (batch_size, batch_timeout_ms) = (config.batch_size, config.batch_timeout_ms);
    let batcher_handle = tokio::spawn(async move {
        batching::run_batcher(rx, batcher_repo, batch_size, batch_timeout_ms).await;
    });

    let sweeper_handle = tokio::spawn(sweeper::run_sweeper(
        store,
        config.sweep_interval,
        config.command_retention()?,
    ));

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .merge(rest::create_router(correlator, repo));

    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    });

    tokio::select! {
        _ = mqtt_handle => {
            error!("MQTT task terminated");
        }
        _ = batcher_handle => {
            error!("Batcher task terminated");
        }
        _ = sweeper_handle => {
            error!("Sweeper task terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
    Ok(())
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}

async fn health_handler() -> &'static str {
    "ok"
}
