use std::sync::Arc;

use anyhow::Result;
use parallizer::{config::Config, feed::FeedService, http::start_http_server};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration (dotenv, parallizer.toml, PARALLIZER_* overrides)
    let mut config = Config::load().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        e
    })?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("parallizer=info,tower_http=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.server.log_ansi)
        .init();

    for warning in config.take_warnings() {
        warn!("{}", warning);
    }

    info!("Starting parallizer backend");
    info!(
        "Cache: max_per_category={}, similarity_threshold={}, ttl={}s, max_users={}",
        config.cache.max_per_category,
        config.cache.similarity_threshold,
        config.cache.ttl_seconds,
        config.cache.max_users
    );

    let feed = Arc::new(FeedService::from_config(&config).map_err(|e| {
        eprintln!("Failed to initialize producers: {}", e);
        e
    })?);
    info!("{} producers registered", feed.producer_count());

    start_http_server(feed, config.server.clone()).await?;

    info!("Server stopped");
    Ok(())
}
