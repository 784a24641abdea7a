use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use gemini_gateway::config::Config;
use gemini_gateway::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file (ignore if missing)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    tracing::info!("Starting Gemini gateway on {}", config.listen_addr);
    tracing::info!(
        "Upstream: {} ({} keys, {} attempts)",
        config.upstream_base_url,
        config.gemini_api_keys.len(),
        config.max_attempts
    );
    if config.client_api_keys.is_empty() {
        tracing::warn!("No CLIENT_API_KEYS configured - running in insecure mode");
    }

    let state = Arc::new(AppState::new(config.clone())?);
    let app = gemini_gateway::app(state);

    let listener = TcpListener::bind(&config.listen_addr).await?;
    tracing::info!("Listening on {}", config.listen_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
