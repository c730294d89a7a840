// Web service that turns an uploaded image into a cinematic video prompt
// using Google Gemini.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vidiovision::analysis::GeminiClient;
use vidiovision::config::Config;
use vidiovision::routes::{create_router, AppState};
use vidiovision::session::SessionController;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("failed to initialise logging")?;

    let config = Config::parse();

    let api_key = config.api_key.clone().unwrap_or_else(|| {
        warn!("GEMINI_API_KEY is not set; analysis requests will be rejected by the service");
        String::new()
    });

    let analyzer = GeminiClient::new(
        api_key,
        config.model.clone(),
        config.base_url.clone(),
        config.request_timeout(),
    )
    .context("failed to build HTTP client")?;

    let state = AppState {
        controller: Arc::new(SessionController::new(Arc::new(analyzer))),
    };
    let app = create_router(state, config.max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    info!(model = %config.model, "server running on http://{}", config.bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}
