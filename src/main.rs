mod actor;
mod config;
mod error;
mod flagging;
mod http_client;
mod logging;
mod providers;
mod ratelimit;
mod server;
mod tokenizer;

use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = config::Settings::load()?;

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let app = server::create_app(config).await?;

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Completions gateway running on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
