use actix_web::middleware::from_fn;
use actix_web::{web, App, HttpServer};
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;

use ernie_gateway::server::{access_log, config_routes};
use ernie_gateway::util::{cors_config, init_tracing, AppState};
use ernie_gateway::GatewayConfig;

/// OpenAI-compatible gateway in front of the ERNIE web chat stream.
#[derive(Debug, Parser)]
#[command(name = "ernie-gateway", version, about)]
struct Args {
    /// YAML or JSON config file; environment variables override its values.
    #[arg(long, env = "GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Listen host (overrides LISTEN_HOST / config file).
    #[arg(long)]
    host: Option<String>,

    /// Listen port (overrides LISTEN_PORT / config file).
    #[arg(long)]
    port: Option<u16>,
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = GatewayConfig::load(args.config.as_deref()).with_context(|| {
        format!(
            "loading configuration{}",
            args.config
                .as_ref()
                .map(|p| format!(" from {}", p.display()))
                .unwrap_or_default()
        )
    })?;
    if let Some(host) = args.host {
        config.listen_host = host;
    }
    if let Some(port) = args.port {
        config.listen_port = port;
    }

    if config.master_key.is_none() {
        tracing::warn!("API_MASTER_KEY is not configured; the API is open to every caller");
    }
    if config.accounts.is_empty() {
        tracing::error!("no ERNIE account configured; chat requests will fail until one is set");
    }
    for problem in config.incomplete_accounts() {
        tracing::error!("{problem}; chat requests using it will fail");
    }
    tracing::info!(
        models = ?config.models.aliases().collect::<Vec<_>>(),
        default_backend = config.models.default_backend(),
        prompt_mode = ?config.prompt_mode,
        upstream = %config.upstream.url,
        timeout_secs = config.upstream.timeout.as_secs(),
        "configuration loaded"
    );

    let bind = (config.listen_host.clone(), config.listen_port);
    let cors_origins = config.cors_allowed_origins.clone();
    let state = web::Data::new(AppState::new(config).context("building upstream HTTP client")?);

    tracing::info!("ernie-gateway listening on {}:{}", bind.0, bind.1);
    HttpServer::new(move || {
        App::new()
            .wrap(cors_config(&cors_origins))
            .wrap(from_fn(access_log))
            .app_data(state.clone())
            .configure(config_routes)
    })
    .bind(bind.clone())
    .with_context(|| format!("failed to bind {}:{}", bind.0, bind.1))?
    .run()
    .await?;

    Ok(())
}
