use actix_web::HttpResponse;
use http::StatusCode;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{GatewayConfig, UpstreamSettings};

/// Initialize dotenv and structured tracing based on RUST_LOG.
/// - Supports an explicit env file path via ENV_FILE
/// - Falls back to default .env discovery
/// - Logs the source used
pub fn init_tracing() {
    let mut env_source: String = "none".into();
    if let Ok(p) = std::env::var("ENV_FILE") {
        let p = p.trim();
        if !p.is_empty() && std::path::Path::new(p).is_file() && dotenvy::from_filename(p).is_ok()
        {
            env_source = format!("{p} (ENV_FILE)");
        }
    }

    if env_source == "none" && dotenvy::dotenv().is_ok() {
        env_source = ".env".into();
    }

    // Initialize tracing (respects RUST_LOG potentially provided by the env file)
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let subscriber = fmt().with_env_filter(EnvFilter::new(filter)).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    tracing::info!("Environment loaded from: {}", env_source);
}

/// Shared application state used by the HTTP server and handlers.
/// Everything in here is read-only once the server starts.
#[derive(Clone)]
pub struct AppState {
    pub http: reqwest::Client,
    pub config: Arc<GatewayConfig>,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> Result<Self, reqwest::Error> {
        let http = build_http_client(&config.upstream)?;
        Ok(Self {
            http,
            config: Arc::new(config),
        })
    }
}

/// Build the upstream HTTP client.
///
/// The whole-call bound is also applied per request; here it caps connection
/// setup. Proxies come from the usual HTTP_PROXY / HTTPS_PROXY variables.
pub fn build_http_client(upstream: &UpstreamSettings) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .connect_timeout(upstream.timeout)
        .pool_idle_timeout(std::time::Duration::from_secs(60))
        .build()
}

/// Build a JSON error response: `{"error": {"message", "type"}}`.
pub fn error_response(status: StatusCode, msg: &str, kind: &str) -> HttpResponse {
    let body = serde_json::json!({ "error": { "message": msg, "type": kind } });
    let status = actix_web::http::StatusCode::from_u16(status.as_u16())
        .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR);
    HttpResponse::build(status).json(body)
}

/// Seconds since the Unix epoch.
pub fn now_epoch() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Build the CORS layer. An empty origin list allows any origin.
pub fn cors_config(allowed_origins: &[String]) -> actix_cors::Cors {
    let mut cors = actix_cors::Cors::default()
        .allow_any_method()
        .allow_any_header();
    if allowed_origins.is_empty() {
        cors = cors.allow_any_origin();
    } else {
        for origin in allowed_origins {
            cors = cors.allowed_origin(origin);
        }
    }
    cors
}
