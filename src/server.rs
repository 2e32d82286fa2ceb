use actix_web::body::MessageBody;
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::http::header;
use actix_web::middleware::Next;
use actix_web::{web, HttpRequest, HttpResponse, Responder};
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::{verify_bearer, Verification};
use crate::error::GatewayError;
use crate::framer::sse_body;
use crate::models::chat::{ChatCompletionRequest, ModelList, ModelObject};
use crate::normalizer::build_upstream_request;
use crate::transducer::transduce;
use crate::util::{now_epoch, AppState};

/// Largest accepted chat request body.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Configure Actix-web routes with AppState.
pub fn config_routes(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::PayloadConfig::new(MAX_BODY_BYTES))
        .route("/", web::get().to(root))
        .route("/v1/models", web::get().to(list_models))
        .route("/v1/chat/completions", web::post().to(chat_completions));
}

/// Access log: one line when the request arrives and one when the response
/// head is ready, leveled by status.
pub async fn access_log(
    req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> Result<ServiceResponse<impl MessageBody>, actix_web::Error> {
    let request_id = Uuid::new_v4();
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.path().to_string();
    let peer = req
        .connection_info()
        .realip_remote_addr()
        .unwrap_or("-")
        .to_string();

    info!(%request_id, %peer, "--> {} {}", method, path);
    let res = next.call(req).await?;

    let status = res.status().as_u16();
    let elapsed_ms = format!("{:.2}", started.elapsed().as_secs_f64() * 1000.0);
    if status >= 500 {
        error!(%request_id, %peer, status, %elapsed_ms, "<-- {} {}", method, path);
    } else if status >= 400 {
        warn!(%request_id, %peer, status, %elapsed_ms, "<-- {} {}", method, path);
    } else {
        info!(%request_id, %peer, status, %elapsed_ms, "<-- {} {}", method, path);
    }
    Ok(res)
}

fn authorize(state: &AppState, req: &HttpRequest) -> Result<(), GatewayError> {
    let auth = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let verification = verify_bearer(state.config.master_key.as_deref(), auth);
    if verification == Verification::Open {
        warn!("API_MASTER_KEY is not configured; the API is open to every caller");
    }
    verification.into_result()
}

/// Unauthenticated liveness/identity probe.
async fn root() -> impl Responder {
    web::Json(serde_json::json!({
        "message": "Welcome to Ernie Gateway",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// List the configured model aliases in configuration order.
async fn list_models(state: web::Data<AppState>, req: HttpRequest) -> HttpResponse {
    if let Err(err) = authorize(&state, &req) {
        return err.to_response();
    }

    let created = now_epoch();
    let data = state
        .config
        .models
        .aliases()
        .map(|alias| ModelObject {
            id: alias.to_string(),
            object: "model".to_string(),
            created,
            owned_by: "system".to_string(),
        })
        .collect();

    HttpResponse::Ok().json(ModelList {
        object: "list".to_string(),
        data,
    })
}

/// Translate a chat completion request into an upstream conversation and
/// stream the reply back as chat completion chunks.
///
/// Everything that can fail before the stream opens is answered with a JSON
/// error envelope. Once streaming starts the status is fixed at 200 and
/// failures only show up as a shorter stream followed by `[DONE]`.
async fn chat_completions(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Bytes,
) -> HttpResponse {
    if let Err(err) = authorize(&state, &req) {
        return err.to_response();
    }

    let request: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            let err = GatewayError::RequestValidation(e.to_string());
            error!(error = %err, "rejecting chat completion request");
            return err.to_response();
        }
    };

    let config = &state.config;
    let upstream = match config
        .accounts
        .select()
        .and_then(|account| build_upstream_request(config, &request, account))
    {
        Ok(upstream) => upstream,
        Err(err) => {
            error!(error = %err, "cannot prepare upstream request");
            return err.to_response();
        }
    };

    info!(
        account = %upstream.account,
        model = %upstream.model,
        backend = %upstream.body.model,
        messages = request.messages.len(),
        "opening upstream conversation stream"
    );

    let events = transduce(state.http.clone(), upstream);
    HttpResponse::Ok()
        .insert_header(("content-type", "text/event-stream"))
        .insert_header(("cache-control", "no-cache"))
        .insert_header(("connection", "keep-alive"))
        .streaming(sse_body(events))
}
