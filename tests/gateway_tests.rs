use actix_web::{test, web, App};
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use ernie_gateway::server::config_routes;
use ernie_gateway::util::AppState;
use ernie_gateway::GatewayConfig;

const UPSTREAM_PATH: &str = "/eb/chat/conversation/v2";

#[derive(Clone, Debug)]
struct RecordedRequest {
    headers: HeaderMap,
    body: Value,
}

#[derive(Clone)]
struct UpstreamState {
    requests: Arc<AsyncMutex<Vec<RecordedRequest>>>,
    status: StatusCode,
    body: Arc<String>,
}

async fn handle_conversation(
    State(state): State<UpstreamState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    state.requests.lock().await.push(RecordedRequest {
        headers,
        body: payload,
    });
    (
        state.status,
        [(header::CONTENT_TYPE, "text/event-stream")],
        state.body.as_str().to_owned(),
    )
}

struct MockUpstream {
    url: String,
    requests: Arc<AsyncMutex<Vec<RecordedRequest>>>,
    join: JoinHandle<()>,
}

impl MockUpstream {
    async fn start(status: StatusCode, body: &str) -> Self {
        let requests = Arc::new(AsyncMutex::new(Vec::new()));
        let state = UpstreamState {
            requests: requests.clone(),
            status,
            body: Arc::new(body.to_string()),
        };

        let app = Router::new()
            .route(UPSTREAM_PATH, post(handle_conversation))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind upstream");
        let addr = listener.local_addr().expect("local addr");
        let url = format!("http://{}{}", addr, UPSTREAM_PATH);

        let join = tokio::spawn(async move {
            axum::serve(listener, app)
                .await
                .expect("upstream server error");
        });

        Self {
            url,
            requests,
            join,
        }
    }

    async fn recorded(&self) -> Vec<RecordedRequest> {
        self.requests.lock().await.clone()
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.join.abort();
    }
}

/// Upstream that answers 200, optionally sends one line, then goes silent for
/// far longer than the gateway's upstream timeout.
struct StallingUpstream {
    url: String,
    join: JoinHandle<()>,
}

const STALL: Duration = Duration::from_secs(30);

async fn stall_conversation(State(first_line): State<Option<&'static str>>) -> impl IntoResponse {
    let head = stream::iter(
        first_line.map(|line| Ok::<_, std::io::Error>(Bytes::from_static(line.as_bytes()))),
    );
    let tail = stream::once(async {
        tokio::time::sleep(STALL).await;
        Ok(Bytes::from_static(
            b"data: {\"data\":{\"content\":\"late\",\"is_end\":1}}\n",
        ))
    });
    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        Body::from_stream(head.chain(tail)),
    )
}

impl StallingUpstream {
    async fn start(first_line: Option<&'static str>) -> Self {
        let app = Router::new()
            .route(UPSTREAM_PATH, post(stall_conversation))
            .with_state(first_line);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind upstream");
        let addr = listener.local_addr().expect("local addr");
        let url = format!("http://{}{}", addr, UPSTREAM_PATH);

        let join = tokio::spawn(async move {
            axum::serve(listener, app)
                .await
                .expect("upstream server error");
        });

        Self { url, join }
    }
}

impl Drop for StallingUpstream {
    fn drop(&mut self) {
        self.join.abort();
    }
}

fn gateway_config(upstream_url: &str, extra: &[(&str, &str)]) -> GatewayConfig {
    let mut vars: Vec<(String, String)> = vec![
        ("ERNIE_UPSTREAM_URL".into(), upstream_url.into()),
        ("ERNIE_UPSTREAM_TIMEOUT_SECONDS".into(), "5".into()),
        ("ERNIE_ACCOUNT_1_COOKIE".into(), "BAIDUID=test".into()),
        ("ERNIE_ACCOUNT_1_ACS_TOKEN".into(), "acs-test".into()),
        ("ERNIE_ACCOUNT_1_SIGN".into(), "sign-test".into()),
    ];
    vars.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));
    GatewayConfig::from_sources(None, vars).expect("config")
}

/// Split an SSE body into its `data:` payloads.
fn data_frames(body: &[u8]) -> Vec<String> {
    let text = std::str::from_utf8(body).expect("utf8 body");
    text.split("\n\n")
        .filter(|f| !f.is_empty())
        .map(|f| {
            f.strip_prefix("data: ")
                .unwrap_or_else(|| panic!("frame without data prefix: {f:?}"))
                .to_string()
        })
        .collect()
}

fn chunks(frames: &[String]) -> Vec<Value> {
    frames
        .iter()
        .filter(|f| f.as_str() != "[DONE]")
        .map(|f| serde_json::from_str(f).expect("chunk json"))
        .collect()
}

macro_rules! gateway {
    ($config:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new(AppState::new($config).expect("state")))
                .configure(config_routes),
        )
        .await
    };
}

#[actix_web::test]
async fn streams_translated_chunks_end_to_end() {
    let upstream_body = concat!(
        "event: message\n",
        "data: {\"data\":{\"content\":\"Hi\",\"is_end\":0}}\n",
        "\n",
        "data: {\"data\":{\"content\":\" there\",\"is_end\":0}}\n",
        "data: {\"data\":{\"content\":\"\",\"is_end\":1}}\n",
        "data: {\"data\":{\"content\":\"ignored\",\"is_end\":0}}\n",
    );
    let upstream = MockUpstream::start(StatusCode::OK, upstream_body).await;
    let app = gateway!(gateway_config(&upstream.url, &[]));

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(json!({
            "model": "ernie-x1",
            "messages": [
                {"role": "user", "content": "earlier"},
                {"role": "user", "content": "hello"}
            ],
            "stream": true
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    assert_eq!(resp.headers().get("cache-control").unwrap(), "no-cache");

    let body = test::read_body(resp).await;
    let frames = data_frames(&body);
    assert_eq!(frames.last().map(String::as_str), Some("[DONE]"));
    assert_eq!(frames.iter().filter(|f| f.as_str() == "[DONE]").count(), 1);

    let chunks = chunks(&frames);
    assert_eq!(chunks.len(), 4, "role, two contents, finish: {chunks:?}");
    assert_eq!(chunks[0]["choices"][0]["delta"], json!({"role": "assistant"}));
    assert_eq!(chunks[1]["choices"][0]["delta"], json!({"content": "Hi"}));
    assert_eq!(chunks[2]["choices"][0]["delta"], json!({"content": " there"}));
    assert_eq!(chunks[3]["choices"][0]["delta"], json!({}));
    assert_eq!(chunks[3]["choices"][0]["finish_reason"], "stop");

    let id = chunks[0]["id"].as_str().unwrap();
    assert!(id.starts_with("chatcmpl-"));
    for chunk in &chunks {
        assert_eq!(chunk["id"], id);
        assert_eq!(chunk["object"], "chat.completion.chunk");
        assert_eq!(chunk["model"], "ernie-x1");
        assert_eq!(chunk["created"], chunks[0]["created"]);
    }

    let recorded = upstream.recorded().await;
    assert_eq!(recorded.len(), 1);
    let sent = &recorded[0];
    assert_eq!(sent.body["text"], "hello");
    assert_eq!(sent.body["model"], "X1_1");
    assert_eq!(sent.body["sign"], "sign-test");
    assert_eq!(sent.body["deviceType"], "pc");
    assert_eq!(sent.body["parentChatId"], "0");
    assert_eq!(sent.headers["cookie"], "BAIDUID=test");
    assert_eq!(sent.headers["acs-token"], "acs-test");
}

#[actix_web::test]
async fn unknown_alias_is_sent_as_default_backend() {
    let upstream = MockUpstream::start(
        StatusCode::OK,
        "data: {\"data\":{\"content\":\"ok\",\"is_end\":true}}\n",
    )
    .await;
    let app = gateway!(gateway_config(&upstream.url, &[]));

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .to_request();
    let body = test::read_body(test::call_service(&app, req).await).await;
    let chunks = chunks(&data_frames(&body));
    assert_eq!(chunks[0]["model"], "gpt-4o");

    let recorded = upstream.recorded().await;
    assert_eq!(recorded[0].body["model"], "EB45T");
}

#[actix_web::test]
async fn malformed_lines_are_skipped() {
    let upstream_body = concat!(
        "data: {\"data\":{\"content\":\"A\",\"is_end\":0}}\n",
        "data: {not json\n",
        "data: {\"data\":{\"content\":\"B\",\"is_end\":0}}\n",
    );
    let upstream = MockUpstream::start(StatusCode::OK, upstream_body).await;
    let app = gateway!(gateway_config(&upstream.url, &[]));

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(json!({"model": "ernie-4.5-turbo", "messages": [{"role": "user", "content": "x"}]}))
        .to_request();
    let body = test::read_body(test::call_service(&app, req).await).await;
    let frames = data_frames(&body);
    let contents: Vec<Value> = chunks(&frames)
        .iter()
        .map(|c| c["choices"][0]["delta"]["content"].clone())
        .collect();
    assert_eq!(contents, vec![Value::Null, json!("A"), json!("B")]);
    assert_eq!(frames.last().map(String::as_str), Some("[DONE]"));
}

#[actix_web::test]
async fn upstream_error_status_yields_only_sentinel() {
    let upstream = MockUpstream::start(StatusCode::FORBIDDEN, "{\"error\":\"denied\"}").await;
    let app = gateway!(gateway_config(&upstream.url, &[]));

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(json!({"model": "ernie-4.5-turbo", "messages": [{"role": "user", "content": "x"}]}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 200);
    let body = test::read_body(resp).await;
    assert_eq!(&body[..], b"data: [DONE]\n\n");
    assert_eq!(upstream.recorded().await.len(), 1);
}

#[actix_web::test]
async fn incomplete_credentials_fail_before_upstream() {
    let upstream = MockUpstream::start(StatusCode::OK, "").await;
    let app = gateway!(gateway_config(
        &upstream.url,
        &[("ERNIE_ACCOUNT_1_SIGN", "")]
    ));

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(json!({"model": "ernie-4.5-turbo", "messages": [{"role": "user", "content": "x"}]}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 500);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["type"], "configuration_error");
    assert!(body["error"]["message"].as_str().unwrap().contains("sign"));
    assert!(upstream.recorded().await.is_empty());
}

#[actix_web::test]
async fn invalid_json_body_is_rejected() {
    let upstream = MockUpstream::start(StatusCode::OK, "").await;
    let app = gateway!(gateway_config(&upstream.url, &[]));

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .insert_header(("content-type", "application/json"))
        .set_payload("{\"messages\": [")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 500);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert!(upstream.recorded().await.is_empty());
}

#[actix_web::test]
async fn bearer_key_is_enforced_when_configured() {
    let upstream = MockUpstream::start(StatusCode::OK, "").await;
    let app = gateway!(gateway_config(&upstream.url, &[("API_MASTER_KEY", "sk-gw")]));

    let missing = test::TestRequest::get().uri("/v1/models").to_request();
    let resp = test::call_service(&app, missing).await;
    assert_eq!(resp.status().as_u16(), 401);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["type"], "authentication_error");

    let scheme = test::TestRequest::get()
        .uri("/v1/models")
        .insert_header(("authorization", "Basic sk-gw"))
        .to_request();
    assert_eq!(test::call_service(&app, scheme).await.status().as_u16(), 401);

    let wrong = test::TestRequest::get()
        .uri("/v1/models")
        .insert_header(("authorization", "Bearer nope"))
        .to_request();
    assert_eq!(test::call_service(&app, wrong).await.status().as_u16(), 403);

    let ok = test::TestRequest::get()
        .uri("/v1/models")
        .insert_header(("authorization", "Bearer sk-gw"))
        .to_request();
    assert_eq!(test::call_service(&app, ok).await.status().as_u16(), 200);

    let chat = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(json!({"messages": []}))
        .to_request();
    assert_eq!(test::call_service(&app, chat).await.status().as_u16(), 401);
    assert!(upstream.recorded().await.is_empty());
}

#[actix_web::test]
async fn models_are_listed_in_configured_order() {
    let upstream = MockUpstream::start(StatusCode::OK, "").await;
    let app = gateway!(gateway_config(
        &upstream.url,
        &[("ERNIE_MODELS", "ernie-x1=X1_1,ernie-4.5-turbo=EB45T,ernie-lite=EBL")]
    ));

    let req = test::TestRequest::get().uri("/v1/models").to_request();
    let body: Value = test::read_body_json(test::call_service(&app, req).await).await;
    assert_eq!(body["object"], "list");
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["ernie-x1", "ernie-4.5-turbo", "ernie-lite"]);
    for model in body["data"].as_array().unwrap() {
        assert_eq!(model["object"], "model");
        assert_eq!(model["owned_by"], "system");
    }
}

#[actix_web::test]
async fn root_reports_identity_without_auth() {
    let upstream = MockUpstream::start(StatusCode::OK, "").await;
    let app = gateway!(gateway_config(&upstream.url, &[("API_MASTER_KEY", "sk-gw")]));

    let req = test::TestRequest::get().uri("/").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let body: Value = test::read_body_json(resp).await;
    assert!(body["message"].as_str().unwrap().contains("Ernie Gateway"));
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[actix_web::test]
async fn trailing_content_on_end_event_precedes_finish() {
    let upstream_body = concat!(
        "data: {\"data\":{\"content\":\"Hi\",\"is_end\":0}}\n",
        "data: {\"data\":{\"content\":\" there\",\"is_end\":1}}\n",
    );
    let upstream = MockUpstream::start(StatusCode::OK, upstream_body).await;
    let app = gateway!(gateway_config(&upstream.url, &[]));

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(json!({
            "model": "ernie-4.5-turbo",
            "messages": [{"role": "user", "content": "hello"}]
        }))
        .to_request();
    let body = test::read_body(test::call_service(&app, req).await).await;
    let frames = data_frames(&body);
    assert_eq!(frames.len(), 5);
    assert_eq!(frames[4], "[DONE]");

    let deltas: Vec<Value> = chunks(&frames)
        .iter()
        .map(|c| c["choices"][0].clone())
        .collect();
    assert_eq!(deltas[0]["delta"], json!({"role": "assistant"}));
    assert_eq!(deltas[1]["delta"], json!({"content": "Hi"}));
    assert_eq!(deltas[2]["delta"], json!({"content": " there"}));
    assert_eq!(deltas[3]["delta"], json!({}));
    assert_eq!(deltas[3]["finish_reason"], "stop");
    assert!(deltas[..3].iter().all(|d| d["finish_reason"].is_null()));

    let recorded = upstream.recorded().await;
    assert_eq!(recorded[0].body["text"], "hello");
    assert_eq!(recorded[0].body["model"], "EB45T");
}

fn hello_request() -> test::TestRequest {
    test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(json!({
            "model": "ernie-4.5-turbo",
            "messages": [{"role": "user", "content": "hello"}]
        }))
}

#[actix_web::test]
async fn upstream_silent_past_timeout_yields_only_sentinel() {
    let upstream = StallingUpstream::start(None).await;
    let app = gateway!(gateway_config(
        &upstream.url,
        &[("ERNIE_UPSTREAM_TIMEOUT_SECONDS", "1")]
    ));

    let started = Instant::now();
    let resp = test::call_service(&app, hello_request().to_request()).await;
    assert_eq!(resp.status().as_u16(), 200);
    let body = test::read_body(resp).await;

    assert_eq!(&body[..], b"data: [DONE]\n\n");
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "stream outlived the upstream timeout: {:?}",
        started.elapsed()
    );
}

#[actix_web::test]
async fn upstream_stalling_mid_stream_keeps_emitted_chunks() {
    let upstream =
        StallingUpstream::start(Some("data: {\"data\":{\"content\":\"A\",\"is_end\":0}}\n"))
            .await;
    let app = gateway!(gateway_config(
        &upstream.url,
        &[("ERNIE_UPSTREAM_TIMEOUT_SECONDS", "1")]
    ));

    let started = Instant::now();
    let body = test::read_body(test::call_service(&app, hello_request().to_request()).await).await;
    assert!(started.elapsed() < Duration::from_secs(10));

    let frames = data_frames(&body);
    assert_eq!(frames.len(), 3, "role, content, sentinel: {frames:?}");
    assert_eq!(frames[2], "[DONE]");
    let chunks = chunks(&frames);
    assert_eq!(chunks[0]["choices"][0]["delta"], json!({"role": "assistant"}));
    assert_eq!(chunks[1]["choices"][0]["delta"], json!({"content": "A"}));
    assert!(chunks.iter().all(|c| c["choices"][0]["finish_reason"].is_null()));
}

#[actix_web::test]
async fn refused_upstream_connection_yields_only_sentinel() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind placeholder");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let url = format!("http://{}{}", addr, UPSTREAM_PATH);
    let app = gateway!(gateway_config(&url, &[]));

    let resp = test::call_service(&app, hello_request().to_request()).await;
    assert_eq!(resp.status().as_u16(), 200);
    let body = test::read_body(resp).await;
    assert_eq!(&body[..], b"data: [DONE]\n\n");
}
