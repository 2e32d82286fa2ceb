//! Build the upstream conversation request from an inbound chat request.
//!
//! Pure apart from reading the clock for the body timestamp: no I/O happens
//! here, so a credential problem is reported before any connection is opened.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::{AccountId, GatewayConfig, PromptMode};
use crate::error::{GatewayError, Result};
use crate::models::chat::{ChatCompletionRequest, ChatMessage};
use crate::models::upstream::ConversationBody;

/// Used when the request carries no usable text.
pub const PLACEHOLDER_PROMPT: &str = "你好";

pub const DEVICE_TYPE: &str = "pc";
const ACCEPT: &str = "text/event-stream,application/json, text/event-stream";
const ORIGIN: &str = "https://ernie.baidu.com";
const REFERER: &str = "https://ernie.baidu.com/";
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/140.0.0.0 Safari/537.36";

/// Everything needed to open one upstream stream.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub body: ConversationBody,
    pub account: AccountId,
    pub timeout: Duration,
    /// Alias echoed back to the caller in every chunk.
    pub model: String,
}

pub fn build_upstream_request(
    config: &GatewayConfig,
    request: &ChatCompletionRequest,
    account: &AccountId,
) -> Result<UpstreamRequest> {
    let credentials = config
        .accounts
        .get(account)
        .ok_or_else(|| GatewayError::Configuration {
            account: account.to_string(),
            field: "credentials",
        })?;
    credentials.validate(account)?;

    let mut headers = HeaderMap::new();
    headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static(ACCEPT));
    headers.insert(
        HeaderName::from_static("acs-token"),
        opaque_header(account, "acs_token", &credentials.acs_token)?,
    );
    headers.insert(
        reqwest::header::CONNECTION,
        HeaderValue::from_static("keep-alive"),
    );
    headers.insert(
        reqwest::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    headers.insert(
        reqwest::header::COOKIE,
        opaque_header(account, "cookie", &credentials.cookie)?,
    );
    headers.insert(
        HeaderName::from_static("device-type"),
        HeaderValue::from_static(DEVICE_TYPE),
    );
    headers.insert(reqwest::header::ORIGIN, HeaderValue::from_static(ORIGIN));
    headers.insert(reqwest::header::REFERER, HeaderValue::from_static(REFERER));
    headers.insert(
        reqwest::header::USER_AGENT,
        HeaderValue::from_static(USER_AGENT),
    );

    let model = request
        .model
        .as_deref()
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| config.models.default_alias())
        .to_string();

    let body = ConversationBody {
        sign: credentials.sign.clone(),
        timestamp: now_millis(),
        device_type: DEVICE_TYPE.to_string(),
        text: prompt_text(&request.messages, config.prompt_mode),
        model: config.models.resolve(&model).to_string(),
        session_id: String::new(),
        session_name: String::new(),
        parent_chat_id: "0".to_string(),
        is_new_yiyan: true,
    };

    Ok(UpstreamRequest {
        url: config.upstream.url.clone(),
        headers,
        body,
        account: account.clone(),
        timeout: config.upstream.timeout,
        model,
    })
}

/// Collapse the message list into the single prompt the upstream accepts.
pub fn prompt_text(messages: &[ChatMessage], mode: PromptMode) -> String {
    let text = match mode {
        PromptMode::LastMessage => messages.last().and_then(ChatMessage::text),
        PromptMode::Transcript => {
            let lines: Vec<String> = messages
                .iter()
                .filter_map(|m| {
                    let text = m.text()?;
                    if text.trim().is_empty() {
                        return None;
                    }
                    let role = if m.role.is_empty() { "user" } else { &m.role };
                    Some(format!("{role}: {text}"))
                })
                .collect();
            (!lines.is_empty()).then(|| lines.join("\n"))
        }
    };
    text.filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| PLACEHOLDER_PROMPT.to_string())
}

fn opaque_header(account: &AccountId, field: &'static str, value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value.trim()).map_err(|_| GatewayError::Configuration {
        account: account.to_string(),
        field,
    })
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
