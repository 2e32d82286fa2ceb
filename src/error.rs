//! Request-level error taxonomy.
//!
//! Every failure that can happen before the first streamed byte is sent maps
//! onto a [`GatewayError`], which in turn maps onto an HTTP status and the
//! `{"error": {"message", "type"}}` envelope. Failures after streaming has
//! begun never surface here; they truncate the stream instead.

use actix_web::HttpResponse;
use http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    /// Account credentials are missing or empty. Never retried.
    #[error("account {account} is missing `{field}`")]
    Configuration { account: String, field: &'static str },
    #[error("no upstream account is configured")]
    NoAccount,
    #[error("invalid request body: {0}")]
    RequestValidation(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("upstream transport error: {0}")]
    UpstreamTransport(#[from] reqwest::Error),
    #[error("upstream returned {status}: {body}")]
    UpstreamStatus { status: u16, body: String },
}

pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Value of the envelope's `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Configuration { .. } | GatewayError::NoAccount => "configuration_error",
            GatewayError::RequestValidation(_) => "invalid_request_error",
            GatewayError::Unauthorized(_) | GatewayError::Forbidden(_) => "authentication_error",
            GatewayError::UpstreamTransport(_) | GatewayError::UpstreamStatus { .. } => {
                "provider_error"
            }
        }
    }

    pub fn to_response(&self) -> HttpResponse {
        crate::util::error_response(self.status(), &self.to_string(), self.kind())
    }
}
