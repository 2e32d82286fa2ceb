#![forbid(unsafe_code)]
#![doc = r#"
Ernie Gateway

Expose the ERNIE web chat conversation stream as an OpenAI-compatible `/v1/chat/completions` endpoint.

Crate highlights
- Library: request normalization via `build_upstream_request`, stream translation via `transduce`, SSE framing via `sse_body`.
- HTTP server (in `server`): `/`, `/v1/models` and `/v1/chat/completions` (always streamed).
- Config: one immutable `GatewayConfig` built at startup from a file and the environment.

Modules
- `config`: Accounts, model aliases, upstream settings.
- `models`: Chat-completion and upstream wire types.
- `normalizer`: Chat request → upstream conversation request.
- `transducer`: Upstream event lines → chunk events, incrementally.
- `framer`: Chunk events → `data:` frames plus the `[DONE]` sentinel.
- `server`: Actix-web routes/handlers and access logging.
- `util`: Shared helpers (tracing, env, HTTP client, error envelope).

Note: only the last inbound message is forwarded by default; the upstream call is single-turn.
"#]

pub mod auth;
pub mod config;
pub mod error;
pub mod framer;
pub mod models;
pub mod normalizer;
pub mod server;
pub mod transducer;
pub mod util;

pub use crate::config::{
    AccountCredentials, AccountId, AccountRegistry, ConfigError, GatewayConfig, ModelAlias,
    ModelCatalog, PromptMode, UpstreamSettings,
};
pub use crate::error::GatewayError;
pub use crate::framer::{frame, sse_body, DONE_SENTINEL};
pub use crate::normalizer::{build_upstream_request, UpstreamRequest};
pub use crate::transducer::{
    decode_line, transduce, translate, ChunkMapper, LineDecode, OutputEvent, OutputEventKind,
    SkipReason, StreamState, UpstreamDelta,
};

// Re-export model namespaces for convenience (downstream users can do `use ernie_gateway::chat`).
pub use crate::models::{chat, upstream};
