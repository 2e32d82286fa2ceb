//! Upstream stream transducer.
//!
//! Turns the ERNIE conversation stream (newline-delimited `data:{json}` lines)
//! into OpenAI-style chunk events while bytes are still arriving.
//!
//! The work is split so each piece can be exercised on its own:
//! - [`decode_line`]: one raw line -> payload or an explicit skip reason.
//! - [`ChunkMapper`]: the per-request state machine
//!   (`AwaitingFirstContent -> Streaming -> Terminated`).
//! - [`translate`]: drives a byte stream through line splitting, decoding and mapping.
//! - [`transduce`]: opens the upstream call and feeds its body to [`translate`].
//!
//! The returned streams are lazy, single-use and finite. Dropping one (for
//! example when the caller disconnects) drops the upstream response with it,
//! which releases the connection.

use bytes::Bytes;
use futures_util::stream::{Stream, StreamExt};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::models::upstream::EventPayload;
use crate::normalizer::UpstreamRequest;
use crate::util::now_epoch;

pub const DATA_PREFIX: &str = "data:";

const ERROR_BODY_LIMIT: usize = 200;

/// Longest unterminated line accepted from the upstream before the stream is
/// treated as broken.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Decoded content of one upstream event line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamDelta {
    pub content: Option<String>,
    pub is_end: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Keep-alive, comment or any other non-`data:` line.
    NotData,
    EmptyPayload,
    /// The payload was not valid event JSON; carries the parser message.
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineDecode {
    Delta(UpstreamDelta),
    Skip(SkipReason),
}

/// Decode a single line (without its trailing newline).
pub fn decode_line(line: &str) -> LineDecode {
    let Some(rest) = line.trim_end_matches('\r').strip_prefix(DATA_PREFIX) else {
        return LineDecode::Skip(SkipReason::NotData);
    };
    let payload = rest.trim();
    if payload.is_empty() {
        return LineDecode::Skip(SkipReason::EmptyPayload);
    }
    match serde_json::from_str::<EventPayload>(payload) {
        Ok(parsed) => {
            let delta = parsed
                .data
                .map(|data| UpstreamDelta {
                    is_end: data.is_end(),
                    content: data.content,
                })
                .unwrap_or_default();
            LineDecode::Delta(delta)
        }
        Err(err) => LineDecode::Skip(SkipReason::Malformed(err.to_string())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    AwaitingFirstContent,
    Streaming,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEventKind {
    /// `delta: {"role": "assistant"}`
    Role,
    Content(String),
    /// Empty delta with `finish_reason: "stop"`.
    Finish,
}

/// One standardized streamed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputEvent {
    pub id: String,
    pub created: u64,
    pub model: String,
    pub kind: OutputEventKind,
}

/// Maps decoded deltas onto output events for a single conversation.
#[derive(Debug)]
pub struct ChunkMapper {
    id: String,
    created: u64,
    model: String,
    state: StreamState,
}

impl ChunkMapper {
    pub fn new(model: impl Into<String>) -> Self {
        Self::with_id(format!("chatcmpl-{}", Uuid::new_v4().simple()), model)
    }

    pub fn with_id(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created: now_epoch(),
            model: model.into(),
            state: StreamState::AwaitingFirstContent,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Events for one delta, in emission order. Once terminated, every
    /// further delta maps to nothing.
    pub fn map(&mut self, delta: UpstreamDelta) -> Vec<OutputEvent> {
        let mut out = Vec::new();
        if self.state == StreamState::Terminated {
            return out;
        }
        if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
            if self.state == StreamState::AwaitingFirstContent {
                out.push(self.event(OutputEventKind::Role));
                self.state = StreamState::Streaming;
            }
            out.push(self.event(OutputEventKind::Content(text)));
        }
        if delta.is_end {
            out.push(self.event(OutputEventKind::Finish));
            self.state = StreamState::Terminated;
        }
        out
    }

    fn event(&self, kind: OutputEventKind) -> OutputEvent {
        OutputEvent {
            id: self.id.clone(),
            created: self.created,
            model: self.model.clone(),
            kind,
        }
    }

    /// Decode and map one raw line, logging skipped malformed payloads.
    fn feed_line(&mut self, line: &str) -> Vec<OutputEvent> {
        match decode_line(line) {
            LineDecode::Delta(delta) => self.map(delta),
            LineDecode::Skip(SkipReason::Malformed(reason)) => {
                warn!(chat_id = %self.id, %reason, line = %line, "skipping malformed upstream event");
                Vec::new()
            }
            LineDecode::Skip(_) => Vec::new(),
        }
    }
}

/// Accumulates raw bytes and hands out complete lines.
#[derive(Debug, Default)]
struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<String> {
        let pos = self.buffer.iter().position(|&b| b == b'\n')?;
        let line = self.buffer.drain(..=pos).collect::<Vec<u8>>();
        Some(String::from_utf8_lossy(&line[..pos]).into_owned())
    }

    fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Remaining unterminated bytes at end of input.
    fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

/// Translate an upstream body into output events.
///
/// Stops at the first completion event without waiting for the upstream to
/// close. A body error, or an unterminated line longer than
/// [`MAX_LINE_BYTES`], ends the stream after whatever was already emitted.
pub fn translate<S, E>(mut mapper: ChunkMapper, body: S) -> impl Stream<Item = OutputEvent> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    async_stream::stream! {
        let mut body = Box::pin(body);
        let mut lines = LineBuffer::default();
        let mut emitted = 0usize;

        'read: loop {
            match body.next().await {
                Some(Ok(chunk)) => {
                    lines.push(&chunk);
                    while let Some(line) = lines.next_line() {
                        for event in mapper.feed_line(&line) {
                            emitted += 1;
                            yield event;
                        }
                        if mapper.state() == StreamState::Terminated {
                            break 'read;
                        }
                    }
                    if lines.pending() > MAX_LINE_BYTES {
                        error!(
                            chat_id = %mapper.id(),
                            pending = lines.pending(),
                            "upstream line exceeds {} bytes without a newline",
                            MAX_LINE_BYTES
                        );
                        break 'read;
                    }
                }
                Some(Err(err)) => {
                    error!(chat_id = %mapper.id(), error = %err, "upstream stream interrupted");
                    break 'read;
                }
                None => {
                    if let Some(line) = lines.finish() {
                        for event in mapper.feed_line(&line) {
                            emitted += 1;
                            yield event;
                        }
                    }
                    break 'read;
                }
            }
        }

        info!(
            chat_id = %mapper.id(),
            events = emitted,
            completed = mapper.state() == StreamState::Terminated,
            "upstream stream finished"
        );
    }
}

/// Open the upstream call and translate its body.
///
/// Transport failures and non-success statuses are logged and produce an empty
/// stream; they never surface as an item.
pub fn transduce(
    client: reqwest::Client,
    request: UpstreamRequest,
) -> impl Stream<Item = OutputEvent> + Send + 'static {
    let mapper = ChunkMapper::new(request.model.clone());
    async_stream::stream! {
        let chat_id = mapper.id().to_string();
        let account = request.account.clone();
        match open(&client, request).await {
            Ok(response) => {
                let events = translate(mapper, response.bytes_stream());
                futures_util::pin_mut!(events);
                while let Some(event) = events.next().await {
                    yield event;
                }
            }
            Err(err) => {
                error!(%chat_id, %account, error = %err, "upstream request failed");
            }
        }
    }
}

async fn open(
    client: &reqwest::Client,
    request: UpstreamRequest,
) -> Result<reqwest::Response, GatewayError> {
    let response = client
        .post(&request.url)
        .headers(request.headers)
        .timeout(request.timeout)
        .json(&request.body)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(GatewayError::UpstreamStatus {
            status: status.as_u16(),
            body: body.chars().take(ERROR_BODY_LIMIT).collect(),
        });
    }
    Ok(response)
}
