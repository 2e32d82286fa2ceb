//! Server-Sent-Events framing for chat completion chunks.

use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use std::convert::Infallible;

use crate::models::chat::{ChatCompletionChunk, ChatDelta, ChatStreamChoice};
use crate::transducer::{OutputEvent, OutputEventKind};

/// Wire-level end of stream marker. Never JSON-encoded.
pub const DONE_SENTINEL: &[u8] = b"data: [DONE]\n\n";

pub const CHUNK_OBJECT: &str = "chat.completion.chunk";

/// Reshape an event into the conventional chunk record.
pub fn to_chunk(event: &OutputEvent) -> ChatCompletionChunk {
    let (delta, finish_reason) = match &event.kind {
        OutputEventKind::Role => (
            ChatDelta {
                role: Some("assistant".to_string()),
                content: None,
            },
            None,
        ),
        OutputEventKind::Content(text) => (
            ChatDelta {
                role: None,
                content: Some(text.clone()),
            },
            None,
        ),
        OutputEventKind::Finish => (ChatDelta::default(), Some("stop".to_string())),
    };

    ChatCompletionChunk {
        id: event.id.clone(),
        object: CHUNK_OBJECT.to_string(),
        created: event.created,
        model: event.model.clone(),
        choices: vec![ChatStreamChoice {
            index: 0,
            delta,
            finish_reason,
        }],
    }
}

/// `data: <json>\n\n`. serde_json writes non-ASCII text as-is.
pub fn frame(event: &OutputEvent) -> Result<Bytes, serde_json::Error> {
    let json = serde_json::to_vec(&to_chunk(event))?;
    let mut out = Vec::with_capacity(json.len() + 8);
    out.extend_from_slice(b"data: ");
    out.extend_from_slice(&json);
    out.extend_from_slice(b"\n\n");
    Ok(Bytes::from(out))
}

/// Frame every event and append the terminal sentinel exactly once.
///
/// The sentinel follows however the event stream ended. Events that fail to
/// serialize are logged and dropped.
pub fn sse_body<S>(events: S) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static
where
    S: Stream<Item = OutputEvent> + Send + 'static,
{
    events
        .filter_map(|event| async move {
            match frame(&event) {
                Ok(bytes) => Some(Ok(bytes)),
                Err(err) => {
                    tracing::error!(chat_id = %event.id, error = %err, "failed to frame chunk");
                    None
                }
            }
        })
        .chain(stream::once(async { Ok(Bytes::from_static(DONE_SENTINEL)) }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn event(kind: OutputEventKind) -> OutputEvent {
        OutputEvent {
            id: "chatcmpl-1".into(),
            created: 1_700_000_000,
            model: "ernie-4.5-turbo".into(),
            kind,
        }
    }

    fn payload(bytes: &Bytes) -> Value {
        let text = std::str::from_utf8(bytes).unwrap();
        let body = text
            .strip_prefix("data: ")
            .and_then(|t| t.strip_suffix("\n\n"))
            .expect("framed envelope");
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn role_chunk_shape() {
        let v = payload(&frame(&event(OutputEventKind::Role)).unwrap());
        assert_eq!(
            v,
            json!({
                "id": "chatcmpl-1",
                "object": "chat.completion.chunk",
                "created": 1_700_000_000,
                "model": "ernie-4.5-turbo",
                "choices": [{"index": 0, "delta": {"role": "assistant"}, "finish_reason": null}]
            })
        );
    }

    #[test]
    fn finish_chunk_has_empty_delta() {
        let v = payload(&frame(&event(OutputEventKind::Finish)).unwrap());
        assert_eq!(v["choices"][0]["delta"], json!({}));
        assert_eq!(v["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn non_ascii_content_is_not_escaped() {
        let bytes = frame(&event(OutputEventKind::Content("你好，世界".into()))).unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.contains("\"content\":\"你好，世界\""));
        assert!(!text.contains("\\u"));
    }

    #[tokio::test]
    async fn sentinel_is_last_and_unique() {
        let events = stream::iter(vec![
            event(OutputEventKind::Role),
            event(OutputEventKind::Content("hi".into())),
            event(OutputEventKind::Finish),
        ]);
        let frames: Vec<Bytes> = sse_body(events).map(|r| r.unwrap()).collect().await;
        assert_eq!(frames.len(), 4);
        assert_eq!(&frames[3][..], DONE_SENTINEL);
        assert_eq!(
            frames.iter().filter(|f| &f[..] == DONE_SENTINEL).count(),
            1
        );
    }

    #[tokio::test]
    async fn empty_stream_still_gets_sentinel() {
        let frames: Vec<Bytes> = sse_body(stream::empty())
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(frames, vec![Bytes::from_static(DONE_SENTINEL)]);
    }
}
