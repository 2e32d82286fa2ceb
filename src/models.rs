//! Wire models.
//!
//! - `chat`: the OpenAI-style surface exposed to callers (request, streamed chunk, model list).
//! - `upstream`: the conversation request body and event payload spoken by ERNIE.

pub mod chat {
    use serde::{Deserialize, Serialize};
    use serde_json::Value;

    /// Inbound `/v1/chat/completions` body. Fields other than `model` and
    /// `messages` are accepted and ignored.
    #[derive(Debug, Clone, Deserialize, Serialize)]
    pub struct ChatCompletionRequest {
        #[serde(default)]
        pub model: Option<String>,
        #[serde(default)]
        pub messages: Vec<ChatMessage>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub stream: Option<bool>,
    }

    #[derive(Debug, Clone, Deserialize, Serialize)]
    pub struct ChatMessage {
        #[serde(default)]
        pub role: String,
        /// String or an array of content parts.
        #[serde(default)]
        pub content: Value,
    }

    impl ChatMessage {
        /// Plain text of the message. Array content keeps only text-like parts,
        /// joined by newlines.
        pub fn text(&self) -> Option<String> {
            match &self.content {
                Value::String(s) => Some(s.clone()),
                Value::Array(parts) => {
                    let pieces: Vec<&str> = parts
                        .iter()
                        .filter(|p| {
                            matches!(
                                p.get("type").and_then(|t| t.as_str()),
                                Some("text") | Some("input_text")
                            )
                        })
                        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                        .collect();
                    if pieces.is_empty() {
                        None
                    } else {
                        Some(pieces.join("\n"))
                    }
                }
                _ => None,
            }
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct ChatCompletionChunk {
        pub id: String,
        pub object: String,
        pub created: u64,
        pub model: String,
        pub choices: Vec<ChatStreamChoice>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct ChatStreamChoice {
        pub index: u32,
        pub delta: ChatDelta,
        pub finish_reason: Option<String>,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
    pub struct ChatDelta {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub role: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub content: Option<String>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ModelObject {
        pub id: String,
        pub object: String,
        pub created: u64,
        pub owned_by: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ModelList {
        pub object: String,
        pub data: Vec<ModelObject>,
    }
}

pub mod upstream {
    use serde::{Deserialize, Serialize};
    use serde_json::Value;

    /// Body of the conversation POST. Session fields stay empty: every call
    /// starts a fresh single-turn conversation.
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    pub struct ConversationBody {
        pub sign: String,
        pub timestamp: u64,
        pub device_type: String,
        pub text: String,
        pub model: String,
        pub session_id: String,
        pub session_name: String,
        pub parent_chat_id: String,
        pub is_new_yiyan: bool,
    }

    /// One `data:` payload from the conversation stream.
    #[derive(Debug, Clone, Default, Deserialize)]
    pub struct EventPayload {
        #[serde(default)]
        pub data: Option<EventData>,
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    pub struct EventData {
        #[serde(default)]
        pub content: Option<String>,
        /// Seen as `0`/`1`; booleans are accepted too.
        #[serde(default)]
        pub is_end: Value,
    }

    impl EventData {
        pub fn is_end(&self) -> bool {
            match &self.is_end {
                Value::Bool(b) => *b,
                Value::Number(n) => n.as_f64() == Some(1.0),
                _ => false,
            }
        }
    }
}
