use crate::upstream::Completion;
use serde::Deserialize;
use std::time::{SystemTime, UNIX_EPOCH};

/// OpenAI `/v1/chat/completions` request schema (the subset the gateway
/// honors).
#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub user: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Flatten a chat transcript into a single prompt for upstreams that only
/// take raw text. System turns lead, then the conversation in order.
pub fn assemble_prompt(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    for msg in messages.iter().filter(|m| m.role == "system") {
        out.push_str(&msg.content);
        out.push_str("\n\n");
    }
    for msg in messages.iter().filter(|m| m.role != "system") {
        match msg.role.as_str() {
            "assistant" => {
                out.push_str("Assistant: ");
                out.push_str(&msg.content);
                out.push('\n');
            }
            _ => {
                out.push_str("User: ");
                out.push_str(&msg.content);
                out.push('\n');
            }
        }
    }
    out.push_str("Assistant:");
    out
}

/// Rough token estimate (4 chars ≈ 1 token) for upstreams that report none.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Shape a completed pipeline result as an OpenAI `chat.completion` object.
pub fn completion_response(
    request_id: &str,
    completion: &Completion,
    prompt: &str,
) -> serde_json::Value {
    let prompt_tokens = completion
        .prompt_tokens
        .unwrap_or_else(|| estimate_tokens(prompt));
    let completion_tokens = completion
        .completion_tokens
        .unwrap_or_else(|| estimate_tokens(&completion.text));
    serde_json::json!({
        "id": format!("chatcmpl-{}", request_id),
        "object": "chat.completion",
        "created": unix_now(),
        "model": completion.model,
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": completion.text,
            },
            "finish_reason": "stop",
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens,
        },
        "system_fingerprint": completion.provider,
    })
}

/// OpenAI error envelope.
pub fn error_envelope(message: &str, kind: &str, code: u16) -> serde_json::Value {
    serde_json::json!({
        "error": {
            "message": message,
            "type": kind,
            "code": code,
        }
    })
}
