#![allow(dead_code)]

use std::collections::HashMap;

use apim_stream::config;
use serde_json::json;

pub const DEPLOYMENT: &str = "gpt-4o-mini";
pub const KEY: &str = "test-key";
pub const COMPLETIONS_PATH: &str = "/openai/deployments/gpt-4o-mini/chat/completions";

pub fn setup() {
    let _ = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(tracing::Level::INFO)
        .with_test_writer()
        .try_init();
}

/// Complete chat configuration pointed at `base_url`.
pub fn env(base_url: &str) -> HashMap<String, String> {
    [
        (config::GATEWAY_URL, base_url),
        (config::DEPLOYMENT_NAME, DEPLOYMENT),
        (config::SUBSCRIPTION_KEY, KEY),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_owned(), v.to_owned()))
    .collect()
}

pub fn delta_chunk(content: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion.chunk",
        "choices": [{"index": 0, "delta": {"content": content}, "finish_reason": null}],
        "usage": null
    })
}

pub fn usage_chunk(prompt: u64, completion: u64) -> serde_json::Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion.chunk",
        "choices": [],
        "usage": {
            "prompt_tokens": prompt,
            "completion_tokens": completion,
            "total_tokens": prompt + completion
        }
    })
}

/// `text/event-stream` body with one `data:` frame per chunk, optionally
/// closed by the `[DONE]` sentinel.
pub fn sse_body(chunks: &[serde_json::Value], done: bool) -> String {
    let mut body: String = chunks
        .iter()
        .map(|chunk| format!("data: {chunk}\n\n"))
        .collect();
    if done {
        body.push_str("data: [DONE]\n\n");
    }
    body
}

pub fn hello_chunks() -> Vec<serde_json::Value> {
    let mut chunks: Vec<_> = ["Hello", ", ", "Bonjour", ", ", "Hola"]
        .into_iter()
        .map(delta_chunk)
        .collect();
    chunks.push(usage_chunk(7, 5));
    chunks
}
