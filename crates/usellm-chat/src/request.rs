use serde_json::{Value, json};
use usellm_core::types::ChatMessage;

use crate::cli::args::Args;

/// Chat Completions request body for a single-turn prompt.
pub fn build_chat_body(args: &Args, prompt: &str) -> Value {
    let mut messages = Vec::new();
    if let Some(system) = args.system_prompt.as_deref().filter(|s| !s.is_empty()) {
        messages.push(ChatMessage::system(system));
    }
    messages.push(ChatMessage::user(prompt));

    let mut body = json!({
        "model": args.model(),
        "messages": messages,
        "stream": true,
    });
    if let Some(temperature) = args.temperature {
        body["temperature"] = json!(temperature);
    }
    body
}
