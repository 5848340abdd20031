//! Bodies that upstream model endpoints and the moderation service send.

use bigmodel_common::ReplyChunk;
use serde_json::{json, Value};

/// A stream body of `data:` lines, one per token, ending with the done line.
pub fn reply_stream<S: AsRef<str>>(tokens: &[S]) -> String {
    let mut body = reply_stream_unterminated(tokens);
    body.push_str(&ReplyChunk::done().to_line());
    body
}

/// A stream body of `data:` lines that simply stops.
pub fn reply_stream_unterminated<S: AsRef<str>>(tokens: &[S]) -> String {
    tokens
        .iter()
        .map(|t| ReplyChunk::reply(t.as_ref()).to_line())
        .collect()
}

/// Tokens `t1..=tn`.
pub fn numbered_tokens(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("t{}", i)).collect()
}

pub fn text_generation_body(text: &str) -> Value {
    json!({
        "code": 200,
        "msg": "",
        "result": [{"text_generation_text": [text]}]
    })
}

/// Moderation answer with the given suggestion.
pub fn moderation_body(suggestion: &str) -> Value {
    json!({"result": {"suggestion": suggestion}})
}
