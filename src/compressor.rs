// Context compression and prompt-cache breakpoint marking (§4.8).
//
// Sliding-window is pure and always available. Summary/hybrid delegate
// summarization to a model call through the `Summarizer` trait and fall
// back to sliding-window on any failure.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::models::anthropic::AnthropicMessage;
use crate::store::CompressionStrategy;
use crate::tokenizer::count_anthropic_message_tokens;

/// Abstracts "call a cheap model to summarize text" so the compressor
/// doesn't depend on a concrete provider adapter.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str) -> anyhow::Result<String>;
}

pub struct CompressionResult {
    pub messages: Vec<AnthropicMessage>,
    pub was_compressed: bool,
    pub original_tokens: i32,
    pub compressed_tokens: i32,
}

fn estimate_tokens(messages: &[AnthropicMessage]) -> i32 {
    count_anthropic_message_tokens(messages, None, None)
}

fn is_system(msg: &AnthropicMessage) -> bool {
    msg.role == "system"
}

/// Keep system messages verbatim; greedily keep the tail of the
/// conversation (back from the last user message) that fits `target`
/// tokens, then clean the sequence to satisfy Anthropic's alternation
/// invariants.
pub fn sliding_window_compress(messages: &[AnthropicMessage], target: i32) -> Vec<AnthropicMessage> {
    if messages.is_empty() {
        return messages.to_vec();
    }

    let system_messages: Vec<AnthropicMessage> = messages.iter().filter(|m| is_system(m)).cloned().collect();
    let conversation: Vec<AnthropicMessage> = messages.iter().filter(|m| !is_system(m)).cloned().collect();

    if conversation.is_empty() {
        return messages.to_vec();
    }

    let Some(last_user_idx) = conversation.iter().rposition(|m| m.role == "user") else {
        tracing::warn!("no user message found in conversation, skipping compression");
        return messages.to_vec();
    };

    let to_compress = &conversation[..=last_user_idx];
    let system_tokens = estimate_tokens(&system_messages);
    let budget = target - system_tokens;

    let mut kept: Vec<AnthropicMessage> = Vec::new();
    let mut current_tokens = 0;
    for msg in to_compress.iter().rev() {
        let msg_tokens = estimate_tokens(std::slice::from_ref(msg));
        if current_tokens + msg_tokens <= budget {
            kept.insert(0, msg.clone());
            current_tokens += msg_tokens;
        } else {
            break;
        }
    }

    if kept.last().map(|m| m.role.as_str()) != Some("user") {
        kept = vec![conversation[last_user_idx].clone()];
    }

    let cleaned = clean_message_sequence(kept);

    let mut result = system_messages;
    result.extend(cleaned);
    result
}

/// Enforce: starts with user, strictly alternates, tool_use/tool_result
/// pairing holds, and the sequence ends on a user turn.
fn clean_message_sequence(messages: Vec<AnthropicMessage>) -> Vec<AnthropicMessage> {
    let mut cleaned: Vec<AnthropicMessage> = Vec::new();

    for msg in messages {
        if cleaned.is_empty() && msg.role != "user" {
            continue;
        }
        if let Some(last) = cleaned.last() {
            if last.role == msg.role {
                continue;
            }
        }
        cleaned.push(msg);
    }

    // (c) strip unmatched tool_use/tool_result pairs between adjacent turns.
    for i in 0..cleaned.len() {
        if cleaned[i].role == "assistant" {
            let has_tool_use = content_has_type(&cleaned[i].content, "tool_use");
            let next_has_tool_result = cleaned
                .get(i + 1)
                .map(|m| content_has_type(&m.content, "tool_result"))
                .unwrap_or(false);
            if has_tool_use && !next_has_tool_result {
                cleaned[i].content = strip_content_type(&cleaned[i].content, "tool_use");
            }
        }
        if cleaned[i].role == "user" && i > 0 {
            let has_tool_result = content_has_type(&cleaned[i].content, "tool_result");
            let prev_has_tool_use = content_has_type(&cleaned[i - 1].content, "tool_use");
            if has_tool_result && !prev_has_tool_use {
                cleaned[i].content = strip_content_type(&cleaned[i].content, "tool_result");
            }
        }
    }

    // (d) drop a trailing assistant turn so the sequence ends on user.
    while cleaned.last().map(|m| m.role.as_str()) == Some("assistant") {
        cleaned.pop();
    }

    cleaned
}

fn content_has_type(content: &Value, type_name: &str) -> bool {
    match content {
        Value::Array(items) => items
            .iter()
            .any(|i| i.get("type").and_then(|t| t.as_str()) == Some(type_name)),
        _ => false,
    }
}

fn strip_content_type(content: &Value, type_name: &str) -> Value {
    match content {
        Value::Array(items) => {
            let filtered: Vec<Value> = items
                .iter()
                .filter(|i| i.get("type").and_then(|t| t.as_str()) != Some(type_name))
                .cloned()
                .collect();
            Value::Array(filtered)
        }
        other => other.clone(),
    }
}

fn plain_text_message(role: &str, text: String) -> AnthropicMessage {
    AnthropicMessage {
        role: role.to_string(),
        content: json!(text),
    }
}

async fn summary_compress(
    messages: &[AnthropicMessage],
    summarizer: &dyn Summarizer,
) -> anyhow::Result<Vec<AnthropicMessage>> {
    let last_user_idx = messages
        .iter()
        .rposition(|m| m.role == "user")
        .ok_or_else(|| anyhow::anyhow!("no user message to summarize around"))?;

    let system_messages: Vec<AnthropicMessage> = messages.iter().filter(|m| is_system(m)).cloned().collect();
    let to_summarize: Vec<&AnthropicMessage> = messages[..last_user_idx]
        .iter()
        .filter(|m| !is_system(m))
        .collect();

    let transcript: String = to_summarize
        .iter()
        .map(|m| format!("{}: {}", m.role, flatten_text(&m.content)))
        .collect::<Vec<_>>()
        .join("\n");

    let summary = summarizer.summarize(&transcript).await?;

    let mut result = system_messages;
    result.push(plain_text_message("user", format!("[历史对话总结]\n{summary}")));
    result.push(messages[last_user_idx].clone());
    Ok(result)
}

fn flatten_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|i| i.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    }
}

/// Run compression per §4.8: pass through under threshold, else dispatch to
/// the configured strategy (falling back to sliding_window on any failure
/// from `summary`/`hybrid`).
pub async fn compress_if_needed(
    messages: &[AnthropicMessage],
    enabled: bool,
    threshold: i32,
    target: i32,
    strategy: CompressionStrategy,
    summarizer: Option<&dyn Summarizer>,
) -> CompressionResult {
    if !enabled {
        return CompressionResult {
            messages: messages.to_vec(),
            was_compressed: false,
            original_tokens: 0,
            compressed_tokens: 0,
        };
    }

    let original_tokens = estimate_tokens(messages);
    if original_tokens < threshold {
        return CompressionResult {
            messages: messages.to_vec(),
            was_compressed: false,
            original_tokens,
            compressed_tokens: original_tokens,
        };
    }

    let compressed = match strategy {
        CompressionStrategy::SlidingWindow => sliding_window_compress(messages, target),
        CompressionStrategy::Summary => match summarizer {
            Some(s) => summary_compress(messages, s).await.unwrap_or_else(|e| {
                tracing::warn!(error = %e, "summary compression failed, falling back to sliding window");
                sliding_window_compress(messages, target)
            }),
            None => sliding_window_compress(messages, target),
        },
        CompressionStrategy::Hybrid => match summarizer {
            Some(s) => match summary_compress(messages, s).await {
                Ok(mut summarized) => {
                    let tail: Vec<AnthropicMessage> = messages
                        .iter()
                        .rev()
                        .take(4)
                        .rev()
                        .cloned()
                        .collect();
                    summarized.extend(tail);
                    summarized
                }
                Err(e) => {
                    tracing::warn!(error = %e, "hybrid compression failed, falling back to sliding window");
                    sliding_window_compress(messages, target)
                }
            },
            None => sliding_window_compress(messages, target),
        },
    };

    let compressed_tokens = estimate_tokens(&compressed);
    CompressionResult {
        messages: compressed,
        was_compressed: true,
        original_tokens,
        compressed_tokens,
    }
}

/// Promote up to three trailing text segments (system, second-to-last user,
/// last user) to cache-breakpoint-marked block-list form.
pub fn apply_cache_markers(messages: &mut Vec<AnthropicMessage>, system: &mut Option<Value>) {
    if let Some(sys) = system {
        *sys = mark_last_text_block(sys);
    }

    let user_indices: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == "user")
        .map(|(i, _)| i)
        .collect();

    if let Some(&last) = user_indices.last() {
        messages[last].content = mark_last_text_block(&messages[last].content);
    }
    if user_indices.len() >= 2 {
        let second_to_last = user_indices[user_indices.len() - 2];
        messages[second_to_last].content = mark_last_text_block(&messages[second_to_last].content);
    }
}

fn mark_last_text_block(content: &Value) -> Value {
    let mut blocks = match content {
        Value::String(s) => vec![json!({"type": "text", "text": s})],
        Value::Array(items) => items.clone(),
        other => return other.clone(),
    };

    if let Some(last_text_idx) = blocks
        .iter()
        .rposition(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
    {
        if let Some(obj) = blocks[last_text_idx].as_object_mut() {
            obj.insert("cache_control".to_string(), json!({"type": "ephemeral"}));
        }
    }

    Value::Array(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(text: &str) -> AnthropicMessage {
        AnthropicMessage {
            role: "user".to_string(),
            content: json!(text),
        }
    }

    fn assistant(text: &str) -> AnthropicMessage {
        AnthropicMessage {
            role: "assistant".to_string(),
            content: json!(text),
        }
    }

    fn system(text: &str) -> AnthropicMessage {
        AnthropicMessage {
            role: "system".to_string(),
            content: json!(text),
        }
    }

    #[tokio::test]
    async fn test_disabled_passes_through() {
        let messages = vec![user("hi")];
        let result = compress_if_needed(&messages, false, 10, 5, CompressionStrategy::SlidingWindow, None).await;
        assert!(!result.was_compressed);
        assert_eq!(result.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_under_threshold_passes_through() {
        let messages = vec![user("hi")];
        let result = compress_if_needed(&messages, true, 100_000, 5, CompressionStrategy::SlidingWindow, None).await;
        assert!(!result.was_compressed);
    }

    #[tokio::test]
    async fn test_sliding_window_keeps_tail_ending_in_user() {
        let messages = vec![
            system("S"),
            user("U1"),
            assistant("A1"),
            user("U2"),
            assistant("A2"),
            user("U3"),
        ];
        let result = compress_if_needed(&messages, true, 1, 1000, CompressionStrategy::SlidingWindow, None).await;
        assert!(result.was_compressed);
        assert_eq!(result.messages.last().unwrap().role, "user");
        assert_eq!(result.messages[0].role, "system");
    }

    #[test]
    fn test_sliding_window_no_user_message_returns_unchanged() {
        let messages = vec![system("S"), assistant("A1")];
        let out = sliding_window_compress(&messages, 1000);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_clean_sequence_enforces_alternation() {
        let messages = vec![user("U1"), user("U2"), assistant("A1")];
        let cleaned = clean_message_sequence(messages);
        for pair in cleaned.windows(2) {
            assert_ne!(pair[0].role, pair[1].role);
        }
    }

    #[test]
    fn test_clean_sequence_ends_on_user() {
        let messages = vec![user("U1"), assistant("A1")];
        let cleaned = clean_message_sequence(messages);
        assert_eq!(cleaned.last().unwrap().role, "user");
    }

    #[test]
    fn test_apply_cache_markers_promotes_string_to_block_list() {
        let mut messages = vec![user("hello")];
        let mut system_val: Option<Value> = Some(json!("sys prompt"));
        apply_cache_markers(&mut messages, &mut system_val);

        let sys = system_val.unwrap();
        assert!(sys.is_array());
        assert_eq!(sys[0]["cache_control"]["type"], "ephemeral");

        assert!(messages[0].content.is_array());
        assert_eq!(messages[0].content[0]["cache_control"]["type"], "ephemeral");
    }

    #[test]
    fn test_apply_cache_markers_marks_last_two_user_messages() {
        let mut messages = vec![user("u1"), assistant("a1"), user("u2")];
        let mut system_val: Option<Value> = None;
        apply_cache_markers(&mut messages, &mut system_val);

        assert_eq!(messages[0].content[0]["cache_control"]["type"], "ephemeral");
        assert_eq!(messages[2].content[0]["cache_control"]["type"], "ephemeral");
        assert!(messages[1].content.get("cache_control").is_none());
    }
}
