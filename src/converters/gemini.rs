// Gemini generateContent/streamGenerateContent converter.
//
// The relay and its adapters only ever speak the neutral
// Anthropic-messages shape, so both directions here go through it:
// Gemini request -> neutral Anthropic request, and Anthropic response/SSE
// -> Gemini response/SSE on the way back out.

use serde_json::{json, Value};

use crate::models::anthropic::AnthropicMessagesRequest;
use crate::models::gemini::{GeminiContent, GeminiPart, GeminiRequest};

fn gemini_parts_to_text(parts: &[GeminiPart]) -> String {
    parts.iter().filter_map(|p| p.text.clone()).collect::<Vec<_>>().join("")
}

fn gemini_role_to_anthropic(role: Option<&str>) -> String {
    match role {
        Some("model") => "assistant".to_string(),
        _ => "user".to_string(),
    }
}

/// Converts an incoming Gemini request into the neutral Anthropic-shaped
/// request the relay operates on. `model` is the path-resolved model id
/// (Gemini carries it in the URL, not the body).
pub fn gemini_to_anthropic_request(request: &GeminiRequest, model: &str) -> AnthropicMessagesRequest {
    let messages = request
        .contents
        .iter()
        .map(|c| crate::models::anthropic::AnthropicMessage {
            role: gemini_role_to_anthropic(c.role.as_deref()),
            content: Value::String(gemini_parts_to_text(&c.parts)),
        })
        .collect();

    let system = request
        .system_instruction
        .as_ref()
        .map(|c| Value::String(gemini_parts_to_text(&c.parts)))
        .filter(|v| v.as_str().is_some_and(|s| !s.is_empty()));

    let tools = request.tools.as_ref().map(|tools| {
        tools
            .iter()
            .flat_map(|t| &t.function_declarations)
            .map(|f| crate::models::anthropic::AnthropicTool {
                name: f.name.clone(),
                description: f.description.clone(),
                input_schema: f.parameters.clone().unwrap_or_else(|| json!({"type": "object"})),
            })
            .collect::<Vec<_>>()
    });

    let gen = request.generation_config.clone().unwrap_or_default();

    AnthropicMessagesRequest {
        model: model.to_string(),
        messages,
        max_tokens: gen.max_output_tokens.unwrap_or(4096),
        system,
        stream: false,
        tools,
        tool_choice: None,
        temperature: gen.temperature,
        top_p: gen.top_p,
        top_k: gen.top_k,
        stop_sequences: gen.stop_sequences,
        metadata: None,
    }
}

fn finish_reason_to_gemini(stop_reason: Option<&str>) -> &'static str {
    match stop_reason {
        Some("max_tokens") => "MAX_TOKENS",
        Some("tool_use") => "STOP",
        _ => "STOP",
    }
}

/// Converts a fully-collected Anthropic messages response into a Gemini
/// `GenerateContentResponse` JSON body.
pub fn anthropic_response_to_gemini(anthropic: &Value) -> Value {
    let text = anthropic
        .get("content")
        .and_then(|c| c.as_array())
        .map(|blocks| {
            blocks
                .iter()
                .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    let stop_reason = anthropic.get("stop_reason").and_then(|v| v.as_str());
    let usage = anthropic.get("usage");
    let input_tokens = usage.and_then(|u| u.get("input_tokens")).and_then(|v| v.as_i64()).unwrap_or(0);
    let output_tokens = usage.and_then(|u| u.get("output_tokens")).and_then(|v| v.as_i64()).unwrap_or(0);

    json!({
        "candidates": [{
            "content": { "role": "model", "parts": [{ "text": text }] },
            "finishReason": finish_reason_to_gemini(stop_reason),
            "index": 0,
        }],
        "usageMetadata": {
            "promptTokenCount": input_tokens,
            "candidatesTokenCount": output_tokens,
            "totalTokenCount": input_tokens + output_tokens,
        }
    })
}

/// Reframes one Anthropic SSE chunk (as produced by the Kiro adapter) into
/// zero or more Gemini `streamGenerateContent` SSE chunks. Anthropic frames
/// carry an `event:`/`data:` pair per line; only `content_block_delta` text
/// deltas and the closing `message_delta` usage carry anything Gemini needs,
/// so anything else maps to an empty output (dropped, not buffered).
pub fn anthropic_sse_chunk_to_gemini(chunk: &str) -> Vec<String> {
    let mut out = Vec::new();
    for line in chunk.lines() {
        let Some(payload) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) else {
            continue;
        };
        let Ok(event) = serde_json::from_str::<Value>(payload.trim()) else {
            continue;
        };
        let event_type = event.get("type").and_then(|v| v.as_str()).unwrap_or("");

        match event_type {
            "content_block_delta" => {
                if let Some(text) = event
                    .get("delta")
                    .filter(|d| d.get("type").and_then(|t| t.as_str()) == Some("text_delta"))
                    .and_then(|d| d.get("text"))
                    .and_then(|t| t.as_str())
                {
                    let gemini_chunk = json!({
                        "candidates": [{
                            "content": { "role": "model", "parts": [{ "text": text }] },
                            "index": 0,
                        }]
                    });
                    out.push(format!("data: {}\n\n", gemini_chunk));
                }
            }
            "message_delta" => {
                let stop_reason = event.get("delta").and_then(|d| d.get("stop_reason")).and_then(|v| v.as_str());
                let usage = event.get("usage");
                let output_tokens = usage.and_then(|u| u.get("output_tokens")).and_then(|v| v.as_i64()).unwrap_or(0);
                let gemini_chunk = json!({
                    "candidates": [{
                        "content": { "role": "model", "parts": [] },
                        "finishReason": finish_reason_to_gemini(stop_reason),
                        "index": 0,
                    }],
                    "usageMetadata": {
                        "candidatesTokenCount": output_tokens,
                    }
                });
                out.push(format!("data: {}\n\n", gemini_chunk));
            }
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::gemini::GeminiGenerationConfig;

    #[test]
    fn test_gemini_request_converts_to_anthropic() {
        let request = GeminiRequest {
            contents: vec![GeminiContent {
                role: Some("user".to_string()),
                parts: vec![GeminiPart { text: Some("hi".to_string()), function_call: None, function_response: None }],
            }],
            system_instruction: None,
            generation_config: Some(GeminiGenerationConfig {
                max_output_tokens: Some(128),
                ..Default::default()
            }),
            tools: None,
        };

        let anthropic = gemini_to_anthropic_request(&request, "gemini-1.5-pro");
        assert_eq!(anthropic.max_tokens, 128);
        assert_eq!(anthropic.messages[0].role, "user");
        assert_eq!(anthropic.messages[0].content, Value::String("hi".to_string()));
    }

    #[test]
    fn test_anthropic_response_to_gemini_extracts_text_and_usage() {
        let anthropic = json!({
            "content": [{"type": "text", "text": "hello there"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 10, "output_tokens": 3}
        });
        let gemini = anthropic_response_to_gemini(&anthropic);
        assert_eq!(gemini["candidates"][0]["content"]["parts"][0]["text"], "hello there");
        assert_eq!(gemini["usageMetadata"]["totalTokenCount"], 13);
    }

    #[test]
    fn test_sse_chunk_reframe_passes_text_delta() {
        let chunk = "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"hi\"}}\n\n";
        let out = anthropic_sse_chunk_to_gemini(chunk);
        assert_eq!(out.len(), 1);
        assert!(out[0].contains("\"text\":\"hi\""));
    }
}
