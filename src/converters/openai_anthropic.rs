// OpenAI to Anthropic direct converter
//
// Builds the neutral, Anthropic-messages-shaped body the relay passes to
// provider adapters out of an incoming OpenAI chat-completions request.
// Reuses the same unified-message pipeline openai_to_kiro.rs uses, rather
// than re-deriving system-prompt/tool-call extraction.

use serde_json::{json, Value};

use crate::models::anthropic::{AnthropicMessage, AnthropicMessagesRequest, AnthropicTool};
use crate::models::openai::ChatCompletionRequest;

use super::core::{MessageContent, UnifiedMessage, UnifiedTool};
use super::openai_to_kiro::{convert_openai_messages_to_unified, convert_openai_tools_to_unified};

fn unified_tool_to_anthropic(tool: &UnifiedTool) -> AnthropicTool {
    AnthropicTool {
        name: tool.name.clone(),
        description: tool.description.clone(),
        input_schema: tool.input_schema.clone().unwrap_or_else(|| json!({"type": "object"})),
    }
}

fn unified_message_to_anthropic(msg: UnifiedMessage) -> AnthropicMessage {
    if let Some(tool_results) = &msg.tool_results {
        let blocks: Vec<Value> = tool_results
            .iter()
            .map(|r| {
                json!({
                    "type": "tool_result",
                    "tool_use_id": r.tool_use_id,
                    "content": r.content,
                })
            })
            .collect();
        return AnthropicMessage {
            role: "user".to_string(),
            content: Value::Array(blocks),
        };
    }

    if let Some(tool_calls) = &msg.tool_calls {
        let mut blocks = Vec::new();
        if let MessageContent::Text(text) = &msg.content {
            if !text.is_empty() {
                blocks.push(json!({"type": "text", "text": text}));
            }
        }
        for call in tool_calls {
            let input: Value = serde_json::from_str(&call.function.arguments).unwrap_or(json!({}));
            blocks.push(json!({
                "type": "tool_use",
                "id": call.id,
                "name": call.function.name,
                "input": input,
            }));
        }
        return AnthropicMessage {
            role: msg.role,
            content: Value::Array(blocks),
        };
    }

    let content = match msg.content {
        MessageContent::Text(text) => Value::String(text),
        MessageContent::Blocks(blocks) => {
            serde_json::to_value(blocks).unwrap_or_else(|_| Value::Array(Vec::new()))
        }
    };

    AnthropicMessage { role: msg.role, content }
}

/// Converts an OpenAI chat-completions request into the neutral
/// Anthropic-messages-shaped request the relay and its adapters operate on.
pub fn openai_to_anthropic_request(request: &ChatCompletionRequest) -> AnthropicMessagesRequest {
    let (system_prompt, unified_messages) = convert_openai_messages_to_unified(&request.messages);
    let unified_tools = convert_openai_tools_to_unified(&request.tools);

    let messages = unified_messages.into_iter().map(unified_message_to_anthropic).collect();
    let tools = unified_tools.map(|tools| tools.iter().map(unified_tool_to_anthropic).collect());

    let tool_choice = request.tool_choice.clone();
    let max_tokens = request
        .max_tokens
        .or(request.max_completion_tokens)
        .unwrap_or(4096);

    let stop_sequences = match &request.stop {
        Some(Value::String(s)) => Some(vec![s.clone()]),
        Some(Value::Array(arr)) => Some(arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()),
        _ => None,
    };

    AnthropicMessagesRequest {
        model: request.model.clone(),
        messages,
        max_tokens,
        system: if system_prompt.is_empty() { None } else { Some(Value::String(system_prompt)) },
        stream: request.stream,
        tools,
        tool_choice,
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: None,
        stop_sequences,
        metadata: None,
    }
}
