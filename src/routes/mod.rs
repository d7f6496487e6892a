use axum::{
    body::Body,
    extract::{Extension, Path, State},
    http::HeaderMap,
    middleware::{self as axum_middleware},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use chrono::Utc;
use futures::stream::{BoxStream, StreamExt};
use serde_json::{json, Value};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use uuid::Uuid;

use crate::auth_gate::AuthContext;
use crate::converters::{gemini as gemini_conv, openai_anthropic};
use crate::error::ApiError;
use crate::metrics::collector::StreamingMetricsTracker;
use crate::middleware;
use crate::models::anthropic::AnthropicMessagesRequest;
use crate::models::gemini::GeminiRequest;
use crate::models::openai::{
    ChatCompletionRequest, ModelList, OpenAIModel, ResponsesRequest, ResponsesResponse,
};
use crate::relay::{OutputFormat, RelayRequest};
use crate::services::Services;
use crate::tokenizer::{count_anthropic_message_tokens, CLAUDE_TOOL_OVERHEAD};

/// Application version from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub services: Arc<Services>,
}

/// Health check routes (no authentication required)
pub fn health_routes() -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
}

/// OpenAI API routes (require authentication)
pub fn openai_routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/models", get(get_models_handler))
        .route("/v1/chat/completions", post(chat_completions_handler))
        .route("/v1/responses", post(responses_handler))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ))
        .with_state(state)
}

/// Anthropic API routes (require authentication)
pub fn anthropic_routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(anthropic_messages_handler))
        .route("/v1/messages/count_tokens", post(count_tokens_handler))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ))
        .with_state(state)
}

/// Gemini API routes (require authentication). Gemini's REST surface
/// encodes both the model and the action (`generateContent` vs.
/// `streamGenerateContent`) in the path, e.g.
/// `/v1beta/models/gemini-1.5-pro:streamGenerateContent`.
pub fn gemini_routes(state: AppState) -> Router {
    Router::new()
        .route("/v1beta/models/*model_action", post(gemini_handler))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ))
        .with_state(state)
}

/// GET / - Simple health check
///
/// Returns basic status and version information.
/// This endpoint does not require authentication (for load balancers).
async fn root_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "Kiro Gateway is running",
        "version": VERSION
    }))
}

/// GET /health - Detailed health check
///
/// Returns detailed health information including timestamp.
/// This endpoint does not require authentication (for load balancers).
async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "version": VERSION
    }))
}

/// GET /v1/models - List available models
///
/// Returns a list of available models in OpenAI format.
/// Models are loaded from the cache (populated at startup).
async fn get_models_handler(State(state): State<AppState>) -> Result<Json<ModelList>, ApiError> {
    tracing::info!("Request to /v1/models");

    let model_ids = state.services.model_cache.get_all_model_ids();

    let models: Vec<OpenAIModel> = model_ids
        .into_iter()
        .map(|id| {
            let mut model = OpenAIModel::new(id);
            model.description = Some("Claude model via Kiro API".to_string());
            model
        })
        .collect();

    Ok(Json(ModelList::new(models)))
}

/// Drains a provider-adapter byte stream into one buffer. Used for every
/// non-streaming request, since adapters always return a stream (a
/// single-chunk one when the upstream call itself wasn't streamed).
async fn drain_stream(mut stream: BoxStream<'static, Result<Bytes, ApiError>>) -> Result<Vec<u8>, ApiError> {
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf)
}

/// Wraps a relay byte stream into a raw `text/event-stream` response. The
/// chunks already carry fully-formed SSE frames; axum's `Sse` wrapper isn't
/// used here as it would double-encode them.
fn sse_response(stream: BoxStream<'static, Result<Bytes, ApiError>>) -> Result<Response, ApiError> {
    let body_stream = stream.map(|r| r.map_err(|e| std::io::Error::other(e.to_string())));
    Response::builder()
        .status(200)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .body(Body::from_stream(body_stream))
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("Failed to build response: {}", e)))
}

async fn run_relay(
    state: &AppState,
    request: RelayRequest,
    cross_group_retry: bool,
) -> Result<BoxStream<'static, Result<Bytes, ApiError>>, ApiError> {
    let providers = state.services.providers();
    state
        .services
        .relay
        .run(request, &providers, &state.services.adapters, cross_group_retry, None)
        .await
}

/// Scans one SSE chunk for a trailing usage object (OpenAI's
/// `usage.completion_tokens`, Anthropic's `message.usage.output_tokens`) so
/// streaming requests can report an approximate output token count to the
/// dashboard without buffering the whole response.
fn scan_output_tokens(chunk: &Bytes) -> Option<u64> {
    let text = std::str::from_utf8(chunk).ok()?;
    let mut found = None;
    for line in text.lines() {
        let Some(payload) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<Value>(payload.trim()) else {
            continue;
        };
        let usage = value.get("usage").or_else(|| value.get("message").and_then(|m| m.get("usage")));
        if let Some(usage) = usage {
            let tokens = usage
                .get("completion_tokens")
                .or_else(|| usage.get("output_tokens"))
                .and_then(|v| v.as_u64());
            if let Some(n) = tokens {
                found = Some(n);
            }
        }
    }
    found
}

/// Byte stream wrapper that scans each passing chunk for a usage object and
/// keeps `StreamingMetricsTracker`'s output-token count current, so the
/// dashboard sees a number by the time the stream ends instead of zero.
struct TokenScanningStream {
    inner: BoxStream<'static, Result<Bytes, ApiError>>,
    output_tokens: Arc<AtomicU64>,
    _tracker: Arc<StreamingMetricsTracker>,
}

impl futures::Stream for TokenScanningStream {
    type Item = Result<Bytes, ApiError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(tokens) = scan_output_tokens(&chunk) {
                    self.output_tokens.store(tokens, Ordering::Relaxed);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            other => other,
        }
    }
}

/// POST /v1/chat/completions - Create chat completion
///
/// Converts the OpenAI request into the neutral Anthropic-shaped body the
/// relay operates on, runs it through the distributor/relay/adapter stack,
/// and converts the result back into OpenAI framing.
async fn chat_completions_handler(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response, ApiError> {
    tracing::info!(
        "Request to /v1/chat/completions: model={}, stream={}, messages={}",
        request.model,
        request.stream,
        request.messages.len()
    );

    if request.messages.is_empty() {
        let err = ApiError::ValidationError("messages cannot be empty".to_string());
        state.services.metrics.record_error(err.kind());
        return Err(err);
    }

    let resolution = state.services.resolver.resolve(&request.model);
    let model_id = resolution.internal_id.clone();

    if !ctx.token.allows_model(Some(&model_id)) {
        let err = ApiError::AuthError("Token not allowed to use this model".to_string());
        state.services.metrics.record_error(err.kind());
        return Err(err);
    }

    tracing::debug!(
        "Model resolution: {} -> {} (source: {}, verified: {})",
        request.model,
        model_id,
        resolution.source,
        resolution.is_verified
    );

    let anthropic_request = openai_anthropic::openai_to_anthropic_request(&request);
    let input_tokens = count_anthropic_message_tokens(
        &anthropic_request.messages,
        anthropic_request.system.as_ref(),
        anthropic_request.tools.as_ref(),
    );
    let tracker = StreamingMetricsTracker::new(state.services.metrics.clone(), &model_id, input_tokens);

    let body = serde_json::to_value(&anthropic_request).map_err(|e| ApiError::Internal(e.into()))?;
    let relay_request = RelayRequest {
        user_id: ctx.user.id.clone(),
        model: model_id,
        messages: Some(anthropic_request.messages.clone()),
        system: anthropic_request.system.clone(),
        body,
        target_format: OutputFormat::OpenAi,
        stream: request.stream,
    };

    let byte_stream = run_relay(&state, relay_request, ctx.token.cross_group_retry)
        .await
        .inspect_err(|e| state.services.metrics.record_error(e.kind()))?;

    if request.stream {
        let output_tokens = tracker.output_tokens_handle();
        let tracked = TokenScanningStream { inner: byte_stream, output_tokens, _tracker: tracker };
        sse_response(Box::pin(tracked))
    } else {
        let bytes = drain_stream(byte_stream).await?;
        let value: Value = serde_json::from_slice(&bytes).map_err(|e| ApiError::Internal(e.into()))?;
        let output_tokens = value
            .get("usage")
            .and_then(|u| u.get("completion_tokens"))
            .and_then(|t| t.as_u64())
            .unwrap_or(0);
        tracker.output_tokens_handle().store(output_tokens, Ordering::Relaxed);
        Ok(Json(value).into_response())
    }
}

/// POST /v1/messages - Create Anthropic message
///
/// The request is already Anthropic-shaped, so it becomes the relay body
/// directly (after model resolution); the response comes back in the same
/// shape the caller sent.
async fn anthropic_messages_handler(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    headers: HeaderMap,
    Json(request): Json<AnthropicMessagesRequest>,
) -> Result<Response, ApiError> {
    tracing::info!(
        "Request to /v1/messages: model={}, stream={}, messages={}",
        request.model,
        request.stream,
        request.messages.len()
    );

    if let Some(version) = headers.get("anthropic-version").and_then(|v| v.to_str().ok()) {
        tracing::debug!("anthropic-version: {}", version);
    }

    if request.messages.is_empty() {
        let err = ApiError::ValidationError("messages cannot be empty".to_string());
        state.services.metrics.record_error(err.kind());
        return Err(err);
    }

    if request.max_tokens <= 0 {
        let err = ApiError::ValidationError("max_tokens must be positive".to_string());
        state.services.metrics.record_error(err.kind());
        return Err(err);
    }

    let resolution = state.services.resolver.resolve(&request.model);
    let model_id = resolution.internal_id.clone();

    if !ctx.token.allows_model(Some(&model_id)) {
        let err = ApiError::AuthError("Token not allowed to use this model".to_string());
        state.services.metrics.record_error(err.kind());
        return Err(err);
    }

    tracing::debug!(
        "Model resolution: {} -> {} (source: {}, verified: {})",
        request.model,
        model_id,
        resolution.source,
        resolution.is_verified
    );

    let input_tokens =
        count_anthropic_message_tokens(&request.messages, request.system.as_ref(), request.tools.as_ref());
    let tracker = StreamingMetricsTracker::new(state.services.metrics.clone(), &model_id, input_tokens);

    let body = serde_json::to_value(&request).map_err(|e| ApiError::Internal(e.into()))?;
    let relay_request = RelayRequest {
        user_id: ctx.user.id.clone(),
        model: model_id,
        messages: Some(request.messages.clone()),
        system: request.system.clone(),
        body,
        target_format: OutputFormat::Anthropic,
        stream: request.stream,
    };

    let byte_stream = run_relay(&state, relay_request, ctx.token.cross_group_retry)
        .await
        .inspect_err(|e| state.services.metrics.record_error(e.kind()))?;

    if request.stream {
        let output_tokens = tracker.output_tokens_handle();
        let tracked = TokenScanningStream { inner: byte_stream, output_tokens, _tracker: tracker };
        sse_response(Box::pin(tracked))
    } else {
        let bytes = drain_stream(byte_stream).await?;
        let value: Value = serde_json::from_slice(&bytes).map_err(|e| ApiError::Internal(e.into()))?;
        let output_tokens = value
            .get("usage")
            .and_then(|u| u.get("output_tokens"))
            .and_then(|t| t.as_u64())
            .unwrap_or(0);
        tracker.output_tokens_handle().store(output_tokens, Ordering::Relaxed);
        Ok(Json(value).into_response())
    }
}

fn extract_anthropic_text(anthropic: &Value) -> String {
    anthropic
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
        .unwrap_or_default()
}

/// POST /v1/responses - Create a response (OpenAI's newer Responses API)
///
/// Folds the free-text/`instructions` shape into a one- or two-message
/// chat-completions request and routes it through the same relay path as
/// `/v1/chat/completions`; streaming isn't supported on this endpoint yet,
/// so the relay always runs non-streaming here.
async fn responses_handler(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(request): Json<ResponsesRequest>,
) -> Result<Response, ApiError> {
    tracing::info!("Request to /v1/responses: model={}", request.model);

    let resolution = state.services.resolver.resolve(&request.model);
    let model_id = resolution.internal_id.clone();

    if !ctx.token.allows_model(Some(&model_id)) {
        let err = ApiError::AuthError("Token not allowed to use this model".to_string());
        state.services.metrics.record_error(err.kind());
        return Err(err);
    }

    let input_text = match &request.input {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    let mut messages = Vec::new();
    if let Some(instructions) = &request.instructions {
        messages.push(crate::models::openai::ChatMessage {
            role: "system".to_string(),
            content: Some(Value::String(instructions.clone())),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        });
    }
    messages.push(crate::models::openai::ChatMessage {
        role: "user".to_string(),
        content: Some(Value::String(input_text)),
        name: None,
        tool_calls: None,
        tool_call_id: None,
    });

    let chat_request = ChatCompletionRequest {
        model: request.model.clone(),
        messages,
        stream: false,
        temperature: request.temperature,
        top_p: None,
        n: None,
        max_tokens: request.max_output_tokens,
        max_completion_tokens: None,
        stop: None,
        presence_penalty: None,
        frequency_penalty: None,
        tools: None,
        tool_choice: None,
        stream_options: None,
        logit_bias: None,
        logprobs: None,
        top_logprobs: None,
        user: None,
        seed: None,
        parallel_tool_calls: None,
    };

    let anthropic_request = openai_anthropic::openai_to_anthropic_request(&chat_request);
    let body = serde_json::to_value(&anthropic_request).map_err(|e| ApiError::Internal(e.into()))?;

    let relay_request = RelayRequest {
        user_id: ctx.user.id.clone(),
        model: model_id.clone(),
        messages: Some(anthropic_request.messages.clone()),
        system: anthropic_request.system.clone(),
        body,
        target_format: OutputFormat::Anthropic,
        stream: false,
    };

    let byte_stream = run_relay(&state, relay_request, ctx.token.cross_group_retry)
        .await
        .inspect_err(|e| state.services.metrics.record_error(e.kind()))?;

    let bytes = drain_stream(byte_stream).await?;
    let anthropic_response: Value = serde_json::from_slice(&bytes).map_err(|e| ApiError::Internal(e.into()))?;
    let text = extract_anthropic_text(&anthropic_response);

    let response = ResponsesResponse::new(Uuid::new_v4().to_string(), model_id, text);
    Ok(Json(response).into_response())
}

/// POST /v1beta/models/{model}:{action} - Gemini generateContent / streamGenerateContent
async fn gemini_handler(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(model_action): Path<String>,
    Json(request): Json<GeminiRequest>,
) -> Result<Response, ApiError> {
    let (raw_model, action) = model_action
        .split_once(':')
        .unwrap_or((model_action.as_str(), "generateContent"));
    let stream = action == "streamGenerateContent";

    tracing::info!("Request to /v1beta/models/{}: action={}", raw_model, action);

    let resolution = state.services.resolver.resolve(raw_model);
    let model_id = resolution.internal_id.clone();

    if !ctx.token.allows_model(Some(&model_id)) {
        let err = ApiError::AuthError("Token not allowed to use this model".to_string());
        state.services.metrics.record_error(err.kind());
        return Err(err);
    }

    let anthropic_request = gemini_conv::gemini_to_anthropic_request(&request, &model_id);
    let body = serde_json::to_value(&anthropic_request).map_err(|e| ApiError::Internal(e.into()))?;

    let relay_request = RelayRequest {
        user_id: ctx.user.id.clone(),
        model: model_id,
        messages: Some(anthropic_request.messages.clone()),
        system: anthropic_request.system.clone(),
        body,
        target_format: OutputFormat::Anthropic,
        stream,
    };

    let byte_stream = run_relay(&state, relay_request, ctx.token.cross_group_retry)
        .await
        .inspect_err(|e| state.services.metrics.record_error(e.kind()))?;

    if stream {
        let gemini_stream = byte_stream.map(|chunk_result| {
            chunk_result.map(|chunk| {
                let text = String::from_utf8_lossy(&chunk);
                let frames = gemini_conv::anthropic_sse_chunk_to_gemini(&text).concat();
                Bytes::from(frames)
            })
        });
        sse_response(Box::pin(gemini_stream))
    } else {
        let bytes = drain_stream(byte_stream).await?;
        let anthropic_response: Value = serde_json::from_slice(&bytes).map_err(|e| ApiError::Internal(e.into()))?;
        let gemini_response = gemini_conv::anthropic_response_to_gemini(&anthropic_response);
        Ok(Json(gemini_response).into_response())
    }
}

/// POST /v1/messages/count_tokens - Count tokens for Anthropic message
///
/// Calculates the number of input tokens that would be used for a message request
/// without actually sending it to the API. Follows Anthropic's token counting specification.
async fn count_tokens_handler(
    State(_state): State<AppState>,
    Json(request): Json<AnthropicMessagesRequest>,
) -> Result<Json<Value>, ApiError> {
    tracing::debug!(
        "Token count request: model={}, messages={}",
        request.model,
        request.messages.len()
    );

    let mut input_tokens = count_anthropic_message_tokens(
        &request.messages,
        request.system.as_ref(),
        request.tools.as_ref(),
    );

    // Add tool overhead for Claude models when tools are present
    // See: https://docs.anthropic.com/en/docs/agents-and-tools/tool-use/overview#pricing
    if let Some(tools) = &request.tools {
        if !tools.is_empty() && request.model.starts_with("claude") {
            input_tokens += CLAUDE_TOOL_OVERHEAD;
            tracing::debug!("Added Claude tool overhead: +{} tokens", CLAUDE_TOOL_OVERHEAD);
        }
    }

    // Apply Claude correction factor (1.15x) for Claude models
    if request.model.starts_with("claude") {
        input_tokens = ((input_tokens as f64) * 1.15).round() as i32;
        tracing::debug!("Applied Claude correction factor (1.15x)");
    }

    tracing::debug!("Final token count: {}", input_tokens);

    Ok(Json(json!({
        "input_tokens": input_tokens
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth_gate::{generate_token, hash_token};
    use crate::store::{ClientToken, MemoryStore, TokenStatus, User};
    use axum::http::{Request, StatusCode};
    use tower::util::ServiceExt;

    fn create_test_state() -> AppState {
        let state = AppState { services: Services::new_for_testing() };
        state.services.model_cache.update(vec![
            serde_json::json!({
                "modelId": "claude-sonnet-4.5",
                "modelName": "Claude Sonnet 4.5"
            }),
            serde_json::json!({
                "modelId": "claude-haiku-4",
                "modelName": "Claude Haiku 4"
            }),
        ]);
        state
    }

    /// Seeds a usable client token/user pair over a fresh in-memory store and
    /// returns the wired-up state plus the plaintext key to authenticate with.
    fn state_with_token() -> (AppState, String) {
        let store = Arc::new(MemoryStore::new());
        let (plaintext, hash) = generate_token().unwrap();
        store.insert_token(ClientToken {
            id: "t1".to_string(),
            user_id: "u1".to_string(),
            status: TokenStatus::Active,
            key_hash: hash,
            total_input_tokens: 0,
            total_output_tokens: 0,
            cross_group_retry: false,
            expires_at: None,
            ip_allowlist: None,
            model_allowlist: None,
        });
        store.insert_user(User {
            id: "u1".to_string(),
            name: "alice".to_string(),
            remaining_quota: None,
            total_input_tokens: 0,
            total_output_tokens: 0,
        });
        let services = Services::new_for_testing_with_store(store);
        let state = AppState { services };
        state.services.model_cache.update(vec![serde_json::json!({
            "modelId": "claude-sonnet-4",
            "modelName": "Claude Sonnet 4"
        })]);
        (state, plaintext)
    }

    fn authed_app(state: AppState, route: &str, handler: axum::routing::MethodRouter<AppState>) -> Router {
        Router::new()
            .route(route, handler)
            .layer(axum_middleware::from_fn_with_state(state.clone(), middleware::auth_middleware))
            .with_state(state)
    }

    #[tokio::test]
    async fn test_root_handler() {
        let json = root_handler().await;
        let value = json.0;

        assert_eq!(value["status"], "ok");
        assert_eq!(value["message"], "Kiro Gateway is running");
        assert_eq!(value["version"], VERSION);
    }

    #[tokio::test]
    async fn test_health_handler() {
        let json = health_handler().await;
        let value = json.0;

        assert_eq!(value["status"], "healthy");
        assert!(value["timestamp"].is_string());
        assert_eq!(value["version"], VERSION);
    }

    #[tokio::test]
    async fn test_get_models_handler() {
        let state = create_test_state();

        let result = get_models_handler(State(state)).await;
        assert!(result.is_ok());

        let model_list = result.unwrap().0;
        assert_eq!(model_list.object, "list");
        assert_eq!(model_list.data.len(), 2);

        let model_ids: Vec<String> = model_list.data.iter().map(|m| m.id.clone()).collect();
        assert!(model_ids.contains(&"claude-sonnet-4.5".to_string()));
        assert!(model_ids.contains(&"claude-haiku-4".to_string()));

        for model in &model_list.data {
            assert_eq!(model.object, "model");
            assert_eq!(model.owned_by, "anthropic");
            assert!(model.description.is_some());
        }
    }

    #[tokio::test]
    async fn test_count_tokens_basic() {
        let state = create_test_state();

        let request = AnthropicMessagesRequest {
            model: "claude-sonnet-4".to_string(),
            messages: vec![crate::models::anthropic::AnthropicMessage {
                role: "user".to_string(),
                content: serde_json::json!("Hello, how are you?"),
            }],
            max_tokens: 100,
            system: None,
            stream: false,
            tools: None,
            tool_choice: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
            metadata: None,
        };

        let result = count_tokens_handler(State(state), Json(request)).await;
        assert!(result.is_ok());

        let response = result.unwrap().0;
        let input_tokens = response["input_tokens"].as_i64().unwrap();

        assert!(input_tokens > 0);
        assert!(input_tokens < 100);
    }

    #[tokio::test]
    async fn test_count_tokens_with_tools() {
        let state = create_test_state();

        let request = AnthropicMessagesRequest {
            model: "claude-sonnet-4".to_string(),
            messages: vec![crate::models::anthropic::AnthropicMessage {
                role: "user".to_string(),
                content: serde_json::json!("What's the weather?"),
            }],
            max_tokens: 100,
            system: None,
            stream: false,
            tools: Some(vec![crate::models::anthropic::AnthropicTool {
                name: "get_weather".to_string(),
                description: Some("Get the current weather".to_string()),
                input_schema: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "location": {"type": "string"}
                    }
                }),
            }]),
            tool_choice: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
            metadata: None,
        };

        let result = count_tokens_handler(State(state), Json(request)).await;
        assert!(result.is_ok());

        let response = result.unwrap().0;
        let input_tokens = response["input_tokens"].as_i64().unwrap();

        assert!(input_tokens > 346);
    }

    #[tokio::test]
    async fn test_count_tokens_non_claude_model() {
        let state = create_test_state();

        let request = AnthropicMessagesRequest {
            model: "gpt-4".to_string(),
            messages: vec![crate::models::anthropic::AnthropicMessage {
                role: "user".to_string(),
                content: serde_json::json!("Hello"),
            }],
            max_tokens: 100,
            system: None,
            stream: false,
            tools: Some(vec![crate::models::anthropic::AnthropicTool {
                name: "test_tool".to_string(),
                description: Some("Test tool".to_string()),
                input_schema: serde_json::json!({"type": "object"}),
            }]),
            tool_choice: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
            metadata: None,
        };

        let result = count_tokens_handler(State(state), Json(request)).await;
        assert!(result.is_ok());

        let response = result.unwrap().0;
        let input_tokens = response["input_tokens"].as_i64().unwrap();

        assert!(input_tokens > 0);
        assert!(input_tokens < 100);
    }

    #[tokio::test]
    async fn test_hash_token_is_deterministic() {
        let (plaintext, hash) = generate_token().unwrap();
        assert_eq!(hash_token(&plaintext), hash);
    }

    #[tokio::test]
    async fn test_anthropic_messages_handler_rejects_empty_messages() {
        let (state, token) = state_with_token();
        let app = authed_app(state, "/v1/messages", post(anthropic_messages_handler));

        let body = serde_json::json!({
            "model": "claude-sonnet-4",
            "messages": [],
            "max_tokens": 100
        });

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/messages")
                    .header("authorization", format!("Bearer {}", token))
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_anthropic_messages_handler_rejects_disallowed_model() {
        let store = Arc::new(MemoryStore::new());
        let (plaintext, hash) = generate_token().unwrap();
        store.insert_token(ClientToken {
            id: "t1".to_string(),
            user_id: "u1".to_string(),
            status: TokenStatus::Active,
            key_hash: hash,
            total_input_tokens: 0,
            total_output_tokens: 0,
            cross_group_retry: false,
            expires_at: None,
            ip_allowlist: None,
            model_allowlist: Some(vec!["claude-haiku-4".to_string()]),
        });
        store.insert_user(User {
            id: "u1".to_string(),
            name: "alice".to_string(),
            remaining_quota: None,
            total_input_tokens: 0,
            total_output_tokens: 0,
        });
        let services = Services::new_for_testing_with_store(store);
        let state = AppState { services };
        state.services.model_cache.update(vec![serde_json::json!({
            "modelId": "claude-sonnet-4",
            "modelName": "Claude Sonnet 4"
        })]);

        let app = authed_app(state, "/v1/messages", post(anthropic_messages_handler));

        let body = serde_json::json!({
            "model": "claude-sonnet-4",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 100
        });

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/messages")
                    .header("authorization", format!("Bearer {}", plaintext))
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_chat_completions_handler_rejects_unauthenticated() {
        let (state, _token) = state_with_token();
        let app = authed_app(state, "/v1/chat/completions", post(chat_completions_handler));

        let body = serde_json::json!({
            "model": "claude-sonnet-4",
            "messages": [{"role": "user", "content": "hi"}]
        });

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/chat/completions")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
