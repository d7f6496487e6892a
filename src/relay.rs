// Relay orchestrator (§4.7): given an authorized request and a selected
// provider, drives up to 3 attempts against a provider adapter, running the
// context compressor first and the accounting/health-record step last.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::Stream;

use crate::compressor::{self, Summarizer};
use crate::distributor::{Distributor, ProviderInfo};
use crate::error::ApiError;
use crate::models::anthropic::AnthropicMessage;
use crate::risk_control::RiskControl;
use crate::store::{CacheConfig, LogRow, Store};

const MAX_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Wire shape the caller wants the response translated to. Every adapter
/// accepts a neutral Anthropic-messages-shaped `body` regardless of this
/// value; it only governs how the adapter frames its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    OpenAi,
    Anthropic,
}

/// Uniform per-backend contract (§4.5). Implementations own rate-limiting,
/// fingerprinting, and proxy acquisition internally; the orchestrator only
/// ever calls `chat`. `body` is always Anthropic-messages-shaped neutral
/// JSON; `credential_payload` carries whatever per-backend secrets/config
/// (access token, region, profile arn, ...) the credential row holds.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn chat(
        &self,
        credential_payload: &serde_json::Value,
        model: &str,
        body: serde_json::Value,
        credential_id: &str,
        user_id: &str,
        target_format: OutputFormat,
        stream: bool,
    ) -> Result<BoxStream<'static, Result<Bytes, ApiError>>, ApiError>;
}

pub type AdapterRegistry = HashMap<String, Arc<dyn ProviderAdapter>>;

pub struct RelayRequest {
    pub user_id: String,
    pub model: String,
    pub messages: Option<Vec<AnthropicMessage>>,
    pub system: Option<serde_json::Value>,
    /// The upstream-bound payload; `messages`/`system` are spliced back in
    /// after compression and cache-marking, if present.
    pub body: serde_json::Value,
    pub target_format: OutputFormat,
    pub stream: bool,
}

#[derive(Default)]
struct UsageTotals {
    input_tokens: AtomicI64,
    output_tokens: AtomicI64,
    cache_read_tokens: AtomicI64,
    cache_create_tokens: AtomicI64,
}

pub struct Relay {
    store: Arc<dyn Store>,
    risk: Arc<RiskControl>,
    distributor: Arc<Distributor>,
}

impl Relay {
    pub fn new(store: Arc<dyn Store>, risk: Arc<RiskControl>, distributor: Arc<Distributor>) -> Self {
        Self { store, risk, distributor }
    }

    /// Run the full relay for one client request, returning a byte stream
    /// suitable for handing straight to the HTTP response body. Accounting
    /// (log row + credential/user token totals) happens when the returned
    /// stream is fully drained or dropped.
    pub async fn run(
        &self,
        mut request: RelayRequest,
        providers: &[ProviderInfo],
        adapters: &AdapterRegistry,
        cross_group_retry: bool,
        summarizer: Option<&dyn Summarizer>,
    ) -> Result<BoxStream<'static, Result<Bytes, ApiError>>, ApiError> {
        let primary = self.distributor.select(&request.model, providers)?.clone();

        let cache_config = self.store.get_cache_config().await.map_err(ApiError::Internal)?;
        let (compressed, was_compressed, original_tokens, compressed_tokens) =
            self.compress_request(&mut request, &cache_config, summarizer).await?;

        let mut candidate_names = vec![primary.name.clone()];
        if cross_group_retry {
            for p in providers {
                if p.enabled && p.supports_model(&request.model) && p.name != primary.name {
                    candidate_names.push(p.name.clone());
                }
            }
        }

        let mut last_error: Option<ApiError> = None;

        for attempt in 0..MAX_ATTEMPTS {
            let provider_name = candidate_names
                .get(attempt.min(candidate_names.len() as u32 - 1) as usize)
                .cloned()
                .unwrap_or_else(|| primary.name.clone());

            let credential = match self.store.get_available_credential(&provider_name).await {
                Ok(Some(c)) => c,
                Ok(None) => {
                    last_error = Some(ApiError::NoCredentialAvailable(format!(
                        "no available credential for provider {provider_name}"
                    )));
                    if attempt + 1 < MAX_ATTEMPTS {
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                    continue;
                }
                Err(e) => return Err(ApiError::Internal(e)),
            };

            let adapter = match adapters.get(&provider_name) {
                Some(a) => a.clone(),
                None => {
                    last_error = Some(ApiError::Internal(anyhow::anyhow!(
                        "no adapter registered for provider {provider_name}"
                    )));
                    continue;
                }
            };

            match adapter
                .chat(
                    &credential.payload,
                    &request.model,
                    request.body.clone(),
                    &credential.id,
                    &request.user_id,
                    request.target_format,
                    request.stream,
                )
                .await
            {
                Ok(stream) => {
                    return Ok(self.finalize(
                        stream,
                        FinalizeContext {
                            user_id: request.user_id.clone(),
                            provider_type: provider_name,
                            model: request.model.clone(),
                            credential_id: credential.id.clone(),
                            was_compressed,
                            original_tokens,
                            compressed_tokens,
                        },
                    ));
                }
                Err(e) => {
                    self.risk.health.record_request(&credential.id, false, 0.0, None);
                    last_error = Some(e);
                    if attempt + 1 < MAX_ATTEMPTS {
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }

        let _ = compressed;
        Err(last_error.unwrap_or_else(|| {
            ApiError::UpstreamError("relay exhausted all attempts".to_string())
        }))
    }

    async fn compress_request(
        &self,
        request: &mut RelayRequest,
        cache_config: &CacheConfig,
        summarizer: Option<&dyn Summarizer>,
    ) -> Result<(bool, bool, i32, i32), ApiError> {
        let Some(messages) = request.messages.take() else {
            return Ok((false, false, 0, 0));
        };

        let result = compressor::compress_if_needed(
            &messages,
            cache_config.context_compression_enabled,
            cache_config.context_compression_threshold as i32,
            cache_config.context_compression_target as i32,
            cache_config.context_compression_strategy,
            summarizer,
        )
        .await;

        let mut final_messages = result.messages;
        let mut system = request.system.clone();

        if cache_config.prompt_cache_enabled {
            compressor::apply_cache_markers(&mut final_messages, &mut system);
        }

        request.body["messages"] = serde_json::to_value(&final_messages).map_err(|e| ApiError::Internal(e.into()))?;
        if let Some(sys) = system {
            request.body["system"] = sys;
        }

        Ok((true, result.was_compressed, result.original_tokens, result.compressed_tokens))
    }

    fn finalize(
        &self,
        inner: BoxStream<'static, Result<Bytes, ApiError>>,
        ctx: FinalizeContext,
    ) -> BoxStream<'static, Result<Bytes, ApiError>> {
        let totals = Arc::new(UsageTotals::default());
        let wrote_any = Arc::new(AtomicBool::new(false));
        let started = Instant::now();

        let store = self.store.clone();
        let totals_for_finalize = totals.clone();
        let wrote_any_for_finalize = wrote_any.clone();

        let watched = WatchingStream {
            inner,
            totals: totals.clone(),
            wrote_any: wrote_any.clone(),
        };

        Box::pin(FinalizingStream {
            inner: Box::pin(watched),
            on_done: Some(Box::new(move || {
                let store = store.clone();
                let totals = totals_for_finalize.clone();
                let wrote_any = wrote_any_for_finalize.clone();
                let ctx = ctx.clone();
                let duration_ms = started.elapsed().as_millis() as u64;
                tokio::spawn(async move {
                    let status: u16 = if wrote_any.load(Ordering::Relaxed) { 200 } else { 500 };
                    let input_tokens = totals.input_tokens.load(Ordering::Relaxed).max(0) as u64;
                    let output_tokens = totals.output_tokens.load(Ordering::Relaxed).max(0) as u64;
                    let cache_read_tokens = totals.cache_read_tokens.load(Ordering::Relaxed).max(0) as u64;
                    let cache_create_tokens = totals.cache_create_tokens.load(Ordering::Relaxed).max(0) as u64;

                    let row = LogRow {
                        user_id: ctx.user_id.clone(),
                        provider_type: ctx.provider_type.clone(),
                        model: ctx.model.clone(),
                        input_tokens,
                        output_tokens,
                        cache_read_tokens,
                        cache_create_tokens,
                        duration_ms,
                        status,
                        error: if status == 200 { None } else { Some("empty_stream".to_string()) },
                        compressed: ctx.was_compressed,
                        original_tokens: ctx.original_tokens.max(0) as u64,
                        compressed_tokens: ctx.compressed_tokens.max(0) as u64,
                        created_at: crate::utils::now_epoch_secs(),
                    };

                    if let Err(e) = store.write_log(row).await {
                        tracing::error!(error = %e, "failed to write relay log row");
                    }
                    if let Err(e) = store.add_credential_tokens(&ctx.credential_id, input_tokens, output_tokens).await {
                        tracing::error!(error = %e, "failed to update credential token totals");
                    }
                    if let Err(e) = store.add_user_tokens(&ctx.user_id, input_tokens, output_tokens).await {
                        tracing::error!(error = %e, "failed to update user token totals");
                    }
                    if let Some(cost) = estimate_credit_cost(input_tokens, output_tokens, cache_read_tokens, cache_create_tokens) {
                        if let Err(e) = store.add_credential_credit(&ctx.credential_id, -cost).await {
                            tracing::error!(error = %e, "failed to debit credential credit");
                        }
                    }
                });
            })),
        })
    }
}

#[derive(Clone)]
struct FinalizeContext {
    user_id: String,
    provider_type: String,
    model: String,
    credential_id: String,
    was_compressed: bool,
    original_tokens: i32,
    compressed_tokens: i32,
}

/// Cost-ratio table per §9: cache-read tokens are a fraction of a full
/// input token, cache-create tokens a small multiple. Returns `None` when
/// there's nothing to bill (all counters zero).
fn estimate_credit_cost(input: u64, output: u64, cache_read: u64, cache_create: u64) -> Option<f64> {
    if input == 0 && output == 0 && cache_read == 0 && cache_create == 0 {
        return None;
    }
    const INPUT_RATE: f64 = 1.0;
    const OUTPUT_RATE: f64 = 4.0;
    const CACHE_READ_RATE: f64 = 0.1;
    const CACHE_CREATE_RATE: f64 = 1.25;
    Some(
        (input as f64 * INPUT_RATE
            + output as f64 * OUTPUT_RATE
            + cache_read as f64 * CACHE_READ_RATE
            + cache_create as f64 * CACHE_CREATE_RATE)
            / 1_000_000.0,
    )
}

/// Scans SSE-framed bytes for OpenAI/Anthropic usage objects as they pass
/// through, per §4.7 point 3's passive parser; falls back to counting
/// chunks when no usage event is ever seen.
struct WatchingStream {
    inner: BoxStream<'static, Result<Bytes, ApiError>>,
    totals: Arc<UsageTotals>,
    wrote_any: Arc<AtomicBool>,
}

impl Stream for WatchingStream {
    type Item = Result<Bytes, ApiError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.wrote_any.store(true, Ordering::Relaxed);
                scan_usage(&chunk, &self.totals);
                Poll::Ready(Some(Ok(chunk)))
            }
            other => other,
        }
    }
}

fn scan_usage(chunk: &Bytes, totals: &UsageTotals) {
    let Ok(text) = std::str::from_utf8(chunk) else {
        return;
    };
    for line in text.lines() {
        let Some(payload) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<serde_json::Value>(payload.trim()) else {
            continue;
        };

        if let Some(usage) = value.get("usage") {
            apply_usage(usage, totals);
        }
        if let Some(message) = value.get("message").and_then(|m| m.get("usage")) {
            apply_usage(message, totals);
        }
    }
}

fn apply_usage(usage: &serde_json::Value, totals: &UsageTotals) {
    if let Some(n) = usage.get("prompt_tokens").or_else(|| usage.get("input_tokens")).and_then(|v| v.as_i64()) {
        totals.input_tokens.store(n, Ordering::Relaxed);
    }
    if let Some(n) = usage.get("completion_tokens").or_else(|| usage.get("output_tokens")).and_then(|v| v.as_i64()) {
        totals.output_tokens.store(n, Ordering::Relaxed);
    }
    if let Some(n) = usage.get("cache_read_input_tokens").and_then(|v| v.as_i64()) {
        totals.cache_read_tokens.store(n, Ordering::Relaxed);
    }
    if let Some(n) = usage.get("cache_creation_input_tokens").and_then(|v| v.as_i64()) {
        totals.cache_create_tokens.store(n, Ordering::Relaxed);
    }
}

/// Forwards every item from `inner` unchanged; when the inner stream is
/// exhausted, fires `on_done` exactly once. `Pin<Box<dyn Stream>>` is
/// itself `Unpin`, so this wrapper needs no pin-projection.
struct FinalizingStream {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, ApiError>> + Send>>,
    on_done: Option<Box<dyn FnOnce() + Send>>,
}

impl Stream for FinalizingStream {
    type Item = Result<Bytes, ApiError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(None) => {
                if let Some(on_done) = self.on_done.take() {
                    on_done();
                }
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl Drop for FinalizingStream {
    fn drop(&mut self) {
        if let Some(on_done) = self.on_done.take() {
            on_done();
        }
    }
}
