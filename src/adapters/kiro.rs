// Kiro/CodeWhisperer adapter: the only concrete `ProviderAdapter` this
// gateway ships. Converts the relay's neutral Anthropic-shaped body into
// a Kiro payload, applies rate-limiting/fingerprinting/proxy selection,
// makes the upstream call, then reframes the Kiro event stream into
// whichever wire format the caller asked for.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;

use crate::config::Config;
use crate::converters::anthropic_to_kiro::build_kiro_payload;
use crate::error::ApiError;
use crate::http_client::KiroHttpClient;
use crate::models::anthropic::AnthropicMessagesRequest;
use crate::relay::{OutputFormat, ProviderAdapter};
use crate::risk_control::{RiskControl, Scope, ScopeLimits};
use crate::tokenizer::count_anthropic_message_tokens;

pub struct KiroAdapter {
    http: Arc<KiroHttpClient>,
    risk: Arc<RiskControl>,
    config: Arc<Config>,
    limits: ScopeLimits,
}

impl KiroAdapter {
    pub fn new(http: Arc<KiroHttpClient>, risk: Arc<RiskControl>, config: Arc<Config>, limits: ScopeLimits) -> Self {
        Self { http, risk, config, limits }
    }

    fn credential_field<'a>(payload: &'a Value, key: &str) -> Option<&'a str> {
        payload.get(key).and_then(|v| v.as_str())
    }

    async fn build_client(&self, proxy_url: Option<&str>) -> Result<reqwest::Client, ApiError> {
        let Some(url) = proxy_url else {
            return Ok(self.http.client().clone());
        };
        let proxy = reqwest::Proxy::all(url).map_err(|e| ApiError::Internal(e.into()))?;
        reqwest::Client::builder()
            .proxy(proxy)
            .build()
            .map_err(|e| ApiError::Internal(e.into()))
    }
}

#[async_trait]
impl ProviderAdapter for KiroAdapter {
    async fn chat(
        &self,
        credential_payload: &Value,
        model: &str,
        body: Value,
        credential_id: &str,
        _user_id: &str,
        target_format: OutputFormat,
        stream: bool,
    ) -> Result<BoxStream<'static, Result<Bytes, ApiError>>, ApiError> {
        let access_token = Self::credential_field(credential_payload, "accessToken")
            .or_else(|| Self::credential_field(credential_payload, "api_key"))
            .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("credential payload has no usable access token")))?
            .to_string();
        let region = Self::credential_field(credential_payload, "region")
            .unwrap_or(&self.config.kiro_region)
            .to_string();
        let profile_arn = Self::credential_field(credential_payload, "profileArn").unwrap_or("");

        let mut request: AnthropicMessagesRequest =
            serde_json::from_value(body).map_err(|e| ApiError::Internal(e.into()))?;
        request.model = model.to_string();
        request.stream = stream;

        let conversation_id = uuid::Uuid::new_v4().to_string();
        let kiro_result = build_kiro_payload(&request, &conversation_id, profile_arn, &self.config)
            .map_err(ApiError::UpstreamError)?;

        let estimated_tokens =
            count_anthropic_message_tokens(&request.messages, request.system.as_ref(), request.tools.as_ref())
                .max(0) as u32;

        let delay = self.risk.rate_limiter.acquire(&Scope::Global, &self.limits, estimated_tokens);
        if delay > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        }

        let mut base_headers = std::collections::HashMap::new();
        base_headers.insert("Authorization".to_string(), format!("Bearer {access_token}"));
        base_headers.insert("Content-Type".to_string(), "application/json".to_string());
        let headers = self.risk.fingerprints.build_headers(credential_id, None, &base_headers, true);

        let proxy_url = self.risk.proxies.acquire(credential_id).map(|s| s.to_string());
        let client = self.build_client(proxy_url.as_deref()).await?;

        let url = format!("https://codewhisperer.{region}.amazonaws.com/generateAssistantResponse");
        let mut req_builder = client.post(&url).json(&kiro_result.payload);
        for (name, value) in &headers {
            req_builder = req_builder.header(name, value);
        }
        let req = req_builder.build().map_err(|e| ApiError::Internal(e.into()))?;

        let started = Instant::now();
        let response = self.http.request_with_retry(req).await;
        let elapsed = started.elapsed().as_secs_f64();

        let response = match response {
            Ok(resp) => {
                self.risk.health.record_request(credential_id, true, elapsed, None);
                if let Some(url) = &proxy_url {
                    self.risk.proxies.record_request(url, elapsed, true);
                }
                resp
            }
            Err(e) => {
                self.risk.health.record_request(credential_id, false, elapsed, None);
                if let Some(url) = &proxy_url {
                    self.risk.proxies.record_request(url, elapsed, false);
                }
                return Err(e);
            }
        };

        let input_tokens = estimated_tokens as i32;
        let first_token_timeout = self.config.first_token_timeout;

        if stream {
            let framed: BoxStream<'static, Result<String, ApiError>> = match target_format {
                OutputFormat::OpenAi => {
                    crate::streaming::stream_kiro_to_openai(response, model, first_token_timeout, input_tokens, None, true)
                        .await?
                }
                OutputFormat::Anthropic => {
                    crate::streaming::stream_kiro_to_anthropic(response, model, first_token_timeout, input_tokens, None).await?
                }
            };
            Ok(Box::pin(framed.map(|r| r.map(Bytes::from))))
        } else {
            let value = match target_format {
                OutputFormat::OpenAi => {
                    crate::streaming::collect_openai_response(response, model, first_token_timeout, input_tokens).await?
                }
                OutputFormat::Anthropic => {
                    crate::streaming::collect_anthropic_response(response, model, first_token_timeout, input_tokens).await?
                }
            };
            let bytes = Bytes::from(serde_json::to_vec(&value).map_err(|e| ApiError::Internal(e.into()))?);
            Ok(Box::pin(futures::stream::iter(vec![Ok(bytes)])))
        }
    }
}
