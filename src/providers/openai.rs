//! OpenAI chat-completions adapter.
//!
//! Also the backbone of the xAI adapter, which speaks the same wire
//! protocol against a different base URL.

use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use super::{
    error_for_status, estimate_tokens, transport_error, with_backoff, Completion,
    CompletionRequest, DeltaSink, Provider, SseLines,
};
use crate::error::ProviderError;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    provider_id: String,
}

impl OpenAiProvider {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, OPENAI_BASE_URL, "openai")
    }

    /// Alternate endpoint speaking the same protocol (used by xAI).
    pub fn with_base_url(
        api_key: String,
        base_url: impl Into<String>,
        provider_id: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.into(),
            provider_id: provider_id.into(),
        }
    }

    fn request_body(&self, request: &CompletionRequest, stream: bool) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        let mut body = json!({
            "model": request.model_id,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });
        if stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({"include_usage": true});
        }
        body
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(&self.provider_id, e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(error_for_status(&self.provider_id, status, &text));
        }
        Ok(response)
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn id(&self) -> &str {
        &self.provider_id
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ProviderError> {
        let body = self.request_body(&request, false);
        let started = Instant::now();

        let payload: Value = with_backoff(&self.provider_id, || async {
            let response = self.send(&body).await?;
            response
                .json()
                .await
                .map_err(|e| transport_error(&self.provider_id, e))
        })
        .await?;

        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let input_tokens = payload["usage"]["prompt_tokens"].as_u64().unwrap_or(0);
        let output_tokens = payload["usage"]["completion_tokens"].as_u64().unwrap_or(0);

        debug!(
            provider = %self.provider_id,
            model = %request.model_id,
            input_tokens,
            output_tokens,
            "chat completion finished"
        );

        Ok(Completion {
            content,
            input_tokens,
            output_tokens,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn complete_streaming(
        &self,
        request: CompletionRequest,
        sink: DeltaSink,
    ) -> Result<Completion, ProviderError> {
        let body = self.request_body(&request, true);
        let started = Instant::now();

        let response = with_backoff(&self.provider_id, || self.send(&body)).await?;

        let mut stream = response.bytes_stream();
        let mut lines = SseLines::new();
        let mut content = String::new();
        let mut input_tokens = 0u64;
        let mut output_tokens = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| transport_error(&self.provider_id, e))?;
            for line in lines.push(&chunk) {
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    continue;
                }
                let Ok(event) = serde_json::from_str::<Value>(data) else {
                    continue;
                };
                if let Some(delta) = event["choices"][0]["delta"]["content"].as_str() {
                    content.push_str(delta);
                    let _ = sink.send(delta.to_string()).await;
                }
                if let Some(usage) = event.get("usage").filter(|u| !u.is_null()) {
                    input_tokens = usage["prompt_tokens"].as_u64().unwrap_or(input_tokens);
                    output_tokens = usage["completion_tokens"]
                        .as_u64()
                        .unwrap_or(output_tokens);
                }
            }
        }

        if output_tokens == 0 {
            output_tokens = estimate_tokens(&content);
        }

        Ok(Completion {
            content,
            input_tokens,
            output_tokens,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }
}
