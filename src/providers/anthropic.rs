//! Anthropic messages-API adapter.

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

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: Client,
    api_key: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
        }
    }

    fn request_body(&self, request: &CompletionRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": request.model_id,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": [{"role": "user", "content": request.prompt}],
        });
        if let Some(system) = &request.system {
            body["system"] = json!(system);
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error("anthropic", e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(error_for_status("anthropic", status, &text));
        }
        Ok(response)
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn id(&self) -> &str {
        "anthropic"
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ProviderError> {
        let body = self.request_body(&request, false);
        let started = Instant::now();

        let payload: Value = with_backoff("anthropic", || async {
            let response = self.send(&body).await?;
            response
                .json()
                .await
                .map_err(|e| transport_error("anthropic", e))
        })
        .await?;

        let content = payload["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| b["text"].as_str())
                    .collect::<String>()
            })
            .unwrap_or_default();
        let input_tokens = payload["usage"]["input_tokens"].as_u64().unwrap_or(0);
        let output_tokens = payload["usage"]["output_tokens"].as_u64().unwrap_or(0);

        debug!(
            model = %request.model_id,
            input_tokens,
            output_tokens,
            "anthropic completion finished"
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

        // Only connection establishment is retried; a broken mid-stream
        // body surfaces as a transient failure for the whole attempt.
        let response = with_backoff("anthropic", || self.send(&body)).await?;

        let mut stream = response.bytes_stream();
        let mut lines = SseLines::new();
        let mut content = String::new();
        let mut input_tokens = 0u64;
        let mut output_tokens = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| transport_error("anthropic", e))?;
            for line in lines.push(&chunk) {
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                let Ok(event) = serde_json::from_str::<Value>(data) else {
                    continue;
                };
                match event["type"].as_str() {
                    Some("message_start") => {
                        input_tokens = event["message"]["usage"]["input_tokens"]
                            .as_u64()
                            .unwrap_or(0);
                    }
                    Some("content_block_delta") => {
                        if let Some(text) = event["delta"]["text"].as_str() {
                            content.push_str(text);
                            let _ = sink.send(text.to_string()).await;
                        }
                    }
                    Some("message_delta") => {
                        if let Some(out) = event["usage"]["output_tokens"].as_u64() {
                            output_tokens = out;
                        }
                    }
                    Some("error") => {
                        return Err(ProviderError::Transient(format!(
                            "anthropic stream error: {}",
                            event["error"]["message"].as_str().unwrap_or("unknown")
                        )));
                    }
                    _ => {}
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
