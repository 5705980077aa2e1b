//! Provider adapters: uniform request/response contract over
//! heterogeneous LLM backends.
//!
//! Adapters own token counting, timing, transient-error retry with
//! exponential backoff, and error normalization. They never invoke the
//! router or verifier.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::Ai3Config;
use crate::error::ProviderError;

pub mod anthropic;
pub mod openai;
pub mod stub;
pub mod xai;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;
pub use stub::{StubOutcome, StubProvider};
pub use xai::XaiProvider;

/// Retry schedule for transient failures: 250 ms base, doubling, at most
/// three attempts total.
const RETRY_BASE_MS: u64 = 250;
const RETRY_FACTOR: u32 = 2;
const RETRY_MAX_ATTEMPTS: u32 = 3;

/// One completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model_id: String,
    pub system: Option<String>,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl CompletionRequest {
    pub fn new(model_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            system: None,
            prompt: prompt.into(),
            max_tokens: 4096,
            temperature: 0.7,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Normalized completion result.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub latency_ms: u64,
}

/// Channel for incremental text fragments during streaming execution.
pub type DeltaSink = mpsc::Sender<String>;

/// Universal provider interface.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable provider id used for concurrency caps and telemetry.
    fn id(&self) -> &str;

    fn supports_streaming(&self) -> bool {
        false
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ProviderError>;

    /// Streaming variant; adapters without streaming fall back to one shot.
    async fn complete_streaming(
        &self,
        request: CompletionRequest,
        sink: DeltaSink,
    ) -> Result<Completion, ProviderError> {
        let completion = self.complete(request).await?;
        let _ = sink.send(completion.content.clone()).await;
        Ok(completion)
    }
}

/// The set of configured providers, keyed by provider id.
#[derive(Clone, Default)]
pub struct ProviderSet {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build adapters for every provider with a configured key.
    pub fn from_config(config: &Ai3Config) -> Self {
        let mut set = Self::new();
        if let Some(key) = &config.anthropic_api_key {
            set.insert(Arc::new(AnthropicProvider::new(key.clone())));
        }
        if let Some(key) = &config.openai_api_key {
            set.insert(Arc::new(OpenAiProvider::new(key.clone())));
        }
        if let Some(key) = &config.xai_api_key {
            set.insert(Arc::new(XaiProvider::new(key.clone())));
        }
        set
    }

    pub fn insert(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.id().to_string(), provider);
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(provider_id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Retry a call on retryable errors with exponential backoff.
pub(crate) async fn with_backoff<T, F, Fut>(
    provider: &str,
    mut call: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ProviderError>>,
{
    let mut delay = Duration::from_millis(RETRY_BASE_MS);
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < RETRY_MAX_ATTEMPTS => {
                warn!(provider, attempt, error = %err, "retrying after transient error");
                tokio::time::sleep(delay).await;
                delay *= RETRY_FACTOR;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Map an HTTP error status to a normalized provider error.
pub(crate) fn error_for_status(
    provider: &str,
    status: StatusCode,
    body: &str,
) -> ProviderError {
    let message = format!("{provider} returned {status}: {body}");
    match status.as_u16() {
        401 | 403 => ProviderError::AuthFailed(message),
        429 => ProviderError::RateLimited(message),
        408 | 500..=599 => ProviderError::Transient(message),
        _ => ProviderError::Permanent(message),
    }
}

/// Map a transport-level failure to a normalized provider error.
pub(crate) fn transport_error(provider: &str, err: reqwest::Error) -> ProviderError {
    ProviderError::Transient(format!("{provider} transport error: {err}"))
}

/// Rough token estimate for responses without a usage block.
pub(crate) fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

/// Incremental splitter turning byte chunks into complete lines, for SSE
/// response bodies.
#[derive(Default)]
pub(crate) struct SseLines {
    buffer: String,
}

impl SseLines {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line = self.buffer[..pos].trim_end_matches('\r').to_string();
            self.buffer.drain(..=pos);
            lines.push(line);
        }
        lines
    }
}
