//! xAI (Grok) adapter: OpenAI-compatible wire protocol on api.x.ai.

use async_trait::async_trait;

use super::{Completion, CompletionRequest, DeltaSink, OpenAiProvider, Provider};
use crate::error::ProviderError;

const XAI_BASE_URL: &str = "https://api.x.ai/v1";

pub struct XaiProvider {
    inner: OpenAiProvider,
}

impl XaiProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            inner: OpenAiProvider::with_base_url(api_key, XAI_BASE_URL, "xai"),
        }
    }
}

#[async_trait]
impl Provider for XaiProvider {
    fn id(&self) -> &str {
        "xai"
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ProviderError> {
        self.inner.complete(request).await
    }

    async fn complete_streaming(
        &self,
        request: CompletionRequest,
        sink: DeltaSink,
    ) -> Result<Completion, ProviderError> {
        self.inner.complete_streaming(request, sink).await
    }
}
