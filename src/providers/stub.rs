//! Deterministic stub adapter backing the test suite.
//!
//! Responses are scripted per model id and consumed in order; an optional
//! artificial delay creates real overlap for concurrency tests. The stub
//! records every prompt and tracks its own peak concurrency.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{estimate_tokens, Completion, CompletionRequest, Provider};
use crate::error::ProviderError;

#[derive(Debug, Clone)]
pub enum StubOutcome {
    Reply(String),
    Fail(ProviderError),
}

pub struct StubProvider {
    provider_id: String,
    delay: Duration,
    default_reply: String,
    script: Mutex<HashMap<String, VecDeque<StubOutcome>>>,
    prompts: Mutex<Vec<String>>,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
}

impl StubProvider {
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            delay: Duration::from_millis(0),
            default_reply: "ok".into(),
            script: Mutex::new(HashMap::new()),
            prompts: Mutex::new(Vec::new()),
            concurrent: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_default_reply(mut self, reply: impl Into<String>) -> Self {
        self.default_reply = reply.into();
        self
    }

    /// Queue the next outcome for a model; consumed FIFO.
    pub fn push(&self, model_id: &str, outcome: StubOutcome) {
        self.script
            .lock()
            .expect("stub lock poisoned")
            .entry(model_id.to_string())
            .or_default()
            .push_back(outcome);
    }

    pub fn push_reply(&self, model_id: &str, reply: impl Into<String>) {
        self.push(model_id, StubOutcome::Reply(reply.into()));
    }

    pub fn push_failure(&self, model_id: &str, error: ProviderError) {
        self.push(model_id, StubOutcome::Fail(error));
    }

    /// Every prompt seen, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("stub lock poisoned").clone()
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().expect("stub lock poisoned").len()
    }

    /// Highest number of calls observed in flight at once.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    fn next_outcome(&self, model_id: &str) -> StubOutcome {
        let mut script = self.script.lock().expect("stub lock poisoned");
        script
            .get_mut(model_id)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| StubOutcome::Reply(self.default_reply.clone()))
    }
}

#[async_trait]
impl Provider for StubProvider {
    fn id(&self) -> &str {
        &self.provider_id
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ProviderError> {
        let started = Instant::now();
        self.prompts
            .lock()
            .expect("stub lock poisoned")
            .push(request.prompt.clone());

        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.concurrent.fetch_sub(1, Ordering::SeqCst);

        match self.next_outcome(&request.model_id) {
            StubOutcome::Reply(content) => Ok(Completion {
                input_tokens: estimate_tokens(&request.prompt),
                output_tokens: estimate_tokens(&content),
                latency_ms: started.elapsed().as_millis() as u64,
                content,
            }),
            StubOutcome::Fail(error) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_outcomes_consumed_in_order() {
        let stub = StubProvider::new("stub");
        stub.push_reply("m", "first");
        stub.push_failure("m", ProviderError::Permanent("second".into()));

        let first = stub
            .complete(CompletionRequest::new("m", "hello"))
            .await
            .unwrap();
        assert_eq!(first.content, "first");

        let second = stub.complete(CompletionRequest::new("m", "again")).await;
        assert!(matches!(second, Err(ProviderError::Permanent(_))));

        // Script exhausted: default reply.
        let third = stub
            .complete(CompletionRequest::new("m", "more"))
            .await
            .unwrap();
        assert_eq!(third.content, "ok");
        assert_eq!(stub.call_count(), 3);
    }
}
