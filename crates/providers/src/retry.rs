//! Single-retry wrapper.
//!
//! The engine itself never retries the model; all retry policy lives
//! in this one wrapper so the behaviour stays bounded and visible.

use std::sync::Arc;
use std::time::Duration;

use tiller_domain::Result;

use crate::traits::{ModelProvider, ModelRequest, ModelResponse};

pub struct RetryProvider {
    inner: Arc<dyn ModelProvider>,
    retries: u32,
    backoff: Duration,
}

impl RetryProvider {
    pub fn new(inner: Arc<dyn ModelProvider>, retries: u32) -> Self {
        Self {
            inner,
            retries,
            backoff: Duration::from_millis(250),
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }
}

#[async_trait::async_trait]
impl ModelProvider for RetryProvider {
    async fn complete(&self, req: &ModelRequest) -> Result<ModelResponse> {
        let mut attempt = 0;
        loop {
            match self.inner.complete(req).await {
                Ok(resp) => return Ok(resp),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    tracing::warn!(
                        provider = self.inner.provider_id(),
                        attempt,
                        error = %e,
                        "model call failed, retrying"
                    );
                    tokio::time::sleep(self.backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn provider_id(&self) -> &str {
        self.inner.provider_id()
    }
}
