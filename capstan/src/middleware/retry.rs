//! Model-call retry: wraps the stream open in exponential backoff for
//! transient backend failures. Terminal failures pass through untouched.

use std::time::Duration;

use futures::future::BoxFuture;

use crate::middleware::{Middleware, ModelCallNext, ModelCallRequest};
use crate::model::{ModelError, ModelStream};

pub struct ModelRetryMiddleware {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
}

impl ModelRetryMiddleware {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            multiplier: multiplier.max(1.0),
        }
    }
}

impl Default for ModelRetryMiddleware {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(200), Duration::from_secs(10), 2.0)
    }
}

#[async_trait::async_trait]
impl Middleware for ModelRetryMiddleware {
    fn name(&self) -> &str {
        "model_retry"
    }

    fn wrap_model_call(
        &self,
        req: ModelCallRequest,
        next: ModelCallNext,
    ) -> BoxFuture<'static, Result<ModelStream, ModelError>> {
        let max_attempts = self.max_attempts;
        let base_delay = self.base_delay;
        let max_delay = self.max_delay;
        let multiplier = self.multiplier;
        Box::pin(async move {
            let mut delay = base_delay;
            let mut attempt = 1;
            loop {
                match next.run(req.clone()).await {
                    Ok(stream) => return Ok(stream),
                    Err(e) if e.is_transient() && attempt < max_attempts => {
                        tracing::debug!(attempt, error = %e, "transient model error; retrying");
                        tokio::select! {
                            _ = req.cancel.cancelled() => return Err(e),
                            _ = tokio::time::sleep(delay) => {}
                        }
                        delay = delay.mul_f64(multiplier).min(max_delay);
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    }
}
