use crate::error::PipelineError;
use crate::llm::LlmClient;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Cooperative cancellation. Checked at every retry-loop boundary; an
/// in-flight network call is never interrupted mid-request.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// A completion that made it through the retry policy, with enough
/// bookkeeping for cost/quality auditing.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub text: String,
    pub model_used: String,
    pub fell_back: bool,
    pub attempts: usize,
}

/// Wraps an `LlmClient` with bounded retry and one-time model degradation:
/// up to `max_attempts` tries on the requested model, then one fresh cycle on
/// the fallback model iff it differs from the requested one. At most
/// `2 * max_attempts` calls per logical generation.
pub struct GenerationClient {
    llm: Box<dyn LlmClient>,
    fallback_model: String,
    max_attempts: usize,
    retry_delay: Duration,
}

impl GenerationClient {
    pub fn new(
        llm: Box<dyn LlmClient>,
        fallback_model: impl Into<String>,
        max_attempts: usize,
        retry_delay: Duration,
    ) -> Self {
        Self {
            llm,
            fallback_model: fallback_model.into(),
            max_attempts: max_attempts.max(1),
            retry_delay,
        }
    }

    pub async fn generate(
        &self,
        system: &str,
        user: &str,
        model: &str,
        cancel: &CancelToken,
    ) -> Result<GenerationOutput, PipelineError> {
        let (primary_attempts, primary_err) = match self.attempt_cycle(system, user, model, cancel).await {
            Ok((text, attempts)) => {
                return Ok(GenerationOutput {
                    text,
                    model_used: model.to_string(),
                    fell_back: false,
                    attempts,
                })
            }
            Err(CycleOutcome::Cancelled) => return Err(PipelineError::Cancelled),
            Err(CycleOutcome::Exhausted { attempts, message }) => (attempts, message),
        };

        if model == self.fallback_model {
            return Err(PipelineError::Generation {
                model: model.to_string(),
                attempts: primary_attempts,
                message: primary_err,
            });
        }

        log::warn!(
            "model '{}' exhausted after {} attempts, degrading to '{}'",
            model,
            primary_attempts,
            self.fallback_model
        );

        match self.attempt_cycle(system, user, &self.fallback_model, cancel).await {
            Ok((text, attempts)) => Ok(GenerationOutput {
                text,
                model_used: self.fallback_model.clone(),
                fell_back: true,
                attempts: primary_attempts + attempts,
            }),
            Err(CycleOutcome::Cancelled) => Err(PipelineError::Cancelled),
            Err(CycleOutcome::Exhausted { attempts, message }) => Err(PipelineError::Generation {
                model: self.fallback_model.clone(),
                attempts: primary_attempts + attempts,
                message,
            }),
        }
    }

    async fn attempt_cycle(
        &self,
        system: &str,
        user: &str,
        model: &str,
        cancel: &CancelToken,
    ) -> Result<(String, usize), CycleOutcome> {
        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            if cancel.is_cancelled() {
                return Err(CycleOutcome::Cancelled);
            }

            match self.llm.chat(system, user, model).await {
                Ok(text) if !text.trim().is_empty() => return Ok((text, attempt)),
                Ok(_) => last_error = "empty completion body".to_string(),
                Err(e) => last_error = e.to_string(),
            }

            log::warn!(
                "generation attempt {}/{} on '{}' failed: {}",
                attempt,
                self.max_attempts,
                model,
                last_error
            );

            if attempt < self.max_attempts && !self.retry_delay.is_zero() {
                let jitter = rand::rng().random_range(0..=self.retry_delay.as_millis() as u64 / 2);
                tokio::time::sleep(self.retry_delay + Duration::from_millis(jitter)).await;
            }
        }
        Err(CycleOutcome::Exhausted {
            attempts: self.max_attempts,
            message: last_error,
        })
    }
}

enum CycleOutcome {
    Cancelled,
    Exhausted { attempts: usize, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct MockLlm {
        calls: Arc<Mutex<Vec<String>>>,
        /// Models that succeed; everything else fails.
        succeed_on: Vec<String>,
    }

    #[async_trait]
    impl crate::llm::LlmClient for MockLlm {
        async fn chat(&self, _system: &str, _user: &str, model: &str) -> Result<String> {
            self.calls.lock().unwrap().push(model.to_string());
            if self.succeed_on.iter().any(|m| m == model) {
                Ok("output".to_string())
            } else {
                Err(anyhow!("boom"))
            }
        }
    }

    fn client_with(succeed_on: Vec<&str>, fallback: &str) -> (GenerationClient, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let llm = Box::new(MockLlm {
            calls: calls.clone(),
            succeed_on: succeed_on.into_iter().map(String::from).collect(),
        });
        (
            GenerationClient::new(llm, fallback, 3, Duration::ZERO),
            calls,
        )
    }

    #[tokio::test]
    async fn exhausts_three_then_three_on_fallback() {
        let (client, calls) = client_with(vec![], "fallback");
        let err = client
            .generate("s", "u", "primary", &CancelToken::new())
            .await
            .unwrap_err();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 6);
        assert_eq!(&calls[..3], &["primary"; 3]);
        assert_eq!(&calls[3..], &["fallback"; 3]);
        match err {
            PipelineError::Generation { model, attempts, .. } => {
                assert_eq!(model, "fallback");
                assert_eq!(attempts, 6);
            }
            other => panic!("expected Generation error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn primary_equals_fallback_means_three_total() {
        let (client, calls) = client_with(vec![], "same");
        let err = client
            .generate("s", "u", "same", &CancelToken::new())
            .await
            .unwrap_err();

        assert_eq!(calls.lock().unwrap().len(), 3);
        assert!(matches!(err, PipelineError::Generation { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn fallback_success_is_flagged() {
        let (client, calls) = client_with(vec!["fallback"], "fallback");
        let out = client
            .generate("s", "u", "primary", &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(calls.lock().unwrap().len(), 4);
        assert!(out.fell_back);
        assert_eq!(out.model_used, "fallback");
    }

    #[tokio::test]
    async fn primary_success_does_not_fall_back() {
        let (client, calls) = client_with(vec!["primary"], "fallback");
        let out = client
            .generate("s", "u", "primary", &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(calls.lock().unwrap().len(), 1);
        assert!(!out.fell_back);
        assert_eq!(out.model_used, "primary");
    }

    #[tokio::test]
    async fn cancellation_stops_before_any_call() {
        let (client, calls) = client_with(vec![], "fallback");
        let token = CancelToken::new();
        token.cancel();
        let err = client.generate("s", "u", "primary", &token).await.unwrap_err();

        assert!(calls.lock().unwrap().is_empty());
        assert!(matches!(err, PipelineError::Cancelled));
    }
}
