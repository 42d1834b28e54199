//! Language-model provider trait and call plumbing.
//!
//! The orchestrator treats the language model as an abstract capability:
//! a prompt goes in, text plus a confidence estimate comes out. Concrete
//! backends live outside this crate; everything here is the seam they
//! plug into, plus the retry/timeout discipline the pipeline relies on.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};

/// Configuration for a single provider call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    /// Model identifier (backend-specific)
    pub model: String,
    /// Sampling temperature
    pub temperature: f64,
    /// Maximum tokens to generate
    pub max_tokens: u32,
    /// Call timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            model: "default".to_string(),
            temperature: 0.3,
            max_tokens: 1024,
            timeout_ms: 30_000,
        }
    }
}

impl CompletionConfig {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
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

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// A completion returned by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    /// Generated text
    pub text: String,
    /// Provider's confidence in the completion (0.0-1.0)
    pub confidence: f64,
}

impl Completion {
    pub fn new(text: impl Into<String>, confidence: f64) -> Self {
        Self {
            text: text.into(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// Abstract language-model capability consumed by the orchestrator.
///
/// Implementations must be thread-safe (`Send + Sync`) since tasks in the
/// same topological level call the provider concurrently.
#[async_trait]
pub trait LanguageModelProvider: Send + Sync {
    /// Complete a prompt.
    ///
    /// Fails with [`Error::ProviderTimeout`] or [`Error::ProviderUnavailable`];
    /// both are transient and handled by the per-stage retry policy.
    async fn complete(&self, prompt: &str, config: &CompletionConfig) -> Result<Completion>;

    /// Short backend name, used in logs.
    fn name(&self) -> &str;
}

/// Wrapper that enforces the call timeout and retries transient failures.
///
/// The wrapped provider is only responsible for the raw call; deadline and
/// retry discipline live here so every stage gets the same behavior.
pub struct RetryingProvider {
    inner: Arc<dyn LanguageModelProvider>,
    max_retries: u32,
}

impl RetryingProvider {
    pub fn new(inner: Arc<dyn LanguageModelProvider>, max_retries: u32) -> Self {
        Self { inner, max_retries }
    }

    /// Complete with timeout enforcement and transient-error retry.
    pub async fn complete(&self, prompt: &str, config: &CompletionConfig) -> Result<Completion> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            let deadline = Duration::from_millis(config.timeout_ms);
            let call = self.inner.complete(prompt, config);

            match tokio::time::timeout(deadline, call).await {
                Ok(Ok(completion)) => return Ok(completion),
                Ok(Err(err)) if err.is_transient() => {
                    tracing::debug!(
                        provider = self.inner.name(),
                        attempt,
                        error = %err,
                        "transient provider failure"
                    );
                    last_err = Some(err);
                }
                Ok(Err(err)) => return Err(err),
                Err(_) => {
                    tracing::debug!(
                        provider = self.inner.name(),
                        attempt,
                        timeout_ms = config.timeout_ms,
                        "provider call timed out"
                    );
                    last_err = Some(Error::provider_timeout(config.timeout_ms));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Error::provider_unavailable("no attempts made")))
    }

    pub fn provider_name(&self) -> &str {
        self.inner.name()
    }
}

/// Scripted provider for tests.
#[cfg(test)]
pub use test_support::{MockProvider, MockReply};

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// One scripted reply.
    #[derive(Debug, Clone)]
    pub enum MockReply {
        Text(String, f64),
        Timeout,
        Unavailable,
    }

    /// Provider that replays a script of replies, falling back to a default
    /// completion once the script is exhausted.
    pub struct MockProvider {
        script: Mutex<VecDeque<MockReply>>,
        default_reply: MockReply,
        calls: AtomicU32,
    }

    impl MockProvider {
        pub fn new() -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                default_reply: MockReply::Text("plausible answer".to_string(), 0.85),
                calls: AtomicU32::new(0),
            }
        }

        /// Provider whose every call times out.
        pub fn always_timeout() -> Self {
            let mut p = Self::new();
            p.default_reply = MockReply::Timeout;
            p
        }

        /// Provider whose every call fails as unavailable.
        pub fn always_unavailable() -> Self {
            let mut p = Self::new();
            p.default_reply = MockReply::Unavailable;
            p
        }

        /// Set the fallback reply used once the script is exhausted.
        pub fn with_default(mut self, text: impl Into<String>, confidence: f64) -> Self {
            self.default_reply = MockReply::Text(text.into(), confidence);
            self
        }

        /// Push a scripted reply.
        pub fn push(self, reply: MockReply) -> Self {
            self.script.lock().unwrap().push_back(reply);
            self
        }

        /// Push a scripted text reply.
        pub fn push_text(self, text: impl Into<String>, confidence: f64) -> Self {
            self.push(MockReply::Text(text.into(), confidence))
        }

        /// Number of completed calls so far.
        pub fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Default for MockProvider {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl LanguageModelProvider for MockProvider {
        async fn complete(
            &self,
            _prompt: &str,
            config: &CompletionConfig,
        ) -> Result<Completion> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            let reply = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.default_reply.clone());

            match reply {
                MockReply::Text(text, confidence) => Ok(Completion::new(text, confidence)),
                MockReply::Timeout => Err(Error::provider_timeout(config.timeout_ms)),
                MockReply::Unavailable => Err(Error::provider_unavailable("mock down")),
            }
        }

        fn name(&self) -> &str {
            "mock"
        }
    }
}
