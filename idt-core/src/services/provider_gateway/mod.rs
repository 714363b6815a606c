//! Provider gateway
//!
//! One `describe` call over a closed set of vision backends. The gateway owns the
//! per-call timeout, the retry/backoff policy and a per-provider concurrency
//! ceiling; it never touches the ledger or the status stream.

pub mod claude;
mod http;
pub mod ollama;
pub mod openai;
mod retry;

pub use retry::{apply_jitter, RetryPolicy};

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use idt_common::{prompts, ConfigError, DescriptionResult, ProviderConfig, ProviderKind, TokenUsage};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::models::ImageTask;

/// Normalized provider failure kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderErrorKind {
    Timeout,
    RateLimited,
    AuthFailed,
    InvalidInput,
    ProviderUnavailable,
    UnknownError,
}

impl ProviderErrorKind {
    /// Transient kinds are retried; everything else fails on the first occurrence
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderErrorKind::Timeout
                | ProviderErrorKind::RateLimited
                | ProviderErrorKind::ProviderUnavailable
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderErrorKind::Timeout => "timeout",
            ProviderErrorKind::RateLimited => "rate_limited",
            ProviderErrorKind::AuthFailed => "auth_failed",
            ProviderErrorKind::InvalidInput => "invalid_input",
            ProviderErrorKind::ProviderUnavailable => "provider_unavailable",
            ProviderErrorKind::UnknownError => "unknown_error",
        }
    }
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider failure after normalization
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    /// Wait requested by the provider (Retry-After)
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// Why a `describe` call produced no description
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DescribeError {
    /// Permanent failure, or transient failures beyond the retry budget
    #[error("{error} (after {attempts} attempt(s))")]
    Failed { error: ProviderError, attempts: u32 },

    /// The run was cancelled before the item finished; it stays pending
    #[error("cancelled after {attempts} attempt(s)")]
    Aborted { attempts: u32 },
}

impl DescribeError {
    pub fn attempts(&self) -> u32 {
        match self {
            DescribeError::Failed { attempts, .. } | DescribeError::Aborted { attempts } => *attempts,
        }
    }

    pub fn kind(&self) -> Option<ProviderErrorKind> {
        match self {
            DescribeError::Failed { error, .. } => Some(error.kind),
            DescribeError::Aborted { .. } => None,
        }
    }

    fn before_call(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        DescribeError::Failed {
            error: ProviderError::new(kind, message),
            attempts: 0,
        }
    }
}

/// Everything a backend needs for one call
#[derive(Debug, Clone)]
pub struct VisionRequest {
    pub model: String,
    pub prompt: &'static str,
    pub media_type: &'static str,
    pub image_base64: String,
}

/// Raw backend answer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendReply {
    pub text: String,
    pub usage: TokenUsage,
}

/// A vision model reachable over some transport
///
/// Implementations make exactly one call per invocation and map every failure to a
/// [`ProviderError`]; retries and timeouts are the gateway's job.
#[async_trait]
pub trait VisionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn describe(&self, request: &VisionRequest) -> Result<BackendReply, ProviderError>;
}

/// Uniform entry point for image descriptions
pub struct ProviderGateway {
    config: ProviderConfig,
    backend: Arc<dyn VisionBackend>,
    permits: Semaphore,
    retry: RetryPolicy,
}

impl ProviderGateway {
    /// Validate `config` and build the backend it names
    pub fn new(config: ProviderConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let backend: Arc<dyn VisionBackend> = match config.provider {
            ProviderKind::Ollama => Arc::new(ollama::OllamaBackend::new(&config)?),
            ProviderKind::OpenAi => Arc::new(openai::OpenAiBackend::new(&config)?),
            ProviderKind::Claude => Arc::new(claude::ClaudeBackend::new(&config)?),
        };
        Ok(Self::assemble(config, backend))
    }

    /// Use a caller-supplied backend (tests, embedding applications)
    pub fn with_backend(
        config: ProviderConfig,
        backend: Arc<dyn VisionBackend>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::assemble(config, backend))
    }

    fn assemble(config: ProviderConfig, backend: Arc<dyn VisionBackend>) -> Self {
        tracing::info!(
            provider = %config.provider,
            backend = backend.name(),
            model = %config.model,
            max_in_flight = config.max_in_flight(),
            max_retries = config.max_retries,
            "Provider gateway ready"
        );
        Self {
            permits: Semaphore::new(config.max_in_flight()),
            retry: RetryPolicy::from_config(&config),
            config,
            backend,
        }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Describe one image
    ///
    /// Transient failures are retried up to `max_retries` times. Cancellation stops
    /// backoff sleeps and permit waits; an attempt already in flight is allowed to
    /// finish within its timeout.
    pub async fn describe(
        &self,
        task: &ImageTask,
        cancel: &CancellationToken,
    ) -> Result<DescriptionResult, DescribeError> {
        let request = self.prepare(task).await?;
        let timeout = self.config.timeout();
        let started = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(DescribeError::Aborted { attempts });
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DescribeError::Aborted { attempts }),
                permit = self.permits.acquire() => permit.map_err(|_| DescribeError::Failed {
                    error: ProviderError::new(ProviderErrorKind::ProviderUnavailable, "gateway closed"),
                    attempts,
                })?,
            };

            attempts += 1;
            tracing::debug!(item_id = %task.id, attempt = attempts, "Provider call");

            let outcome = match tokio::time::timeout(timeout, self.backend.describe(&request)).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::new(
                    ProviderErrorKind::Timeout,
                    format!("no response within {} ms", timeout.as_millis()),
                )),
            };
            drop(permit);

            let error = match outcome {
                Ok(reply) if !reply.text.trim().is_empty() => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    if attempts > 1 {
                        tracing::info!(item_id = %task.id, attempts, latency_ms, "Description succeeded after retry");
                    }
                    return Ok(DescriptionResult {
                        text: reply.text.trim().to_string(),
                        provider: self.config.provider.as_str().to_string(),
                        model: self.config.model.clone(),
                        prompt_style: self.config.prompt_style.clone(),
                        latency_ms,
                        attempts,
                        usage: reply.usage,
                        completed_at: Utc::now(),
                    });
                }
                Ok(_) => ProviderError::new(ProviderErrorKind::UnknownError, "provider returned an empty description"),
                Err(error) => error,
            };

            let retry = attempts - 1;
            if !error.is_transient() || !self.retry.should_retry(retry) {
                tracing::warn!(
                    item_id = %task.id,
                    attempts,
                    kind = %error.kind,
                    error = %error.message,
                    "Description failed"
                );
                return Err(DescribeError::Failed { error, attempts });
            }

            if cancel.is_cancelled() {
                return Err(DescribeError::Aborted { attempts });
            }

            let delay = self.retry.delay_for(retry, error.retry_after);
            tracing::warn!(
                item_id = %task.id,
                attempt = attempts,
                kind = %error.kind,
                delay_ms = delay.as_millis() as u64,
                "Transient provider error, will retry after backoff"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(DescribeError::Aborted { attempts }),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Check the input file and encode it; failures here cost no provider call
    async fn prepare(&self, task: &ImageTask) -> Result<VisionRequest, DescribeError> {
        let format = task.format().ok_or_else(|| {
            DescribeError::before_call(
                ProviderErrorKind::InvalidInput,
                format!("unsupported image format: {}", task.path.display()),
            )
        })?;

        let bytes = tokio::fs::read(&task.path).await.map_err(|e| {
            DescribeError::before_call(
                ProviderErrorKind::InvalidInput,
                format!("cannot read {}: {}", task.path.display(), e),
            )
        })?;

        if !format.matches_magic(&bytes) {
            return Err(DescribeError::before_call(
                ProviderErrorKind::InvalidInput,
                format!("{} is not a valid {} file", task.path.display(), format.media_type()),
            ));
        }

        let prompt = prompts::template(&self.config.prompt_style).ok_or_else(|| {
            DescribeError::before_call(
                ProviderErrorKind::InvalidInput,
                format!("unknown prompt style '{}'", self.config.prompt_style),
            )
        })?;

        Ok(VisionRequest {
            model: self.config.model.clone(),
            prompt,
            media_type: format.media_type(),
            image_base64: base64::engine::general_purpose::STANDARD.encode(&bytes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_transient_kinds() {
        assert!(ProviderErrorKind::Timeout.is_transient());
        assert!(ProviderErrorKind::RateLimited.is_transient());
        assert!(ProviderErrorKind::ProviderUnavailable.is_transient());
        assert!(!ProviderErrorKind::AuthFailed.is_transient());
        assert!(!ProviderErrorKind::InvalidInput.is_transient());
        assert!(!ProviderErrorKind::UnknownError.is_transient());
    }

    #[test]
    fn test_describe_error_accessors() {
        let failed = DescribeError::Failed {
            error: ProviderError::new(ProviderErrorKind::AuthFailed, "bad key"),
            attempts: 1,
        };
        assert_eq!(failed.attempts(), 1);
        assert_eq!(failed.kind(), Some(ProviderErrorKind::AuthFailed));
        assert!(failed.to_string().contains("auth_failed: bad key"));

        let aborted = DescribeError::Aborted { attempts: 2 };
        assert_eq!(aborted.kind(), None);
    }

    #[test]
    #[serial]
    fn test_cloud_gateway_needs_key() {
        std::env::remove_var("OPENAI_API_KEY");
        let config = ProviderConfig::new(ProviderKind::OpenAi, "gpt-4o");
        assert!(ProviderGateway::new(config).is_err());
    }
}
