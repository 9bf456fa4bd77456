use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tracing::{info, warn};

use weft_core::config::{EngineConfig, ModelConfig, RetryConfig};
use weft_core::error::{Result, WeftError};
use weft_core::traits::LlmClient;
use weft_core::types::*;

/// An oracle client that retries transient failures, then walks a list of
/// fallback oracles before giving up.
pub struct RetryingClient {
    primary: Arc<dyn LlmClient>,
    fallbacks: Vec<(ModelConfig, Arc<dyn LlmClient>)>,
    retry_config: RetryConfig,
}

impl RetryingClient {
    pub fn new(primary: Arc<dyn LlmClient>, retry_config: RetryConfig) -> Self {
        Self {
            primary,
            fallbacks: Vec::new(),
            retry_config,
        }
    }

    pub fn with_fallback(mut self, config: ModelConfig, client: Arc<dyn LlmClient>) -> Self {
        self.fallbacks.push((config, client));
        self
    }

    /// Build from `[model]` and `[[fallback_models]]`. `connect` opens a
    /// transport for each model. Without `[model.retry]` the primary is
    /// tried once.
    pub fn from_config(
        config: &EngineConfig,
        connect: impl Fn(&ModelConfig) -> Arc<dyn LlmClient>,
    ) -> Self {
        let retry_config = config.model.retry.clone().unwrap_or(RetryConfig {
            max_retries: 0,
            ..RetryConfig::default()
        });
        let client = Self::new(connect(&config.model), retry_config);
        config
            .fallback_models
            .iter()
            .fold(client, |client, model| client.with_fallback(model.clone(), connect(model)))
    }
}

/// Transient transport failures worth another attempt.
pub fn is_retryable(e: &WeftError) -> bool {
    match e {
        WeftError::LlmRequest(msg) => {
            let msg = msg.to_ascii_lowercase();
            ["429", "500", "502", "503", "529", "overloaded", "timeout", "connection"]
                .iter()
                .any(|needle| msg.contains(needle))
        }
        WeftError::LlmStream(_) => true,
        _ => false,
    }
}

fn backoff_for(attempt: u32, config: &RetryConfig) -> Duration {
    let base = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((base as f64 * jitter) as u64)
}

impl LlmClient for RetryingClient {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        let config = config.clone();
        let tools = tools.to_vec();

        Box::pin(async move {
            let max_retries = self.retry_config.max_retries;
            let mut last_err = None;

            for attempt in 0..=max_retries {
                match self
                    .primary
                    .chat_stream(&config, messages.clone(), &tools)
                    .await
                {
                    Ok(stream) => return Ok(stream),
                    Err(e) if is_retryable(&e) && attempt < max_retries => {
                        let backoff = backoff_for(attempt, &self.retry_config);
                        warn!(
                            attempt = attempt + 1,
                            max_retries,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Retrying oracle request"
                        );
                        tokio::time::sleep(backoff).await;
                        last_err = Some(e);
                    }
                    Err(e) => {
                        last_err = Some(e);
                        break;
                    }
                }
            }

            if !self.fallbacks.is_empty() {
                info!("Primary oracle exhausted, trying fallbacks");
            }
            for (fb_config, fb_client) in &self.fallbacks {
                match fb_client
                    .chat_stream(fb_config, messages.clone(), &tools)
                    .await
                {
                    Ok(stream) => {
                        info!(model = %fb_config.model_id, "Fell back to alternative oracle");
                        return Ok(stream);
                    }
                    Err(e) => {
                        warn!(model = %fb_config.model_id, error = %e, "Fallback oracle failed");
                        last_err = Some(e);
                    }
                }
            }

            Err(last_err.unwrap_or_else(|| WeftError::LlmRequest("all oracles failed".into())))
        })
    }
}
