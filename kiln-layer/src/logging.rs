//! Logging layer for provider operations.

use futures::StreamExt;
use kiln_core::error::KilnError;
use kiln_core::layer::{Layer, LayeredProvider};
use kiln_core::provider::{ChatProvider, ChunkStream};
use kiln_core::types::*;
use async_trait::async_trait;

/// Logging layer that logs provider operations.
#[derive(Debug, Clone)]
pub struct LoggingLayer {
    prefix: String,
}

impl LoggingLayer {
    /// Create a new logging layer
    pub fn new() -> Self {
        Self {
            prefix: "[Kiln]".to_string(),
        }
    }

    /// Create a logging layer with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for LoggingLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: ChatProvider> Layer<P> for LoggingLayer {
    type LayeredProvider = LoggingProvider<P>;

    fn layer(&self, inner: P) -> Self::LayeredProvider {
        LoggingProvider {
            inner,
            prefix: self.prefix.clone(),
        }
    }
}

/// Provider wrapped with logging
#[derive(Debug)]
pub struct LoggingProvider<P> {
    inner: P,
    prefix: String,
}

fn total_tokens(result: &ChatResult) -> u32 {
    result
        .generations
        .iter()
        .filter_map(|generation| generation.message.usage)
        .map(|usage| usage.total_tokens)
        .sum()
}

#[async_trait]
impl<P: ChatProvider> LayeredProvider for LoggingProvider<P> {
    type Inner = P;

    fn inner(&self) -> &Self::Inner {
        &self.inner
    }

    async fn layered_generate(
        &self,
        messages: &[Message],
        options: &CallOptions,
    ) -> Result<ChatResult, KilnError> {
        tracing::debug!(
            "{} generate request: provider={}, messages={}, tools={}",
            self.prefix,
            self.inner.info().id,
            messages.len(),
            options.tools.len()
        );

        let start = std::time::Instant::now();
        let result = self.inner.generate(messages, options).await;
        let elapsed = start.elapsed();

        match &result {
            Ok(response) => {
                tracing::debug!(
                    "{} generate success: generations={}, tokens={}, elapsed={:?}",
                    self.prefix,
                    response.generations.len(),
                    total_tokens(response),
                    elapsed
                );
            }
            Err(e) => {
                tracing::error!(
                    "{} generate error: {:?}, elapsed={:?}",
                    self.prefix,
                    e,
                    elapsed
                );
            }
        }

        result
    }

    async fn layered_stream(
        &self,
        messages: &[Message],
        options: &CallOptions,
    ) -> Result<Box<ChunkStream>, KilnError> {
        tracing::debug!(
            "{} stream request: provider={}, messages={}",
            self.prefix,
            self.inner.info().id,
            messages.len()
        );

        let start = std::time::Instant::now();
        let mut inner = match self.inner.stream(messages, options).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(
                    "{} stream error: {:?}, elapsed={:?}",
                    self.prefix,
                    e,
                    start.elapsed()
                );
                return Err(e);
            }
        };

        let prefix = self.prefix.clone();
        let stream = async_stream::stream! {
            let mut chunks = 0usize;
            while let Some(item) = inner.next().await {
                match &item {
                    Ok(_) => chunks += 1,
                    Err(e) => tracing::error!("{} stream chunk error: {:?}", prefix, e),
                }
                yield item;
            }
            tracing::debug!(
                "{} stream finished: chunks={}, elapsed={:?}",
                prefix,
                chunks,
                start.elapsed()
            );
        };
        Ok(Box::new(Box::pin(stream)))
    }
}

kiln_core::impl_layered_provider!(LoggingProvider<P>, [P: ChatProvider]);
