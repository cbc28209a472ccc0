//! Lifecycle reporter that logs through `tracing`.

use async_trait::async_trait;
use kiln_core::error::KilnError;
use kiln_core::lifecycle::{BatchDescriptor, LifecycleReporter, RunHandle, RunOutput};
use kiln_core::types::GenerationChunk;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Emits one `tracing` event per lifecycle call.
///
/// Run starts and ends are logged at `info`, failures at `warn` and tokens
/// at `trace`.
#[derive(Debug, Clone, Default)]
pub struct TracingReporter {
    tokens: bool,
}

impl TracingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request incremental tokens. Single-conversation calls then stream.
    pub fn with_tokens(mut self, tokens: bool) -> Self {
        self.tokens = tokens;
        self
    }
}

#[async_trait]
impl LifecycleReporter for TracingReporter {
    fn name(&self) -> &str {
        "tracing"
    }

    fn prefers_streaming(&self) -> bool {
        self.tokens
    }

    async fn start(&self, batch: &BatchDescriptor) -> Result<Vec<Box<dyn RunHandle>>, KilnError> {
        let provider: Arc<str> = Arc::from(batch.provider.id.as_str());
        let started = Instant::now();
        Ok(batch
            .run_ids
            .iter()
            .zip(&batch.prompts)
            .enumerate()
            .map(|(index, (&run_id, prompt))| {
                tracing::info!(
                    %run_id,
                    provider = %provider,
                    index,
                    batch_size = batch.batch_size(),
                    messages = prompt.len(),
                    run_name = batch.run_name.as_deref().unwrap_or(""),
                    "run started"
                );
                Box::new(TracingHandle {
                    run_id,
                    index,
                    provider: provider.clone(),
                    started,
                }) as Box<dyn RunHandle>
            })
            .collect())
    }
}

#[derive(Debug)]
struct TracingHandle {
    run_id: Uuid,
    index: usize,
    provider: Arc<str>,
    started: Instant,
}

#[async_trait]
impl RunHandle for TracingHandle {
    fn run_id(&self) -> Uuid {
        self.run_id
    }

    async fn new_token(&self, token: &str, _chunk: Option<&GenerationChunk>) {
        tracing::trace!(run_id = %self.run_id, token, "run token");
    }

    async fn end(self: Box<Self>, output: &RunOutput) {
        tracing::info!(
            run_id = %self.run_id,
            provider = %self.provider,
            index = self.index,
            generations = output.generations.len(),
            cached = output.cached,
            elapsed = ?self.started.elapsed(),
            "run finished"
        );
    }

    async fn error(self: Box<Self>, error: &KilnError) {
        tracing::warn!(
            run_id = %self.run_id,
            provider = %self.provider,
            index = self.index,
            cancelled = error.is_cancellation(),
            error = %error,
            elapsed = ?self.started.elapsed(),
            "run failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::testing::FakeChatProvider;
    use kiln_core::{ChatModel, LanguageModelInput, RunConfig};

    #[tokio::test]
    async fn test_tracing_reporter_covers_every_run() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .try_init();

        let provider = FakeChatProvider::new().fail("bad", "nope");
        let model = ChatModel::builder(provider)
            .reporter(Arc::new(TracingReporter::new()))
            .finish();

        let inputs = vec![LanguageModelInput::from("good"), LanguageModelInput::from("bad")];
        let err = model
            .generate(inputs, RunConfig::default().with_run_name("smoke"))
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::Provider(_)));
    }

    #[test]
    fn test_token_preference() {
        assert!(!TracingReporter::new().prefers_streaming());
        assert!(TracingReporter::new().with_tokens(true).prefers_streaming());
    }
}
