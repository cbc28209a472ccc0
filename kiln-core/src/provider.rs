//! Provider trait and core abstractions.

use crate::error::KilnError;
use crate::types::*;
use async_trait::async_trait;
use futures::Stream;
use std::fmt::Debug;
use std::sync::Arc;

/// Stream type alias for generation chunks
pub type ChunkStream = dyn Stream<Item = Result<GenerationChunk, KilnError>> + Send + Unpin;

/// Core provider trait for text-generation backends.
///
/// A provider completes one conversation at a time. Batching, caching,
/// lifecycle reporting and structured output are handled by the runtime
/// on top of this interface.
#[async_trait]
pub trait ChatProvider: Send + Sync + Debug + 'static {
    /// Get provider information
    fn info(&self) -> Arc<ProviderInfo>;

    /// Declared capabilities. The runtime never probes for them.
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Provider-level parameters for this call (model name, sampling
    /// settings, ...). They become part of the cache fingerprint.
    fn invocation_params(&self, _options: &CallOptions) -> serde_json::Value {
        serde_json::Value::Object(Metadata::new())
    }

    /// Complete one conversation
    async fn generate(
        &self,
        messages: &[Message],
        options: &CallOptions,
    ) -> Result<ChatResult, KilnError>;

    /// Stream one conversation as incremental chunks.
    ///
    /// Only called when [`Capabilities::streaming`] is declared. Each call
    /// returns a fresh, finite stream.
    async fn stream(
        &self,
        _messages: &[Message],
        _options: &CallOptions,
    ) -> Result<Box<ChunkStream>, KilnError> {
        Err(KilnError::unsupported(format!(
            "{} does not support streaming",
            self.info().name
        )))
    }

    /// Combine the provider-level outputs of a batch into one
    fn combine_llm_output(&self, _outputs: &[Metadata]) -> Option<Metadata> {
        None
    }
}

#[async_trait]
impl<P: ChatProvider + ?Sized> ChatProvider for Arc<P> {
    fn info(&self) -> Arc<ProviderInfo> {
        (**self).info()
    }

    fn capabilities(&self) -> Capabilities {
        (**self).capabilities()
    }

    fn invocation_params(&self, options: &CallOptions) -> serde_json::Value {
        (**self).invocation_params(options)
    }

    async fn generate(
        &self,
        messages: &[Message],
        options: &CallOptions,
    ) -> Result<ChatResult, KilnError> {
        (**self).generate(messages, options).await
    }

    async fn stream(
        &self,
        messages: &[Message],
        options: &CallOptions,
    ) -> Result<Box<ChunkStream>, KilnError> {
        (**self).stream(messages, options).await
    }

    fn combine_llm_output(&self, outputs: &[Metadata]) -> Option<Metadata> {
        (**self).combine_llm_output(outputs)
    }
}

/// Helper function to fold a chunk stream into a single generation
pub async fn collect_chunk_stream(mut stream: Box<ChunkStream>) -> Result<Generation, KilnError> {
    use futures::StreamExt;

    let mut aggregate: Option<GenerationChunk> = None;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        aggregate = Some(match aggregate {
            None => chunk,
            Some(aggregate) => aggregate.concat(chunk),
        });
    }

    aggregate.map(Generation::from).ok_or(KilnError::EmptyStream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_collect_chunk_stream() {
        let chunks: Vec<Result<GenerationChunk, KilnError>> = vec![
            Ok(GenerationChunk::new(MessageChunk::ai("Hello"))),
            Ok(GenerationChunk::new(MessageChunk::ai(", world"))),
        ];
        let stream: Box<ChunkStream> = Box::new(futures::stream::iter(chunks));
        let generation = collect_chunk_stream(stream).await.unwrap();
        assert_eq!(generation.text, "Hello, world");
        assert_eq!(generation.message.role, Role::Ai);
    }

    #[tokio::test]
    async fn test_collect_empty_stream() {
        let stream: Box<ChunkStream> = Box::new(futures::stream::iter(Vec::<Result<GenerationChunk, KilnError>>::new()));
        assert!(matches!(
            collect_chunk_stream(stream).await,
            Err(KilnError::EmptyStream)
        ));
    }
}
