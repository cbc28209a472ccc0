//! Lifecycle reporter that forwards events to a stream.

use async_trait::async_trait;
use kiln_core::error::KilnError;
use kiln_core::lifecycle::{BatchDescriptor, LifecycleReporter, RunHandle, RunOutput};
use kiln_core::types::{GenerationChunk, Message};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

/// A lifecycle call, as delivered by [`ChannelReporter`]
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Start {
        run_id: Uuid,
        index: usize,
        provider: String,
        run_name: Option<String>,
        prompt: Vec<Message>,
    },
    Token {
        run_id: Uuid,
        token: String,
    },
    End {
        run_id: Uuid,
        output: RunOutput,
    },
    Error {
        run_id: Uuid,
        error: String,
        cancelled: bool,
    },
}

impl LifecycleEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            LifecycleEvent::Start { run_id, .. }
            | LifecycleEvent::Token { run_id, .. }
            | LifecycleEvent::End { run_id, .. }
            | LifecycleEvent::Error { run_id, .. } => *run_id,
        }
    }
}

/// Sends every lifecycle call over an unbounded channel.
///
/// Events for a run arrive in call order. Once the receiving stream is
/// dropped, events are discarded.
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    sender: mpsc::UnboundedSender<LifecycleEvent>,
    streaming: bool,
}

impl ChannelReporter {
    /// Create a reporter and the stream its events are delivered to
    pub fn new() -> (Self, UnboundedReceiverStream<LifecycleEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender,
                streaming: false,
            },
            UnboundedReceiverStream::new(receiver),
        )
    }

    /// Request incremental tokens
    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    fn send(sender: &mpsc::UnboundedSender<LifecycleEvent>, event: LifecycleEvent) {
        if sender.send(event).is_err() {
            tracing::trace!("lifecycle event dropped, receiver closed");
        }
    }
}

#[async_trait]
impl LifecycleReporter for ChannelReporter {
    fn name(&self) -> &str {
        "channel"
    }

    fn prefers_streaming(&self) -> bool {
        self.streaming
    }

    async fn start(&self, batch: &BatchDescriptor) -> Result<Vec<Box<dyn RunHandle>>, KilnError> {
        Ok(batch
            .run_ids
            .iter()
            .zip(&batch.prompts)
            .enumerate()
            .map(|(index, (&run_id, prompt))| {
                Self::send(
                    &self.sender,
                    LifecycleEvent::Start {
                        run_id,
                        index,
                        provider: batch.provider.id.clone(),
                        run_name: batch.run_name.clone(),
                        prompt: prompt.clone(),
                    },
                );
                Box::new(ChannelHandle {
                    run_id,
                    sender: self.sender.clone(),
                }) as Box<dyn RunHandle>
            })
            .collect())
    }
}

#[derive(Debug)]
struct ChannelHandle {
    run_id: Uuid,
    sender: mpsc::UnboundedSender<LifecycleEvent>,
}

#[async_trait]
impl RunHandle for ChannelHandle {
    fn run_id(&self) -> Uuid {
        self.run_id
    }

    async fn new_token(&self, token: &str, _chunk: Option<&GenerationChunk>) {
        ChannelReporter::send(
            &self.sender,
            LifecycleEvent::Token {
                run_id: self.run_id,
                token: token.to_string(),
            },
        );
    }

    async fn end(self: Box<Self>, output: &RunOutput) {
        ChannelReporter::send(
            &self.sender,
            LifecycleEvent::End {
                run_id: self.run_id,
                output: output.clone(),
            },
        );
    }

    async fn error(self: Box<Self>, error: &KilnError) {
        ChannelReporter::send(
            &self.sender,
            LifecycleEvent::Error {
                run_id: self.run_id,
                error: error.to_string(),
                cancelled: error.is_cancellation(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use kiln_core::testing::FakeChatProvider;
    use kiln_core::types::{GenerationChunk, MessageChunk};
    use kiln_core::{ChatModel, InMemoryCache, LanguageModelInput, RunConfig};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_events_follow_the_batch() {
        let (reporter, events) = ChannelReporter::new();
        let model = ChatModel::builder(FakeChatProvider::new())
            .reporter(Arc::new(reporter))
            .finish();

        let result = model
            .generate(
                vec![LanguageModelInput::from("a"), LanguageModelInput::from("b")],
                RunConfig::default(),
            )
            .await
            .unwrap();
        drop(model);

        let events: Vec<LifecycleEvent> = events.collect().await;
        assert_eq!(events.len(), 4);
        assert!(matches!(events[0], LifecycleEvent::Start { index: 0, .. }));
        assert!(matches!(events[1], LifecycleEvent::Start { index: 1, .. }));
        assert_eq!(events[0].run_id(), result.run_ids[0]);
        let ended: Vec<Uuid> = events[2..].iter().map(LifecycleEvent::run_id).collect();
        assert_eq!(ended, result.run_ids);
    }

    #[tokio::test]
    async fn test_cached_runs_emit_token_then_end() {
        let (reporter, mut events) = ChannelReporter::new();
        let model = ChatModel::builder(FakeChatProvider::new())
            .cache(Arc::new(InMemoryCache::new()))
            .reporter(Arc::new(reporter))
            .finish();

        model.invoke("same", RunConfig::default()).await.unwrap();
        model.invoke("same", RunConfig::default()).await.unwrap();
        drop(model);

        let mut tail = Vec::new();
        while let Some(event) = events.next().await {
            tail.push(event);
        }
        let second = &tail[2..];
        assert!(matches!(second[0], LifecycleEvent::Start { .. }));
        assert!(matches!(&second[1], LifecycleEvent::Token { token, .. } if token == "same"));
        assert!(matches!(&second[2], LifecycleEvent::End { output, .. } if output.cached));
    }

    #[tokio::test]
    async fn test_streaming_preference_forwards_tokens() {
        let chunk = |text: &str| Ok(GenerationChunk::new(MessageChunk::ai(text)));
        let provider = FakeChatProvider::new()
            .streaming()
            .with_chunks(vec![chunk("x"), chunk("y")]);
        let (reporter, events) = ChannelReporter::new();
        let model = ChatModel::builder(provider)
            .reporter(Arc::new(reporter.with_streaming(true)))
            .finish();

        let message = model.invoke("go", RunConfig::default()).await.unwrap();
        assert_eq!(message.text(), "xy");
        drop(model);

        let tokens: Vec<String> = events
            .filter_map(|event| async move {
                match event {
                    LifecycleEvent::Token { token, .. } => Some(token),
                    _ => None,
                }
            })
            .collect()
            .await;
        assert_eq!(tokens, vec!["x", "y"]);
    }
}
