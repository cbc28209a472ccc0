//! Run lifecycle reporting.
//!
//! Every batch call starts exactly one lifecycle covering all of its
//! conversations. The reporter hands back one [`RunHandle`] per
//! conversation, and each handle receives exactly one terminal call:
//! [`RunHandle::end`] or [`RunHandle::error`]. Both consume the handle, so a
//! handle cannot be finished twice.

use crate::error::KilnError;
use crate::types::*;
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;
use uuid::Uuid;

/// Everything a reporter learns when a batch starts
#[derive(Debug, Clone)]
pub struct BatchDescriptor {
    pub provider: Arc<ProviderInfo>,
    /// Coerced conversations, in batch order
    pub prompts: Vec<Vec<Message>>,
    /// Run id allocated for each conversation, in batch order
    pub run_ids: Vec<Uuid>,
    pub invocation_params: Value,
    pub options: CallOptions,
    pub run_name: Option<String>,
    pub metadata: Metadata,
}

impl BatchDescriptor {
    pub fn batch_size(&self) -> usize {
        self.prompts.len()
    }
}

/// Successful outcome handed to [`RunHandle::end`]
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutput {
    pub generations: Vec<Generation>,
    pub llm_output: Option<Metadata>,
    /// Served from the cache rather than the provider
    pub cached: bool,
}

/// Per-conversation lifecycle handle.
#[async_trait]
pub trait RunHandle: Send + Sync + Debug {
    /// Run id this handle reports for
    fn run_id(&self) -> Uuid;

    /// Called for each streamed token, in arrival order
    async fn new_token(&self, _token: &str, _chunk: Option<&GenerationChunk>) {}

    /// Terminal call on success
    async fn end(self: Box<Self>, output: &RunOutput);

    /// Terminal call on failure
    async fn error(self: Box<Self>, error: &KilnError);
}

/// Observability collaborator notified around every batch.
#[async_trait]
pub trait LifecycleReporter: Send + Sync + Debug + 'static {
    /// Reporter name
    fn name(&self) -> &str;

    /// Whether this reporter wants incremental tokens. When it does, a
    /// single-conversation call is executed through the streaming path.
    fn prefers_streaming(&self) -> bool {
        false
    }

    /// Start a batch. Must return one handle per conversation, in order,
    /// using the run ids from the descriptor.
    async fn start(&self, batch: &BatchDescriptor) -> Result<Vec<Box<dyn RunHandle>>, KilnError>;
}

/// Lifecycle fan-out over any number of reporters.
#[derive(Debug, Clone, Default)]
pub struct LifecycleManager {
    reporters: Vec<Arc<dyn LifecycleReporter>>,
}

impl LifecycleManager {
    /// Create a new lifecycle manager
    pub fn new(reporters: Vec<Arc<dyn LifecycleReporter>>) -> Self {
        Self { reporters }
    }

    /// True if any reporter wants incremental tokens
    pub fn prefers_streaming(&self) -> bool {
        self.reporters.iter().any(|r| r.prefers_streaming())
    }

    /// Start the batch on every reporter and merge their handles per
    /// conversation.
    ///
    /// If any reporter fails to start, the handles already created by the
    /// others are finished with that error before it is returned.
    pub async fn start(&self, batch: &BatchDescriptor) -> Result<Vec<Box<dyn RunHandle>>, KilnError> {
        if self.reporters.is_empty() {
            return Ok(batch
                .run_ids
                .iter()
                .map(|&run_id| Box::new(NoopHandle { run_id }) as Box<dyn RunHandle>)
                .collect());
        }

        let started = join_all(self.reporters.iter().map(|r| async move {
            let handles = r.start(batch).await?;
            if handles.len() != batch.batch_size() {
                let err = KilnError::lifecycle(format!(
                    "reporter {} returned {} handles for a batch of {}",
                    r.name(),
                    handles.len(),
                    batch.batch_size()
                ));
                fail_all(handles, &err).await;
                return Err(err);
            }
            Ok(handles)
        }))
        .await;

        let mut per_reporter = Vec::with_capacity(started.len());
        let mut first_error = None;
        for result in started {
            match result {
                Ok(handles) => per_reporter.push(handles),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        if let Some(err) = first_error {
            for handles in per_reporter {
                fail_all(handles, &err).await;
            }
            return Err(err);
        }

        if per_reporter.len() == 1 {
            return Ok(per_reporter.pop().unwrap_or_default());
        }

        let mut columns: Vec<Vec<Box<dyn RunHandle>>> =
            batch.run_ids.iter().map(|_| Vec::new()).collect();
        for handles in per_reporter {
            for (index, handle) in handles.into_iter().enumerate() {
                columns[index].push(handle);
            }
        }
        Ok(batch
            .run_ids
            .iter()
            .zip(columns)
            .map(|(&run_id, inner)| Box::new(CompositeHandle { run_id, inner }) as Box<dyn RunHandle>)
            .collect())
    }
}

async fn fail_all(handles: Vec<Box<dyn RunHandle>>, err: &KilnError) {
    join_all(handles.into_iter().map(|h| h.error(err))).await;
}

/// Handle used when nobody is listening
#[derive(Debug)]
struct NoopHandle {
    run_id: Uuid,
}

#[async_trait]
impl RunHandle for NoopHandle {
    fn run_id(&self) -> Uuid {
        self.run_id
    }

    async fn end(self: Box<Self>, _output: &RunOutput) {}

    async fn error(self: Box<Self>, _error: &KilnError) {}
}

/// One conversation's handles from several reporters
#[derive(Debug)]
struct CompositeHandle {
    run_id: Uuid,
    inner: Vec<Box<dyn RunHandle>>,
}

#[async_trait]
impl RunHandle for CompositeHandle {
    fn run_id(&self) -> Uuid {
        self.run_id
    }

    async fn new_token(&self, token: &str, chunk: Option<&GenerationChunk>) {
        join_all(self.inner.iter().map(|h| h.new_token(token, chunk))).await;
    }

    async fn end(self: Box<Self>, output: &RunOutput) {
        join_all(self.inner.into_iter().map(|h| h.end(output))).await;
    }

    async fn error(self: Box<Self>, error: &KilnError) {
        join_all(self.inner.into_iter().map(|h| h.error(error))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordedEvent, RecordingReporter};

    fn descriptor(size: usize) -> BatchDescriptor {
        BatchDescriptor {
            provider: ProviderInfo::new("fake", "Fake"),
            prompts: (0..size).map(|i| vec![Message::human(format!("p{}", i))]).collect(),
            run_ids: (0..size).map(|_| Uuid::new_v4()).collect(),
            invocation_params: Value::Null,
            options: CallOptions::default(),
            run_name: None,
            metadata: Metadata::new(),
        }
    }

    #[derive(Debug)]
    struct ShortReporter;

    #[async_trait]
    impl LifecycleReporter for ShortReporter {
        fn name(&self) -> &str {
            "short"
        }

        async fn start(&self, _batch: &BatchDescriptor) -> Result<Vec<Box<dyn RunHandle>>, KilnError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_no_reporters_still_yields_run_ids() {
        let batch = descriptor(3);
        let handles = LifecycleManager::default().start(&batch).await.unwrap();
        let ids: Vec<Uuid> = handles.iter().map(|h| h.run_id()).collect();
        assert_eq!(ids, batch.run_ids);
    }

    #[tokio::test]
    async fn test_composite_fans_out_terminal_calls() {
        let first = Arc::new(RecordingReporter::new());
        let second = Arc::new(RecordingReporter::new().with_streaming(true));
        let manager = LifecycleManager::new(vec![first.clone(), second.clone()]);
        assert!(manager.prefers_streaming());

        let batch = descriptor(2);
        let mut handles = manager.start(&batch).await.unwrap();
        let last = handles.pop().unwrap();
        let head = handles.pop().unwrap();
        head.new_token("tok", None).await;
        head.end(&RunOutput {
            generations: vec![Generation::new(Message::ai("tok"))],
            llm_output: None,
            cached: false,
        })
        .await;
        last.error(&KilnError::Cancelled).await;

        for reporter in [&first, &second] {
            assert_eq!(reporter.starts(), 1);
            assert_eq!(reporter.tokens(0), vec!["tok".to_string()]);
            assert!(matches!(reporter.terminal(0), Some(RecordedEvent::End { .. })));
            assert!(matches!(reporter.terminal(1), Some(RecordedEvent::Error { .. })));
        }
    }

    #[tokio::test]
    async fn test_start_length_mismatch_fails_and_closes_other_handles() {
        let recording = Arc::new(RecordingReporter::new());
        let manager = LifecycleManager::new(vec![recording.clone(), Arc::new(ShortReporter)]);

        let err = manager.start(&descriptor(2)).await.unwrap_err();
        assert!(matches!(err, KilnError::Lifecycle(_)));
        assert!(matches!(recording.terminal(0), Some(RecordedEvent::Error { .. })));
        assert!(matches!(recording.terminal(1), Some(RecordedEvent::Error { .. })));
    }
}
