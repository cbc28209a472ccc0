//! Test doubles for providers and lifecycle reporters.
//!
//! Enabled for this crate's own tests and, for downstream crates, through the
//! `testing` feature.

use crate::error::KilnError;
use crate::lifecycle::{BatchDescriptor, LifecycleReporter, RunHandle, RunOutput};
use crate::provider::{ChatProvider, ChunkStream};
use crate::types::*;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
enum Rule {
    Reply(Message),
    Fail(String),
}

type CompletionHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Scripted provider.
///
/// Replies are keyed by the text of the last message in the conversation.
/// Unscripted prompts are echoed back as an AI message. Clones share their
/// call counters.
#[derive(Clone)]
pub struct FakeChatProvider {
    info: Arc<ProviderInfo>,
    capabilities: Capabilities,
    rules: Vec<(String, Rule)>,
    default_reply: Option<Message>,
    delays: Vec<(String, Duration)>,
    chunks: Option<Vec<Result<GenerationChunk, String>>>,
    chunk_delay: Option<Duration>,
    llm_output: Option<Metadata>,
    calls: Arc<AtomicUsize>,
    stream_calls: Arc<AtomicUsize>,
    last_options: Arc<Mutex<Option<CallOptions>>>,
    on_complete: Option<CompletionHook>,
}

impl fmt::Debug for FakeChatProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeChatProvider")
            .field("info", &self.info)
            .field("capabilities", &self.capabilities)
            .field("rules", &self.rules.len())
            .field("calls", &self.calls())
            .finish()
    }
}

impl Default for FakeChatProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeChatProvider {
    /// A provider that supports tool calling but not streaming
    pub fn new() -> Self {
        Self {
            info: ProviderInfo::new("fake", "Fake"),
            capabilities: Capabilities::default()
                .with_tool_calling(true)
                .with_tool_choice(true),
            rules: Vec::new(),
            default_reply: None,
            delays: Vec::new(),
            chunks: None,
            chunk_delay: None,
            llm_output: None,
            calls: Arc::new(AtomicUsize::new(0)),
            stream_calls: Arc::new(AtomicUsize::new(0)),
            last_options: Arc::new(Mutex::new(None)),
            on_complete: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Declare streaming support
    pub fn streaming(mut self) -> Self {
        self.capabilities.streaming = true;
        self
    }

    /// Reply with `message` when the conversation ends with `prompt`
    pub fn reply(mut self, prompt: impl Into<String>, message: Message) -> Self {
        self.rules.push((prompt.into(), Rule::Reply(message)));
        self
    }

    /// Reply with `message` to every unscripted prompt
    pub fn reply_all(mut self, message: Message) -> Self {
        self.default_reply = Some(message);
        self
    }

    /// Fail with a provider error when the conversation ends with `prompt`
    pub fn fail(mut self, prompt: impl Into<String>, error: impl Into<String>) -> Self {
        self.rules.push((prompt.into(), Rule::Fail(error.into())));
        self
    }

    /// Sleep before answering `prompt`
    pub fn delay(mut self, prompt: impl Into<String>, delay: Duration) -> Self {
        self.delays.push((prompt.into(), delay));
        self
    }

    /// Script the chunks returned by `stream`. `Err` entries become stream errors.
    pub fn with_chunks(mut self, chunks: Vec<Result<GenerationChunk, String>>) -> Self {
        self.chunks = Some(chunks);
        self
    }

    /// Sleep before each streamed chunk
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Provider-level output attached to every result
    pub fn with_llm_output(mut self, llm_output: Metadata) -> Self {
        self.llm_output = Some(llm_output);
        self
    }

    /// Call `hook` with the prompt after each `generate` finishes
    pub fn on_complete(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(hook));
        self
    }

    /// Number of `generate` calls so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of `stream` calls so far
    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    /// Options passed to the most recent call
    pub fn last_options(&self) -> Option<CallOptions> {
        lock(&self.last_options).clone()
    }

    fn prompt(messages: &[Message]) -> String {
        messages.last().map(Message::text).unwrap_or_default()
    }

    fn delay_for(&self, prompt: &str) -> Option<Duration> {
        self.delays
            .iter()
            .find(|(key, _)| key == prompt)
            .map(|(_, delay)| *delay)
    }

    fn answer(&self, prompt: &str) -> Result<Message, KilnError> {
        match self.rules.iter().find(|(key, _)| key == prompt) {
            Some((_, Rule::Reply(message))) => Ok(message.clone()),
            Some((_, Rule::Fail(error))) => Err(KilnError::provider(error.clone())),
            None => Ok(self
                .default_reply
                .clone()
                .unwrap_or_else(|| Message::ai(prompt))),
        }
    }
}

#[async_trait]
impl ChatProvider for FakeChatProvider {
    fn info(&self) -> Arc<ProviderInfo> {
        self.info.clone()
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn invocation_params(&self, _options: &CallOptions) -> serde_json::Value {
        serde_json::json!({ "model": "fake-model" })
    }

    async fn generate(&self, messages: &[Message], options: &CallOptions) -> Result<ChatResult, KilnError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *lock(&self.last_options) = Some(options.clone());

        let prompt = Self::prompt(messages);
        if let Some(delay) = self.delay_for(&prompt) {
            tokio::time::sleep(delay).await;
        }

        let result = self.answer(&prompt).map(|message| {
            let result = ChatResult::single(message);
            match &self.llm_output {
                Some(llm_output) => result.with_llm_output(llm_output.clone()),
                None => result,
            }
        });
        if let Some(hook) = &self.on_complete {
            (**hook)(&prompt);
        }
        result
    }

    async fn stream(&self, messages: &[Message], options: &CallOptions) -> Result<Box<ChunkStream>, KilnError> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        *lock(&self.last_options) = Some(options.clone());

        let prompt = Self::prompt(messages);
        let chunks = match &self.chunks {
            Some(chunks) => chunks.clone(),
            None => {
                let message = self.answer(&prompt)?;
                vec![Ok(GenerationChunk::new(MessageChunk::from(message)))]
            }
        };
        let delay = self.chunk_delay;

        let stream = async_stream::stream! {
            for chunk in chunks {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                yield chunk.map_err(KilnError::stream);
            }
        };
        Ok(Box::new(Box::pin(stream)))
    }

    fn combine_llm_output(&self, outputs: &[Metadata]) -> Option<Metadata> {
        outputs.last().cloned()
    }
}

/// A lifecycle call observed by [`RecordingReporter`]
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedEvent {
    Start {
        batch: usize,
        run_ids: Vec<Uuid>,
        run_name: Option<String>,
    },
    Token {
        batch: usize,
        index: usize,
        token: String,
    },
    End {
        batch: usize,
        index: usize,
        output: RunOutput,
    },
    Error {
        batch: usize,
        index: usize,
        message: String,
        cancellation: bool,
    },
}

impl RecordedEvent {
    fn position(&self) -> Option<(usize, usize)> {
        match self {
            RecordedEvent::Start { .. } => None,
            RecordedEvent::Token { batch, index, .. }
            | RecordedEvent::End { batch, index, .. }
            | RecordedEvent::Error { batch, index, .. } => Some((*batch, *index)),
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, RecordedEvent::End { .. } | RecordedEvent::Error { .. })
    }
}

/// Reporter that keeps every lifecycle call in memory.
///
/// Per-index accessors look at the most recent batch.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    streaming: bool,
    events: Arc<Mutex<Vec<RecordedEvent>>>,
    batches: AtomicUsize,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    /// Every recorded event, in call order
    pub fn events(&self) -> Vec<RecordedEvent> {
        lock(&self.events).clone()
    }

    /// Number of `start` calls
    pub fn starts(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    /// Run ids of the most recent batch
    pub fn run_ids(&self) -> Vec<Uuid> {
        self.events()
            .into_iter()
            .rev()
            .find_map(|event| match event {
                RecordedEvent::Start { run_ids, .. } => Some(run_ids),
                _ => None,
            })
            .unwrap_or_default()
    }

    fn for_index(&self, index: usize) -> Vec<RecordedEvent> {
        let batch = self.starts().saturating_sub(1);
        self.events()
            .into_iter()
            .filter(|event| event.position() == Some((batch, index)))
            .collect()
    }

    /// Tokens received by conversation `index`
    pub fn tokens(&self, index: usize) -> Vec<String> {
        self.for_index(index)
            .into_iter()
            .filter_map(|event| match event {
                RecordedEvent::Token { token, .. } => Some(token),
                _ => None,
            })
            .collect()
    }

    /// Last terminal call for conversation `index`
    pub fn terminal(&self, index: usize) -> Option<RecordedEvent> {
        self.for_index(index)
            .into_iter()
            .filter(RecordedEvent::is_terminal)
            .last()
    }

    /// Number of terminal calls for conversation `index`
    pub fn terminal_count(&self, index: usize) -> usize {
        self.for_index(index)
            .iter()
            .filter(|event| event.is_terminal())
            .count()
    }
}

#[async_trait]
impl LifecycleReporter for RecordingReporter {
    fn name(&self) -> &str {
        "recording"
    }

    fn prefers_streaming(&self) -> bool {
        self.streaming
    }

    async fn start(&self, batch: &BatchDescriptor) -> Result<Vec<Box<dyn RunHandle>>, KilnError> {
        let number = self.batches.fetch_add(1, Ordering::SeqCst);
        lock(&self.events).push(RecordedEvent::Start {
            batch: number,
            run_ids: batch.run_ids.clone(),
            run_name: batch.run_name.clone(),
        });
        Ok(batch
            .run_ids
            .iter()
            .enumerate()
            .map(|(index, &run_id)| {
                Box::new(RecordingHandle {
                    batch: number,
                    index,
                    run_id,
                    events: self.events.clone(),
                }) as Box<dyn RunHandle>
            })
            .collect())
    }
}

#[derive(Debug)]
struct RecordingHandle {
    batch: usize,
    index: usize,
    run_id: Uuid,
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

#[async_trait]
impl RunHandle for RecordingHandle {
    fn run_id(&self) -> Uuid {
        self.run_id
    }

    async fn new_token(&self, token: &str, _chunk: Option<&GenerationChunk>) {
        lock(&self.events).push(RecordedEvent::Token {
            batch: self.batch,
            index: self.index,
            token: token.to_string(),
        });
    }

    async fn end(self: Box<Self>, output: &RunOutput) {
        lock(&self.events).push(RecordedEvent::End {
            batch: self.batch,
            index: self.index,
            output: output.clone(),
        });
    }

    async fn error(self: Box<Self>, error: &KilnError) {
        lock(&self.events).push(RecordedEvent::Error {
            batch: self.batch,
            index: self.index,
            message: error.to_string(),
            cancellation: error.is_cancellation(),
        });
    }
}
