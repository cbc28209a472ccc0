//! GenerationExecutor implementation.
//!
//! Runs the provider across the conversations that missed the cache. Each
//! conversation fails on its own: the executor always waits for every call,
//! finishes every handle, and hands back one outcome per job.

use super::signal::CallSignal;
use crate::error::KilnError;
use crate::lifecycle::{RunHandle, RunOutput};
use crate::provider::ChatProvider;
use crate::types::*;
use futures::future::{join_all, BoxFuture};
use futures::{FutureExt, StreamExt};
use uuid::Uuid;

/// One conversation scheduled for execution
#[derive(Debug)]
pub(crate) struct Job<'a> {
    pub index: usize,
    pub messages: &'a [Message],
    pub handle: Box<dyn RunHandle>,
}

/// How the miss set is sent to the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// One `generate` call per conversation
    Direct,
    /// A single conversation pulled chunk by chunk
    StreamAggregate,
}

impl DispatchMode {
    /// Stream only a lone conversation, and only when someone wants tokens
    /// and the provider can deliver them.
    pub fn select(jobs: usize, reporter_prefers_streaming: bool, capabilities: Capabilities) -> Self {
        if jobs == 1 && reporter_prefers_streaming && capabilities.streaming {
            DispatchMode::StreamAggregate
        } else {
            DispatchMode::Direct
        }
    }
}

/// Executes uncached conversations against one provider
pub(crate) struct GenerationExecutor<'a> {
    pub provider: &'a dyn ChatProvider,
    pub options: &'a CallOptions,
    pub signal: &'a CallSignal,
    pub max_concurrency: Option<usize>,
}

impl<'a> GenerationExecutor<'a> {
    /// Execute `jobs` and return `(index, outcome)` pairs in job order
    pub(crate) async fn execute(
        &self,
        jobs: Vec<Job<'a>>,
        mode: DispatchMode,
    ) -> Vec<(usize, Result<ChatResult, KilnError>)> {
        tracing::debug!(jobs = jobs.len(), mode = ?mode, "dispatching uncached conversations");
        match (mode, jobs.len()) {
            (DispatchMode::StreamAggregate, 1) => {
                let mut jobs = jobs;
                match jobs.pop() {
                    Some(job) => vec![self.stream_one(job).await],
                    None => Vec::new(),
                }
            }
            _ => self.direct(jobs).await,
        }
    }

    async fn direct(&self, jobs: Vec<Job<'a>>) -> Vec<(usize, Result<ChatResult, KilnError>)> {
        let calls: Vec<BoxFuture<'_, Result<ChatResult, KilnError>>> = jobs
            .iter()
            .map(|job| self.call(job.messages).boxed())
            .collect();
        let outcomes: Vec<Result<ChatResult, KilnError>> = match self.max_concurrency {
            Some(limit) => futures::stream::iter(calls).buffered(limit.max(1)).collect().await,
            None => join_all(calls).await,
        };

        let mut settled = Vec::with_capacity(jobs.len());
        for (job, outcome) in jobs.into_iter().zip(outcomes) {
            let outcome = outcome.map(|result| normalize(result, job.handle.run_id()));
            finish(job.handle, &outcome).await;
            settled.push((job.index, outcome));
        }
        settled
    }

    async fn call(&self, messages: &[Message]) -> Result<ChatResult, KilnError> {
        self.signal.check()?;
        self.signal
            .race(self.provider.generate(messages, self.options))
            .await
    }

    async fn stream_one(&self, job: Job<'a>) -> (usize, Result<ChatResult, KilnError>) {
        let outcome = self.aggregate(job.messages, job.handle.as_ref()).await;
        finish(job.handle, &outcome).await;
        (job.index, outcome)
    }

    async fn aggregate(&self, messages: &[Message], handle: &dyn RunHandle) -> Result<ChatResult, KilnError> {
        self.signal.check()?;
        let mut stream = self
            .signal
            .race(self.provider.stream(messages, self.options))
            .await?;

        let mut folder = ChunkFolder::new(handle.run_id());
        loop {
            self.signal.check()?;
            let next = self.signal.race(async { Ok(stream.next().await) }).await?;
            let Some(chunk) = next else { break };
            let chunk = folder.push(chunk?);
            handle.new_token(&chunk.text, Some(&chunk)).await;
        }
        folder.finish()
    }
}

async fn finish(handle: Box<dyn RunHandle>, outcome: &Result<ChatResult, KilnError>) {
    match outcome {
        Ok(result) => {
            handle
                .end(&RunOutput {
                    generations: result.generations.clone(),
                    llm_output: result.llm_output.clone(),
                    cached: false,
                })
                .await
        }
        Err(err) => handle.error(err).await,
    }
}

/// Message id assigned to generations that arrive without one
pub(crate) fn run_message_id(run_id: Uuid) -> String {
    format!("run-{}", run_id)
}

/// Fill in message ids and fold generation-level metadata into the message.
///
/// Message metadata wins over generation info, which wins over the
/// provider-level output. The provider-level output only applies when the
/// result holds exactly one generation.
fn normalize(mut result: ChatResult, run_id: Uuid) -> ChatResult {
    let single = result.generations.len() == 1;
    for generation in &mut result.generations {
        let base = match (&result.llm_output, single) {
            (Some(llm_output), true) => llm_output.clone(),
            _ => Metadata::new(),
        };
        let base = merge_metadata(base, generation.generation_info.clone());
        generation.message.response_metadata =
            merge_metadata(base, std::mem::take(&mut generation.message.response_metadata));
        if generation.message.id.is_none() {
            generation.message.id = Some(run_message_id(run_id));
        }
    }
    result
}

/// Folds a chunk stream into one generation
#[derive(Debug)]
pub(crate) struct ChunkFolder {
    run_id: Uuid,
    aggregate: Option<GenerationChunk>,
}

impl ChunkFolder {
    pub(crate) fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            aggregate: None,
        }
    }

    /// Prepare `chunk` for delivery and fold it in. Returns the prepared chunk.
    pub(crate) fn push(&mut self, mut chunk: GenerationChunk) -> GenerationChunk {
        if chunk.message.id.is_none() {
            chunk.message.id = Some(run_message_id(self.run_id));
        }
        chunk.message.response_metadata = merge_metadata(
            chunk.generation_info.clone(),
            std::mem::take(&mut chunk.message.response_metadata),
        );
        self.aggregate = Some(match self.aggregate.take() {
            None => chunk.clone(),
            Some(aggregate) => aggregate.concat(chunk.clone()),
        });
        chunk
    }

    /// The aggregate as a single-generation result.
    ///
    /// Usage carried by the chunks becomes `llm_output.token_usage`.
    pub(crate) fn finish(self) -> Result<ChatResult, KilnError> {
        let aggregate = self.aggregate.ok_or(KilnError::EmptyStream)?;
        let llm_output = match aggregate.message.usage {
            Some(usage) => {
                let mut output = Metadata::new();
                output.insert("token_usage".into(), serde_json::to_value(usage)?);
                Some(output)
            }
            None => None,
        };
        Ok(ChatResult {
            generations: vec![Generation::from(aggregate)],
            llm_output,
        })
    }
}
