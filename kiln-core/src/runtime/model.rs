//! ChatModel implementation.
//!
//! `ChatModel` is the entry point for generation. It owns the layered
//! provider, the optional cache and the lifecycle reporters, and runs the
//! full batch flow: coerce, start the lifecycle, split against the cache,
//! execute the misses, write back and merge in input order.

use super::executor::{ChunkFolder, DispatchMode, GenerationExecutor, Job};
use super::signal::CallSignal;
use crate::cache::{fingerprint, mark_cached, CacheCoordinator, CacheStore};
use crate::error::{CacheWriteError, CacheWriteFailure, KilnError};
use crate::layer::Layer;
use crate::lifecycle::{BatchDescriptor, LifecycleManager, LifecycleReporter, RunHandle, RunOutput};
use crate::message::LanguageModelInput;
use crate::provider::ChatProvider;
use crate::types::*;
use futures::future::{join_all, BoxFuture};
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Type-erased provider that can be shared across threads
type BoxedProvider = Arc<dyn ChatProvider>;

/// Builder for composing a chat model.
///
/// Layers wrap the provider with static dispatch; the cache and reporters
/// are injected as shared trait objects.
///
/// # Example
///
/// ```ignore
/// let model = ChatModel::builder(provider)
///     .layer(LoggingLayer::new())
///     .cache(Arc::new(InMemoryCache::new()))
///     .reporter(Arc::new(TracingReporter::new()))
///     .finish();
/// ```
pub struct ChatModelBuilder<P> {
    provider: P,
    cache: Option<Arc<dyn CacheStore>>,
    reporters: Vec<Arc<dyn LifecycleReporter>>,
    options: CallOptions,
}

impl<P: ChatProvider> ChatModelBuilder<P> {
    /// Create a new builder with a provider
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            cache: None,
            reporters: Vec::new(),
            options: CallOptions::default(),
        }
    }

    /// Add a layer to wrap the provider
    ///
    /// Each call to `layer()` creates a new concrete type by wrapping the
    /// previous provider.
    pub fn layer<L>(self, layer: L) -> ChatModelBuilder<L::LayeredProvider>
    where
        L: Layer<P>,
    {
        ChatModelBuilder {
            provider: layer.layer(self.provider),
            cache: self.cache,
            reporters: self.reporters,
            options: self.options,
        }
    }

    /// Use `cache` for batch calls
    pub fn cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Add a lifecycle reporter
    pub fn reporter(mut self, reporter: Arc<dyn LifecycleReporter>) -> Self {
        self.reporters.push(reporter);
        self
    }

    /// Set default call options
    pub fn options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }

    /// Finish building and create a ChatModel
    pub fn finish(self) -> ChatModel {
        ChatModel {
            inner: Arc::new(ModelInner {
                provider: Arc::new(self.provider),
                cache: self.cache,
                lifecycle: LifecycleManager::new(self.reporters),
            }),
            defaults: self.options,
        }
    }
}

#[derive(Debug)]
struct ModelInner {
    provider: BoxedProvider,
    cache: Option<Arc<dyn CacheStore>>,
    lifecycle: LifecycleManager,
}

/// Cache-aware, lifecycle-reporting chat model. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ChatModel {
    inner: Arc<ModelInner>,
    defaults: CallOptions,
}

impl ChatModel {
    /// Create a new builder
    pub fn builder<P: ChatProvider>(provider: P) -> ChatModelBuilder<P> {
        ChatModelBuilder::new(provider)
    }

    /// Get provider information
    pub fn info(&self) -> Arc<ProviderInfo> {
        self.inner.provider.info()
    }

    /// Capabilities declared by the provider
    pub fn capabilities(&self) -> Capabilities {
        self.inner.provider.capabilities()
    }

    /// Default call options of this model
    pub fn default_options(&self) -> &CallOptions {
        &self.defaults
    }

    /// A model sharing provider, cache and reporters, with `options` merged
    /// into the defaults. Call-level options still win.
    pub fn bind(&self, options: CallOptions) -> ChatModel {
        ChatModel {
            inner: self.inner.clone(),
            defaults: self.defaults.merged(&options),
        }
    }

    /// Generate completions for a batch of conversations.
    ///
    /// Output order matches input order. A failing conversation does not
    /// stop the others; once every conversation has finished, the first
    /// failure by index is returned. If generation succeeded but cache
    /// writes failed, the error carries the assembled result.
    pub async fn generate<I>(&self, conversations: I, config: RunConfig) -> Result<BatchResult, KilnError>
    where
        I: IntoIterator,
        I::Item: Into<LanguageModelInput>,
    {
        let conversations: Vec<Vec<Message>> = conversations
            .into_iter()
            .map(|input| input.into().into_messages())
            .collect();
        let provider = self.inner.provider.as_ref();
        let options = self.defaults.merged(&config.options);
        let signal = CallSignal::new(config.cancel.as_ref(), config.timeout);

        let run_ids: Vec<Uuid> = conversations.iter().map(|_| Uuid::new_v4()).collect();
        let batch = BatchDescriptor {
            provider: provider.info(),
            prompts: conversations.clone(),
            run_ids: run_ids.clone(),
            invocation_params: provider.invocation_params(&options),
            options: options.clone(),
            run_name: config.run_name.clone(),
            metadata: config.metadata.clone(),
        };
        let coordinator = match &self.inner.cache {
            Some(store) => Some(CacheCoordinator::new(store.clone(), fingerprint(provider, &options)?)),
            None => None,
        };

        let handles = self.inner.lifecycle.start(&batch).await?;
        let mut handles: Vec<Option<Box<dyn RunHandle>>> = handles.into_iter().map(Some).collect();
        let split = match &coordinator {
            Some(coordinator) => coordinator.split(&conversations).await,
            None => crate::cache::CacheSplit {
                hits: BTreeMap::new(),
                misses: (0..conversations.len()).collect(),
            },
        };

        let mut generations: Vec<Vec<Generation>> = vec![Vec::new(); conversations.len()];
        for (index, mut cached) in split.hits {
            mark_cached(&mut cached);
            if let Some(handle) = handles[index].take() {
                if let Some(first) = cached.first() {
                    handle.new_token(&first.text, None).await;
                }
                handle
                    .end(&RunOutput {
                        generations: cached.clone(),
                        llm_output: None,
                        cached: true,
                    })
                    .await;
            }
            generations[index] = cached;
        }

        let jobs: Vec<Job<'_>> = split
            .misses
            .iter()
            .filter_map(|&index| {
                handles[index].take().map(|handle| Job {
                    index,
                    messages: &conversations[index],
                    handle,
                })
            })
            .collect();
        let mode = DispatchMode::select(
            jobs.len(),
            self.inner.lifecycle.prefers_streaming(),
            provider.capabilities(),
        );
        let executor = GenerationExecutor {
            provider,
            options: &options,
            signal: &signal,
            max_concurrency: config.max_concurrency,
        };
        let outcomes = executor.execute(jobs, mode).await;

        let mut first_error: Option<(usize, KilnError)> = None;
        let mut llm_outputs = Vec::new();
        let mut written = Vec::new();
        for (index, outcome) in outcomes {
            match outcome {
                Ok(result) => {
                    if let Some(llm_output) = result.llm_output {
                        llm_outputs.push(llm_output);
                    }
                    written.push(index);
                    generations[index] = result.generations;
                }
                Err(err) => {
                    if first_error.as_ref().map_or(true, |(first, _)| index < *first) {
                        first_error = Some((index, err));
                    }
                }
            }
        }

        let result = BatchResult {
            generations,
            llm_output: provider.combine_llm_output(&llm_outputs),
            run_ids,
        };

        let failures = match &coordinator {
            Some(coordinator) if !signal.is_cancelled() => {
                let writes: Vec<BoxFuture<'_, Result<(), KilnError>>> = written
                    .iter()
                    .map(|&index| {
                        coordinator
                            .write_back(&conversations[index], result.generations[index].clone())
                            .boxed()
                    })
                    .collect();
                let writes = join_all(writes).await;
                written
                    .into_iter()
                    .zip(writes)
                    .filter_map(|(index, write)| {
                        write.err().map(|error| CacheWriteFailure { index, error })
                    })
                    .collect()
            }
            _ => Vec::new(),
        };

        if let Some((_, err)) = first_error {
            return Err(err);
        }
        if !failures.is_empty() {
            return Err(CacheWriteError {
                failures,
                result: Box::new(result),
            }
            .into());
        }
        Ok(result)
    }

    /// Complete a single conversation and return the first generated message
    pub async fn invoke(&self, input: impl Into<LanguageModelInput>, config: RunConfig) -> Result<Message, KilnError> {
        let result = self.generate([input.into()], config).await?;
        result
            .generations
            .into_iter()
            .next()
            .and_then(|generations| generations.into_iter().next())
            .map(|generation| generation.message)
            .ok_or_else(|| KilnError::provider("No generations returned for the conversation"))
    }

    /// Stream a single conversation chunk by chunk.
    ///
    /// Providers without streaming yield the `invoke` result as one chunk.
    /// Streaming never reads or writes the cache.
    pub fn stream(&self, input: impl Into<LanguageModelInput>, config: RunConfig) -> BoxStream<'static, Result<MessageChunk, KilnError>> {
        let model = self.clone();
        let input = input.into();

        if !model.capabilities().streaming {
            return async_stream::stream! {
                yield model.invoke(input, config).await.map(MessageChunk::from);
            }
            .boxed();
        }

        async_stream::stream! {
            let messages = input.into_messages();
            let provider = model.inner.provider.clone();
            let options = model.defaults.merged(&config.options);
            let signal = CallSignal::new(config.cancel.as_ref(), config.timeout);
            let run_id = Uuid::new_v4();
            let batch = BatchDescriptor {
                provider: provider.info(),
                prompts: vec![messages.clone()],
                run_ids: vec![run_id],
                invocation_params: provider.invocation_params(&options),
                options: options.clone(),
                run_name: config.run_name.clone(),
                metadata: config.metadata.clone(),
            };

            let run = match model.inner.lifecycle.start(&batch).await {
                Ok(mut handles) => match handles.pop() {
                    Some(handle) => StreamRun::new(handle),
                    None => {
                        yield Err(KilnError::lifecycle("no handle returned for the stream"));
                        return;
                    }
                },
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };

            let opened = match signal.check() {
                Ok(()) => signal.race(provider.stream(&messages, &options)).await,
                Err(err) => Err(err),
            };
            let mut chunks = match opened {
                Ok(chunks) => chunks,
                Err(err) => {
                    run.error(&err).await;
                    yield Err(err);
                    return;
                }
            };

            let mut folder = ChunkFolder::new(run_id);
            loop {
                let next = match signal.check() {
                    Ok(()) => signal.race(async { Ok(chunks.next().await) }).await,
                    Err(err) => Err(err),
                };
                let chunk = match next {
                    Ok(Some(Ok(chunk))) => chunk,
                    Ok(None) => break,
                    Ok(Some(Err(err))) | Err(err) => {
                        run.error(&err).await;
                        yield Err(err);
                        return;
                    }
                };
                let chunk = folder.push(chunk);
                run.new_token(&chunk.text, &chunk).await;
                yield Ok(chunk.message);
            }

            match folder.finish() {
                Ok(result) => {
                    run.end(&RunOutput {
                        generations: result.generations,
                        llm_output: result.llm_output,
                        cached: false,
                    })
                    .await;
                }
                Err(err) => {
                    run.error(&err).await;
                    yield Err(err);
                }
            }
        }
        .boxed()
    }
}

/// Run handle owned by an open stream.
///
/// If the stream is dropped before the run finishes, the handle is closed
/// with `Cancelled` on the current runtime.
#[derive(Debug)]
struct StreamRun {
    handle: Option<Box<dyn RunHandle>>,
}

impl StreamRun {
    fn new(handle: Box<dyn RunHandle>) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    async fn new_token(&self, token: &str, chunk: &GenerationChunk) {
        if let Some(handle) = &self.handle {
            handle.new_token(token, Some(chunk)).await;
        }
    }

    async fn end(mut self, output: &RunOutput) {
        if let Some(handle) = self.handle.take() {
            handle.end(output).await;
        }
    }

    async fn error(mut self, error: &KilnError) {
        if let Some(handle) = self.handle.take() {
            handle.error(error).await;
        }
    }
}

impl Drop for StreamRun {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    handle.error(&KilnError::Cancelled).await;
                });
            }
            Err(_) => tracing::debug!(run_id = %handle.run_id(), "stream dropped outside a runtime"),
        }
    }
}
