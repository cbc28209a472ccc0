//! Basic usage example using the kiln meta crate.
//!
//! This demonstrates:
//! 1. Writing a provider adapter against `ChatProvider`
//! 2. Batch generation served from a cache on repeat calls
//! 3. Streaming tokens to a reporter
//! 4. Structured output from a schema derived with schemars
//!
//! The provider is a small offline stand-in so the example runs without
//! network access or credentials.

use async_trait::async_trait;
use futures::StreamExt;
use kiln::prelude::*;
use kiln::provider::ChunkStream;
use kiln::schemars::JsonSchema;
use kiln::{Capabilities, ChatResult, GenerationChunk, OutputSchema, ProviderInfo, ToolCall, ToolChoice};
use serde::Deserialize;
use std::sync::Arc;

/// Answers from a fixed phrase book and fills extraction tools with canned values.
#[derive(Debug)]
struct PhraseBookProvider {
    info: Arc<ProviderInfo>,
}

impl PhraseBookProvider {
    fn new() -> Self {
        Self {
            info: ProviderInfo::new("phrase-book", "Phrase Book"),
        }
    }

    fn respond(messages: &[Message], options: &CallOptions) -> Message {
        if let Some(ToolChoice::Tool { name }) = &options.tool_choice {
            let args = serde_json::json!({ "name": "Ferris", "age": 9 });
            return Message::ai("").with_tool_calls(vec![ToolCall::new(name.clone(), args)]);
        }
        let prompt = messages.last().map(Message::text).unwrap_or_default();
        let answer = match prompt.as_str() {
            "What is Rust?" => "A systems language focused on safety and speed.".to_string(),
            "What is a kiln?" => "An oven for firing pottery.".to_string(),
            other => format!("I have no entry for {:?}.", other),
        };
        Message::ai(answer)
    }
}

#[async_trait]
impl ChatProvider for PhraseBookProvider {
    fn info(&self) -> Arc<ProviderInfo> {
        self.info.clone()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
            .with_streaming(true)
            .with_tool_calling(true)
            .with_tool_choice(true)
    }

    fn invocation_params(&self, _options: &CallOptions) -> serde_json::Value {
        serde_json::json!({ "edition": 2 })
    }

    async fn generate(&self, messages: &[Message], options: &CallOptions) -> Result<ChatResult> {
        Ok(ChatResult::single(Self::respond(messages, options)))
    }

    /// Text streams word by word; tool calls arrive as one chunk
    async fn stream(&self, messages: &[Message], options: &CallOptions) -> Result<Box<ChunkStream>> {
        let message = Self::respond(messages, options);
        let chunks: Vec<Result<GenerationChunk>> = if message.tool_calls.is_empty() {
            message
                .text()
                .split_inclusive(' ')
                .map(|word| Ok(GenerationChunk::new(MessageChunk::ai(word))))
                .collect()
        } else {
            vec![Ok(GenerationChunk::new(MessageChunk::from(message)))]
        };
        Ok(Box::new(futures::stream::iter(chunks)))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct Mascot {
    /// Name of the mascot
    name: String,
    /// Age in years
    age: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cache = Arc::new(InMemoryCache::new());
    let (channel, events) = ChannelReporter::new();
    let model = ChatModel::builder(PhraseBookProvider::new())
        .layer(LoggingLayer::new())
        .cache(cache.clone())
        .reporter(Arc::new(TracingReporter::new()))
        .reporter(Arc::new(channel.with_streaming(true)))
        .finish();

    // Example 1: Batch generation, twice. The second batch is served from the cache.
    println!("=== Example 1: Cached Batch ===");
    let questions = ["What is Rust?", "What is a kiln?"];
    for round in 1..=2 {
        let result = model.generate(questions, RunConfig::default()).await?;
        for (question, generations) in questions.iter().zip(&result.generations) {
            println!("[round {}] {} -> {}", round, question, generations[0].text);
        }
    }
    println!("cache entries: {}", cache.len());

    // Example 2: Streaming a single conversation
    println!("\n=== Example 2: Streaming ===");
    let mut chunks = model.stream("What is Rust?", RunConfig::default());
    while let Some(chunk) = chunks.next().await {
        print!("{}", chunk?.text());
    }
    println!();

    // Example 3: Structured output
    println!("\n=== Example 3: Structured Output ===");
    let structured = model.with_structured_output(
        OutputSchema::of::<Mascot>()?,
        StructuredOutputOptions::new().with_name("mascot"),
    )?;
    let mascot: Mascot = structured
        .invoke("Describe the Rust mascot", RunConfig::default())
        .await?
        .parse_as()?;
    println!("{:?} via {}", mascot, structured.strategy());

    // Lifecycle events seen by the channel reporter
    drop(structured);
    drop(model);
    let seen: Vec<LifecycleEvent> = events.collect().await;
    println!("\nchannel reporter saw {} lifecycle events", seen.len());

    Ok(())
}
