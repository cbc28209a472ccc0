//! # Kiln Core
//!
//! Core abstractions and runtime for orchestrating text-generation calls.
//!
//! This crate provides the message and generation types, the provider,
//! cache and lifecycle traits, and the [`ChatModel`] runtime that ties them
//! together: cache-aware batch generation, streaming aggregation, partial
//! failure isolation and structured output over tool calling.

pub mod cache;
pub mod error;
pub mod layer;
pub mod lifecycle;
pub mod message;
pub mod provider;
pub mod runtime;
pub mod strategy;
pub mod structured;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-exports
pub use cache::{CacheCoordinator, CacheSplit, CacheStore, InMemoryCache};
pub use error::{CacheWriteError, CacheWriteFailure, KilnError};
pub use layer::{Layer, LayeredProvider};
pub use lifecycle::{BatchDescriptor, LifecycleManager, LifecycleReporter, RunHandle, RunOutput};
pub use message::{buffer_string, coerce, coerce_json, coerce_messages, LanguageModelInput, MessageLike};
pub use provider::{ChatProvider, ChunkStream};
pub use runtime::{ChatModel, ChatModelBuilder, DispatchMode};
pub use strategy::{AnyToolStrategy, ForcedToolStrategy, ToolChoiceStrategy};
pub use structured::{
    NullParser, OutputParser, OutputSchema, StructuredModel, StructuredOutput, StructuredOutputOptions,
    ToolCallParser, WithFallback,
};
pub use types::*;

/// Result type alias for Kiln operations
pub type Result<T> = std::result::Result<T, KilnError>;
