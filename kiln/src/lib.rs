//! # Kiln
//!
//! Cache-aware chat model orchestration for Rust.
//!
//! Kiln sits between application code and a text-generation provider. It
//! batches conversations, serves repeated prompts from a cache, streams
//! tokens to lifecycle reporters, keeps one failing conversation from
//! sinking the others, and extracts structured output through tool calls.
//!
//! ## Features
//!
//! - **Batch generation**: concurrent, order-preserving, with per-conversation failures
//! - **Caching**: pluggable stores keyed by prompt and a canonical parameter fingerprint
//! - **Streaming**: chunk aggregation with token forwarding to reporters
//! - **Structured output**: schema-driven extraction over a forced tool call
//! - **Composable layers**: wrap providers with logging or capability masking
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! kiln = { version = "0.1", features = ["layers", "reporters"] }
//! ```
//!
//! ```ignore
//! use std::sync::Arc;
//! use kiln::prelude::*;
//!
//! # async fn example(provider: impl ChatProvider) -> kiln::Result<()> {
//! let model = ChatModel::builder(provider)
//!     .layer(LoggingLayer::new())
//!     .cache(Arc::new(InMemoryCache::new()))
//!     .reporter(Arc::new(TracingReporter::new()))
//!     .finish();
//!
//! let answer = model.invoke("What is Rust?", RunConfig::default()).await?;
//! println!("{}", answer.text());
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `default`: `layers` and `reporters`
//! - `layers`: Built-in provider layers (logging, streaming masking)
//! - `reporters`: Built-in lifecycle reporters (tracing, channel)
//! - `schema`: Derive structured-output schemas from Rust types
//! - `testing`: Fake provider and recording reporter
//! - `full`: All of the above except `testing`

// Re-export core types and traits
pub use kiln_core::*;

// Re-export layers under `layer` module
#[cfg(feature = "kiln-layer")]
pub mod layer {
    //! Built-in provider layers.
    pub use kiln_core::layer::{Layer, LayeredProvider};
    pub use kiln_layer::*;
}

// Re-export reporters under `reporter` module
#[cfg(feature = "kiln-reporter")]
pub mod reporter {
    //! Built-in lifecycle reporters.
    pub use kiln_reporter::*;
}

// Re-export schemars when schema feature is enabled
#[cfg(feature = "schema")]
pub mod schemars {
    pub use ::schemars::*;
}

// Convenience re-exports at root level for common types
pub use kiln_core::{
    error::KilnError,
    layer::{Layer, LayeredProvider},
    lifecycle::{LifecycleReporter, RunHandle},
    provider::ChatProvider,
    runtime::ChatModel,
    types::{
        BatchResult, CallOptions, Capabilities, ChatResult, Content, ContentPart, Generation,
        GenerationChunk, Message, MessageChunk, ProviderInfo, Role, RunConfig, ToolCall,
        ToolChoice, ToolDefinition, Usage,
    },
    Result,
};

/// Prelude module for convenient imports
pub mod prelude {
    //! Prelude module containing the most commonly used types and traits.
    //!
    //! ```
    //! use kiln::prelude::*;
    //! ```

    pub use crate::{
        CacheStore, CallOptions, ChatModel, ChatProvider, Generation, InMemoryCache, KilnError,
        Layer, LifecycleReporter, Message, MessageChunk, Result, Role, RunConfig,
        StructuredOutputOptions, Usage,
    };

    #[cfg(feature = "kiln-layer")]
    pub use crate::layer::{DisableStreamingLayer, LoggingLayer};

    #[cfg(feature = "kiln-reporter")]
    pub use crate::reporter::*;
}
