//! # Kiln Layers
//!
//! Built-in provider layers for Kiln.
//!
//! Currently implemented layers:
//! - `LoggingLayer`: Logs all provider operations with timing information
//! - `DisableStreamingLayer`: Hides the streaming capability of a provider
//!
//! ## Usage
//!
//! ```ignore
//! use kiln_core::ChatModel;
//! use kiln_layer::{DisableStreamingLayer, LoggingLayer};
//!
//! let model = ChatModel::builder(provider)
//!     .layer(LoggingLayer::new())
//!     .layer(DisableStreamingLayer)
//!     .finish();
//! ```

pub mod logging;
pub mod streaming;

// Re-exports
pub use logging::LoggingLayer;
pub use streaming::DisableStreamingLayer;
