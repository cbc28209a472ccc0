//! # Kiln Reporters
//!
//! Built-in lifecycle reporters for Kiln.
//!
//! - `TracingReporter`: emits a `tracing` event for every lifecycle call
//! - `ChannelReporter`: forwards lifecycle events to a stream

pub mod channel;
pub mod tracing_reporter;

// Re-exports
pub use channel::{ChannelReporter, LifecycleEvent};
pub use tracing_reporter::TracingReporter;
