//! Runtime layer for Kiln.
//!
//! This module sits between application code and the provider interface.
//! It is responsible for:
//! - Coercing inputs and splitting batches against the cache
//! - Choosing between direct and streaming dispatch
//! - Driving the lifecycle reporters for every conversation
//! - Honouring cancellation and deadlines

pub mod executor;
pub mod model;
mod signal;

pub use executor::DispatchMode;
pub use model::{ChatModel, ChatModelBuilder};
