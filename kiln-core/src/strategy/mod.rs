//! Strategy layer for provider-specific behaviors.
//!
//! This module defines strategy patterns for handling differences between
//! providers, such as whether a specific tool can be forced.

pub mod tool_choice;

pub use tool_choice::{detect_tool_strategy, AnyToolStrategy, ForcedToolStrategy, ToolChoiceStrategy};
