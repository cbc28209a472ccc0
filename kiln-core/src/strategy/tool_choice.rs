//! Tool-choice strategies for structured output.
//!
//! Providers differ in how they can be made to call a tool:
//! - ForcedToolStrategy: the provider honours a named tool choice
//! - AnyToolStrategy: the provider can only be told to call some tool; the
//!   tool name is checked when the response is parsed

use crate::error::KilnError;
use crate::types::{CallOptions, Capabilities, ToolChoice, ToolDefinition};

/// Strategy for binding a single tool to a call.
pub trait ToolChoiceStrategy: Send + Sync + std::fmt::Debug {
    /// Get the strategy name for debugging
    fn name(&self) -> &str;

    /// Bind `tool` to the call options
    fn apply(&self, options: &mut CallOptions, tool: &ToolDefinition) -> Result<(), KilnError>;
}

/// Forces the model to call the named tool.
#[derive(Debug, Clone, Default)]
pub struct ForcedToolStrategy;

impl ToolChoiceStrategy for ForcedToolStrategy {
    fn name(&self) -> &str {
        "ForcedToolStrategy"
    }

    fn apply(&self, options: &mut CallOptions, tool: &ToolDefinition) -> Result<(), KilnError> {
        options.tools = vec![tool.clone()];
        options.tool_choice = Some(ToolChoice::Tool {
            name: tool.name.clone(),
        });
        Ok(())
    }
}

/// Requires some tool call without naming one.
///
/// Only one tool is bound, so any call should be to it; the parser still
/// checks the name.
#[derive(Debug, Clone, Default)]
pub struct AnyToolStrategy;

impl ToolChoiceStrategy for AnyToolStrategy {
    fn name(&self) -> &str {
        "AnyToolStrategy"
    }

    fn apply(&self, options: &mut CallOptions, tool: &ToolDefinition) -> Result<(), KilnError> {
        options.tools = vec![tool.clone()];
        options.tool_choice = Some(ToolChoice::Any);
        Ok(())
    }
}

/// Pick the strategy for a provider from its declared capabilities.
pub fn detect_tool_strategy(capabilities: Capabilities) -> Result<Box<dyn ToolChoiceStrategy>, KilnError> {
    if !capabilities.tool_calling {
        return Err(KilnError::unsupported(
            "structured output requires a provider with tool calling",
        ));
    }
    if capabilities.tool_choice {
        Ok(Box::new(ForcedToolStrategy))
    } else {
        Ok(Box::new(AnyToolStrategy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool() -> ToolDefinition {
        ToolDefinition {
            name: "extract".into(),
            description: "A function available to call.".into(),
            parameters: json!({"type": "object"}),
        }
    }

    #[test]
    fn test_forced_tool_strategy() {
        let mut options = CallOptions::new().with_temperature(0.0);
        ForcedToolStrategy.apply(&mut options, &tool()).unwrap();

        assert_eq!(options.tools, vec![tool()]);
        assert_eq!(
            options.tool_choice,
            Some(ToolChoice::Tool {
                name: "extract".into()
            })
        );
        assert_eq!(options.temperature, Some(0.0));
    }

    #[test]
    fn test_any_tool_strategy() {
        let mut options = CallOptions::new();
        AnyToolStrategy.apply(&mut options, &tool()).unwrap();
        assert_eq!(options.tool_choice, Some(ToolChoice::Any));
    }

    #[test]
    fn test_detect_tool_strategy() {
        let forced = Capabilities::default()
            .with_tool_calling(true)
            .with_tool_choice(true);
        assert_eq!(detect_tool_strategy(forced).unwrap().name(), "ForcedToolStrategy");

        let any = Capabilities::default().with_tool_calling(true);
        assert_eq!(detect_tool_strategy(any).unwrap().name(), "AnyToolStrategy");

        assert!(matches!(
            detect_tool_strategy(Capabilities::default()),
            Err(KilnError::Unsupported(_))
        ));
    }
}
