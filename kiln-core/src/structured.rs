//! Structured output on top of tool calling.
//!
//! A schema becomes a single tool definition. The model is bound to that
//! tool and the arguments of the matching tool call are returned as the
//! parsed value.

use crate::error::KilnError;
use crate::message::LanguageModelInput;
use crate::runtime::ChatModel;
use crate::strategy::detect_tool_strategy;
use crate::types::*;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt::Debug;

/// Tool name used when neither the options nor the schema name one
pub const DEFAULT_TOOL_NAME: &str = "extract";

/// Tool description used when the schema carries none
pub const DEFAULT_TOOL_DESCRIPTION: &str = "A function available to call.";

/// JSON schema describing the expected output
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSchema(Value);

impl OutputSchema {
    pub fn new(schema: Value) -> Self {
        Self(schema)
    }

    /// Derive the schema from a Rust type
    #[cfg(feature = "schema")]
    pub fn of<T: schemars::JsonSchema>() -> Result<Self, KilnError> {
        Ok(Self(serde_json::to_value(schemars::schema_for!(T))?))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    fn string_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }
}

impl From<Value> for OutputSchema {
    fn from(schema: Value) -> Self {
        Self(schema)
    }
}

/// Options for [`ChatModel::with_structured_output`]
#[derive(Debug, Clone, Default)]
pub struct StructuredOutputOptions {
    /// Tool name. A `name` key in the schema takes precedence.
    pub name: Option<String>,
    /// Return the raw message next to the parsed value, and never fail on parsing
    pub include_raw: bool,
}

impl StructuredOutputOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_include_raw(mut self, include_raw: bool) -> Self {
        self.include_raw = include_raw;
        self
    }
}

/// Build the tool definition for `schema`
pub fn tool_definition(schema: &OutputSchema, options: &StructuredOutputOptions) -> ToolDefinition {
    let name = schema
        .string_field("name")
        .map(str::to_string)
        .or_else(|| options.name.clone())
        .unwrap_or_else(|| DEFAULT_TOOL_NAME.to_string());
    let description = schema
        .string_field("description")
        .unwrap_or(DEFAULT_TOOL_DESCRIPTION)
        .to_string();
    ToolDefinition {
        name,
        description,
        parameters: schema.as_value().clone(),
    }
}

/// Turns a model response into a value.
pub trait OutputParser: Send + Sync + Debug {
    fn parse(&self, message: &Message) -> Result<Value, KilnError>;

    /// Try `fallback` when this parser fails
    fn with_fallback<F>(self, fallback: F) -> WithFallback<Self, F>
    where
        Self: Sized,
        F: OutputParser,
    {
        WithFallback {
            primary: self,
            fallback,
        }
    }
}

/// Extracts the arguments of the first tool call with a given name
#[derive(Debug, Clone)]
pub struct ToolCallParser {
    tool_name: String,
}

impl ToolCallParser {
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
        }
    }

    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }
}

impl OutputParser for ToolCallParser {
    fn parse(&self, message: &Message) -> Result<Value, KilnError> {
        if message.role != Role::Ai {
            return Err(KilnError::invalid_request(format!(
                "tool call parsing requires an ai message, got {}",
                message.role
            )));
        }
        if message.tool_calls.is_empty() {
            return Err(KilnError::tool_call_missing("No tool calls found in the response."));
        }
        let call = message
            .tool_calls
            .iter()
            .find(|call| call.name == self.tool_name)
            .ok_or_else(|| {
                KilnError::tool_call_missing(format!("No tool call found with name {}", self.tool_name))
            })?;
        match &call.args {
            Value::Object(_) => Ok(call.args.clone()),
            other => Err(KilnError::invalid_request(format!(
                "tool call arguments must be a JSON object, got {}",
                other
            ))),
        }
    }
}

/// Always yields `null`
#[derive(Debug, Clone, Copy, Default)]
pub struct NullParser;

impl OutputParser for NullParser {
    fn parse(&self, _message: &Message) -> Result<Value, KilnError> {
        Ok(Value::Null)
    }
}

/// Runs `primary`, then `fallback` if it fails
#[derive(Debug, Clone)]
pub struct WithFallback<P, F> {
    primary: P,
    fallback: F,
}

impl<P: OutputParser, F: OutputParser> OutputParser for WithFallback<P, F> {
    fn parse(&self, message: &Message) -> Result<Value, KilnError> {
        self.primary
            .parse(message)
            .or_else(|_| self.fallback.parse(message))
    }
}

/// Result of a structured call
#[derive(Debug, Clone, PartialEq)]
pub enum StructuredOutput {
    Parsed(Value),
    WithRaw {
        raw: Message,
        /// `None` when the response could not be parsed
        parsed: Option<Value>,
    },
}

impl StructuredOutput {
    pub fn parsed(&self) -> Option<&Value> {
        match self {
            StructuredOutput::Parsed(value) => Some(value),
            StructuredOutput::WithRaw { parsed, .. } => parsed.as_ref(),
        }
    }

    pub fn raw(&self) -> Option<&Message> {
        match self {
            StructuredOutput::Parsed(_) => None,
            StructuredOutput::WithRaw { raw, .. } => Some(raw),
        }
    }

    /// Deserialize the parsed value
    pub fn parse_as<T: DeserializeOwned>(&self) -> Result<T, KilnError> {
        let value = self
            .parsed()
            .ok_or_else(|| KilnError::tool_call_missing("response held no parsable tool call"))?;
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// A chat model bound to one extraction tool
#[derive(Debug, Clone)]
pub struct StructuredModel {
    model: ChatModel,
    tool: ToolDefinition,
    parser: ToolCallParser,
    include_raw: bool,
    strategy: String,
}

impl StructuredModel {
    /// Tool the model is bound to
    pub fn tool(&self) -> &ToolDefinition {
        &self.tool
    }

    /// Name of the tool-choice strategy in use
    pub fn strategy(&self) -> &str {
        &self.strategy
    }

    pub async fn invoke(&self, input: impl Into<LanguageModelInput>, config: RunConfig) -> Result<StructuredOutput, KilnError> {
        let message = self.model.invoke(input, config).await?;
        if !self.include_raw {
            return Ok(StructuredOutput::Parsed(self.parser.parse(&message)?));
        }

        let pipeline = self.parser.clone().with_fallback(NullParser);
        let parsed = match pipeline.parse(&message) {
            Ok(Value::Null) | Err(_) => None,
            Ok(value) => Some(value),
        };
        Ok(StructuredOutput::WithRaw {
            raw: message,
            parsed,
        })
    }
}

impl ChatModel {
    /// Bind this model to a single tool derived from `schema`.
    ///
    /// Fails with `Unsupported` when the provider cannot call tools.
    pub fn with_structured_output(
        &self,
        schema: impl Into<OutputSchema>,
        options: StructuredOutputOptions,
    ) -> Result<StructuredModel, KilnError> {
        let strategy = detect_tool_strategy(self.capabilities())?;
        let tool = tool_definition(&schema.into(), &options);

        let mut bound = CallOptions::default();
        strategy.apply(&mut bound, &tool)?;

        Ok(StructuredModel {
            model: self.bind(bound),
            parser: ToolCallParser::new(tool.name.clone()),
            tool,
            include_raw: options.include_raw,
            strategy: strategy.name().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeChatProvider;
    use serde::Deserialize;
    use serde_json::json;

    fn person_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "age": {"type": "integer"}
            },
            "required": ["name", "age"]
        })
    }

    fn tool_reply(name: &str, args: Value) -> Message {
        Message::ai("").with_tool_calls(vec![ToolCall::new(name, args).with_id("call-1")])
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Person {
        name: String,
        age: u32,
    }

    #[test]
    fn test_tool_definition_naming() {
        let schema = OutputSchema::new(person_schema());
        let tool = tool_definition(&schema, &StructuredOutputOptions::new());
        assert_eq!(tool.name, DEFAULT_TOOL_NAME);
        assert_eq!(tool.description, DEFAULT_TOOL_DESCRIPTION);
        assert_eq!(tool.parameters, person_schema());

        let named = tool_definition(&schema, &StructuredOutputOptions::new().with_name("person"));
        assert_eq!(named.name, "person");

        let mut with_name = person_schema();
        with_name["name"] = json!("from_schema");
        with_name["description"] = json!("Extract a person");
        let tool = tool_definition(
            &OutputSchema::new(with_name),
            &StructuredOutputOptions::new().with_name("person"),
        );
        assert_eq!(tool.name, "from_schema");
        assert_eq!(tool.description, "Extract a person");
    }

    #[test]
    fn test_tool_call_parser() {
        let parser = ToolCallParser::new("extract");
        let message = Message::ai("")
            .with_tool_calls(vec![
                ToolCall::new("other", json!({"x": 1})),
                ToolCall::new("extract", json!({"name": "Ada"})),
            ]);
        assert_eq!(parser.parse(&message).unwrap(), json!({"name": "Ada"}));

        assert!(matches!(
            parser.parse(&Message::ai("plain text")),
            Err(KilnError::ToolCallMissing(ref msg)) if msg == "No tool calls found in the response."
        ));
        assert!(matches!(
            parser.parse(&tool_reply("other", json!({}))),
            Err(KilnError::ToolCallMissing(ref msg)) if msg == "No tool call found with name extract"
        ));
        assert!(matches!(
            parser.parse(&Message::human("hi")),
            Err(KilnError::InvalidRequest(_))
        ));
        assert!(parser.parse(&tool_reply("extract", json!([1, 2]))).is_err());
    }

    #[test]
    fn test_fallback_pipeline() {
        let pipeline = ToolCallParser::new("extract").with_fallback(NullParser);
        assert_eq!(pipeline.parse(&Message::ai("no tools")).unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_forced_tool_extraction() {
        let provider = FakeChatProvider::new()
            .reply_all(tool_reply("extract", json!({"name": "Ada", "age": 36})));
        let model = ChatModel::builder(provider.clone()).finish();
        let structured = model
            .with_structured_output(person_schema(), StructuredOutputOptions::new())
            .unwrap();
        assert_eq!(structured.strategy(), "ForcedToolStrategy");

        let output = structured
            .invoke("Ada is 36", RunConfig::default())
            .await
            .unwrap();
        assert_eq!(
            output.parse_as::<Person>().unwrap(),
            Person {
                name: "Ada".into(),
                age: 36
            }
        );

        let options = provider.last_options().unwrap();
        assert_eq!(options.tools.len(), 1);
        assert_eq!(
            options.tool_choice,
            Some(ToolChoice::Tool {
                name: "extract".into()
            })
        );
    }

    #[tokio::test]
    async fn test_any_tool_strategy_checks_name_when_parsing() {
        let provider = FakeChatProvider::new()
            .with_capabilities(Capabilities::default().with_tool_calling(true))
            .reply_all(tool_reply("something_else", json!({})));
        let model = ChatModel::builder(provider.clone()).finish();
        let structured = model
            .with_structured_output(person_schema(), StructuredOutputOptions::new())
            .unwrap();
        assert_eq!(structured.strategy(), "AnyToolStrategy");

        let err = structured
            .invoke("hi", RunConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::ToolCallMissing(_)));
        assert_eq!(provider.last_options().unwrap().tool_choice, Some(ToolChoice::Any));
    }

    #[tokio::test]
    async fn test_include_raw_falls_back_to_none() {
        let provider = FakeChatProvider::new().reply_all(Message::ai("I'd rather not."));
        let model = ChatModel::builder(provider).finish();

        let strict = model
            .with_structured_output(person_schema(), StructuredOutputOptions::new())
            .unwrap();
        assert!(matches!(
            strict.invoke("hi", RunConfig::default()).await,
            Err(KilnError::ToolCallMissing(_))
        ));

        let lenient = model
            .with_structured_output(
                person_schema(),
                StructuredOutputOptions::new().with_include_raw(true),
            )
            .unwrap();
        let output = lenient.invoke("hi", RunConfig::default()).await.unwrap();
        assert_eq!(output.parsed(), None);
        assert_eq!(output.raw().map(Message::text), Some("I'd rather not.".to_string()));
    }

    #[test]
    fn test_provider_without_tools_is_unsupported() {
        let provider = FakeChatProvider::new().with_capabilities(Capabilities::default());
        let model = ChatModel::builder(provider).finish();
        assert!(matches!(
            model.with_structured_output(person_schema(), StructuredOutputOptions::new()),
            Err(KilnError::Unsupported(_))
        ));
    }

    #[cfg(feature = "schema")]
    #[test]
    fn test_schema_from_type() {
        #[derive(schemars::JsonSchema)]
        #[allow(dead_code)]
        struct Weather {
            city: String,
            celsius: f64,
        }

        let schema = OutputSchema::of::<Weather>().unwrap();
        assert!(schema.as_value()["properties"]["city"].is_object());
        let tool = tool_definition(&schema, &StructuredOutputOptions::new().with_name("weather"));
        assert_eq!(tool.name, "weather");
    }
}
