//! Core types for generation operations.

use serde::{Deserialize, Serialize};
pub use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Free-form metadata attached to messages, generations and runs
pub type Metadata = serde_json::Map<String, Value>;

/// Message role.
///
/// The role space is open: provider-specific roles are kept verbatim in
/// [`Role::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    Human,
    Ai,
    System,
    Tool,
    Custom(String),
}

impl Role {
    /// Canonical role name
    pub fn as_str(&self) -> &str {
        match self {
            Role::Human => "human",
            Role::Ai => "ai",
            Role::System => "system",
            Role::Tool => "tool",
            Role::Custom(role) => role,
        }
    }
}

impl From<&str> for Role {
    fn from(s: &str) -> Self {
        match s {
            "human" | "user" => Role::Human,
            "ai" | "assistant" => Role::Ai,
            "system" => Role::System,
            "tool" => Role::Tool,
            other => Role::Custom(other.to_string()),
        }
    }
}

impl From<String> for Role {
    fn from(s: String) -> Self {
        Role::from(s.as_str())
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        match role {
            Role::Custom(role) => role,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message content block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { url: String },
}

/// Message content: plain text or an ordered list of blocks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Content {
    /// Concatenated text of all text blocks
    pub fn text(&self) -> String {
        match self {
            Content::Text(text) => text.clone(),
            Content::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Content::Text(text) => text.is_empty(),
            Content::Parts(parts) => parts.is_empty(),
        }
    }

    /// Append `other` to this content.
    ///
    /// Text with text stays text. Anything involving blocks becomes a block
    /// list, with adjacent text blocks joined at the seam.
    pub fn concat(self, other: Content) -> Content {
        match (self, other) {
            (Content::Text(mut left), Content::Text(right)) => {
                left.push_str(&right);
                Content::Text(left)
            }
            (left, right) => {
                let mut parts = left.into_parts();
                for part in right.into_parts() {
                    push_part(&mut parts, part);
                }
                Content::Parts(parts)
            }
        }
    }

    fn into_parts(self) -> Vec<ContentPart> {
        match self {
            Content::Text(text) => vec![ContentPart::Text { text }],
            Content::Parts(parts) => parts,
        }
    }
}

fn push_part(parts: &mut Vec<ContentPart>, part: ContentPart) {
    if let (Some(ContentPart::Text { text: last }), ContentPart::Text { text }) =
        (parts.last_mut(), &part)
    {
        last.push_str(text);
        return;
    }
    parts.push(part);
}

impl Default for Content {
    fn default() -> Self {
        Content::Text(String::new())
    }
}

impl From<&str> for Content {
    fn from(text: &str) -> Self {
        Content::Text(text.to_string())
    }
}

impl From<String> for Content {
    fn from(text: String) -> Self {
        Content::Text(text)
    }
}

impl From<Vec<ContentPart>> for Content {
    fn from(parts: Vec<ContentPart>) -> Self {
        Content::Parts(parts)
    }
}

/// A complete tool call emitted by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub args: Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            id: None,
            name: name.into(),
            args,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// A fragment of a tool call received while streaming.
///
/// Fragments sharing an `index` belong to the same call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Raw, possibly partial, JSON arguments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<String>,
}

impl ToolCallChunk {
    fn merge(&mut self, other: ToolCallChunk) {
        if self.id.is_none() {
            self.id = other.id;
        }
        concat_opt(&mut self.name, other.name);
        concat_opt(&mut self.args, other.args);
    }

    /// Finish the fragment into a tool call. Fragments without a name are dropped.
    fn into_tool_call(self) -> Option<ToolCall> {
        let name = self.name?;
        let args = match self.args.as_deref().map(str::trim) {
            None | Some("") => Value::Object(Metadata::new()),
            Some(raw) => serde_json::from_str(raw).unwrap_or_else(|_| Value::Object(Metadata::new())),
        };
        Some(ToolCall {
            id: self.id,
            name,
            args,
        })
    }
}

fn concat_opt(left: &mut Option<String>, right: Option<String>) {
    match (left.as_mut(), right) {
        (Some(l), Some(r)) => l.push_str(&r),
        (None, Some(r)) => *left = Some(r),
        (_, None) => {}
    }
}

fn merge_tool_call_chunks(left: &mut Vec<ToolCallChunk>, right: Vec<ToolCallChunk>) {
    for chunk in right {
        let existing = chunk
            .index
            .and_then(|index| left.iter_mut().find(|c| c.index == Some(index)));
        match existing {
            Some(existing) => existing.merge(chunk),
            None => left.push(chunk),
        }
    }
}

/// Token usage statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

impl std::ops::Add for Usage {
    type Output = Usage;

    fn add(self, rhs: Usage) -> Usage {
        Usage {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
            total_tokens: self.total_tokens + rhs.total_tokens,
        }
    }
}

fn merge_usage(left: Option<Usage>, right: Option<Usage>) -> Option<Usage> {
    match (left, right) {
        (Some(l), Some(r)) => Some(l + r),
        (l, r) => l.or(r),
    }
}

/// Merge two metadata maps; `right` takes precedence.
///
/// Nested objects merge recursively. A `null` on the right never replaces
/// an existing value, and neither does a non-object value replace an object.
/// The merge is associative.
pub fn merge_metadata(mut left: Metadata, right: Metadata) -> Metadata {
    for (key, value) in right {
        let merged = match (left.remove(&key), value) {
            (Some(existing), Value::Null) => existing,
            (Some(Value::Object(l)), Value::Object(r)) => Value::Object(merge_metadata(l, r)),
            (Some(Value::Object(l)), _) => Value::Object(l),
            (_, value) => value,
        };
        left.insert(key, merged);
    }
    left
}

/// Message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Content,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Tool calls requested by an `ai` message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Call being answered by a `tool` message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub response_metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl Message {
    /// Create a message with an arbitrary role
    pub fn new(role: impl Into<Role>, content: impl Into<Content>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            id: None,
            name: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
            response_metadata: Metadata::new(),
            usage: None,
        }
    }

    /// Create a new human message
    pub fn human(content: impl Into<Content>) -> Self {
        Self::new(Role::Human, content)
    }

    /// Create a new AI message
    pub fn ai(content: impl Into<Content>) -> Self {
        Self::new(Role::Ai, content)
    }

    /// Create a new system message
    pub fn system(content: impl Into<Content>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a tool result message answering `tool_call_id`
    pub fn tool(content: impl Into<Content>, tool_call_id: impl Into<String>) -> Self {
        let mut message = Self::new(Role::Tool, content);
        message.tool_call_id = Some(tool_call_id.into());
        message
    }

    /// Set the message name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the message id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Attach tool calls
    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    /// Attach token usage
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Text of the message content
    pub fn text(&self) -> String {
        self.content.text()
    }
}

/// Incremental delta of a message received while streaming
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageChunk {
    pub role: Role,
    pub content: Content,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_call_chunks: Vec<ToolCallChunk>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub response_metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl MessageChunk {
    /// Create an AI delta carrying `content`
    pub fn ai(content: impl Into<Content>) -> Self {
        Self {
            role: Role::Ai,
            content: content.into(),
            id: None,
            name: None,
            tool_call_chunks: Vec::new(),
            response_metadata: Metadata::new(),
            usage: None,
        }
    }

    /// Attach tool call fragments
    pub fn with_tool_call_chunks(mut self, chunks: Vec<ToolCallChunk>) -> Self {
        self.tool_call_chunks = chunks;
        self
    }

    /// Attach token usage
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn text(&self) -> String {
        self.content.text()
    }

    /// Append another delta. Associative: folding left or right yields the same chunk.
    pub fn concat(mut self, other: MessageChunk) -> MessageChunk {
        self.content = self.content.concat(other.content);
        if self.id.is_none() {
            self.id = other.id;
        }
        if self.name.is_none() {
            self.name = other.name;
        }
        merge_tool_call_chunks(&mut self.tool_call_chunks, other.tool_call_chunks);
        self.response_metadata = merge_metadata(self.response_metadata, other.response_metadata);
        self.usage = merge_usage(self.usage, other.usage);
        self
    }

    /// Finish the delta into a message, parsing tool call fragments
    pub fn into_message(self) -> Message {
        Message {
            role: self.role,
            content: self.content,
            id: self.id,
            name: self.name,
            tool_calls: self
                .tool_call_chunks
                .into_iter()
                .filter_map(ToolCallChunk::into_tool_call)
                .collect(),
            tool_call_id: None,
            response_metadata: self.response_metadata,
            usage: self.usage,
        }
    }
}

impl From<Message> for MessageChunk {
    fn from(message: Message) -> Self {
        let tool_call_chunks = message
            .tool_calls
            .into_iter()
            .enumerate()
            .map(|(index, call)| ToolCallChunk {
                index: Some(index as u32),
                id: call.id,
                name: Some(call.name),
                args: Some(call.args.to_string()),
            })
            .collect();
        Self {
            role: message.role,
            content: message.content,
            id: message.id,
            name: message.name,
            tool_call_chunks,
            response_metadata: message.response_metadata,
            usage: message.usage,
        }
    }
}

/// One candidate completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    pub message: Message,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub generation_info: Metadata,
}

impl Generation {
    pub fn new(message: Message) -> Self {
        Self {
            text: message.text(),
            message,
            generation_info: Metadata::new(),
        }
    }

    pub fn with_generation_info(mut self, info: Metadata) -> Self {
        self.generation_info = info;
        self
    }
}

/// Partial generation received while streaming
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationChunk {
    pub text: String,
    pub message: MessageChunk,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub generation_info: Metadata,
}

impl GenerationChunk {
    pub fn new(message: MessageChunk) -> Self {
        Self {
            text: message.text(),
            message,
            generation_info: Metadata::new(),
        }
    }

    pub fn with_generation_info(mut self, info: Metadata) -> Self {
        self.generation_info = info;
        self
    }

    /// Fold `other` onto this chunk
    pub fn concat(mut self, other: GenerationChunk) -> GenerationChunk {
        self.text.push_str(&other.text);
        self.message = self.message.concat(other.message);
        self.generation_info = merge_metadata(self.generation_info, other.generation_info);
        self
    }
}

impl From<GenerationChunk> for Generation {
    fn from(chunk: GenerationChunk) -> Self {
        Self {
            text: chunk.text,
            message: chunk.message.into_message(),
            generation_info: chunk.generation_info,
        }
    }
}

/// Output of one provider call for one conversation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatResult {
    pub generations: Vec<Generation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_output: Option<Metadata>,
}

impl ChatResult {
    /// A result holding a single generation for `message`
    pub fn single(message: Message) -> Self {
        Self {
            generations: vec![Generation::new(message)],
            llm_output: None,
        }
    }

    pub fn with_llm_output(mut self, llm_output: Metadata) -> Self {
        self.llm_output = Some(llm_output);
        self
    }
}

/// Result of a batch call.
///
/// `generations[i]` and `run_ids[i]` belong to input conversation `i`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResult {
    pub generations: Vec<Vec<Generation>>,
    pub llm_output: Option<Metadata>,
    pub run_ids: Vec<Uuid>,
}

/// Tool definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// How the model should use the tools it was given
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
    /// The model may call any tool or none
    Auto,
    /// The model must call one of the tools
    Any,
    /// The model must not call tools
    None,
    /// The model must call this tool
    Tool { name: String },
}

/// Invocation parameters that shape the completion.
///
/// Everything here is part of the cache fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    /// Additional provider-specific parameters
    #[serde(flatten)]
    pub extra: Metadata,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set stop sequences
    pub fn with_stop(mut self, stop: Vec<String>) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Set temperature
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set max tokens
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set tools
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    /// Set tool choice
    pub fn with_tool_choice(mut self, tool_choice: ToolChoice) -> Self {
        self.tool_choice = Some(tool_choice);
        self
    }

    /// Set an extra provider-specific parameter
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Overlay `overrides` on top of these options; set values in `overrides` win
    pub fn merged(&self, overrides: &CallOptions) -> CallOptions {
        let mut extra = self.extra.clone();
        for (key, value) in &overrides.extra {
            extra.insert(key.clone(), value.clone());
        }
        CallOptions {
            stop: overrides.stop.clone().or_else(|| self.stop.clone()),
            temperature: overrides.temperature.or(self.temperature),
            max_tokens: overrides.max_tokens.or(self.max_tokens),
            tools: if overrides.tools.is_empty() {
                self.tools.clone()
            } else {
                overrides.tools.clone()
            },
            tool_choice: overrides
                .tool_choice
                .clone()
                .or_else(|| self.tool_choice.clone()),
            extra,
        }
    }
}

/// Per-call runtime settings that never affect the completion itself
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    pub options: CallOptions,
    pub cancel: Option<CancellationToken>,
    pub timeout: Option<Duration>,
    /// Upper bound on concurrent provider calls within a batch
    pub max_concurrency: Option<usize>,
    pub run_name: Option<String>,
    pub metadata: Metadata,
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = Some(max_concurrency.max(1));
        self
    }

    pub fn with_run_name(mut self, run_name: impl Into<String>) -> Self {
        self.run_name = Some(run_name.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Provider information
#[derive(Debug, Clone)]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
}

impl ProviderInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            name: name.into(),
        })
    }
}

/// What a provider adapter supports, declared at construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Implements incremental chunk streaming
    pub streaming: bool,
    /// Accepts tool definitions
    pub tool_calling: bool,
    /// Honours `ToolChoice::Tool` to force one specific tool
    pub tool_choice: bool,
}

impl Capabilities {
    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_tool_calling(mut self, tool_calling: bool) -> Self {
        self.tool_calling = tool_calling;
        self
    }

    pub fn with_tool_choice(mut self, tool_choice: bool) -> Self {
        self.tool_choice = tool_choice;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(value: Value) -> Metadata {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn chunk(text: &str) -> GenerationChunk {
        GenerationChunk::new(MessageChunk::ai(text))
    }

    #[test]
    fn test_role_aliases_and_custom() {
        assert_eq!(Role::from("user"), Role::Human);
        assert_eq!(Role::from("assistant"), Role::Ai);
        assert_eq!(Role::from("developer"), Role::Custom("developer".into()));

        let json = serde_json::to_value(Role::Custom("critic".into())).unwrap();
        assert_eq!(json, json!("critic"));
        let role: Role = serde_json::from_value(json!("system")).unwrap();
        assert_eq!(role, Role::System);
    }

    #[test]
    fn test_content_concat_promotes_blocks() {
        let image = ContentPart::Image {
            url: "https://example.com/cat.png".into(),
        };
        let merged = Content::from("a")
            .concat(Content::from(vec![image.clone()]))
            .concat(Content::from("b"))
            .concat(Content::from("c"));

        assert_eq!(
            merged,
            Content::Parts(vec![
                ContentPart::Text { text: "a".into() },
                image,
                ContentPart::Text { text: "bc".into() },
            ])
        );
        assert_eq!(merged.text(), "abc");
    }

    #[test]
    fn test_generation_chunk_concat_is_associative() {
        let mut a = chunk("Hel");
        a.message.id = Some("msg-1".into());
        a.generation_info = meta(json!({"model": "m", "nested": {"x": 1}}));
        let mut b = chunk("lo").with_generation_info(meta(json!({"nested": {"y": 2}})));
        b.message.tool_call_chunks = vec![ToolCallChunk {
            index: Some(0),
            id: Some("call-1".into()),
            name: Some("extract".into()),
            args: Some("{\"na".into()),
        }];
        b.message.usage = Some(Usage {
            input_tokens: 3,
            output_tokens: 1,
            total_tokens: 4,
        });
        let mut c = chunk(" world").with_generation_info(meta(json!({"finish_reason": "stop"})));
        c.message.tool_call_chunks = vec![ToolCallChunk {
            index: Some(0),
            args: Some("me\":\"kiln\"}".into()),
            ..Default::default()
        }];
        c.message.usage = Some(Usage {
            input_tokens: 0,
            output_tokens: 2,
            total_tokens: 2,
        });

        let left = a.clone().concat(b.clone()).concat(c.clone());
        let right = a.concat(b.concat(c));
        assert_eq!(left, right);

        let shapes = [
            json!({"k": {"x": 1}}),
            json!({"k": 2}),
            json!({"k": {"y": 2}}),
            json!({"k": null}),
            json!({"k": [1]}),
        ];
        for a in &shapes {
            for b in &shapes {
                for c in &shapes {
                    let info = |value: &Value| chunk("").with_generation_info(meta(value.clone()));
                    let left = info(a).concat(info(b)).concat(info(c));
                    let right = info(a).concat(info(b).concat(info(c)));
                    assert_eq!(left, right, "{} {} {}", a, b, c);
                }
            }
        }

        assert_eq!(left.text, "Hello world");
        assert_eq!(left.message.id.as_deref(), Some("msg-1"));
        assert_eq!(
            Value::Object(left.generation_info.clone()),
            json!({"model": "m", "nested": {"x": 1, "y": 2}, "finish_reason": "stop"})
        );
        assert_eq!(left.message.usage.unwrap().total_tokens, 6);

        let generation = Generation::from(left);
        assert_eq!(
            generation.message.tool_calls,
            vec![ToolCall::new("extract", json!({"name": "kiln"})).with_id("call-1")]
        );
    }

    #[test]
    fn test_tool_call_chunks_without_index_append() {
        let first = MessageChunk::ai("").with_tool_call_chunks(vec![ToolCallChunk {
            name: Some("a".into()),
            ..Default::default()
        }]);
        let second = MessageChunk::ai("").with_tool_call_chunks(vec![ToolCallChunk {
            name: Some("b".into()),
            args: Some("not json".into()),
            ..Default::default()
        }]);

        let message = first.concat(second).into_message();
        assert_eq!(message.tool_calls.len(), 2);
        assert_eq!(message.tool_calls[1].name, "b");
        assert_eq!(message.tool_calls[1].args, json!({}));
    }

    #[test]
    fn test_merge_metadata_right_wins_except_null() {
        let merged = merge_metadata(
            meta(json!({"a": 1, "b": "keep", "c": {"d": 1}})),
            meta(json!({"a": 2, "b": null, "c": {"e": 2}})),
        );
        assert_eq!(
            Value::Object(merged),
            json!({"a": 2, "b": "keep", "c": {"d": 1, "e": 2}})
        );

        let object_then_scalar = merge_metadata(meta(json!({"k": {"x": 1}})), meta(json!({"k": 2})));
        assert_eq!(Value::Object(object_then_scalar), json!({"k": {"x": 1}}));
        let scalar_then_object = merge_metadata(meta(json!({"k": 2})), meta(json!({"k": {"y": 2}})));
        assert_eq!(Value::Object(scalar_then_object), json!({"k": {"y": 2}}));
    }

    #[test]
    fn test_call_options_merge() {
        let defaults = CallOptions::new()
            .with_temperature(0.2)
            .with_stop(vec!["\n".into()])
            .with_extra("seed", json!(7));
        let overrides = CallOptions::new()
            .with_temperature(0.9)
            .with_tool_choice(ToolChoice::Any)
            .with_extra("top_k", json!(3));

        let merged = defaults.merged(&overrides);
        assert_eq!(merged.temperature, Some(0.9));
        assert_eq!(merged.stop, Some(vec!["\n".to_string()]));
        assert_eq!(merged.tool_choice, Some(ToolChoice::Any));
        assert_eq!(merged.extra.len(), 2);
    }

    #[test]
    fn test_message_chunk_from_message_round_trips_tool_calls() {
        let message = Message::ai("").with_tool_calls(vec![ToolCall::new("f", json!({"x": 1}))]);
        let chunk = MessageChunk::from(message.clone());
        assert_eq!(chunk.into_message(), message);
    }
}
