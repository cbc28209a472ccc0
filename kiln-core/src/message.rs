//! Coercion of loosely-shaped conversation inputs into typed messages.

use crate::error::KilnError;
use crate::types::{Content, ContentPart, Message, Role};
use serde_json::Value;

/// Anything that can stand in for a message
#[derive(Debug, Clone, PartialEq)]
pub enum MessageLike {
    /// A bare string, read as a human turn
    Text(String),
    /// A `(role, content)` pair
    Tuple(Role, Content),
    /// An already-built message
    Message(Message),
}

impl From<&str> for MessageLike {
    fn from(text: &str) -> Self {
        MessageLike::Text(text.to_string())
    }
}

impl From<String> for MessageLike {
    fn from(text: String) -> Self {
        MessageLike::Text(text)
    }
}

impl From<Message> for MessageLike {
    fn from(message: Message) -> Self {
        MessageLike::Message(message)
    }
}

impl<R, C> From<(R, C)> for MessageLike
where
    R: Into<Role>,
    C: Into<Content>,
{
    fn from((role, content): (R, C)) -> Self {
        MessageLike::Tuple(role.into(), content.into())
    }
}

/// Input accepted by single-conversation entry points
#[derive(Debug, Clone, PartialEq)]
pub enum LanguageModelInput {
    /// One human turn
    Text(String),
    /// A full conversation
    Messages(Vec<MessageLike>),
}

impl From<&str> for LanguageModelInput {
    fn from(text: &str) -> Self {
        LanguageModelInput::Text(text.to_string())
    }
}

impl From<String> for LanguageModelInput {
    fn from(text: String) -> Self {
        LanguageModelInput::Text(text)
    }
}

impl From<Vec<MessageLike>> for LanguageModelInput {
    fn from(messages: Vec<MessageLike>) -> Self {
        LanguageModelInput::Messages(messages)
    }
}

impl From<Vec<Message>> for LanguageModelInput {
    fn from(messages: Vec<Message>) -> Self {
        LanguageModelInput::Messages(messages.into_iter().map(MessageLike::Message).collect())
    }
}

impl From<Message> for LanguageModelInput {
    fn from(message: Message) -> Self {
        LanguageModelInput::Messages(vec![MessageLike::Message(message)])
    }
}

impl LanguageModelInput {
    /// Normalize into a conversation
    pub fn into_messages(self) -> Vec<Message> {
        match self {
            LanguageModelInput::Text(text) => vec![Message::human(text)],
            LanguageModelInput::Messages(messages) => coerce_messages(messages),
        }
    }
}

/// Coerce one message-like into a message
pub fn coerce(message: impl Into<MessageLike>) -> Message {
    match message.into() {
        MessageLike::Text(text) => Message::human(text),
        MessageLike::Tuple(role, content) => Message::new(role, content),
        MessageLike::Message(message) => message,
    }
}

/// Coerce a conversation, preserving order
pub fn coerce_messages<I, M>(messages: I) -> Vec<Message>
where
    I: IntoIterator<Item = M>,
    M: Into<MessageLike>,
{
    messages.into_iter().map(coerce).collect()
}

/// Coerce a JSON value into a message.
///
/// Strings are human turns. Objects need a `role` (or `type`) and a
/// `content`; full serialized messages are accepted as well.
pub fn coerce_json(value: Value) -> Result<Message, KilnError> {
    match value {
        Value::String(text) => Ok(Message::human(text)),
        Value::Object(mut object) => {
            let role = object
                .remove("role")
                .or_else(|| object.remove("type"))
                .and_then(|role| role.as_str().map(Role::from))
                .ok_or_else(|| KilnError::invalid_request("message object is missing a role"))?;
            let content = object
                .remove("content")
                .ok_or_else(|| KilnError::invalid_request("message object is missing content"))?;
            object.insert("role".into(), Value::String(role.to_string()));
            object.insert("content".into(), content);
            Ok(serde_json::from_value(Value::Object(object))?)
        }
        other => Err(KilnError::invalid_request(format!(
            "cannot coerce {} into a message",
            other
        ))),
    }
}

/// Render a conversation as prompt text, one `Role: content` line per message.
///
/// This is the prompt half of the cache key.
pub fn buffer_string(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|message| {
            let label = match &message.role {
                Role::Human => "Human",
                Role::Ai => "AI",
                Role::System => "System",
                Role::Tool => "Tool",
                Role::Custom(role) => role.as_str(),
            };
            let name = message
                .name
                .as_deref()
                .map(|name| format!("{}, ", name))
                .unwrap_or_default();
            let mut line = format!("{}: {}{}", label, name, render_content(&message.content));
            if !message.tool_calls.is_empty() {
                if let Ok(calls) = serde_json::to_string(&message.tool_calls) {
                    line.push_str(&calls);
                }
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_content(content: &Content) -> String {
    match content {
        Content::Text(text) => text.clone(),
        Content::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => text.clone(),
                other => serde_json::to_string(other).unwrap_or_default(),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_coerce_shapes() {
        assert_eq!(coerce("hi"), Message::human("hi"));
        assert_eq!(coerce(("assistant", "hello")), Message::ai("hello"));
        assert_eq!(coerce((Role::System, "be brief")), Message::system("be brief"));

        let prebuilt = Message::ai("x").with_id("keep-me");
        assert_eq!(coerce(prebuilt.clone()), prebuilt);
    }

    #[test]
    fn test_unknown_role_is_kept() {
        let message = coerce(("critic", "too long"));
        assert_eq!(message.role, Role::Custom("critic".into()));
    }

    #[test]
    fn test_input_into_messages() {
        let single: LanguageModelInput = "What is Rust?".into();
        assert_eq!(single.into_messages(), vec![Message::human("What is Rust?")]);

        let conversation = LanguageModelInput::from(vec![
            MessageLike::from(("system", "terse")),
            MessageLike::from("hello"),
        ]);
        let messages = conversation.into_messages();
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].role, Role::Human);
    }

    #[test]
    fn test_coerce_json_objects() {
        let message = coerce_json(json!({"role": "user", "content": "hi"})).unwrap();
        assert_eq!(message, Message::human("hi"));

        let tool = coerce_json(json!({
            "role": "tool",
            "content": "42",
            "tool_call_id": "call-1"
        }))
        .unwrap();
        assert_eq!(tool.tool_call_id.as_deref(), Some("call-1"));

        assert!(matches!(
            coerce_json(json!({"content": "no role"})),
            Err(KilnError::InvalidRequest(_))
        ));
        assert!(coerce_json(json!(3)).is_err());
    }

    #[test]
    fn test_buffer_string() {
        let messages = vec![
            Message::system("You are terse."),
            Message::human("Hi").with_name("ada"),
            Message::ai(vec![
                ContentPart::Text { text: "see ".into() },
                ContentPart::Image {
                    url: "u".into(),
                },
            ]),
        ];
        assert_eq!(
            buffer_string(&messages),
            "System: You are terse.\nHuman: ada, Hi\nAI: see {\"type\":\"image\",\"url\":\"u\"}"
        );
    }
}
