//! Chat messages, prompt templates and request-body normalization.
//!
//! Callers send chat turns in a few different JSON shapes. Everything is
//! funneled into a [`ChatRequest`] before a prompt is rendered.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// A single chat turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// How chat messages are flattened into a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChatTemplate {
    /// `<|im_start|>role\ncontent<|im_end|>` turns plus an open assistant turn.
    #[default]
    ChatMl,
    /// `role: content` lines, no generation prompt.
    Plain,
}

impl std::str::FromStr for ChatTemplate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chatml" => Ok(Self::ChatMl),
            "plain" => Ok(Self::Plain),
            other => Err(format!("unknown chat template '{other}' (expected chatml or plain)")),
        }
    }
}

impl std::fmt::Display for ChatTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::ChatMl => "chatml",
            Self::Plain => "plain",
        })
    }
}

impl ChatTemplate {
    /// Render messages into a prompt string.
    ///
    /// With ChatML, `default_system` is prepended as a system turn when the
    /// conversation does not open with one.
    pub fn render(&self, messages: &[ChatMessage], default_system: Option<&str>) -> String {
        match self {
            Self::ChatMl => {
                let mut prompt = String::new();
                let opens_with_system = messages.first().is_some_and(|m| m.role == "system");
                if let (false, Some(system)) = (opens_with_system, default_system) {
                    push_chatml_turn(&mut prompt, "system", system);
                }
                for msg in messages {
                    push_chatml_turn(&mut prompt, &msg.role, &msg.content);
                }
                prompt.push_str("<|im_start|>assistant\n");
                prompt
            }
            Self::Plain => messages
                .iter()
                .map(|m| format!("{}: {}", m.role, m.content))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

fn push_chatml_turn(prompt: &mut String, role: &str, content: &str) {
    prompt.push_str("<|im_start|>");
    prompt.push_str(role);
    prompt.push('\n');
    prompt.push_str(content);
    prompt.push_str("<|im_end|>\n");
}

/// Per-request generation settings that override the server defaults.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GenerationOverrides {
    #[serde(default, alias = "max_tokens")]
    pub max_new_tokens: Option<usize>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub seed: Option<u64>,
}

/// Why a request body could not be turned into chat messages.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("unsupported input: {0}")]
    UnsupportedInput(String),
    #[error("message {index}: {reason}")]
    InvalidMessage { index: usize, reason: String },
    #[error("no messages supplied")]
    Empty,
    #[error("invalid generation settings: {0}")]
    InvalidOverrides(String),
}

/// A normalized generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub overrides: GenerationOverrides,
}

impl ChatRequest {
    /// Normalize any accepted request body.
    ///
    /// Accepted shapes: a bare array of messages, `{"messages": [...]}`,
    /// a single `{"role", "content"}` object, or `{"prompt": "..."}`.
    /// Object forms may also carry generation overrides.
    pub fn from_value(body: Value) -> Result<Self, RequestError> {
        let (messages, overrides) = match body {
            Value::Array(items) => (parse_messages(&items)?, GenerationOverrides::default()),
            Value::Object(obj) => {
                let overrides = parse_overrides(&obj)?;
                let messages = if let Some(messages) = obj.get("messages") {
                    match messages {
                        Value::Array(items) => parse_messages(items)?,
                        other => {
                            return Err(RequestError::UnsupportedInput(format!(
                                "'messages' must be an array, got {}",
                                kind(other)
                            )))
                        }
                    }
                } else if obj.contains_key("role") {
                    vec![parse_message(0, &Value::Object(obj.clone()))?]
                } else if let Some(prompt) = obj.get("prompt") {
                    match prompt {
                        Value::String(text) => vec![ChatMessage::new("user", text.clone())],
                        other => {
                            return Err(RequestError::UnsupportedInput(format!(
                                "'prompt' must be a string, got {}",
                                kind(other)
                            )))
                        }
                    }
                } else {
                    return Err(RequestError::UnsupportedInput(
                        "expected 'messages', 'prompt' or a single message object".into(),
                    ));
                };
                (messages, overrides)
            }
            other => {
                return Err(RequestError::UnsupportedInput(format!(
                    "expected a JSON array or object, got {}",
                    kind(&other)
                )))
            }
        };

        if messages.is_empty() {
            return Err(RequestError::Empty);
        }
        Ok(Self {
            messages,
            overrides,
        })
    }
}

fn parse_overrides(obj: &Map<String, Value>) -> Result<GenerationOverrides, RequestError> {
    const KEYS: &[&str] = &["max_new_tokens", "max_tokens", "temperature", "top_p", "top_k", "seed"];
    let subset: Map<String, Value> = obj
        .iter()
        .filter(|(k, v)| KEYS.contains(&k.as_str()) && !v.is_null())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    serde_json::from_value(Value::Object(subset))
        .map_err(|e| RequestError::InvalidOverrides(e.to_string()))
}

fn parse_messages(items: &[Value]) -> Result<Vec<ChatMessage>, RequestError> {
    items
        .iter()
        .enumerate()
        .map(|(index, item)| parse_message(index, item))
        .collect()
}

fn parse_message(index: usize, item: &Value) -> Result<ChatMessage, RequestError> {
    let invalid = |reason: String| RequestError::InvalidMessage { index, reason };

    let obj = item
        .as_object()
        .ok_or_else(|| invalid(format!("expected an object, got {}", kind(item))))?;
    let role = match obj.get("role") {
        Some(Value::String(role)) if !role.trim().is_empty() => role.trim().to_string(),
        Some(Value::String(_)) => return Err(invalid("'role' is empty".into())),
        Some(other) => return Err(invalid(format!("'role' must be a string, got {}", kind(other)))),
        None => return Err(invalid("missing 'role'".into())),
    };
    let content = content_text(obj.get("content").unwrap_or(&Value::Null)).map_err(invalid)?;

    Ok(ChatMessage { role, content })
}

/// Flatten a `content` value into text.
fn content_text(content: &Value) -> Result<String, String> {
    match content {
        Value::Null => Ok(String::new()),
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Array(parts) => {
            let mut text = String::new();
            for part in parts {
                match part {
                    Value::String(s) => text.push_str(s),
                    Value::Object(obj) => match (obj.get("type"), obj.get("text")) {
                        (Some(Value::String(t)), Some(Value::String(s))) if t == "text" => {
                            text.push_str(s)
                        }
                        _ => return Err("content parts must be strings or text parts".into()),
                    },
                    other => {
                        return Err(format!("unsupported content part: {}", kind(other)));
                    }
                }
            }
            Ok(text)
        }
        Value::Object(_) => Err("'content' must be a string or a list of text parts".into()),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msgs(req: &ChatRequest) -> Vec<(&str, &str)> {
        req.messages
            .iter()
            .map(|m| (m.role.as_str(), m.content.as_str()))
            .collect()
    }

    #[test]
    fn bare_array() {
        let req = ChatRequest::from_value(json!([
            {"role": "system", "content": "Be brief."},
            {"role": "user", "content": "Hi"}
        ]))
        .unwrap();
        assert_eq!(msgs(&req), vec![("system", "Be brief."), ("user", "Hi")]);
        assert_eq!(req.overrides, GenerationOverrides::default());
    }

    #[test]
    fn messages_object_with_overrides() {
        let req = ChatRequest::from_value(json!({
            "messages": [{"role": "user", "content": "Hi"}],
            "max_tokens": 32,
            "temperature": 0.0,
            "top_p": null
        }))
        .unwrap();
        assert_eq!(msgs(&req), vec![("user", "Hi")]);
        assert_eq!(req.overrides.max_new_tokens, Some(32));
        assert_eq!(req.overrides.temperature, Some(0.0));
        assert_eq!(req.overrides.top_p, None);
    }

    #[test]
    fn single_message_object() {
        let req = ChatRequest::from_value(json!({"role": "user", "content": "Hi"})).unwrap();
        assert_eq!(msgs(&req), vec![("user", "Hi")]);
    }

    #[test]
    fn prompt_string_becomes_user_turn() {
        let req = ChatRequest::from_value(json!({"prompt": "Tell me a joke"})).unwrap();
        assert_eq!(msgs(&req), vec![("user", "Tell me a joke")]);
    }

    #[test]
    fn content_variants_are_flattened() {
        let req = ChatRequest::from_value(json!([
            {"role": "user", "content": [{"type": "text", "text": "a"}, "b"]},
            {"role": "user", "content": 42},
            {"role": "assistant", "content": null},
            {"role": "user"}
        ]))
        .unwrap();
        assert_eq!(
            msgs(&req),
            vec![("user", "ab"), ("user", "42"), ("assistant", ""), ("user", "")]
        );
    }

    #[test]
    fn unsupported_shapes() {
        assert!(matches!(
            ChatRequest::from_value(json!("hello")),
            Err(RequestError::UnsupportedInput(_))
        ));
        assert!(matches!(
            ChatRequest::from_value(json!({"messages": "hello"})),
            Err(RequestError::UnsupportedInput(_))
        ));
        assert!(matches!(
            ChatRequest::from_value(json!({"text": "hello"})),
            Err(RequestError::UnsupportedInput(_))
        ));
        assert_eq!(ChatRequest::from_value(json!([])), Err(RequestError::Empty));
    }

    #[test]
    fn non_string_prompt_is_unsupported() {
        let err = ChatRequest::from_value(json!({"prompt": 5})).unwrap_err();
        assert_eq!(
            err,
            RequestError::UnsupportedInput("'prompt' must be a string, got a number".into())
        );
        assert!(matches!(
            ChatRequest::from_value(json!({"prompt": ["hi"]})),
            Err(RequestError::UnsupportedInput(_))
        ));
    }

    #[test]
    fn blank_role_is_rejected() {
        for role in ["", "   "] {
            let err = ChatRequest::from_value(json!([{"role": role, "content": "x"}]))
                .unwrap_err();
            assert_eq!(
                err,
                RequestError::InvalidMessage {
                    index: 0,
                    reason: "'role' is empty".into()
                }
            );
        }
        let err = ChatRequest::from_value(json!({"role": " ", "content": "x"})).unwrap_err();
        assert!(matches!(err, RequestError::InvalidMessage { index: 0, .. }));
    }

    #[test]
    fn bad_messages_report_index() {
        let err = ChatRequest::from_value(json!([
            {"role": "user", "content": "ok"},
            {"content": "no role"}
        ]))
        .unwrap_err();
        assert_eq!(
            err,
            RequestError::InvalidMessage {
                index: 1,
                reason: "missing 'role'".into()
            }
        );

        let err = ChatRequest::from_value(json!([{"role": "user", "content": {"x": 1}}]))
            .unwrap_err();
        assert!(matches!(err, RequestError::InvalidMessage { index: 0, .. }));
    }

    #[test]
    fn bad_override_type() {
        let err = ChatRequest::from_value(json!({
            "messages": [{"role": "user", "content": "Hi"}],
            "max_new_tokens": "lots"
        }))
        .unwrap_err();
        assert!(matches!(err, RequestError::InvalidOverrides(_)));
    }

    #[test]
    fn chatml_render() {
        let messages = vec![ChatMessage::new("user", "Hi")];
        assert_eq!(
            ChatTemplate::ChatMl.render(&messages, None),
            "<|im_start|>user\nHi<|im_end|>\n<|im_start|>assistant\n"
        );
        assert_eq!(
            ChatTemplate::ChatMl.render(&messages, Some("Be nice.")),
            "<|im_start|>system\nBe nice.<|im_end|>\n\
             <|im_start|>user\nHi<|im_end|>\n<|im_start|>assistant\n"
        );
    }

    #[test]
    fn chatml_keeps_caller_system_prompt() {
        let messages = vec![
            ChatMessage::new("system", "Mine."),
            ChatMessage::new("user", "Hi"),
        ];
        let prompt = ChatTemplate::ChatMl.render(&messages, Some("Default."));
        assert!(!prompt.contains("Default."));
        assert!(prompt.starts_with("<|im_start|>system\nMine.<|im_end|>\n"));
    }

    #[test]
    fn plain_render_joins_lines() {
        let messages = vec![
            ChatMessage::new("system", "Be brief."),
            ChatMessage::new("user", "Hi"),
        ];
        assert_eq!(
            ChatTemplate::Plain.render(&messages, Some("ignored")),
            "system: Be brief.\nuser: Hi"
        );
    }

    #[test]
    fn template_names() {
        assert_eq!("ChatML".parse::<ChatTemplate>().unwrap(), ChatTemplate::ChatMl);
        assert_eq!("plain".parse::<ChatTemplate>().unwrap(), ChatTemplate::Plain);
        assert!("jinja".parse::<ChatTemplate>().is_err());
    }
}
