//! Wire types shared between the host and the in-container wrapper.
//!
//! Records on the output channel are tagged by `type`; the closed set of
//! kinds is modeled as [`AgentMessage`]. The terminal record of a turn is
//! always a `result` record, decoded into [`TurnResult`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token counts reported by the agent for one turn.
///
/// Canonical field names are snake case; [`TokenUsage::from_value`] also
/// accepts the camel-cased variants some agent versions emit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Extract usage from a `usage` object, tolerating snake and camel keys.
    pub fn from_value(value: &Value) -> Self {
        let field = |snake: &str, camel: &str| -> u64 {
            value
                .get(snake)
                .or_else(|| value.get(camel))
                .and_then(Value::as_u64)
                .unwrap_or(0)
        };
        Self {
            input_tokens: field("input_tokens", "inputTokens"),
            output_tokens: field("output_tokens", "outputTokens"),
        }
    }
}

/// Whether a turn finished cleanly or with an agent-reported error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultSubtype {
    Success,
    Error,
}

impl Default for ResultSubtype {
    fn default() -> Self {
        Self::Success
    }
}

/// Terminal record of one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnResult {
    #[serde(default)]
    pub subtype: ResultSubtype,
    /// Final text, when the agent produced one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Resumable agent-session identifier, when the agent surfaced one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl TurnResult {
    /// Decode a `result` record, tolerating snake- and camel-cased field
    /// variants on usage, duration and session id.
    pub fn from_value(value: &Value) -> Self {
        let subtype = match value.get("subtype").and_then(Value::as_str) {
            Some("error") => ResultSubtype::Error,
            _ => ResultSubtype::Success,
        };
        let opt_u64 = |snake: &str, camel: &str| {
            value
                .get(snake)
                .or_else(|| value.get(camel))
                .and_then(Value::as_u64)
        };
        let opt_str = |snake: &str, camel: &str| {
            value
                .get(snake)
                .or_else(|| value.get(camel))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        Self {
            subtype,
            result: value
                .get("result")
                .and_then(Value::as_str)
                .map(str::to_string),
            usage: value
                .get("usage")
                .map(TokenUsage::from_value)
                .unwrap_or_default(),
            duration_ms: opt_u64("duration_ms", "durationMs"),
            session_id: opt_str("session_id", "sessionId"),
        }
    }

    pub fn is_error(&self) -> bool {
        self.subtype == ResultSubtype::Error
    }
}

/// One parsed record from the agent output stream.
///
/// Non-terminal variants carry the decoded record verbatim so downstream
/// consumers can render whatever the agent emitted; the terminal `result`
/// record is decoded into its typed form.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentMessage {
    Assistant(Value),
    ToolUse(Value),
    ToolResult(Value),
    System(Value),
    Result(TurnResult),
    Error(Value),
}

impl AgentMessage {
    /// Classify a decoded record into its message kind.
    ///
    /// A `message` envelope is unwrapped to its inner `type`. Records with
    /// no recognizable kind yield `None` and are dropped by callers.
    pub fn classify(value: Value) -> Option<Self> {
        let outer = value.get("type").and_then(Value::as_str)?;
        let effective = if outer == "message" {
            value
                .get("message")
                .and_then(|m| m.get("type"))
                .and_then(Value::as_str)
                .unwrap_or(outer)
        } else {
            outer
        };
        match effective {
            "assistant" => Some(Self::Assistant(value)),
            "tool_use" => Some(Self::ToolUse(value)),
            "tool_result" => Some(Self::ToolResult(value)),
            "system" => Some(Self::System(value)),
            "result" => Some(Self::Result(TurnResult::from_value(&value))),
            "error" => Some(Self::Error(value)),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Assistant(_) => "assistant",
            Self::ToolUse(_) => "tool_use",
            Self::ToolResult(_) => "tool_result",
            Self::System(_) => "system",
            Self::Result(_) => "result",
            Self::Error(_) => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Result(_))
    }

    /// Wire form published on the output channel.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Assistant(v)
            | Self::ToolUse(v)
            | Self::ToolResult(v)
            | Self::System(v)
            | Self::Error(v) => v.clone(),
            Self::Result(r) => {
                let mut v = serde_json::to_value(r).unwrap_or(Value::Null);
                if let Some(obj) = v.as_object_mut() {
                    obj.insert("type".to_string(), Value::String("result".to_string()));
                }
                v
            }
        }
    }
}

/// One prompt-execution input pushed onto a session's input queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputRecord {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub queued_at: DateTime<Utc>,
}

impl InputRecord {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            attachments: Vec::new(),
            extra_system_prompt: None,
            model: None,
            queued_at: Utc::now(),
        }
    }
}

/// Priority of a redirect interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedirectPriority {
    Normal,
    High,
}

impl Default for RedirectPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl std::fmt::Display for RedirectPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Control records delivered to the in-container wrapper.
///
/// `Rebind` is host-internal: it re-keys a warm container's session
/// channels when the container is assigned to a caller session. The public
/// interrupt kinds are stop, redirect, pause and resume; anything the
/// wrapper cannot decode is logged and ignored on its side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Interrupt {
    Stop,
    Redirect {
        message: String,
        #[serde(default)]
        priority: RedirectPriority,
    },
    Pause,
    Resume,
    Rebind {
        session_key: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_usage_accepts_both_casings() {
        let snake = TokenUsage::from_value(&json!({"input_tokens": 3, "output_tokens": 1}));
        assert_eq!(snake, TokenUsage::new(3, 1));

        let camel = TokenUsage::from_value(&json!({"inputTokens": 7, "outputTokens": 9}));
        assert_eq!(camel, TokenUsage::new(7, 9));

        let missing = TokenUsage::from_value(&json!({}));
        assert_eq!(missing, TokenUsage::default());
    }

    #[test]
    fn test_turn_result_extraction() {
        let r = TurnResult::from_value(&json!({
            "type": "result",
            "subtype": "success",
            "result": "hello",
            "usage": {"input_tokens": 3, "output_tokens": 1},
            "duration_ms": 42,
            "session_id": "abc"
        }));
        assert_eq!(r.result.as_deref(), Some("hello"));
        assert_eq!(r.usage, TokenUsage::new(3, 1));
        assert_eq!(r.duration_ms, Some(42));
        assert_eq!(r.session_id.as_deref(), Some("abc"));
        assert!(!r.is_error());
    }

    #[test]
    fn test_turn_result_camel_variants() {
        let r = TurnResult::from_value(&json!({
            "subtype": "error",
            "usage": {"inputTokens": 1, "outputTokens": 2},
            "durationMs": 10,
            "sessionId": "xyz"
        }));
        assert!(r.is_error());
        assert_eq!(r.usage, TokenUsage::new(1, 2));
        assert_eq!(r.duration_ms, Some(10));
        assert_eq!(r.session_id.as_deref(), Some("xyz"));
    }

    #[test]
    fn test_classify_plain_kinds() {
        let m = AgentMessage::classify(json!({"type": "assistant", "content": "hi"})).unwrap();
        assert_eq!(m.kind(), "assistant");

        let m = AgentMessage::classify(json!({"type": "tool_use", "name": "bash"})).unwrap();
        assert_eq!(m.kind(), "tool_use");

        assert!(AgentMessage::classify(json!({"type": "banana"})).is_none());
        assert!(AgentMessage::classify(json!({"no_type": true})).is_none());
    }

    #[test]
    fn test_classify_message_envelope() {
        let m = AgentMessage::classify(json!({
            "type": "message",
            "message": {"type": "assistant", "content": "inner"}
        }))
        .unwrap();
        assert_eq!(m.kind(), "assistant");
    }

    #[test]
    fn test_result_round_trips_through_wire_form() {
        let m = AgentMessage::classify(json!({
            "type": "result",
            "subtype": "error",
            "usage": {"input_tokens": 5, "output_tokens": 6}
        }))
        .unwrap();
        assert!(m.is_terminal());

        let wire = m.to_value();
        assert_eq!(wire["type"], "result");
        let back = AgentMessage::classify(wire).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn test_interrupt_tagging() {
        let i: Interrupt = serde_json::from_value(json!({"type": "stop"})).unwrap();
        assert_eq!(i, Interrupt::Stop);

        let i: Interrupt =
            serde_json::from_value(json!({"type": "redirect", "message": "focus on tests"}))
                .unwrap();
        assert_eq!(
            i,
            Interrupt::Redirect {
                message: "focus on tests".to_string(),
                priority: RedirectPriority::Normal,
            }
        );

        assert!(serde_json::from_value::<Interrupt>(json!({"type": "reboot"})).is_err());
    }
}
