//! Agent session protocol: the abstract event set the runtime consumes, plus
//! the NDJSON wire dialects spoken by agent subprocesses.

use serde::{Deserialize, Serialize};
use serde_json::json;

/// Wire dialect an agent subprocess speaks on stdin/stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    #[default]
    Default,
    NativeCopilot,
}

/// Options sent when opening a session on an agent handle.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub streaming: bool,
    pub model: Option<String>,
}

/// The abstract event set every dialect is parsed into.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Incremental assistant text.
    MessageDelta(String),
    /// A complete assistant message. Authoritative only when no deltas arrived.
    Message(String),
    /// The agent invoked a tool; `label` is a human hint taken from its args.
    Tool { name: String, label: Option<String> },
    /// Terminal success.
    Idle,
    /// Terminal failure.
    SessionError(String),
}

/// Serialize the session-open request line for the given dialect.
pub fn open_request(protocol: Protocol, options: &SessionOptions) -> String {
    match protocol {
        Protocol::Default => {
            let mut opts = json!({ "streaming": options.streaming });
            if let Some(ref model) = options.model {
                opts["model"] = json!(model);
            }
            json!({ "event": "session.create", "options": opts }).to_string()
        }
        Protocol::NativeCopilot => {
            let mut line = json!({ "type": "session", "streaming": options.streaming });
            if let Some(ref model) = options.model {
                line["model"] = json!(model);
            }
            line.to_string()
        }
    }
}

/// Serialize the prompt request line for the given dialect.
pub fn prompt_request(protocol: Protocol, prompt: &str) -> String {
    match protocol {
        Protocol::Default => json!({ "event": "session.prompt", "prompt": prompt }).to_string(),
        Protocol::NativeCopilot => json!({ "type": "prompt", "prompt": prompt }).to_string(),
    }
}

/// Parse one stdout line into a session event. Non-JSON lines and unknown
/// event kinds are ignored (agents are free to log noise to stdout).
pub fn parse_line(protocol: Protocol, line: &str) -> Option<SessionEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match protocol {
        Protocol::Default => parse_default(line),
        Protocol::NativeCopilot => parse_copilot(line),
    }
}

#[derive(Debug, Deserialize)]
struct RawDefaultEvent {
    event: String,
    #[serde(default, rename = "deltaContent")]
    delta_content: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool: Option<RawTool>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTool {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    args: Option<serde_json::Value>,
}

fn parse_default(line: &str) -> Option<SessionEvent> {
    let raw: RawDefaultEvent = serde_json::from_str(line).ok()?;
    match raw.event.as_str() {
        "assistant.message_delta" => {
            Some(SessionEvent::MessageDelta(raw.delta_content.unwrap_or_default()))
        }
        "assistant.message" => Some(SessionEvent::Message(raw.content.unwrap_or_default())),
        "session.idle" => Some(SessionEvent::Idle),
        "session.error" | "error" => Some(SessionEvent::SessionError(
            raw.message.unwrap_or_else(|| "agent session error".to_string()),
        )),
        event if event.starts_with("tool.") => {
            let (name, label) = match raw.tool {
                Some(tool) => {
                    let name = tool
                        .name
                        .unwrap_or_else(|| event.trim_start_matches("tool.").to_string());
                    (name, tool.args.as_ref().and_then(tool_label))
                }
                None => (event.trim_start_matches("tool.").to_string(), None),
            };
            Some(SessionEvent::Tool { name, label })
        }
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct RawCopilotEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    delta: Option<RawCopilotDelta>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<RawCopilotError>,
}

#[derive(Debug, Deserialize)]
struct RawCopilotDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCopilotError {
    #[serde(default)]
    message: Option<String>,
}

fn parse_copilot(line: &str) -> Option<SessionEvent> {
    let raw: RawCopilotEvent = serde_json::from_str(line).ok()?;
    match raw.kind.as_str() {
        "message_delta" => Some(SessionEvent::MessageDelta(
            raw.delta.and_then(|d| d.content).unwrap_or_default(),
        )),
        "message" => Some(SessionEvent::Message(raw.content.unwrap_or_default())),
        "tool_call" => Some(SessionEvent::Tool {
            name: raw.name.unwrap_or_else(|| "tool".to_string()),
            label: raw.arguments.as_ref().and_then(tool_label),
        }),
        "idle" | "done" => Some(SessionEvent::Idle),
        "error" => Some(SessionEvent::SessionError(
            raw.error
                .and_then(|e| e.message)
                .or(raw.message)
                .unwrap_or_else(|| "agent session error".to_string()),
        )),
        _ => None,
    }
}

/// Pick a human label for a tool invocation from its argument object: the
/// first present of `file_path`, `path`, `filePath`, `command`.
fn tool_label(args: &serde_json::Value) -> Option<String> {
    let obj = args.as_object()?;
    for key in ["file_path", "path", "filePath", "command"] {
        if let Some(v) = obj.get(key).and_then(|v| v.as_str()) {
            return Some(v.to_string());
        }
    }
    None
}
