// Claude Code output parsing
//
// Maps the CLI's stream-json lines onto AgentEvent. With
// --include-partial-messages the CLI emits `stream_event` wrappers around the
// raw API stream; text arrives there as deltas and the later complete
// `assistant` message only contributes finished tool calls.

use serde_json::Value;

use crate::agents::events::AgentEvent;
use crate::utils::truncate_string;

/// Stateless line parser for one run
#[derive(Debug, Clone, Copy)]
pub struct ClaudeStreamParser {
    partial_messages: bool,
}

impl ClaudeStreamParser {
    /// Parser for output produced with `--include-partial-messages`
    pub fn partial() -> Self {
        Self {
            partial_messages: true,
        }
    }

    /// Parser for output that only carries complete assistant messages
    pub fn complete_messages() -> Self {
        Self {
            partial_messages: false,
        }
    }

    pub fn partial_messages(&self) -> bool {
        self.partial_messages
    }

    /// Parse one stdout line. Returns no events for anything unrecognized.
    pub fn parse_line(&self, line: &str) -> Vec<AgentEvent> {
        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }

        let json: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => {
                log::trace!(
                    "[ClaudeStreamParser] Dropping non-JSON line: {}",
                    truncate_string(line, 200)
                );
                return Vec::new();
            }
        };

        let msg_type = json.get("type").and_then(Value::as_str).unwrap_or("");
        match msg_type {
            "stream_event" if self.partial_messages => parse_stream_event(&json),
            "assistant" => self.parse_assistant(&json),
            "result" => vec![parse_result(&json)],
            _ => {
                log::trace!("[ClaudeStreamParser] Dropping '{}' message", msg_type);
                Vec::new()
            }
        }
    }

    fn parse_assistant(&self, json: &Value) -> Vec<AgentEvent> {
        let Some(content) = json
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_array)
        else {
            return Vec::new();
        };

        let mut events = Vec::new();
        for item in content {
            match item.get("type").and_then(Value::as_str) {
                Some("text") if !self.partial_messages => {
                    if let Some(text) = item.get("text").and_then(Value::as_str) {
                        events.push(AgentEvent::text(text));
                    }
                }
                Some("tool_use") => {
                    let name = tool_name(item);
                    if !self.partial_messages {
                        // No content_block_start was seen for this call
                        events.push(AgentEvent::ToolUseStarted { name: name.clone() });
                    }
                    events.push(AgentEvent::ToolUseCompleted {
                        name,
                        input: item.get("input").cloned().unwrap_or(Value::Null),
                    });
                }
                _ => {}
            }
        }
        events
    }
}

impl Default for ClaudeStreamParser {
    fn default() -> Self {
        Self::partial()
    }
}

fn tool_name(block: &Value) -> String {
    block
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("tool")
        .to_string()
}

fn parse_stream_event(json: &Value) -> Vec<AgentEvent> {
    let Some(event) = json.get("event") else {
        return Vec::new();
    };

    match event.get("type").and_then(Value::as_str) {
        Some("content_block_delta") => {
            let delta = event.get("delta");
            let is_text = delta
                .and_then(|d| d.get("type"))
                .and_then(Value::as_str)
                == Some("text_delta");
            match delta.and_then(|d| d.get("text")).and_then(Value::as_str) {
                Some(text) if is_text && !text.is_empty() => vec![AgentEvent::text(text)],
                _ => Vec::new(),
            }
        }
        Some("content_block_start") => match event.get("content_block") {
            Some(block) if block.get("type").and_then(Value::as_str) == Some("tool_use") => {
                vec![AgentEvent::ToolUseStarted {
                    name: tool_name(block),
                }]
            }
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn parse_result(json: &Value) -> AgentEvent {
    let subtype = json.get("subtype").and_then(Value::as_str).unwrap_or("");
    let is_error = json
        .get("is_error")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let ok = subtype == "success" && !is_error;

    let summary = json
        .get("result")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(String::from)
        .unwrap_or_else(|| subtype.to_string());

    let mut errors: Vec<String> = json
        .get("errors")
        .and_then(Value::as_array)
        .map(|errs| {
            errs.iter()
                .map(|e| e.as_str().map(String::from).unwrap_or_else(|| e.to_string()))
                .collect()
        })
        .unwrap_or_default();
    if !ok && errors.is_empty() {
        errors.push(if subtype.is_empty() {
            summary.clone()
        } else {
            subtype.to_string()
        });
    }

    AgentEvent::Result {
        ok,
        summary,
        errors,
    }
}
