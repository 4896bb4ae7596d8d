// Typed agent events
//
// The only shapes a runner ever emits. Unrecognized upstream messages are
// dropped by the parsers and never reach this type.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tool name the agent uses to ask the human a clarifying question
pub const ASK_USER_TOOL: &str = "AskUserQuestion";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    TextDelta {
        text: String,
    },
    /// Emitted as soon as the agent declares intent to call a tool
    ToolUseStarted {
        name: String,
    },
    /// Emitted once the tool inputs are fully known
    ToolUseCompleted {
        name: String,
        input: Value,
    },
    /// Terminal event, exactly one per run
    Result {
        ok: bool,
        summary: String,
        #[serde(default)]
        errors: Vec<String>,
    },
}

impl AgentEvent {
    pub fn text(text: impl Into<String>) -> Self {
        AgentEvent::TextDelta { text: text.into() }
    }

    pub fn success(summary: impl Into<String>) -> Self {
        AgentEvent::Result {
            ok: true,
            summary: summary.into(),
            errors: Vec::new(),
        }
    }

    /// A failed `Result` carrying one error message
    pub fn failure(error: impl Into<String>) -> Self {
        let error = error.into();
        AgentEvent::Result {
            ok: false,
            summary: error.clone(),
            errors: vec![error],
        }
    }

    pub fn is_result(&self) -> bool {
        matches!(self, AgentEvent::Result { .. })
    }

    /// The question text when this is a completed ask-user tool call
    pub fn ask_user_question(&self) -> Option<String> {
        match self {
            AgentEvent::ToolUseCompleted { name, input } if name == ASK_USER_TOOL => {
                Some(extract_question(input))
            }
            _ => None,
        }
    }
}

/// The ask-user tool takes either `{question}` or `{questions: [{question}, ...]}`
fn extract_question(input: &Value) -> String {
    if let Some(question) = input.get("question").and_then(Value::as_str) {
        return question.to_string();
    }

    if let Some(questions) = input.get("questions").and_then(Value::as_array) {
        let texts: Vec<&str> = questions
            .iter()
            .filter_map(|q| q.get("question").and_then(Value::as_str))
            .collect();
        if !texts.is_empty() {
            return texts.join("\n");
        }
    }

    input.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_serialized_tag_shape() {
        let event = AgentEvent::ToolUseCompleted {
            name: "Edit".to_string(),
            input: json!({"file_path": "src/lib.rs"}),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "tool_use_completed", "name": "Edit", "input": {"file_path": "src/lib.rs"}})
        );

        let parsed: AgentEvent =
            serde_json::from_value(json!({"type": "result", "ok": true, "summary": "done"}))
                .unwrap();
        assert_eq!(parsed, AgentEvent::success("done"));
    }

    #[test]
    fn test_failure_carries_error() {
        match AgentEvent::failure("boom") {
            AgentEvent::Result { ok, errors, .. } => {
                assert!(!ok);
                assert_eq!(errors, vec!["boom"]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_ask_user_question_extraction() {
        let single = AgentEvent::ToolUseCompleted {
            name: ASK_USER_TOOL.to_string(),
            input: json!({"question": "Which database?"}),
        };
        assert_eq!(single.ask_user_question().as_deref(), Some("Which database?"));

        let multi = AgentEvent::ToolUseCompleted {
            name: ASK_USER_TOOL.to_string(),
            input: json!({"questions": [{"question": "A?"}, {"question": "B?"}]}),
        };
        assert_eq!(multi.ask_user_question().as_deref(), Some("A?\nB?"));

        let other_tool = AgentEvent::ToolUseCompleted {
            name: "Read".to_string(),
            input: json!({"question": "not a question"}),
        };
        assert!(other_tool.ask_user_question().is_none());
        assert!(AgentEvent::text("hi").ask_user_question().is_none());
    }
}
