//! Output events produced by a code submission
//!
//! The kernel publishes everything observable about an execution on the
//! iopub channel. The pump classifies each message into an [`IopubUpdate`]:
//! either an [`OutputEvent`] to record, a status transition, or something we
//! don't surface (`execute_input`, `clear_output`, comms, ...).

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `ename` of the synthetic error appended when the kernel dies mid-execution
pub const KERNEL_DIED: &str = "KernelDied";

/// One unit of observable effect from a code submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputEvent {
    /// Text written to stdout/stderr
    Stream { name: String, text: String },
    /// Rich output emitted via `display()`
    #[serde(rename = "display_data")]
    Display {
        data: Map<String, Value>,
        metadata: Map<String, Value>,
    },
    /// Value of the last expression in the cell
    #[serde(rename = "execute_result")]
    Result {
        data: Map<String, Value>,
        metadata: Map<String, Value>,
    },
    /// Uncaught exception (or synthetic kernel failure)
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
}

impl OutputEvent {
    /// The synthetic event recorded when the kernel process died
    pub fn kernel_died() -> Self {
        OutputEvent::Error {
            ename: KERNEL_DIED.to_string(),
            evalue: "Kernel died".to_string(),
            traceback: Vec::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, OutputEvent::Error { .. })
    }

    pub fn is_kernel_died(&self) -> bool {
        matches!(self, OutputEvent::Error { ename, .. } if ename == KERNEL_DIED)
    }

    /// Plain-text rendering of the payload (the `text/plain` MIME entry for
    /// rich outputs)
    pub fn plain_text(&self) -> Option<&str> {
        match self {
            OutputEvent::Stream { text, .. } => Some(text),
            OutputEvent::Display { data, .. } | OutputEvent::Result { data, .. } => {
                data.get("text/plain").and_then(Value::as_str)
            }
            OutputEvent::Error { evalue, .. } => Some(evalue),
        }
    }
}

impl fmt::Display for OutputEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputEvent::Stream { text, .. } => write!(f, "{}", text.trim_end_matches('\n')),
            OutputEvent::Display { data, .. } | OutputEvent::Result { data, .. } => {
                match data.get("text/plain").and_then(Value::as_str) {
                    Some(text) => write!(f, "{}", text),
                    None => {
                        let kinds: Vec<&str> = data.keys().map(String::as_str).collect();
                        write!(f, "<{}>", kinds.join(", "))
                    }
                }
            }
            OutputEvent::Error {
                ename,
                evalue,
                traceback,
            } => {
                // IPython tracebacks already end with "<ename>: <evalue>"
                if traceback.is_empty() {
                    return write!(f, "{}: {}", ename, evalue);
                }
                let lines: Vec<String> = traceback.iter().map(|line| strip_ansi(line)).collect();
                write!(f, "{}", lines.join("\n"))
            }
        }
    }
}

/// What a single iopub message means for the in-flight request
#[derive(Debug, Clone, PartialEq)]
pub enum IopubUpdate {
    Event(OutputEvent),
    Busy,
    Idle,
    Ignored,
}

/// Classify an iopub message by its `msg_type`
pub fn classify(msg_type: &str, content: &Value) -> IopubUpdate {
    match msg_type {
        "status" => match content.get("execution_state").and_then(Value::as_str) {
            Some("idle") => IopubUpdate::Idle,
            Some("busy") => IopubUpdate::Busy,
            _ => IopubUpdate::Ignored,
        },
        "stream" => IopubUpdate::Event(OutputEvent::Stream {
            name: str_field(content, "name"),
            text: str_field(content, "text"),
        }),
        "display_data" => IopubUpdate::Event(OutputEvent::Display {
            data: map_field(content, "data"),
            metadata: map_field(content, "metadata"),
        }),
        "execute_result" => IopubUpdate::Event(OutputEvent::Result {
            data: map_field(content, "data"),
            metadata: map_field(content, "metadata"),
        }),
        "error" => IopubUpdate::Event(OutputEvent::Error {
            ename: str_field(content, "ename"),
            evalue: str_field(content, "evalue"),
            traceback: content
                .get("traceback")
                .and_then(Value::as_array)
                .map(|lines| {
                    lines
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        }),
        _ => IopubUpdate::Ignored,
    }
}

/// Render an ordered event list as newline-joined text
pub fn render_events(events: &[OutputEvent]) -> String {
    if events.is_empty() {
        return "(no output)".to_string();
    }
    events
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

fn str_field(content: &Value, key: &str) -> String {
    content
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn map_field(content: &Value, key: &str) -> Map<String, Value> {
    content
        .get(key)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

/// Remove ANSI CSI escape sequences (IPython colours its tracebacks)
fn strip_ansi(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' && chars.peek() == Some(&'[') {
            chars.next();
            // parameters and intermediates run until a final byte in @..~
            for next in chars.by_ref() {
                if ('@'..='~').contains(&next) {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_status() {
        assert_eq!(classify("status", &json!({"execution_state": "idle"})), IopubUpdate::Idle);
        assert_eq!(classify("status", &json!({"execution_state": "busy"})), IopubUpdate::Busy);
        assert_eq!(
            classify("status", &json!({"execution_state": "starting"})),
            IopubUpdate::Ignored
        );
    }

    #[test]
    fn test_classify_execute_result() {
        let update = classify(
            "execute_result",
            &json!({"execution_count": 1, "data": {"text/plain": "2"}, "metadata": {}}),
        );
        let IopubUpdate::Event(event) = update else {
            panic!("expected an event");
        };
        assert_eq!(event.plain_text(), Some("2"));
        assert_eq!(event.to_string(), "2");
    }

    #[test]
    fn test_classify_error_keeps_traceback_lines() {
        let update = classify(
            "error",
            &json!({
                "ename": "ZeroDivisionError",
                "evalue": "division by zero",
                "traceback": [
                    "\u{1b}[0;31m------------------------------------\u{1b}[0m",
                    "Cell In[1], line 1",
                    "\u{1b}[0;31mZeroDivisionError\u{1b}[0m: division by zero"
                ]
            }),
        );
        let IopubUpdate::Event(event) = update else {
            panic!("expected an event");
        };
        assert!(event.is_error());
        assert_eq!(
            event.to_string(),
            "------------------------------------\nCell In[1], line 1\nZeroDivisionError: division by zero"
        );
        assert_eq!(event.to_string().matches("division by zero").count(), 1);
    }

    #[test]
    fn test_unsurfaced_messages_are_ignored() {
        assert_eq!(classify("execute_input", &json!({"code": "1"})), IopubUpdate::Ignored);
        assert_eq!(classify("clear_output", &json!({"wait": false})), IopubUpdate::Ignored);
    }

    #[test]
    fn test_display_without_plain_text() {
        let event = OutputEvent::Display {
            data: json!({"image/png": "iVBOR..."}).as_object().cloned().unwrap(),
            metadata: Map::new(),
        };
        assert_eq!(event.to_string(), "<image/png>");
        assert_eq!(event.plain_text(), None);
    }

    #[test]
    fn test_render_events_joins_in_order() {
        let events = vec![
            OutputEvent::Stream {
                name: "stdout".into(),
                text: "hello\n".into(),
            },
            OutputEvent::kernel_died(),
        ];
        assert_eq!(render_events(&events), "hello\nKernelDied: Kernel died");
        assert_eq!(render_events(&[]), "(no output)");
        assert!(events[1].is_kernel_died());
    }

    #[test]
    fn test_event_serializes_with_protocol_tag() {
        let event = OutputEvent::Result {
            data: Map::new(),
            metadata: Map::new(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "execute_result");
    }
}
