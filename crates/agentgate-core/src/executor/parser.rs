//! Line parser for the agent's stream-JSON protocol.
//!
//! The agent emits one JSON object per stdout line. Each line is
//! classified as system / assistant-text / tool-use / tool-result /
//! final-result; anything else (including malformed JSON) is ignored with
//! a debug log. The parser also keeps the running tool-call counter and
//! phase label that feed progress updates.

use std::pin::Pin;
use std::time::{Duration, Instant};

use futures::Stream;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, warn};

use super::{AgentEvent, ProgressUpdate, TokenUsage};

/// Stream the lines of an agent's stdout as they arrive.
///
/// Framing never hands the parser a partial line. A read error ends the
/// stream with a warning rather than surfacing to the caller; the exit
/// status carries the failure.
pub fn line_stream<R>(reader: R) -> Pin<Box<dyn Stream<Item = String> + Send>>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    Box::pin(async_stream::stream! {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => yield line,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "error reading agent stdout");
                    break;
                }
            }
        }
    })
}

/// Minimum spacing between emitted progress updates.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

/// A classified stream line.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    /// Informational; never surfaced as an event.
    System,
    ToolUse {
        tool_use_id: String,
        tool: String,
        input: Value,
    },
    Text {
        content: String,
    },
    ToolResult {
        tool_use_id: String,
        success: bool,
        content: Value,
        duration_ms: Option<u64>,
    },
    /// The final result record. Also captured from the collected stdout
    /// after exit; surfacing it live lets the phase label advance.
    Result {
        raw: Value,
    },
}

/// Stateful parser for one agent execution. [`StreamParser::reset`]
/// prepares it for reuse.
pub struct StreamParser {
    accumulated_text: String,
    tool_calls: u64,
    phase: String,
    started: Instant,
    last_progress: Option<Instant>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self {
            accumulated_text: String::new(),
            tool_calls: 0,
            phase: "Starting".to_owned(),
            started: Instant::now(),
            last_progress: None,
        }
    }

    /// Classify one stdout line. Tolerates CRLF line endings. Returns
    /// `None` for blank, malformed, or unrecognised lines.
    pub fn parse_line(&mut self, line: &str) -> Option<ParsedLine> {
        let trimmed = line.trim_end_matches('\r').trim();
        if trimmed.is_empty() {
            return None;
        }

        let value: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "ignoring malformed stream line");
                return None;
            }
        };

        let line_type = value.get("type").and_then(|t| t.as_str()).unwrap_or("");

        match line_type {
            "system" => Some(ParsedLine::System),
            "assistant" => {
                let message = value.get("message")?;
                match message.get("type").and_then(|t| t.as_str()) {
                    Some("tool_use") => {
                        let tool_use_id = message
                            .get("tool_use_id")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_owned();
                        let tool = message
                            .get("tool")
                            .and_then(|v| v.as_str())
                            .unwrap_or("unknown")
                            .to_owned();
                        let input = message.get("input").cloned().unwrap_or(Value::Null);
                        Some(ParsedLine::ToolUse {
                            tool_use_id,
                            tool,
                            input,
                        })
                    }
                    Some("text") => {
                        let content = message
                            .get("content")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_owned();
                        Some(ParsedLine::Text { content })
                    }
                    other => {
                        debug!(message_type = ?other, "ignoring assistant message");
                        None
                    }
                }
            }
            "user" => {
                let message = value.get("message")?;
                if message.get("type").and_then(|t| t.as_str()) != Some("tool_result") {
                    return None;
                }
                let tool_use_id = message
                    .get("tool_use_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_owned();
                let success = message
                    .get("success")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(true);
                let content = message.get("content").cloned().unwrap_or(Value::Null);
                let duration_ms = message.get("durationMs").and_then(|v| v.as_u64());
                Some(ParsedLine::ToolResult {
                    tool_use_id,
                    success,
                    content,
                    duration_ms,
                })
            }
            "result" => Some(ParsedLine::Result { raw: value }),
            _ if value.get("result").is_some() => Some(ParsedLine::Result { raw: value }),
            other => {
                debug!(line_type = other, "ignoring unrecognised stream line");
                None
            }
        }
    }

    /// Transform a classified line into the outbound event, annotated with
    /// the executing work order and run. Updates the tool counter, the
    /// accumulated text, and the phase label as a side effect. `System`
    /// and `Result` lines produce no event.
    pub fn to_event(
        &mut self,
        work_order_id: &str,
        run_id: &str,
        parsed: ParsedLine,
    ) -> Option<AgentEvent> {
        match parsed {
            ParsedLine::System => None,
            ParsedLine::ToolUse {
                tool_use_id,
                tool,
                input,
            } => {
                self.tool_calls += 1;
                self.phase = format!("Running {tool}");
                Some(AgentEvent::ToolCall {
                    work_order_id: work_order_id.to_owned(),
                    run_id: run_id.to_owned(),
                    tool_use_id,
                    tool,
                    input,
                })
            }
            ParsedLine::Text { content } => {
                self.accumulated_text.push_str(&content);
                self.phase = "Responding".to_owned();
                Some(AgentEvent::Output {
                    work_order_id: work_order_id.to_owned(),
                    run_id: run_id.to_owned(),
                    text: content,
                })
            }
            ParsedLine::ToolResult {
                tool_use_id,
                success,
                content,
                duration_ms,
            } => Some(AgentEvent::ToolResult {
                work_order_id: work_order_id.to_owned(),
                run_id: run_id.to_owned(),
                tool_use_id,
                success,
                content,
                duration_ms,
            }),
            ParsedLine::Result { .. } => {
                self.phase = "Finalizing".to_owned();
                None
            }
        }
    }

    /// A progress update, if the spacing interval has elapsed. The
    /// percentage is a coarse estimate and never reaches 100 while the
    /// agent is still running.
    pub fn maybe_progress(&mut self) -> Option<ProgressUpdate> {
        let due = match self.last_progress {
            None => true,
            Some(last) => last.elapsed() >= PROGRESS_INTERVAL,
        };
        if !due {
            return None;
        }
        self.last_progress = Some(Instant::now());
        Some(self.progress_snapshot())
    }

    /// Current progress without the interval gate.
    pub fn progress_snapshot(&self) -> ProgressUpdate {
        ProgressUpdate {
            percentage: (5 + self.tool_calls.saturating_mul(5)).min(99) as u8,
            phase: self.phase.clone(),
            tool_calls: self.tool_calls,
            elapsed: self.started.elapsed(),
            estimated_remaining: None,
        }
    }

    pub fn tool_calls(&self) -> u64 {
        self.tool_calls
    }

    pub fn accumulated_text(&self) -> &str {
        &self.accumulated_text
    }

    /// Clear counters and text for reuse on a fresh execution.
    pub fn reset(&mut self) {
        self.accumulated_text.clear();
        self.tool_calls = 0;
        self.phase = "Starting".to_owned();
        self.started = Instant::now();
        self.last_progress = None;
    }
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

/// The final structured record extracted from the collected stdout.
#[derive(Debug, Clone, Default)]
pub struct FinalResult {
    pub structured_output: Option<Value>,
    pub session_id: Option<String>,
    pub tokens_used: Option<TokenUsage>,
}

/// Scan the collected stdout for the last result record and pull out the
/// session id and token usage.
pub fn parse_final_result(stdout: &str) -> FinalResult {
    let mut result = FinalResult::default();

    for line in stdout.lines().rev() {
        let trimmed = line.trim_end_matches('\r').trim();
        if trimmed.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
            continue;
        };
        let is_result = value.get("type").and_then(|t| t.as_str()) == Some("result")
            || value.get("result").is_some();
        if !is_result {
            continue;
        }

        result.session_id = value
            .get("sessionId")
            .and_then(|v| v.as_str())
            .map(str::to_owned);
        result.tokens_used = value.get("tokensUsed").map(|usage| {
            let input = usage.get("input").and_then(|v| v.as_u64()).unwrap_or(0);
            let output = usage.get("output").and_then(|v| v.as_u64()).unwrap_or(0);
            TokenUsage {
                input,
                output,
                total: input + output,
            }
        });
        result.structured_output = Some(value);
        break;
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tool_use() {
        let mut parser = StreamParser::new();
        let line = r#"{"type":"assistant","message":{"type":"tool_use","tool_use_id":"tu_1","tool":"Bash","input":{"command":"ls"}}}"#;
        let parsed = parser.parse_line(line).unwrap();
        assert_eq!(
            parsed,
            ParsedLine::ToolUse {
                tool_use_id: "tu_1".to_owned(),
                tool: "Bash".to_owned(),
                input: serde_json::json!({"command": "ls"}),
            }
        );
    }

    #[test]
    fn parses_text() {
        let mut parser = StreamParser::new();
        let line = r#"{"type":"assistant","message":{"type":"text","content":"working on it"}}"#;
        assert_eq!(
            parser.parse_line(line).unwrap(),
            ParsedLine::Text {
                content: "working on it".to_owned()
            }
        );
    }

    #[test]
    fn parses_tool_result() {
        let mut parser = StreamParser::new();
        let line = r#"{"type":"user","message":{"type":"tool_result","tool_use_id":"tu_1","success":true,"content":"ok","durationMs":42}}"#;
        assert_eq!(
            parser.parse_line(line).unwrap(),
            ParsedLine::ToolResult {
                tool_use_id: "tu_1".to_owned(),
                success: true,
                content: serde_json::json!("ok"),
                duration_ms: Some(42),
            }
        );
    }

    #[test]
    fn parses_system_and_result() {
        let mut parser = StreamParser::new();
        assert_eq!(
            parser.parse_line(r#"{"type":"system","subtype":"init"}"#),
            Some(ParsedLine::System)
        );
        assert!(matches!(
            parser.parse_line(r#"{"result":"done","sessionId":"s1"}"#),
            Some(ParsedLine::Result { .. })
        ));
    }

    #[test]
    fn malformed_blank_and_unknown_lines_are_none() {
        let mut parser = StreamParser::new();
        assert_eq!(parser.parse_line("not json"), None);
        assert_eq!(parser.parse_line(""), None);
        assert_eq!(parser.parse_line("   "), None);
        assert_eq!(parser.parse_line(r#"{"type":"banana"}"#), None);
        assert_eq!(
            parser.parse_line(r#"{"type":"assistant","message":{"type":"thinking"}}"#),
            None
        );
    }

    #[test]
    fn tolerates_crlf() {
        let mut parser = StreamParser::new();
        let line = "{\"type\":\"system\"}\r";
        assert_eq!(parser.parse_line(line), Some(ParsedLine::System));
    }

    #[test]
    fn tool_counter_and_phase_track_events() {
        let mut parser = StreamParser::new();

        let tool_use = parser
            .parse_line(r#"{"type":"assistant","message":{"type":"tool_use","tool_use_id":"tu_1","tool":"Read","input":{}}}"#)
            .unwrap();
        let event = parser.to_event("wo_1", "run_1", tool_use).unwrap();
        assert!(matches!(event, AgentEvent::ToolCall { ref tool, .. } if tool == "Read"));
        assert_eq!(parser.tool_calls(), 1);
        assert_eq!(parser.progress_snapshot().phase, "Running Read");

        let text = parser
            .parse_line(r#"{"type":"assistant","message":{"type":"text","content":"done"}}"#)
            .unwrap();
        parser.to_event("wo_1", "run_1", text);
        assert_eq!(parser.accumulated_text(), "done");
        assert_eq!(parser.progress_snapshot().phase, "Responding");
    }

    #[test]
    fn system_and_result_produce_no_event() {
        let mut parser = StreamParser::new();
        assert!(parser.to_event("wo", "run", ParsedLine::System).is_none());
        assert!(
            parser
                .to_event(
                    "wo",
                    "run",
                    ParsedLine::Result {
                        raw: serde_json::json!({"result": "ok"})
                    }
                )
                .is_none()
        );
    }

    #[test]
    fn progress_respects_interval_and_cap() {
        let mut parser = StreamParser::new();

        let first = parser.maybe_progress().expect("first update always due");
        assert!(first.percentage < 100);
        assert!(parser.maybe_progress().is_none(), "second update too soon");

        // Many tool calls never push the estimate to 100.
        for _ in 0..100 {
            parser.to_event(
                "wo",
                "run",
                ParsedLine::ToolUse {
                    tool_use_id: String::new(),
                    tool: "Bash".to_owned(),
                    input: Value::Null,
                },
            );
        }
        assert_eq!(parser.progress_snapshot().percentage, 99);
    }

    #[test]
    fn reset_clears_state() {
        let mut parser = StreamParser::new();
        parser.to_event(
            "wo",
            "run",
            ParsedLine::ToolUse {
                tool_use_id: String::new(),
                tool: "Bash".to_owned(),
                input: Value::Null,
            },
        );
        parser.to_event(
            "wo",
            "run",
            ParsedLine::Text {
                content: "hello".to_owned(),
            },
        );

        parser.reset();
        assert_eq!(parser.tool_calls(), 0);
        assert_eq!(parser.accumulated_text(), "");
        assert_eq!(parser.progress_snapshot().phase, "Starting");
    }

    #[test]
    fn final_result_extraction() {
        let stdout = concat!(
            "{\"type\":\"system\"}\n",
            "{\"type\":\"assistant\",\"message\":{\"type\":\"text\",\"content\":\"hi\"}}\n",
            "{\"result\":\"all done\",\"sessionId\":\"sess_42\",\"tokensUsed\":{\"input\":120,\"output\":30}}\n",
        );

        let parsed = parse_final_result(stdout);
        assert_eq!(parsed.session_id.as_deref(), Some("sess_42"));
        let tokens = parsed.tokens_used.unwrap();
        assert_eq!(tokens.input, 120);
        assert_eq!(tokens.output, 30);
        assert_eq!(tokens.total, 150);
        assert_eq!(
            parsed.structured_output.unwrap()["result"],
            serde_json::json!("all done")
        );
    }

    #[test]
    fn final_result_missing_is_default() {
        let parsed = parse_final_result("{\"type\":\"system\"}\nnot json\n");
        assert!(parsed.structured_output.is_none());
        assert!(parsed.session_id.is_none());
        assert!(parsed.tokens_used.is_none());
    }
}
