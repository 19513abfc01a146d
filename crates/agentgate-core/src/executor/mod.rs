//! Streaming subprocess executor.
//!
//! Spawns the agent CLI, parses its line-delimited JSON stdout into typed
//! events as they arrive, drains stderr concurrently so pipe backpressure
//! can never hang the child, and resolves to a single
//! [`ExecutionResult`] on exit, cancellation, or timeout.
//!
//! The process manager owns the child handle for the whole execution; the
//! executor only watches the exit flag and delegates termination to it.

pub mod parser;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::process::{KillOptions, ProcessManager};
use parser::{StreamParser, line_stream, parse_final_result};

/// Exit code reported when the per-execute timeout fired.
pub const EXIT_TIMEOUT: i32 = 124;
/// Exit code reported when the execution was cancelled.
pub const EXIT_CANCELLED: i32 = 130;

/// Grace between terminate and force-kill on the cancellation path.
const CANCEL_GRACE: Duration = Duration::from_secs(1);
/// Grace between terminate and force-kill on the timeout path.
const TIMEOUT_GRACE: Duration = Duration::from_secs(5);

/// Token usage reported by the agent's final result record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub total: u64,
}

/// A periodic progress estimate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    /// 0-99; never 100 while the agent is still running.
    pub percentage: u8,
    pub phase: String,
    pub tool_calls: u64,
    pub elapsed: Duration,
    pub estimated_remaining: Option<Duration>,
}

/// Typed events delivered to the caller's sink during execution. The
/// serialized form is what the API layer relays to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    ToolCall {
        work_order_id: String,
        run_id: String,
        tool_use_id: String,
        tool: String,
        input: Value,
    },
    ToolResult {
        work_order_id: String,
        run_id: String,
        tool_use_id: String,
        success: bool,
        content: Value,
        duration_ms: Option<u64>,
    },
    Output {
        work_order_id: String,
        run_id: String,
        text: String,
    },
    Progress {
        work_order_id: String,
        run_id: String,
        update: ProgressUpdate,
    },
}

/// Which event classes reach the caller's sink.
#[derive(Debug, Clone, Copy)]
pub struct EventFilter {
    pub tool_calls: bool,
    pub tool_results: bool,
    pub output: bool,
    pub progress: bool,
}

impl EventFilter {
    pub fn all() -> Self {
        Self {
            tool_calls: true,
            tool_results: true,
            output: true,
            progress: true,
        }
    }

    pub fn none() -> Self {
        Self {
            tool_calls: false,
            tool_results: false,
            output: false,
            progress: false,
        }
    }

    fn allows(&self, event: &AgentEvent) -> bool {
        match event {
            AgentEvent::ToolCall { .. } => self.tool_calls,
            AgentEvent::ToolResult { .. } => self.tool_results,
            AgentEvent::Output { .. } => self.output,
            AgentEvent::Progress { .. } => self.progress,
        }
    }
}

impl Default for EventFilter {
    fn default() -> Self {
        Self::all()
    }
}

/// Options for one [`execute`] call.
pub struct ExecOptions {
    pub work_order_id: String,
    pub run_id: String,
    pub cwd: Option<PathBuf>,
    /// Overlaid on the inherited parent environment.
    pub env: HashMap<String, String>,
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
    /// Sink for streamed events; `None` disables streaming entirely.
    pub events: Option<mpsc::UnboundedSender<AgentEvent>>,
    pub filter: EventFilter,
}

impl ExecOptions {
    pub fn new(work_order_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            work_order_id: work_order_id.into(),
            run_id: run_id.into(),
            cwd: None,
            env: HashMap::new(),
            timeout: None,
            cancel: None,
            events: None,
            filter: EventFilter::all(),
        }
    }
}

/// The resolved outcome of one execution.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// The final JSON record on the stream, when one was emitted.
    pub structured_output: Option<Value>,
    pub session_id: Option<String>,
    pub tokens_used: Option<TokenUsage>,
    pub duration: Duration,
    pub cancelled: bool,
}

impl ExecutionResult {
    fn spawn_failure(message: String, duration: Duration) -> Self {
        Self {
            success: false,
            exit_code: 1,
            stdout: String::new(),
            stderr: message,
            structured_output: None,
            session_id: None,
            tokens_used: None,
            duration,
            cancelled: false,
        }
    }
}

enum Outcome {
    Exited,
    Cancelled,
    TimedOut,
}

/// Run an agent subprocess to completion.
///
/// The child inherits the parent environment overlaid with
/// `options.env`, with colour output forced off. Stdin is closed
/// immediately after spawn. Stdout is consumed line by line through the
/// stream parser; stderr is buffered and surfaced only in the result.
pub async fn execute(
    command: &str,
    args: &[String],
    options: ExecOptions,
    processes: &Arc<ProcessManager>,
) -> ExecutionResult {
    let start = Instant::now();

    // Environment hygiene: inherited vars, caller overlay, colour off.
    let mut env: HashMap<String, String> = std::env::vars().collect();
    env.extend(options.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    env.insert("NO_COLOR".to_owned(), "1".to_owned());
    env.insert("FORCE_COLOR".to_owned(), "0".to_owned());

    let mut cmd = Command::new(command);
    cmd.args(args)
        .env_clear()
        .envs(&env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = &options.cwd {
        cmd.current_dir(cwd);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(command, error = %e, "failed to spawn agent");
            return ExecutionResult::spawn_failure(
                format!("failed to spawn {command}: {e}"),
                start.elapsed(),
            );
        }
    };

    // The agent gets no interactive input; close stdin right away.
    drop(child.stdin.take());

    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();

    let handle = match processes
        .register(&options.work_order_id, &options.run_id, child)
        .await
    {
        Ok(handle) => handle,
        Err(e) => {
            return ExecutionResult::spawn_failure(e.to_string(), start.elapsed());
        }
    };

    // Stdout reader: parse lines into events as they arrive, keep the raw
    // text for final-result extraction.
    let work_order_id = options.work_order_id.clone();
    let run_id = options.run_id.clone();
    let events = options.events.clone();
    let filter = options.filter;
    let stdout_task = tokio::spawn(async move {
        let mut collected = String::new();
        let Some(pipe) = stdout_pipe else {
            return collected;
        };
        let mut parser = StreamParser::new();
        let mut lines = line_stream(pipe);

        while let Some(line) = lines.next().await {
            collected.push_str(&line);
            collected.push('\n');

            let Some(parsed) = parser.parse_line(&line) else {
                continue;
            };
            if let Some(sink) = &events {
                if let Some(event) = parser.to_event(&work_order_id, &run_id, parsed) {
                    if filter.allows(&event) && sink.send(event).is_err() {
                        debug!("event sink closed, continuing without streaming");
                    }
                }
                if filter.progress {
                    if let Some(update) = parser.maybe_progress() {
                        let _ = sink.send(AgentEvent::Progress {
                            work_order_id: work_order_id.clone(),
                            run_id: run_id.clone(),
                            update,
                        });
                    }
                }
            } else {
                // Still advance the counters so reuse stays coherent.
                parser.to_event(&work_order_id, &run_id, parsed);
            }
        }
        collected
    });

    // Stderr drain, concurrent with stdout so the child never blocks on a
    // full pipe.
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = stderr_pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        String::from_utf8_lossy(&buf).into_owned()
    });

    // Wait for exit, cancellation, or timeout -- whichever comes first.
    let cancel = options.cancel.clone();
    let outcome = {
        let exited = handle.wait_exited_forever();
        tokio::pin!(exited);
        let cancelled = async {
            match &cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let timed_out = async {
            match options.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = &mut exited => Outcome::Exited,
            _ = cancelled => Outcome::Cancelled,
            _ = timed_out => Outcome::TimedOut,
        }
    };

    match outcome {
        Outcome::Exited => {}
        Outcome::Cancelled => {
            processes
                .kill(
                    &options.work_order_id,
                    KillOptions {
                        grace_period: Some(CANCEL_GRACE),
                        reason: Some("execution cancelled".to_owned()),
                        force_immediate: false,
                    },
                )
                .await;
            handle.wait_exited(CANCEL_GRACE + Duration::from_secs(5)).await;
        }
        Outcome::TimedOut => {
            warn!(
                work_order_id = %options.work_order_id,
                timeout_ms = options.timeout.map(|d| d.as_millis() as u64),
                "execution timed out, terminating agent"
            );
            processes
                .kill(
                    &options.work_order_id,
                    KillOptions {
                        grace_period: Some(TIMEOUT_GRACE),
                        reason: Some("execution timeout".to_owned()),
                        force_immediate: false,
                    },
                )
                .await;
            handle.wait_exited(TIMEOUT_GRACE + Duration::from_secs(5)).await;
        }
    }

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();
    let info = handle.info();
    let duration = start.elapsed();

    match outcome {
        Outcome::Cancelled => {
            if filter.progress {
                if let Some(sink) = &options.events {
                    let _ = sink.send(AgentEvent::Progress {
                        work_order_id: options.work_order_id.clone(),
                        run_id: options.run_id.clone(),
                        update: ProgressUpdate {
                            percentage: 0,
                            phase: "Cancelled".to_owned(),
                            tool_calls: 0,
                            elapsed: duration,
                            estimated_remaining: None,
                        },
                    });
                }
            }
            ExecutionResult {
                success: false,
                exit_code: EXIT_CANCELLED,
                stdout,
                stderr,
                structured_output: None,
                session_id: None,
                tokens_used: None,
                duration,
                cancelled: true,
            }
        }
        Outcome::TimedOut => ExecutionResult {
            success: false,
            exit_code: EXIT_TIMEOUT,
            stdout,
            stderr,
            structured_output: None,
            session_id: None,
            tokens_used: None,
            duration,
            cancelled: false,
        },
        Outcome::Exited => {
            if let Some(signal) = info.exit_signal {
                // Killed from outside, with neither the cancel nor the
                // timeout path responsible.
                return ExecutionResult {
                    success: false,
                    exit_code: info.exit_code.unwrap_or(128 + signal),
                    stdout,
                    stderr,
                    structured_output: None,
                    session_id: None,
                    tokens_used: None,
                    duration,
                    cancelled: false,
                };
            }

            let exit_code = info.exit_code.unwrap_or(1);
            let final_result = parse_final_result(&stdout);
            ExecutionResult {
                success: exit_code == 0,
                exit_code,
                stdout,
                stderr,
                structured_output: final_result.structured_output,
                session_id: final_result.session_id,
                tokens_used: final_result.tokens_used,
                duration,
                cancelled: false,
            }
        }
    }
}
