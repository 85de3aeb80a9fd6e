//! [`ReasoningEngine`] backed by the `claude` command-line tool.
//!
//! Each session turn is one CLI process run with
//! `--output-format stream-json`. Stdout carries one JSON object per line:
//!
//! ```text
//! {"type":"system","subtype":"init","session_id":"..."}
//! {"type":"assistant","message":{"content":[{"type":"text",...},{"type":"tool_use",...}]}}
//! {"type":"user","message":{"content":[{"type":"tool_result",...}]}}
//! {"type":"result","subtype":"success","result":"...","is_error":false,"session_id":"..."}
//! ```

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use ap_core::config::AgentsConfig;
use ap_core::task_error::{classify_message, ErrorKind};

use crate::engine::{EngineError, EngineMessage, MessageStream, ReasoningEngine, SessionRequest};

/// Keep at most this much stderr for error messages.
const STDERR_LIMIT: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct ClaudeCliEngine {
    cli_path: PathBuf,
    extra_args: Vec<String>,
    timeout: Option<Duration>,
}

impl ClaudeCliEngine {
    pub fn new(cli_path: impl Into<PathBuf>) -> Self {
        Self {
            cli_path: cli_path.into(),
            extra_args: Vec::new(),
            timeout: None,
        }
    }

    pub fn from_config(config: &AgentsConfig) -> Self {
        Self {
            cli_path: PathBuf::from(&config.claude_cli_path),
            extra_args: config.extra_args.clone(),
            timeout: config.timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    /// Command-line arguments for one turn.
    pub fn build_args(&self, request: &SessionRequest) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            request.prompt.clone(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];
        if !request.system_prompt.is_empty() {
            args.push("--append-system-prompt".to_string());
            args.push(request.system_prompt.clone());
        }
        if let Some(handle) = &request.resume {
            args.push("--resume".to_string());
            args.push(handle.clone());
        }
        if let Some(model) = &request.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

#[async_trait]
impl ReasoningEngine for ClaudeCliEngine {
    async fn open(&self, request: SessionRequest) -> Result<MessageStream, EngineError> {
        let mut cmd = Command::new(&self.cli_path);
        cmd.args(self.build_args(&request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &request.workdir {
            cmd.current_dir(dir);
        }

        let child = cmd
            .spawn()
            .map_err(|e| EngineError::Spawn(format!("{}: {e}", self.cli_path.display())))?;
        debug!(
            cli = %self.cli_path.display(),
            resume = request.resume.as_deref().unwrap_or(""),
            "claude process started"
        );

        let (tx, rx) = flume::bounded(256);
        let timeout = self.timeout;
        let resuming = request.resume.is_some();
        tokio::spawn(async move {
            let outcome = match timeout {
                Some(limit) => match tokio::time::timeout(limit, pump(child, &tx, resuming)).await {
                    Ok(outcome) => outcome,
                    // Dropping the pump future drops the child, which kills it.
                    Err(_) => Err(EngineError::Timeout(limit)),
                },
                None => pump(child, &tx, resuming).await,
            };
            if let Err(e) = outcome {
                let _ = tx.send_async(Err(e)).await;
            }
        });

        Ok(rx)
    }
}

/// Forward parsed stdout lines until EOF, then check the exit status.
async fn pump(
    mut child: Child,
    tx: &flume::Sender<Result<EngineMessage, EngineError>>,
    resuming: bool,
) -> Result<(), EngineError> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| EngineError::Stream("stdout not captured".into()))?;
    let stderr_task = child.stderr.take().map(|mut stderr| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = (&mut stderr).take(STDERR_LIMIT as u64).read_to_end(&mut buf).await;
            // Drain the rest so the child never blocks on a full pipe.
            let _ = tokio::io::copy(&mut stderr, &mut tokio::io::sink()).await;
            String::from_utf8_lossy(&buf).into_owned()
        })
    });

    let mut lines = BufReader::new(stdout).lines();
    let mut saw_result = false;
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| EngineError::Stream(format!("reading engine output: {e}")))?
    {
        for message in parse_stream_line(&line) {
            if let EngineMessage::Result {
                is_error: true,
                summary,
                ..
            } = &message
            {
                let text = summary.as_deref().unwrap_or_default();
                if resuming && classify_message(text) == ErrorKind::SessionExpired {
                    return Err(EngineError::SessionNotFound(text.to_string()));
                }
            }
            if matches!(message, EngineMessage::Result { .. }) {
                saw_result = true;
            }
            if tx.send_async(Ok(message)).await.is_err() {
                debug!("engine stream receiver dropped, stopping claude process");
                return Ok(());
            }
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| EngineError::Stream(format!("waiting for engine: {e}")))?;
    let stderr = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };

    if !status.success() && !saw_result {
        if classify_message(&stderr) == ErrorKind::SessionExpired {
            return Err(EngineError::SessionNotFound(stderr.trim().to_string()));
        }
        return Err(EngineError::Process {
            code: status.code(),
            stderr: stderr.trim().to_string(),
        });
    }
    if !status.success() {
        warn!(code = ?status.code(), "claude exited non-zero after reporting a result");
    }
    Ok(())
}

/// Translate one stdout line into zero or more messages.
pub fn parse_stream_line(line: &str) -> Vec<EngineMessage> {
    let line = line.trim();
    if line.is_empty() {
        return Vec::new();
    }
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "non-JSON line from claude");
            return vec![EngineMessage::Unknown {
                kind: "non_json".into(),
                raw: Value::String(line.to_string()),
            }];
        }
    };

    let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
    match kind {
        "system" => {
            let subtype = value.get("subtype").and_then(Value::as_str).unwrap_or_default();
            match (subtype, str_field(&value, "session_id")) {
                ("init", Some(session_id)) => vec![EngineMessage::SessionInit { session_id }],
                _ => vec![EngineMessage::Unknown {
                    kind: format!("system/{subtype}"),
                    raw: value,
                }],
            }
        }
        "assistant" => content_blocks(&value)
            .iter()
            .filter_map(|block| match block.get("type").and_then(Value::as_str) {
                Some("text") => str_field(block, "text")
                    .filter(|t| !t.trim().is_empty())
                    .map(|text| EngineMessage::AssistantText { text }),
                Some("tool_use") => Some(EngineMessage::ToolUse {
                    id: str_field(block, "id").unwrap_or_default(),
                    name: str_field(block, "name").unwrap_or_else(|| "unknown".into()),
                    input: block.get("input").cloned().unwrap_or(Value::Null),
                }),
                _ => None,
            })
            .collect(),
        "user" => content_blocks(&value)
            .iter()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_result"))
            .map(|block| EngineMessage::ToolResult {
                tool_use_id: str_field(block, "tool_use_id").unwrap_or_default(),
                content: block.get("content").cloned().unwrap_or(Value::Null),
                is_error: block
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            })
            .collect(),
        "result" => {
            let subtype = value.get("subtype").and_then(Value::as_str).unwrap_or_default();
            let is_error = value
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false)
                || subtype.starts_with("error");
            vec![EngineMessage::Result {
                summary: str_field(&value, "result"),
                is_error,
                session_id: str_field(&value, "session_id"),
            }]
        }
        other => vec![EngineMessage::Unknown {
            kind: other.to_string(),
            raw: value,
        }],
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn content_blocks(value: &Value) -> &[Value] {
    value
        .pointer("/message/content")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_init() {
        let msgs = parse_stream_line(
            r#"{"type":"system","subtype":"init","session_id":"abc-123","tools":[]}"#,
        );
        assert_eq!(
            msgs,
            vec![EngineMessage::SessionInit {
                session_id: "abc-123".into()
            }]
        );
    }

    #[test]
    fn parses_assistant_blocks_in_order() {
        let line = json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "text", "text": "Reading the file"},
                {"type": "tool_use", "id": "toolu_1", "name": "Read", "input": {"file_path": "/a.rs"}},
                {"type": "thinking", "thinking": "..."}
            ]}
        })
        .to_string();
        let msgs = parse_stream_line(&line);
        assert_eq!(msgs.len(), 2);
        assert!(matches!(&msgs[0], EngineMessage::AssistantText { text } if text == "Reading the file"));
        match &msgs[1] {
            EngineMessage::ToolUse { id, name, input } => {
                assert_eq!(id, "toolu_1");
                assert_eq!(name, "Read");
                assert_eq!(input["file_path"], "/a.rs");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_tool_results_with_any_content_shape() {
        let line = json!({
            "type": "user",
            "message": {"content": [
                {"type": "tool_result", "tool_use_id": "toolu_1", "content": [{"type": "text", "text": "ok"}]},
                {"type": "tool_result", "tool_use_id": "toolu_2", "is_error": true}
            ]}
        })
        .to_string();
        let msgs = parse_stream_line(&line);
        assert_eq!(msgs.len(), 2);
        match &msgs[1] {
            EngineMessage::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                assert_eq!(tool_use_id, "toolu_2");
                assert!(content.is_null());
                assert!(*is_error);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_result() {
        let msgs = parse_stream_line(
            r#"{"type":"result","subtype":"success","is_error":false,"result":"Done.","session_id":"abc"}"#,
        );
        assert_eq!(
            msgs,
            vec![EngineMessage::Result {
                summary: Some("Done.".into()),
                is_error: false,
                session_id: Some("abc".into()),
            }]
        );

        let msgs = parse_stream_line(r#"{"type":"result","subtype":"error_max_turns"}"#);
        assert!(matches!(&msgs[0], EngineMessage::Result { is_error: true, .. }));
    }

    #[test]
    fn unknown_and_garbage_lines() {
        assert!(parse_stream_line("   ").is_empty());
        let msgs = parse_stream_line(r#"{"type":"stream_event","event":{}}"#);
        assert!(matches!(&msgs[0], EngineMessage::Unknown { kind, .. } if kind == "stream_event"));
        let msgs = parse_stream_line("warning: something");
        assert!(matches!(&msgs[0], EngineMessage::Unknown { kind, .. } if kind == "non_json"));
    }

    #[test]
    fn builds_resume_args() {
        let engine = ClaudeCliEngine::new("claude").with_extra_args(vec!["--max-turns".into(), "40".into()]);
        let args = engine.build_args(&SessionRequest {
            system_prompt: "sys".into(),
            prompt: "continue".into(),
            resume: Some("sess-1".into()),
            model: Some("opus".into()),
            workdir: None,
        });
        assert_eq!(&args[..2], ["-p", "continue"]);
        assert!(args.windows(2).any(|w| w == ["--resume", "sess-1"]));
        assert!(args.windows(2).any(|w| w == ["--append-system-prompt", "sys"]));
        assert!(args.windows(2).any(|w| w == ["--model", "opus"]));
        assert_eq!(&args[args.len() - 2..], ["--max-turns", "40"]);
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let engine = ClaudeCliEngine::new("/nonexistent/claude-binary");
        let err = engine.open(SessionRequest::default()).await.unwrap_err();
        assert!(matches!(err, EngineError::Spawn(_)));
    }
}
