//! Agent subprocess execution.
//!
//! Spawns the amp binary in stream-JSON mode, decodes each stdout line,
//! forwards messages to the caller's callback, and materializes an
//! [`ExecuteResult`] from the terminal `result` message. Cancellation of
//! the scheduling context kills the subprocess; the child is always
//! reaped before this function returns.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt as _;
use tokio::io::AsyncReadExt as _;
use tokio::process::Command;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::AmpError;
use crate::message::StreamMessage;
use crate::permissions::PermissionRule;
use crate::settings::{ServerConfig, SettingsFile};

/// Per-line cap on the NDJSON stream.
const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

/// Options for one agent run.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Working directory the agent is confined to.
    pub workdir: PathBuf,
    /// Agent mode (`smart`, `rush`, `deep`); `None` uses the client default.
    pub mode: Option<String>,
    /// Permission rules written to the settings file.
    pub permissions: Vec<PermissionRule>,
    /// Extension servers written to the settings file.
    pub servers: HashMap<String, ServerConfig>,
    /// Free-form labels attached to the run.
    pub labels: Vec<String>,
    /// Extra environment (e.g. `GIT_SSH_COMMAND`).
    pub env: BTreeMap<String, String>,
}

/// Outcome of one agent run.
#[derive(Debug, Clone, Default)]
pub struct ExecuteResult {
    /// Session identifier reported by the agent.
    pub session_id: String,
    /// Final textual output.
    pub text: String,
    /// Whether the agent reported an error.
    pub is_error: bool,
    /// Error string when `is_error`.
    pub error: String,
    /// Wall-clock duration of the run.
    pub duration: Duration,
    /// Conversation turns.
    pub num_turns: u32,
    /// Prompt tokens consumed.
    pub input_tokens: u64,
    /// Completion tokens produced.
    pub output_tokens: u64,
    /// Distinct tool names observed in the stream.
    pub tool_names: BTreeSet<String>,
}

/// Callback invoked for every decoded message. Returning `Err` aborts the
/// subprocess.
pub type OnMessage<'a> = &'a mut (dyn FnMut(&str, &StreamMessage) -> Result<(), String> + Send);

/// The seam the engine depends on; implemented by [`AmpClient`] and by
/// scripted stubs in tests.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Run the agent to completion (or cancellation) with the given prompt.
    async fn execute(
        &self,
        prompt: &str,
        options: ExecuteOptions,
        cancel: CancellationToken,
        on_message: OnMessage<'_>,
    ) -> Result<ExecuteResult, AmpError>;
}

/// Client for the amp CLI.
pub struct AmpClient {
    binary: String,
    api_key: String,
    default_mode: String,
}

impl AmpClient {
    #[must_use]
    pub fn new(binary: String, api_key: String, default_mode: String) -> Self {
        Self {
            binary,
            api_key,
            default_mode,
        }
    }

    fn build_command(&self, prompt: &str, options: &ExecuteOptions, settings: &SettingsFile) -> Command {
        let mode = options.mode.as_deref().unwrap_or(&self.default_mode);

        let mut cmd = Command::new(&self.binary);
        cmd.arg("--execute")
            .arg(prompt)
            .arg("--stream-json")
            .arg("--settings-file")
            .arg(settings.path())
            .arg("--mode")
            .arg(mode);
        for label in &options.labels {
            cmd.arg("--label").arg(label);
        }

        if !options.workdir.as_os_str().is_empty() {
            cmd.current_dir(&options.workdir);
        }
        if !self.api_key.is_empty() {
            cmd.env("AMP_API_KEY", &self.api_key);
        }
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl AgentExecutor for AmpClient {
    async fn execute(
        &self,
        prompt: &str,
        options: ExecuteOptions,
        cancel: CancellationToken,
        on_message: OnMessage<'_>,
    ) -> Result<ExecuteResult, AmpError> {
        let started = Instant::now();
        let settings = SettingsFile::write(&options.permissions, &options.servers)?;

        let mut cmd = self.build_command(prompt, &options, &settings);
        let mut child = cmd.spawn().map_err(|e| AmpError::Spawn {
            binary: self.binary.clone(),
            reason: e.to_string(),
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AmpError::Stream("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AmpError::Stream("stderr not captured".to_string()))?;

        // Drain stderr concurrently so a chatty subprocess cannot stall
        // the stdout pipe.
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let mut stderr = stderr;
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let mut lines = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

        let mut result = ExecuteResult::default();
        let mut saw_result = false;

        loop {
            let line = tokio::select! {
                () = cancel.cancelled() => {
                    info!(binary = %self.binary, "cancellation received, killing agent");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    stderr_task.abort();
                    return Err(AmpError::Cancelled);
                }
                line = lines.next() => line,
            };

            let line = match line {
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    stderr_task.abort();
                    return Err(AmpError::Stream(e.to_string()));
                }
                None => break,
            };

            if line.trim().is_empty() {
                continue;
            }

            let message = match StreamMessage::decode(&line) {
                Ok(message) => message,
                Err(e) => {
                    // Non-JSON noise on stdout is logged and skipped.
                    debug!(error = %e, "undecodable stream line");
                    continue;
                }
            };

            if let Some(session_id) = message.session_id() {
                result.session_id = session_id.to_string();
            }
            for name in message.tool_names() {
                result.tool_names.insert(name.to_string());
            }
            if let StreamMessage::Result(r) = &message {
                saw_result = true;
                result.text = r.result.clone();
                result.is_error = r.is_error;
                result.error = r.error.clone();
                result.num_turns = r.num_turns;
                result.input_tokens = r.usage.input_tokens;
                result.output_tokens = r.usage.output_tokens;
            }

            if let Err(reason) = on_message(&line, &message) {
                let _ = child.start_kill();
                let _ = child.wait().await;
                stderr_task.abort();
                return Err(AmpError::Aborted(reason));
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| AmpError::Stream(format!("wait failed: {e}")))?;
        let stderr_text = stderr_task.await.unwrap_or_default();

        if !saw_result {
            result.is_error = true;
            result.error = if status.success() {
                "stream ended without a result message".to_string()
            } else {
                format!(
                    "agent exited with {}: {}",
                    status.code().unwrap_or(-1),
                    stderr_text.trim()
                )
            };
            warn!(
                binary = %self.binary,
                exit = ?status.code(),
                "agent run produced no result message"
            );
        }

        result.duration = started.elapsed();
        debug!(
            session = %result.session_id,
            turns = result.num_turns,
            tools = result.tool_names.len(),
            duration_ms = result.duration.as_millis() as u64,
            "agent run finished"
        );
        Ok(result)
    }
}
