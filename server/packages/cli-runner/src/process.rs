//! Subprocess lifecycle for Claude CLI invocations.
//!
//! Every invocation spawns one child with piped stdio and `kill_on_drop`, so
//! dropping the returned stream (client disconnect) also reaps the process.
//! Non-streaming runs race an absolute timeout; streaming runs apply an idle
//! timeout between stdout lines. Both escalate SIGTERM, grace, SIGKILL.

use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use claude_bridge_error::BridgeError;
use futures::stream::{self, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::command::{build_command, InvocationSpec};
use crate::config::RunnerConfig;
use crate::decoder::LineDecoder;
use crate::record::DecodedRecord;

/// Records from one invocation, in CLI output order.
pub type RecordStream = Pin<Box<dyn Stream<Item = Result<DecodedRecord, BridgeError>> + Send>>;

/// Preview length for unparsable non-streaming output.
const OUTPUT_PREVIEW_CHARS: usize = 500;

/// Preview length for skipped stream lines.
const LINE_PREVIEW_CHARS: usize = 200;

/// Maximum stderr retained per invocation (64KB).
const MAX_STDERR_SIZE: usize = 64 * 1024;

/// Upper bound for `--version` checks.
const VERSION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ClaudeRunner {
    config: Arc<RunnerConfig>,
}

impl ClaudeRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Spawns the CLI for `spec` and returns its records.
    ///
    /// Configuration and launch failures are returned before any record is
    /// produced. In streaming mode records arrive as stdout lines are read; an
    /// idle timeout ends the stream without an error. Otherwise the stream
    /// yields at most one record, or the classified failure.
    pub async fn invoke(&self, spec: &InvocationSpec) -> Result<RecordStream, BridgeError> {
        let command = build_command(&self.config.policy, spec)?;
        let child = self.spawn(&command.args)?;
        debug!(
            stream = spec.stream,
            prompt_preview = %truncate_chars(&command.stdin, LINE_PREVIEW_CHARS),
            "Claude CLI spawned"
        );

        if spec.stream {
            return self.stream_records(child, command.stdin).await;
        }

        let config = self.config.clone();
        let completion = stream::once(run_to_completion(child, command.stdin, config))
            .filter_map(|outcome| futures::future::ready(outcome.transpose()));
        Ok(Box::pin(completion))
    }

    /// Runs `cli --version`, returning its trimmed output on success.
    pub async fn version(&self) -> Option<String> {
        let version_check = Command::new(&self.config.cli_path)
            .arg("--version")
            .kill_on_drop(true)
            .output();
        let output = match timeout(VERSION_TIMEOUT, version_check).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                debug!(error = %err, "Claude CLI version check failed");
                return None;
            }
            Err(_) => {
                warn!("Claude CLI version check timed out");
                return None;
            }
        };
        if !output.status.success() {
            return None;
        }
        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if version.is_empty() {
            None
        } else {
            Some(version)
        }
    }

    pub async fn check_available(&self) -> bool {
        self.version().await.is_some()
    }

    fn spawn(&self, args: &[String]) -> Result<Child, BridgeError> {
        let mut cmd = Command::new(&self.config.cli_path);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.config.cwd {
            cmd.current_dir(cwd);
        }

        info!(
            cli = %self.config.cli_path.display(),
            args = ?args,
            cwd = ?self.config.cwd,
            "Executing Claude CLI"
        );

        cmd.spawn().map_err(|err| BridgeError::Launch {
            cli_path: self.config.cli_path.display().to_string(),
            message: err.to_string(),
        })
    }

    async fn stream_records(
        &self,
        mut child: Child,
        payload: String,
    ) -> Result<RecordStream, BridgeError> {
        let stdout = child.stdout.take().ok_or_else(|| BridgeError::Stream {
            message: "Claude CLI stdout unavailable".to_string(),
        })?;
        let stderr_task = drain_pipe(child.stderr.take(), MAX_STDERR_SIZE);

        if timeout(self.config.stream_idle_timeout, write_stdin(&mut child, &payload))
            .await
            .is_err()
        {
            warn!("Timed out writing prompt to Claude CLI");
            stderr_task.abort();
            terminate(&mut child, self.config.kill_grace).await;
            return Err(BridgeError::Stream {
                message: "timed out writing prompt to Claude CLI".to_string(),
            });
        }

        let live = LiveProcess {
            child,
            lines: LineDecoder::new(BufReader::new(stdout)),
            stderr_task: Some(stderr_task),
            idle_timeout: self.config.stream_idle_timeout,
            kill_grace: self.config.kill_grace,
            started: Instant::now(),
            records: 0,
        };

        let records = stream::unfold(live, |mut live| async move {
            match live.next_record().await {
                Some(record) => Some((Ok::<_, BridgeError>(record), live)),
                None => {
                    live.finish().await;
                    None
                }
            }
        });
        Ok(Box::pin(records))
    }
}

struct LiveProcess {
    child: Child,
    lines: LineDecoder<BufReader<ChildStdout>>,
    stderr_task: Option<JoinHandle<Vec<u8>>>,
    idle_timeout: Duration,
    kill_grace: Duration,
    started: Instant,
    records: u64,
}

impl LiveProcess {
    async fn next_record(&mut self) -> Option<DecodedRecord> {
        loop {
            let line = match timeout(self.idle_timeout, self.lines.next_line()).await {
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => return None,
                Ok(Err(err)) => {
                    warn!(error = %err, "Failed to read Claude CLI output");
                    return None;
                }
                Err(_) => {
                    warn!(
                        idle_timeout_secs = self.idle_timeout.as_secs(),
                        records = self.records,
                        "Claude CLI stream idle; terminating"
                    );
                    terminate(&mut self.child, self.kill_grace).await;
                    return None;
                }
            };

            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match DecodedRecord::parse(line) {
                Ok(record) => {
                    self.records += 1;
                    return Some(record);
                }
                Err(err) => debug!(
                    error = %err,
                    line = %truncate_chars(line, LINE_PREVIEW_CHARS),
                    "Skipping non-JSON line from Claude CLI"
                ),
            }
        }
    }

    async fn finish(mut self) {
        match timeout(self.kill_grace, self.child.wait()).await {
            Ok(Ok(status)) if status.success() => {}
            Ok(Ok(status)) => {
                let stderr = self.collect_stderr().await;
                warn!(
                    exit_code = ?status.code(),
                    stderr = %truncate_chars(stderr.trim(), OUTPUT_PREVIEW_CHARS),
                    "Claude CLI stream exited with failure"
                );
            }
            Ok(Err(err)) => warn!(error = %err, "Failed to wait for Claude CLI"),
            Err(_) => {
                warn!("Claude CLI still running after stream ended; terminating");
                terminate(&mut self.child, self.kill_grace).await;
            }
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        debug!(
            records = self.records,
            duration_ms = self.started.elapsed().as_millis() as u64,
            "Claude CLI stream finished"
        );
    }

    async fn collect_stderr(&mut self) -> String {
        let Some(mut task) = self.stderr_task.take() else {
            return String::new();
        };
        match timeout(self.kill_grace, &mut task).await {
            Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
            _ => {
                task.abort();
                String::new()
            }
        }
    }
}

async fn run_to_completion(
    mut child: Child,
    payload: String,
    config: Arc<RunnerConfig>,
) -> Result<Option<DecodedRecord>, BridgeError> {
    let stdout_task = drain_pipe(child.stdout.take(), usize::MAX);
    let stderr_task = drain_pipe(child.stderr.take(), MAX_STDERR_SIZE);
    let started = Instant::now();

    let finished = timeout(config.process_timeout, async {
        write_stdin(&mut child, &payload).await;
        child.wait().await
    })
    .await;

    let status = match finished {
        Ok(Ok(status)) => status,
        Ok(Err(err)) => {
            stdout_task.abort();
            stderr_task.abort();
            return Err(BridgeError::Stream {
                message: format!("Failed to wait for Claude CLI: {err}"),
            });
        }
        Err(_) => {
            warn!(
                timeout_secs = config.process_timeout.as_secs(),
                "Claude CLI timed out; terminating"
            );
            terminate(&mut child, config.kill_grace).await;
            stdout_task.abort();
            stderr_task.abort();
            return Err(BridgeError::Timeout {
                timeout_secs: config.process_timeout.as_secs(),
            });
        }
    };

    let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).into_owned();
    let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).into_owned();
    debug!(
        exit_code = ?status.code(),
        duration_ms = started.elapsed().as_millis() as u64,
        stdout_bytes = stdout.len(),
        "Claude CLI exited"
    );

    if !status.success() {
        let exit_code = status.code().unwrap_or(-1);
        error!(
            exit_code,
            stderr = %truncate_chars(stderr.trim(), OUTPUT_PREVIEW_CHARS),
            "Claude CLI failed"
        );
        return Err(BridgeError::ProcessExit {
            exit_code,
            message: exit_failure_message(exit_code, &stdout, &stderr),
        });
    }

    parse_output(&stdout)
}

/// Parses the single JSON object printed by `--output-format json`.
fn parse_output(stdout: &str) -> Result<Option<DecodedRecord>, BridgeError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let record = DecodedRecord::parse(trimmed).map_err(|err| BridgeError::OutputParse {
        message: err.to_string(),
        preview: truncate_chars(stdout, OUTPUT_PREVIEW_CHARS),
    })?;
    if let Some(message) = record.error_message() {
        return Err(BridgeError::CliReported { message });
    }
    Ok(Some(record))
}

/// Best message for a non-zero exit: the CLI's own error record, then raw
/// stdout, then stderr.
fn exit_failure_message(exit_code: i32, stdout: &str, stderr: &str) -> String {
    let stdout = stdout.trim();
    if !stdout.is_empty() {
        if let Some(message) = DecodedRecord::parse(stdout)
            .ok()
            .and_then(|record| record.error_message())
        {
            return message;
        }
        return stdout.to_string();
    }
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    format!("Command failed with exit code {exit_code}")
}

/// Writes the prompt and closes stdin so the CLI sees EOF.
async fn write_stdin(child: &mut Child, payload: &str) {
    let Some(mut stdin) = child.stdin.take() else {
        return;
    };
    if let Err(err) = stdin.write_all(payload.as_bytes()).await {
        // The exit status explains an early exit better than EPIPE does.
        warn!(error = %err, "Failed to write prompt to Claude CLI");
        return;
    }
    if let Err(err) = stdin.shutdown().await {
        debug!(error = %err, "Failed to close Claude CLI stdin");
    }
}

fn drain_pipe<R>(pipe: Option<R>, limit: usize) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut collected = Vec::new();
        let Some(mut pipe) = pipe else {
            return collected;
        };
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let room = limit.saturating_sub(collected.len());
                    collected.extend_from_slice(&chunk[..n.min(room)]);
                }
            }
        }
        collected
    })
}

/// Sends SIGTERM, waits up to `grace`, then SIGKILLs. Already-exited
/// processes are left alone.
pub async fn terminate(child: &mut Child, grace: Duration) {
    if let Ok(Some(status)) = child.try_wait() {
        debug!(?status, "Claude CLI already exited");
        return;
    }

    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            if let Ok(Ok(status)) = timeout(grace, child.wait()).await {
                debug!(?status, "Claude CLI exited after SIGTERM");
                return;
            }
            warn!(grace_secs = grace.as_secs(), "Claude CLI ignored SIGTERM; killing");
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(err) = child.kill().await {
        debug!(error = %err, "Failed to kill Claude CLI");
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((end, _)) => text[..end].to_string(),
        None => text.to_string(),
    }
}
