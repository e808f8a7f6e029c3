use super::{CallOptions, Completion, HealthReport, StreamSink};
use crate::error::{classify_upstream_error, GatewayError};
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

/// Child-process CLI adapter: prompt on stdin, completion on stdout, stderr
/// surfaced as the error text. Used for local inference CLIs.
#[derive(Debug)]
pub struct ProcessUpstream {
    name: String,
    command: String,
    args: Vec<String>,
}

impl ProcessUpstream {
    pub fn new(name: String, command: String, args: Vec<String>) -> Self {
        Self { name, command, args }
    }

    /// Substitute `{model}` placeholders and build the command.
    fn build_command(&self, model: &str) -> Command {
        let mut cmd = Command::new(&self.command);
        for arg in &self.args {
            if arg.contains("{model}") {
                cmd.arg(arg.replace("{model}", model));
            } else {
                cmd.arg(arg);
            }
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    pub async fn complete(
        &self,
        prompt: &str,
        model: &str,
        opts: &CallOptions,
    ) -> Result<Completion, GatewayError> {
        let start = Instant::now();
        let mut child = self
            .build_command(model)
            .spawn()
            .map_err(|e| GatewayError::Upstream(format!("spawn {}: {}", self.command, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| GatewayError::Upstream(format!("stdin write: {}", e)))?;
            // Dropping stdin closes the pipe so the child sees EOF.
        }

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::Internal("child stdout not captured".into()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| GatewayError::Internal("child stderr not captured".into()))?;

        let mut out_buf = Vec::new();
        let mut err_buf = Vec::new();
        let cancelled = {
            let drain = async {
                let _ = tokio::join!(
                    stdout.read_to_end(&mut out_buf),
                    stderr.read_to_end(&mut err_buf)
                );
            };
            tokio::select! {
                _ = drain => false,
                _ = opts.cancel.cancelled() => true,
            }
        };

        if cancelled {
            // Terminate the child and reap its exit status.
            let _ = child.start_kill();
            let status = child.wait().await;
            tracing::debug!(
                "process: cancelled, command={}, exit={:?}",
                self.command,
                status.ok().and_then(|s| s.code())
            );
            return Err(GatewayError::Internal("request cancelled".into()));
        }

        let status = child
            .wait()
            .await
            .map_err(|e| GatewayError::Upstream(format!("wait: {}", e)))?;

        let stderr_text = String::from_utf8_lossy(&err_buf);
        if !status.success() {
            let code = status.code().unwrap_or(-1);
            return Err(classify_upstream_error(&format!(
                "exit {}: {}",
                code,
                stderr_text.trim()
            )));
        }

        let text = String::from_utf8_lossy(&out_buf).trim().to_string();
        if text.is_empty() {
            return Err(GatewayError::Upstream(format!(
                "empty output from {}: {}",
                self.command,
                stderr_text.trim()
            )));
        }

        Ok(Completion {
            model: model.to_string(),
            text,
            provider: self.name.clone(),
            duration_ms: start.elapsed().as_millis() as u64,
            cached: false,
            prompt_tokens: None,
            completion_tokens: None,
        })
    }

    /// Stream stdout line-by-line as chunks.
    pub async fn complete_stream(
        &self,
        prompt: &str,
        model: &str,
        opts: &CallOptions,
        sink: &StreamSink,
    ) -> Result<(), GatewayError> {
        let start = Instant::now();
        let mut child = self
            .build_command(model)
            .spawn()
            .map_err(|e| GatewayError::Upstream(format!("spawn {}: {}", self.command, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| GatewayError::Upstream(format!("stdin write: {}", e)))?;
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::Internal("child stdout not captured".into()))?;
        let mut lines = BufReader::new(stdout).lines();

        loop {
            let line = tokio::select! {
                l = lines.next_line() => l,
                _ = opts.cancel.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Err(GatewayError::Internal("request cancelled".into()));
                }
            };
            match line {
                Ok(Some(line)) => {
                    if !sink.chunk(format!("{}\n", line)).await {
                        let _ = child.start_kill();
                        return Ok(());
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = child.start_kill();
                    return Err(GatewayError::Upstream(format!("stdout read: {}", e)));
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| GatewayError::Upstream(format!("wait: {}", e)))?;
        if !status.success() {
            let mut stderr_text = String::new();
            if let Some(stderr) = child.stderr.take() {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    stderr_text.push_str(&line);
                    stderr_text.push('\n');
                }
            }
            return Err(classify_upstream_error(&format!(
                "exit {}: {}",
                status.code().unwrap_or(-1),
                stderr_text.trim()
            )));
        }

        sink.end(start.elapsed().as_millis() as u64).await;
        Ok(())
    }

    /// Probe the CLI with `--version`.
    pub async fn health_check(&self) -> HealthReport {
        let start = Instant::now();
        let result = Command::new(&self.command)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        let latency_ms = start.elapsed().as_millis() as u64;
        match result {
            Ok(status) if status.success() => HealthReport {
                ok: true,
                latency_ms,
                error: None,
            },
            Ok(status) => HealthReport {
                ok: false,
                latency_ms,
                error: Some(format!("exit {}", status.code().unwrap_or(-1))),
            },
            Err(e) => HealthReport {
                ok: false,
                latency_ms,
                error: Some(e.to_string()),
            },
        }
    }

    pub async fn list_models(&self) -> Vec<String> {
        Vec::new()
    }
}
