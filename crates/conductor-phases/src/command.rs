//! Shell command execution for the validation phases.
//!
//! Commands run under `bash -c` in their own process group so a timeout or
//! cancellation can take down everything they spawned.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;

/// How long a terminated process group gets before it is killed outright.
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// The last `max_lines` lines of stdout followed by stderr.
    pub fn tail(&self, max_lines: usize) -> String {
        let mut combined = self.stdout.clone();
        if !combined.is_empty() && !combined.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(&self.stderr);
        let lines: Vec<&str> = combined.lines().collect();
        let start = lines.len().saturating_sub(max_lines);
        lines[start..].join("\n")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Exited(CommandOutput),
    TimedOut { duration_ms: u64 },
    Cancelled,
}

/// Runs commands in a fixed working directory with a per-command timeout.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    working_dir: PathBuf,
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(working_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            working_dir: working_dir.into(),
            timeout,
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Environment for child processes, minus anything that looks like a secret.
    fn filtered_env() -> HashMap<String, String> {
        let exclude_suffixes: &[&str] = &["_api_key", "_secret", "_token", "_password", "_credential"];
        let always_include: &[&str] = &["PATH", "HOME", "USER", "SHELL", "LANG", "TERM", "TMPDIR"];

        std::env::vars()
            .filter(|(key, _)| {
                let lower = key.to_lowercase();
                always_include.contains(&key.as_str())
                    || !exclude_suffixes.iter().any(|s| lower.ends_with(s))
            })
            .collect()
    }

    pub async fn run(&self, command: &str, cancel: &CancellationToken) -> std::io::Result<CommandOutcome> {
        let mut cmd = tokio::process::Command::new("bash");
        cmd.args(["-c", command])
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear()
            .envs(Self::filtered_env())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let start = tokio::time::Instant::now();
        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;
        let stdout = tokio::spawn(read_all(stdout));
        let stderr = tokio::spawn(read_all(stderr));

        tracing::debug!(command = %command, cwd = %self.working_dir.display(), "Running command");

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                let stdout = stdout.await.unwrap_or_default();
                let stderr = stderr.await.unwrap_or_default();
                Ok(CommandOutcome::Exited(CommandOutput {
                    stdout: String::from_utf8_lossy(&stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                    exit_code: status.code().unwrap_or(-1),
                    duration_ms: start.elapsed().as_millis() as u64,
                }))
            }
            _ = tokio::time::sleep(self.timeout) => {
                tracing::warn!(command = %command, timeout_ms = %self.timeout.as_millis(), "Command timed out");
                terminate(&mut child).await;
                stdout.abort();
                stderr.abort();
                Ok(CommandOutcome::TimedOut {
                    duration_ms: start.elapsed().as_millis() as u64,
                })
            }
            _ = cancel.cancelled() => {
                tracing::info!(command = %command, "Command cancelled");
                terminate(&mut child).await;
                stdout.abort();
                stderr.abort();
                Ok(CommandOutcome::Cancelled)
            }
        }
    }
}

fn missing_pipe(name: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, format!("{name} was not captured"))
}

async fn read_all<R: AsyncRead + Unpin>(mut reader: R) -> Vec<u8> {
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf).await;
    buf
}

/// SIGTERM the process group, then kill the child if it lingers.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: kill(2) on the process group this child leads; no memory is touched.
            unsafe {
                libc::kill(-(pid as i32), libc::SIGTERM);
            }
        }
        tokio::select! {
            _ = child.wait() => {}
            _ = tokio::time::sleep(KILL_GRACE) => {
                let _ = child.kill().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.kill().await;
    }
}
