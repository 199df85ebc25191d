//! Executor seam: the scraping logic the engine runs once per attempt.
//!
//! The engine hands the executor the job payload and a cancellation token
//! and waits for a result, bounded by the per-job timeout. Cancellation is
//! cooperative; an executor that ignores the token is simply abandoned when
//! the timeout fires.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        payload: &serde_json::Value,
        cancel: CancellationToken,
    ) -> anyhow::Result<serde_json::Value>;
}

/// Runs an external program for every attempt.
///
/// The payload is written to the child's stdin as JSON; whatever the child
/// prints to stdout is parsed as the JSON result. A non-zero exit status is
/// a failure carrying the tail of stderr. Cancellation kills the child.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: PathBuf,
    args: Vec<String>,
}

/// Bytes of stderr kept in a failure message.
const STDERR_TAIL: usize = 2048;

impl CommandExecutor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Resolve relative program paths against the process CWD.
    fn resolved_program(&self) -> std::io::Result<PathBuf> {
        if self.program.is_relative() && self.program.components().count() > 1 {
            Ok(std::env::current_dir()?.join(&self.program))
        } else {
            Ok(self.program.clone())
        }
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute(
        &self,
        payload: &serde_json::Value,
        cancel: CancellationToken,
    ) -> anyhow::Result<serde_json::Value> {
        let program = self.resolved_program()?;
        debug!(program = %program.display(), "spawning executor");

        let mut child = Command::new(&program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let input = serde_json::to_vec(payload)?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&input).await?;
            // dropping stdin closes the pipe so the child sees EOF
        }

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("child stdout not captured"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("child stderr not captured"))?;

        let run = async {
            let mut out = Vec::new();
            let mut err = Vec::new();
            let (read_out, read_err, status) = tokio::join!(
                stdout.read_to_end(&mut out),
                stderr.read_to_end(&mut err),
                child.wait()
            );
            read_out?;
            read_err?;
            Ok::<_, std::io::Error>((status?, out, err))
        };

        let (status, out, err) = tokio::select! {
            _ = cancel.cancelled() => anyhow::bail!("cancelled"),
            finished = run => finished?,
        };

        if !status.success() {
            let err = String::from_utf8_lossy(&err);
            let start = err.len().saturating_sub(STDERR_TAIL);
            let tail = err.get(start..).unwrap_or(&*err).trim();
            anyhow::bail!(
                "{} exited with status {}: {tail}",
                program.display(),
                status.code().unwrap_or(-1)
            );
        }

        Ok(serde_json::from_slice(&out)?)
    }
}
