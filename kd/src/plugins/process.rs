//! Subprocess execution with line streaming
//!
//! Rule bodies are synchronous and run on the blocking pool; the child is
//! driven by tokio from there so a cancelled run kills it instead of waiting.

use std::collections::VecDeque;
use std::future::Future;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::eval::CancelToken;
use crate::events::ProgressLogger;
use crate::rule::BuildError;

/// Stderr lines kept for the failure message
const STDERR_TAIL: usize = 20;

#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    /// Last lines written to stderr
    pub stderr_tail: Vec<String>,
}

impl ProcessOutput {
    /// Turn a non-zero exit into an execution error carrying the stderr tail
    pub fn ensure_success(self, program: &str) -> Result<(), BuildError> {
        if self.status.success() {
            return Ok(());
        }
        let message = match self.status.code() {
            Some(code) => format!("{} exited with status {}", program, code),
            None => format!("{} was terminated by a signal", program),
        };
        Err(BuildError::RuleExecution {
            rule: String::new(),
            message,
            causes: self.stderr_tail,
        })
    }
}

/// Run `program` to completion, forwarding each output line to `progress`
///
/// Must be called from a blocking context. When `cancel` fires the child is
/// killed and `BuildError::Cancelled` is returned.
pub fn run_streaming(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    progress: &ProgressLogger,
    cancel: &CancelToken,
) -> Result<ProcessOutput, BuildError> {
    debug!(%program, ?args, ?cwd, "run_streaming: called");
    block_on(drive(program, args, cwd, progress, cancel))?
}

async fn drive(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    progress: &ProgressLogger,
    cancel: &CancelToken,
) -> Result<ProcessOutput, BuildError> {
    if cancel.is_cancelled() {
        return Err(BuildError::Cancelled);
    }
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }

    let mut child = command
        .spawn()
        .map_err(|e| BuildError::execution(format!("failed to start {}: {}", program, e)))?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let out_lines = async {
        if let Some(stdout) = stdout {
            forward_lines(stdout, |line| progress.output(line, false)).await;
        }
    };
    let err_lines = async {
        let mut tail = VecDeque::with_capacity(STDERR_TAIL);
        if let Some(stderr) = stderr {
            forward_lines(stderr, |line| {
                progress.output(line.clone(), true);
                if tail.len() == STDERR_TAIL {
                    tail.pop_front();
                }
                tail.push_back(line);
            })
            .await;
        }
        tail
    };
    let finished = async {
        let (_, tail, status) = tokio::join!(out_lines, err_lines, child.wait());
        (tail, status)
    };

    tokio::select! {
        (tail, status) = finished => {
            let status = status.map_err(|e| BuildError::execution(format!("failed to wait for {}: {}", program, e)))?;
            debug!(%program, ?status, "run_streaming: finished");
            Ok(ProcessOutput {
                status,
                stderr_tail: Vec::from(tail),
            })
        }
        _ = cancel.cancelled() => {
            // Dropping the child kills it
            info!(%program, "run_streaming: cancelled, killing child");
            Err(BuildError::Cancelled)
        }
    }
}

/// Run `future` to completion from synchronous code
///
/// Uses the ambient runtime when called from its blocking pool, otherwise a
/// private current-thread runtime.
fn block_on<F: Future>(future: F) -> Result<F::Output, BuildError> {
    match Handle::try_current() {
        Ok(handle) => Ok(handle.block_on(future)),
        Err(_) => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| BuildError::execution(format!("failed to start process runtime: {}", e)))?;
            Ok(runtime.block_on(future))
        }
    }
}

async fn forward_lines(stream: impl AsyncRead + Unpin, mut sink: impl FnMut(String)) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                sink(text.trim_end_matches('\n').trim_end_matches('\r').to_string());
            }
            Err(e) => {
                debug!(error = %e, "forward_lines: read failed");
                break;
            }
        }
    }
}
