/// Single pipeline attempt: spawn the pipeline subprocess, tee its output
/// to the console and the run log, and report how it exited.
use crate::config::PipelineConfig;
use crate::logfile::RunLog;
use nix::sys::signal::Signal;
use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

/// Result of a completed attempt.
#[derive(Debug)]
pub struct AttemptResult {
    /// Exit code as a shell would report it: `128 + signo` when killed by a signal.
    pub exit_code: i32,
    /// Terminating signal, if any.
    pub signal: Option<Signal>,
    /// Bytes of output captured from stdout and stderr combined.
    pub output_bytes: u64,
    pub duration: Duration,
    pub pid: u32,
}

/// Errors that can occur while running an attempt.
#[derive(Debug)]
pub enum SessionError {
    /// Failed to spawn the pipeline subprocess.
    Spawn {
        command: String,
        source: std::io::Error,
    },
    /// Failed to read child output, write the run log, or wait for the child.
    Io { source: std::io::Error },
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Spawn { command, source } => {
                write!(f, "failed to spawn pipeline '{command}': {source}")
            }
            SessionError::Io { source } => write!(f, "I/O error during pipeline run: {source}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Spawn { source, .. } => Some(source),
            SessionError::Io { source } => Some(source),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Map an exit status to the shell's `$?` convention.
pub fn exit_code(status: ExitStatus) -> (i32, Option<Signal>) {
    if let Some(code) = status.code() {
        return (code, None);
    }
    match status.signal() {
        Some(signo) => (128 + signo, Signal::try_from(signo).ok()),
        None => (-1, None),
    }
}

/// Run the pipeline once, blocking until it exits.
pub async fn run_attempt(
    pipeline: &PipelineConfig,
    log: &RunLog,
) -> Result<AttemptResult, SessionError> {
    tracing::info!(
        command = %pipeline.command,
        args = ?pipeline.args,
        workdir = %pipeline.workdir.display(),
        "spawning pipeline"
    );

    let start = Instant::now();

    let mut child = Command::new(&pipeline.command)
        .args(&pipeline.args)
        .current_dir(&pipeline.workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| SessionError::Spawn {
            command: pipeline.command_line(),
            source: e,
        })?;

    let pid = child.id().unwrap_or(0);
    tracing::debug!(pid, "pipeline subprocess started");

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    // Drain both pipes while waiting so the child never blocks on a full pipe.
    let (out_bytes, err_bytes, status) = tokio::join!(
        tee(stdout, log, Stream::Stdout),
        tee(stderr, log, Stream::Stderr),
        child.wait(),
    );

    let status = status.map_err(|e| SessionError::Io { source: e })?;
    let output_bytes = out_bytes.map_err(|e| SessionError::Io { source: e })?
        + err_bytes.map_err(|e| SessionError::Io { source: e })?;
    let duration = start.elapsed();
    let (exit_code, signal) = exit_code(status);

    tracing::info!(
        pid,
        exit_code,
        signal = ?signal,
        output_bytes,
        duration_secs = duration.as_secs(),
        "pipeline exited"
    );

    Ok(AttemptResult {
        exit_code,
        signal,
        output_bytes,
        duration,
        pid,
    })
}

/// Copy `reader` line by line to the console stream and the run log.
async fn tee<R>(reader: Option<R>, log: &RunLog, stream: Stream) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return Ok(0);
    };
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(1024);
    let mut total = 0u64;

    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf).await?;
        if n == 0 {
            break;
        }
        total += n as u64;

        // Console output is best effort; a closed terminal must not stall the child.
        let _ = match stream {
            Stream::Stdout => {
                let mut out = std::io::stdout().lock();
                out.write_all(&buf).and_then(|_| out.flush())
            }
            Stream::Stderr => {
                let mut err = std::io::stderr().lock();
                err.write_all(&buf).and_then(|_| err.flush())
            }
        };

        log.write_output(&buf)?;
    }

    Ok(total)
}
