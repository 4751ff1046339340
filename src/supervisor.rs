/// Supervisor loop: run the pipeline until it exits 0, backing off between
/// failed attempts.
///
/// One supervisor per working directory: the loop holds the instance lock for
/// its whole lifetime, which is also how the watchdog recognises a supervisor
/// sitting in a backoff pause.
use crate::config::Config;
use crate::lock::{self, InstanceLock};
use crate::logfile::RunLog;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::session::{self, SessionError};
use crate::status::{StatusTracker, SupervisorState};
use chrono::{DateTime, Local, TimeDelta, Utc};
use nix::sys::signal::Signal;
use std::path::PathBuf;
use std::time::Duration;

/// Exit code recorded when the pipeline command cannot be spawned at all,
/// matching the shell's "command not found".
pub const SPAWN_FAILED_CODE: i32 = 127;

/// How long a starting supervisor keeps retrying a contended instance lock.
const LOCK_WAIT: Duration = Duration::from_millis(200);

/// How the supervisor loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorOutcome {
    Succeeded { attempts: u32 },
    Exhausted { attempts: u32, last_exit_code: i32 },
}

pub struct Supervisor {
    config: Config,
    policy: RetryPolicy,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        let policy = RetryPolicy::from_config(&config.retry);
        Self::with_policy(config, policy)
    }

    pub fn with_policy(config: Config, policy: RetryPolicy) -> Self {
        Self { config, policy }
    }

    /// Run the loop to a terminal state.
    pub async fn run(mut self) -> Result<SupervisorOutcome, SupervisorError> {
        let lock_path = self.config.resolve(&self.config.supervisor.lock_file);
        let instance_lock = match InstanceLock::try_acquire_within(&lock_path, LOCK_WAIT) {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                return Err(SupervisorError::AlreadyRunning {
                    pid: lock::read_owner_pid(&lock_path),
                    path: lock_path,
                })
            }
            Err(e) => {
                return Err(SupervisorError::Lock {
                    path: lock_path,
                    source: e,
                })
            }
        };

        tracing::debug!(lock = %instance_lock.path().display(), "instance lock acquired");

        let log_dir = self.config.resolve(&self.config.supervisor.log_dir);
        let log = RunLog::create(&log_dir, &self.config.supervisor.log_prefix, Local::now())
            .map_err(|e| SupervisorError::LogFile {
                path: log_dir.clone(),
                source: e,
            })?;
        tracing::info!(
            log = %log.path().display(),
            pipeline = %self.config.pipeline.command_line(),
            "supervisor started"
        );

        let status_path = self.config.resolve(&self.config.supervisor.status_file);
        let mut tracker = StatusTracker::new(status_path, log.path(), self.policy.max_attempts());
        tracker.update(SupervisorState::Starting);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            tracker.set_attempt(attempt);
            tracker.update(SupervisorState::Running);
            note(&log, &format!("Starting pipeline (attempt {attempt})"))?;

            let (exit_code, signal) = match session::run_attempt(&self.config.pipeline, &log).await
            {
                Ok(result) => {
                    tracing::debug!(
                        attempt,
                        pid = result.pid,
                        output_bytes = result.output_bytes,
                        duration_secs = result.duration.as_secs(),
                        "attempt finished"
                    );
                    (result.exit_code, result.signal)
                }
                Err(e @ SessionError::Spawn { .. }) => {
                    tracing::warn!(error = %e, "pipeline spawn failed");
                    note(&log, &e.to_string())?;
                    (SPAWN_FAILED_CODE, None)
                }
                Err(e) => return Err(SupervisorError::Session(e)),
            };
            tracker.set_last_exit_code(exit_code);

            match self.policy.evaluate(exit_code) {
                RetryDecision::Done => {
                    note(&log, "Pipeline completed successfully")?;
                    tracker.update(SupervisorState::Succeeded);
                    tracing::info!(attempts = attempt, "pipeline succeeded");
                    return Ok(SupervisorOutcome::Succeeded { attempts: attempt });
                }
                RetryDecision::Retry { delay, .. } => {
                    note(
                        &log,
                        &format!(
                            "Pipeline exited with code {}. Restarting in {}...",
                            describe_exit(exit_code, signal),
                            format_delay(delay)
                        ),
                    )?;
                    if let Some(at) = retry_at(Utc::now(), delay) {
                        tracker.set_next_retry_at(at);
                    }
                    tracker.update(SupervisorState::Backoff);
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::Exhausted { failures } => {
                    note(
                        &log,
                        &format!(
                            "Pipeline exited with code {}. Giving up after {failures} failed attempts",
                            describe_exit(exit_code, signal)
                        ),
                    )?;
                    tracker.update(SupervisorState::Exhausted);
                    tracing::error!(attempts = attempt, exit_code, "pipeline retries exhausted");
                    return Ok(SupervisorOutcome::Exhausted {
                        attempts: attempt,
                        last_exit_code: exit_code,
                    });
                }
            }
        }
    }
}

fn note(log: &RunLog, msg: &str) -> Result<(), SupervisorError> {
    log.status_line(msg).map_err(|e| SupervisorError::LogFile {
        path: log.path().to_path_buf(),
        source: e,
    })
}

/// Wall-clock time of the next attempt, if representable.
fn retry_at(now: DateTime<Utc>, delay: Duration) -> Option<DateTime<Utc>> {
    let wait = TimeDelta::from_std(delay).ok()?;
    now.checked_add_signed(wait)
}

fn describe_exit(code: i32, signal: Option<Signal>) -> String {
    match signal {
        Some(sig) => format!("{code} ({})", sig.as_str()),
        None => code.to_string(),
    }
}

fn format_delay(delay: Duration) -> String {
    if delay.subsec_nanos() == 0 {
        format!("{}s", delay.as_secs())
    } else {
        format!("{}ms", delay.as_millis())
    }
}

/// Errors that stop the supervisor before it reaches a terminal state.
#[derive(Debug)]
pub enum SupervisorError {
    /// Another supervisor holds the instance lock.
    AlreadyRunning { path: PathBuf, pid: Option<u32> },
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },
    Session(SessionError),
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::AlreadyRunning { path, pid } => match pid {
                Some(pid) => write!(
                    f,
                    "another supervisor (pid {pid}) holds {}",
                    path.display()
                ),
                None => write!(f, "another supervisor holds {}", path.display()),
            },
            SupervisorError::Lock { path, source } => {
                write!(f, "failed to lock {}: {source}", path.display())
            }
            SupervisorError::LogFile { path, source } => {
                write!(f, "failed to write run log {}: {source}", path.display())
            }
            SupervisorError::Session(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::AlreadyRunning { .. } => None,
            SupervisorError::Lock { source, .. } => Some(source),
            SupervisorError::LogFile { source, .. } => Some(source),
            SupervisorError::Session(e) => Some(e),
        }
    }
}
