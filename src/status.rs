/// Status file: the supervisor writes its state as JSON on every transition.
///
/// Uses atomic write pattern: write to a temp file in the same directory, then rename.
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Supervisor states written to the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Starting,
    Running,
    Backoff,
    Succeeded,
    Exhausted,
}

impl SupervisorState {
    /// Whether the loop has stopped for good.
    pub fn is_terminal(self) -> bool {
        matches!(self, SupervisorState::Succeeded | SupervisorState::Exhausted)
    }
}

/// The JSON payload written to the status file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusData {
    pub pid: u32,
    pub state: SupervisorState,
    /// 1-based number of the current (or last) pipeline attempt.
    pub attempt: u32,
    pub max_attempts: Option<u32>,
    pub last_exit_code: Option<i32>,
    pub run_log: String,
    pub started_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Manages the status file lifecycle.
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Atomically write status data to the status file.
    ///
    /// Readers never see a partial write.
    pub fn write(&self, data: &StatusData) -> Result<(), StatusError> {
        let json =
            serde_json::to_string_pretty(data).map_err(|e| StatusError::Serialize { source: e })?;

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(|e| StatusError::Write {
            path: dir.to_path_buf(),
            source: e,
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StatusError::Write {
            path: dir.to_path_buf(),
            source: e,
        })?;
        tmp.write_all(json.as_bytes())
            .map_err(|e| StatusError::Write {
                path: tmp.path().to_path_buf(),
                source: e,
            })?;

        tmp.persist(&self.path).map_err(|e| StatusError::Rename {
            to: self.path.clone(),
            source: e.error,
        })?;

        Ok(())
    }

    /// Read back a status file written by [`StatusFile::write`].
    pub fn read(&self) -> Result<StatusData, StatusError> {
        let contents = std::fs::read_to_string(&self.path).map_err(|e| StatusError::Read {
            path: self.path.clone(),
            source: e,
        })?;
        serde_json::from_str(&contents).map_err(|e| StatusError::Deserialize {
            path: self.path.clone(),
            source: e,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Mutable state tracker that builds StatusData for each update.
pub struct StatusTracker {
    file: StatusFile,
    pid: u32,
    attempt: u32,
    max_attempts: Option<u32>,
    last_exit_code: Option<i32>,
    run_log: String,
    started_at: DateTime<Utc>,
    next_retry_at: Option<DateTime<Utc>>,
}

impl StatusTracker {
    pub fn new(status_path: PathBuf, run_log: &Path, max_attempts: Option<u32>) -> Self {
        Self {
            file: StatusFile::new(status_path),
            pid: std::process::id(),
            attempt: 0,
            max_attempts,
            last_exit_code: None,
            run_log: run_log.display().to_string(),
            started_at: Utc::now(),
            next_retry_at: None,
        }
    }

    /// Write the status file with the given state.
    ///
    /// Failures are logged, never fatal: the status file is informational.
    pub fn update(&self, state: SupervisorState) {
        let data = StatusData {
            pid: self.pid,
            state,
            attempt: self.attempt,
            max_attempts: self.max_attempts,
            last_exit_code: self.last_exit_code,
            run_log: self.run_log.clone(),
            started_at: self.started_at,
            last_update: Utc::now(),
            next_retry_at: self.next_retry_at,
        };

        if let Err(e) = self.file.write(&data) {
            tracing::warn!(error = %e, path = %self.file.path().display(), "failed to write status file");
        }
    }

    pub fn set_attempt(&mut self, attempt: u32) {
        self.attempt = attempt;
        self.next_retry_at = None;
    }

    pub fn set_last_exit_code(&mut self, code: i32) {
        self.last_exit_code = Some(code);
    }

    pub fn set_next_retry_at(&mut self, at: DateTime<Utc>) {
        self.next_retry_at = Some(at);
    }
}

/// Whether a process with this PID exists (EPERM still means it exists).
pub fn pid_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Errors from status file operations.
#[derive(Debug)]
pub enum StatusError {
    Serialize {
        source: serde_json::Error,
    },
    Deserialize {
        path: PathBuf,
        source: serde_json::Error,
    },
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::Serialize { source } => write!(f, "failed to serialize status: {source}"),
            StatusError::Deserialize { path, source } => {
                write!(f, "failed to parse status file {}: {source}", path.display())
            }
            StatusError::Read { path, source } => {
                write!(f, "failed to read status file {}: {source}", path.display())
            }
            StatusError::Write { path, source } => {
                write!(
                    f,
                    "failed to write temp status file {}: {source}",
                    path.display()
                )
            }
            StatusError::Rename { to, source } => {
                write!(f, "failed to move status file into {}: {source}", to.display())
            }
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Serialize { source } => Some(source),
            StatusError::Deserialize { source, .. } => Some(source),
            StatusError::Read { source, .. } => Some(source),
            StatusError::Write { source, .. } => Some(source),
            StatusError::Rename { source, .. } => Some(source),
        }
    }
}
