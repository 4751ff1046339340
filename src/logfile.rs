/// Plain-text, append-only log files: the per-run pipeline log and the
/// watchdog's restart log.
use chrono::{DateTime, Local};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Timestamp format used in every status line.
const STAMP: &str = "%Y-%m-%d %H:%M:%S";

/// Format `msg` as a single timestamped line (with trailing newline).
pub fn stamped(msg: &str) -> String {
    format!("[{}] {msg}\n", Local::now().format(STAMP))
}

/// Append one timestamped line to `path`, creating the file and its parent
/// directory if needed.
pub fn append_line(path: &Path, msg: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(stamped(msg).as_bytes())
}

/// Run log for one supervisor invocation.
///
/// Holds the pipeline's stdout/stderr and the supervisor's status lines.
/// Both output pipes write through the same handle, so writes are serialized.
pub struct RunLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl RunLog {
    /// Create `{dir}/{prefix}-{YYYYmmdd-HHMMSS}.log` for a loop started at `started`.
    pub fn create(dir: &Path, prefix: &str, started: DateTime<Local>) -> std::io::Result<RunLog> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{prefix}-{}.log", started.format("%Y%m%d-%H%M%S")));
        Self::open(path)
    }

    /// Open (append) an existing or new log at an explicit path.
    pub fn open(path: PathBuf) -> std::io::Result<RunLog> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(RunLog {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append raw pipeline output.
    pub fn write_output(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut file = self
            .file
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        file.write_all(bytes)
    }

    /// Append a timestamped status line and echo it to the console.
    pub fn status_line(&self, msg: &str) -> std::io::Result<()> {
        self.status_line_to(msg, &mut std::io::stdout().lock())
    }

    /// Like [`RunLog::status_line`], echoing to `console`. Only the log write
    /// can fail; a closed console must not stop the supervisor.
    pub fn status_line_to<W: Write>(&self, msg: &str, console: &mut W) -> std::io::Result<()> {
        let line = stamped(msg);
        let _ = console
            .write_all(line.as_bytes())
            .and_then(|_| console.flush());
        self.write_output(line.as_bytes())
    }
}
