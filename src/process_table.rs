/// Process-table snapshots for the liveness check.
use regex::Regex;
use std::path::PathBuf;

/// One running process as seen in the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    /// Arguments joined with single spaces.
    pub cmdline: String,
}

/// Source of process-table snapshots.
pub trait ProcessTable {
    fn snapshot(&self) -> std::io::Result<Vec<ProcessEntry>>;
}

/// Reads `/proc/<pid>/cmdline` for every numeric entry under a procfs root.
pub struct ProcFs {
    root: PathBuf,
}

impl ProcFs {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for ProcFs {
    fn snapshot(&self) -> std::io::Result<Vec<ProcessEntry>> {
        let mut entries = Vec::new();
        for dirent in std::fs::read_dir(&self.root)? {
            let Ok(dirent) = dirent else { continue };
            let Some(pid) = dirent
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };

            // Processes exit between read_dir and read; skip them.
            let raw = match std::fs::read(dirent.path().join("cmdline")) {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            let cmdline = join_cmdline(&raw);
            // Kernel threads have an empty cmdline.
            if cmdline.is_empty() {
                continue;
            }
            entries.push(ProcessEntry { pid, cmdline });
        }
        entries.sort_by_key(|e| e.pid);
        Ok(entries)
    }
}

fn join_cmdline(raw: &[u8]) -> String {
    raw.split(|b| *b == 0)
        .filter(|arg| !arg.is_empty())
        .map(String::from_utf8_lossy)
        .collect::<Vec<_>>()
        .join(" ")
}

/// First entry whose command line matches `pattern`, ignoring `exclude_pid`.
pub fn find_match<'a>(
    entries: &'a [ProcessEntry],
    pattern: &Regex,
    exclude_pid: u32,
) -> Option<&'a ProcessEntry> {
    entries
        .iter()
        .find(|e| e.pid != exclude_pid && pattern.is_match(&e.cmdline))
}
