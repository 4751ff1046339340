/// Liveness watchdog for the supervised pipeline.
///
/// Meant to be run periodically by cron. Each check looks for the pipeline
/// in the process table (or a live supervisor holding the instance lock) and
/// launches a detached supervisor when neither is found. A result line is
/// appended to the restart log either way.
///
/// The whole check-then-act sequence runs under an exclusive lock, and the
/// lock is only released once a freshly launched supervisor is visible, so
/// overlapping checks cannot launch duplicates.
use crate::config::{Config, ConfigError};
use crate::lock::{self, InstanceLock};
use crate::logfile;
use crate::process_table::{find_match, ProcessTable};
use regex::Regex;
use std::ffi::OsString;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

/// Starts a new supervisor.
pub trait Launcher {
    /// Launch and return the new process id.
    fn launch(&self) -> std::io::Result<u32>;
}

/// Launches a command detached from the watchdog: own process group,
/// stdio redirected to /dev/null, never waited on.
#[derive(Debug, Clone)]
pub struct DetachedLauncher {
    program: PathBuf,
    args: Vec<OsString>,
    workdir: PathBuf,
}

impl DetachedLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>, workdir: &Path) -> Self {
        Self {
            program: program.into(),
            args,
            workdir: workdir.to_path_buf(),
        }
    }

    /// `<current exe> --config <config_path> supervise`, run in `workdir`.
    pub fn supervisor(config_path: &Path, workdir: &Path) -> std::io::Result<Self> {
        let exe = std::env::current_exe()?;
        let args = vec![
            OsString::from("--config"),
            config_path.as_os_str().to_os_string(),
            OsString::from("supervise"),
        ];
        Ok(Self::new(exe, args, workdir))
    }
}

impl Launcher for DetachedLauncher {
    fn launch(&self) -> std::io::Result<u32> {
        let child = std::process::Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()?;
        Ok(child.id())
    }
}

/// Result of one watchdog check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogOutcome {
    /// Pipeline or supervisor already alive; nothing launched.
    Running { pid: Option<u32> },
    /// Nothing alive; a supervisor was launched.
    Restarted { pid: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Liveness {
    Pipeline(u32),
    Supervisor(Option<u32>),
    Absent,
}

pub struct Watchdog<T, L> {
    table: T,
    launcher: L,
    pattern: Regex,
    restart_log: PathBuf,
    lock_path: PathBuf,
    supervisor_lock: PathBuf,
    settle_timeout: Duration,
    poll_interval: Duration,
    self_pid: u32,
}

impl<T: ProcessTable, L: Launcher> Watchdog<T, L> {
    pub fn new(config: &Config, table: T, launcher: L) -> Result<Self, WatchdogError> {
        let pattern = config
            .pipeline
            .match_regex()
            .map_err(WatchdogError::Pattern)?;
        Ok(Self {
            table,
            launcher,
            pattern,
            restart_log: config.resolve(&config.watchdog.restart_log),
            lock_path: config.resolve(&config.watchdog.lock_file),
            supervisor_lock: config.resolve(&config.supervisor.lock_file),
            settle_timeout: Duration::from_secs(config.watchdog.settle_timeout_secs),
            poll_interval: Duration::from_millis(config.watchdog.poll_interval_ms.max(1)),
            self_pid: std::process::id(),
        })
    }

    /// Run one check-then-act cycle.
    pub fn check(&self) -> Result<WatchdogOutcome, WatchdogError> {
        let _guard =
            InstanceLock::acquire_blocking(&self.lock_path).map_err(|e| WatchdogError::Lock {
                path: self.lock_path.clone(),
                source: e,
            })?;
        tracing::debug!(lock = %self.lock_path.display(), "watchdog lock acquired");

        match self.liveness()? {
            Liveness::Pipeline(pid) => {
                tracing::debug!(pid, "pipeline process found");
                self.record(&format!("Pipeline running (pid {pid})"))?;
                return Ok(WatchdogOutcome::Running { pid: Some(pid) });
            }
            Liveness::Supervisor(pid) => {
                tracing::debug!(pid = ?pid, "supervisor holds instance lock");
                let msg = match pid {
                    Some(pid) => format!("Pipeline supervisor running (pid {pid})"),
                    None => "Pipeline supervisor running".to_string(),
                };
                self.record(&msg)?;
                return Ok(WatchdogOutcome::Running { pid });
            }
            Liveness::Absent => {}
        }

        self.record("Pipeline not running, restarting...")?;
        let pid = match self.launcher.launch() {
            Ok(pid) => pid,
            Err(e) => {
                self.record(&format!("Failed to launch supervisor: {e}"))?;
                return Err(WatchdogError::Launch { source: e });
            }
        };
        tracing::info!(pid, "supervisor launched");

        if !self.wait_for_settle()? {
            tracing::warn!(
                pid,
                timeout_secs = self.settle_timeout.as_secs(),
                "launched supervisor not visible before settle timeout"
            );
        }

        Ok(WatchdogOutcome::Restarted { pid })
    }

    fn liveness(&self) -> Result<Liveness, WatchdogError> {
        let entries = self
            .table
            .snapshot()
            .map_err(|e| WatchdogError::ProcessTable { source: e })?;
        if let Some(entry) = find_match(&entries, &self.pattern, self.self_pid) {
            return Ok(Liveness::Pipeline(entry.pid));
        }

        let held = lock::is_held(&self.supervisor_lock).map_err(|e| WatchdogError::Lock {
            path: self.supervisor_lock.clone(),
            source: e,
        })?;
        if held {
            return Ok(Liveness::Supervisor(lock::read_owner_pid(
                &self.supervisor_lock,
            )));
        }

        Ok(Liveness::Absent)
    }

    /// Poll until the launched supervisor (or its pipeline) shows up.
    fn wait_for_settle(&self) -> Result<bool, WatchdogError> {
        let deadline = Instant::now().checked_add(self.settle_timeout);
        loop {
            if self.liveness()? != Liveness::Absent {
                return Ok(true);
            }
            if deadline.map_or(true, |d| Instant::now() >= d) {
                return Ok(false);
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    fn record(&self, msg: &str) -> Result<(), WatchdogError> {
        logfile::append_line(&self.restart_log, msg).map_err(|e| WatchdogError::RestartLog {
            path: self.restart_log.clone(),
            source: e,
        })
    }
}

/// Errors that abort a watchdog check.
#[derive(Debug)]
pub enum WatchdogError {
    Pattern(ConfigError),
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },
    ProcessTable {
        source: std::io::Error,
    },
    Launch {
        source: std::io::Error,
    },
    RestartLog {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for WatchdogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchdogError::Pattern(e) => write!(f, "{e}"),
            WatchdogError::Lock { path, source } => {
                write!(f, "failed to lock {}: {source}", path.display())
            }
            WatchdogError::ProcessTable { source } => {
                write!(f, "failed to read process table: {source}")
            }
            WatchdogError::Launch { source } => {
                write!(f, "failed to launch supervisor: {source}")
            }
            WatchdogError::RestartLog { path, source } => {
                write!(f, "failed to append to {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for WatchdogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WatchdogError::Pattern(e) => Some(e),
            WatchdogError::Lock { source, .. } => Some(source),
            WatchdogError::ProcessTable { source } => Some(source),
            WatchdogError::Launch { source } => Some(source),
            WatchdogError::RestartLog { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_table::ProcessEntry;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    type Shared = Arc<Mutex<Vec<ProcessEntry>>>;

    struct FakeTable(Shared);

    impl ProcessTable for FakeTable {
        fn snapshot(&self) -> std::io::Result<Vec<ProcessEntry>> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    /// Registers a pipeline process in the shared table when `registers` is set.
    struct FakeLauncher {
        table: Shared,
        launches: Arc<AtomicU32>,
        registers: bool,
    }

    impl Launcher for FakeLauncher {
        fn launch(&self) -> std::io::Result<u32> {
            let n = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
            let pid = 5000 + n;
            if self.registers {
                // Give a concurrent checker every chance to race us.
                std::thread::sleep(Duration::from_millis(50));
                self.table.lock().unwrap().push(ProcessEntry {
                    pid,
                    cmdline: "python3 pipeline.py".to_string(),
                });
            }
            Ok(pid)
        }
    }

    struct FailingLauncher;

    impl Launcher for FailingLauncher {
        fn launch(&self) -> std::io::Result<u32> {
            Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no such binary",
            ))
        }
    }

    fn test_config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.pipeline.workdir = dir.to_path_buf();
        config.watchdog.settle_timeout_secs = 1;
        config.watchdog.poll_interval_ms = 10;
        config
    }

    fn restart_lines(dir: &Path) -> Vec<String> {
        std::fs::read_to_string(dir.join("restart.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn entry(pid: u32, cmdline: &str) -> ProcessEntry {
        ProcessEntry {
            pid,
            cmdline: cmdline.to_string(),
        }
    }

    #[test]
    fn test_running_pipeline_spawns_nothing() {
        let dir = tempdir().unwrap();
        let table: Shared = Arc::new(Mutex::new(vec![
            entry(1, "/sbin/init"),
            entry(321, "python3 pipeline.py"),
        ]));
        let launches = Arc::new(AtomicU32::new(0));
        let watchdog = Watchdog::new(
            &test_config(dir.path()),
            FakeTable(table.clone()),
            FakeLauncher {
                table,
                launches: launches.clone(),
                registers: true,
            },
        )
        .unwrap();

        let outcome = watchdog.check().unwrap();
        assert_eq!(outcome, WatchdogOutcome::Running { pid: Some(321) });
        assert_eq!(launches.load(Ordering::SeqCst), 0);

        let lines = restart_lines(dir.path());
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("Pipeline running (pid 321)"));
    }

    #[test]
    fn test_absent_pipeline_spawns_exactly_one() {
        let dir = tempdir().unwrap();
        let table: Shared = Arc::new(Mutex::new(vec![entry(1, "/sbin/init")]));
        let launches = Arc::new(AtomicU32::new(0));
        let watchdog = Watchdog::new(
            &test_config(dir.path()),
            FakeTable(table.clone()),
            FakeLauncher {
                table,
                launches: launches.clone(),
                registers: true,
            },
        )
        .unwrap();

        let outcome = watchdog.check().unwrap();
        assert_eq!(outcome, WatchdogOutcome::Restarted { pid: 5001 });
        assert_eq!(launches.load(Ordering::SeqCst), 1);

        let lines = restart_lines(dir.path());
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("Pipeline not running, restarting..."));

        // The next check sees the launched pipeline.
        let outcome = watchdog.check().unwrap();
        assert_eq!(outcome, WatchdogOutcome::Running { pid: Some(5001) });
        assert_eq!(launches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_supervisor_in_backoff_counts_as_running() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let _supervisor =
            InstanceLock::try_acquire(&config.resolve(&config.supervisor.lock_file))
                .unwrap()
                .unwrap();

        let table: Shared = Arc::new(Mutex::new(Vec::new()));
        let launches = Arc::new(AtomicU32::new(0));
        let watchdog = Watchdog::new(
            &config,
            FakeTable(table.clone()),
            FakeLauncher {
                table,
                launches: launches.clone(),
                registers: true,
            },
        )
        .unwrap();

        let outcome = watchdog.check().unwrap();
        assert_eq!(
            outcome,
            WatchdogOutcome::Running {
                pid: Some(std::process::id())
            }
        );
        assert_eq!(launches.load(Ordering::SeqCst), 0);
        assert!(restart_lines(dir.path())[0].contains("supervisor running"));
    }

    #[test]
    fn test_own_pid_is_not_a_match() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.pipeline.match_pattern = Some("pipewarden".to_string());
        config.watchdog.settle_timeout_secs = 0;
        let table: Shared = Arc::new(Mutex::new(vec![entry(
            std::process::id(),
            "pipewarden watchdog",
        )]));
        let launches = Arc::new(AtomicU32::new(0));
        let watchdog = Watchdog::new(
            &config,
            FakeTable(table.clone()),
            FakeLauncher {
                table,
                launches: launches.clone(),
                registers: false,
            },
        )
        .unwrap();

        assert!(matches!(
            watchdog.check().unwrap(),
            WatchdogOutcome::Restarted { .. }
        ));
        assert_eq!(launches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_settle_timeout_still_reports_restart() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.watchdog.settle_timeout_secs = 0;
        let table: Shared = Arc::new(Mutex::new(Vec::new()));
        let launches = Arc::new(AtomicU32::new(0));
        let watchdog = Watchdog::new(
            &config,
            FakeTable(table.clone()),
            FakeLauncher {
                table,
                launches: launches.clone(),
                registers: false,
            },
        )
        .unwrap();

        let outcome = watchdog.check().unwrap();
        assert_eq!(outcome, WatchdogOutcome::Restarted { pid: 5001 });
    }

    #[test]
    fn test_unbounded_settle_timeout_does_not_overflow() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.watchdog.settle_timeout_secs = u64::MAX;
        let table: Shared = Arc::new(Mutex::new(Vec::new()));
        let watchdog = Watchdog::new(
            &config,
            FakeTable(table.clone()),
            FakeLauncher {
                table,
                launches: Arc::new(AtomicU32::new(0)),
                registers: true,
            },
        )
        .unwrap();

        assert_eq!(
            watchdog.check().unwrap(),
            WatchdogOutcome::Restarted { pid: 5001 }
        );
    }

    #[test]
    fn test_launch_failure_is_reported() {
        let dir = tempdir().unwrap();
        let watchdog = Watchdog::new(
            &test_config(dir.path()),
            FakeTable(Arc::new(Mutex::new(Vec::new()))),
            FailingLauncher,
        )
        .unwrap();

        let err = watchdog.check().unwrap_err();
        assert!(matches!(err, WatchdogError::Launch { .. }));

        let lines = restart_lines(dir.path());
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("Pipeline not running, restarting..."));
        assert!(lines[1].contains("Failed to launch supervisor: no such binary"));
    }

    #[test]
    fn test_concurrent_checks_launch_once() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let table: Shared = Arc::new(Mutex::new(Vec::new()));
        let launches = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let config = config.clone();
                let table = table.clone();
                let launches = launches.clone();
                std::thread::spawn(move || {
                    let watchdog = Watchdog::new(
                        &config,
                        FakeTable(table.clone()),
                        FakeLauncher {
                            table,
                            launches,
                            registers: true,
                        },
                    )
                    .unwrap();
                    watchdog.check().unwrap()
                })
            })
            .collect();

        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(launches.load(Ordering::SeqCst), 1);
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, WatchdogOutcome::Restarted { .. }))
                .count(),
            1
        );
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, WatchdogOutcome::Running { .. }))
                .count(),
            1
        );
        assert_eq!(restart_lines(dir.path()).len(), 2);
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.pipeline.match_pattern = Some("(".to_string());
        let result = Watchdog::new(
            &config,
            FakeTable(Arc::new(Mutex::new(Vec::new()))),
            FailingLauncher,
        );
        assert!(matches!(result, Err(WatchdogError::Pattern(_))));
    }

    #[test]
    fn test_detached_launcher_runs_in_workdir() {
        let dir = tempdir().unwrap();
        let launcher = DetachedLauncher::new(
            "sh",
            vec![OsString::from("-c"), OsString::from("touch launched")],
            dir.path(),
        );
        let pid = launcher.launch().unwrap();
        assert!(pid > 0);

        let marker = dir.path().join("launched");
        let deadline = Instant::now() + Duration::from_secs(5);
        while !marker.exists() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(marker.exists());
    }

    #[test]
    fn test_supervisor_launcher_args() {
        let dir = tempdir().unwrap();
        let launcher =
            DetachedLauncher::supervisor(Path::new("/etc/pipewarden.toml"), dir.path()).unwrap();
        assert_eq!(
            launcher.args,
            vec![
                OsString::from("--config"),
                OsString::from("/etc/pipewarden.toml"),
                OsString::from("supervise"),
            ]
        );
        assert_eq!(launcher.workdir, dir.path());
    }
}
