mod config;
mod lock;
mod logfile;
mod process_table;
mod progress;
mod retry;
mod session;
mod status;
mod supervisor;
mod watchdog;

use clap::{Parser, Subcommand};
use config::Config;
use process_table::ProcFs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use supervisor::{Supervisor, SupervisorError, SupervisorOutcome};
use watchdog::{DetachedLauncher, Watchdog, WatchdogOutcome};

/// Keeps the podcast data pipeline running: a restart-on-failure supervisor
/// loop plus a cron-friendly liveness watchdog.
#[derive(Parser, Debug)]
#[command(name = "pipewarden", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, global = true, default_value = "pipewarden.toml")]
    config: PathBuf,

    /// Validate config and print resolved settings, don't run
    #[arg(long, global = true)]
    dry_run: bool,

    /// Extra logging (lock handling, process-table matches)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pipeline until it exits 0, restarting it on failure
    Supervise {
        /// Give up after this many failed attempts (0 = never)
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Seconds to wait before the first restart (overrides config)
        #[arg(long)]
        delay: Option<u64>,
    },
    /// Check once whether the pipeline is alive and relaunch it if not
    Watchdog,
    /// Print supervisor state and pipeline progress
    Status,
}

const EXIT_FAILURE: u8 = 1;
const EXIT_ALREADY_RUNNING: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    if let Command::Supervise {
        max_attempts,
        delay,
    } = &cli.command
    {
        if let Some(n) = max_attempts {
            config.retry.max_attempts = *n;
        }
        if let Some(secs) = delay {
            config.retry.initial_delay_secs = *secs;
            config.retry.max_delay_secs = config.retry.max_delay_secs.max(*secs);
        }
        if let Err(e) = config.validate() {
            tracing::error!(error = %e, "invalid CLI overrides");
            return ExitCode::from(EXIT_FAILURE);
        }
    }

    if cli.dry_run {
        print_resolved(&cli.config, &config);
        return ExitCode::SUCCESS;
    }

    match cli.command {
        Command::Supervise { .. } => run_supervise(config).await,
        Command::Watchdog => run_watchdog(&cli.config, config).await,
        Command::Status => run_status(&config),
    }
}

async fn run_supervise(config: Config) -> ExitCode {
    match Supervisor::new(config).run().await {
        Ok(SupervisorOutcome::Succeeded { attempts }) => {
            tracing::info!(attempts, "supervisor finished");
            ExitCode::SUCCESS
        }
        Ok(SupervisorOutcome::Exhausted {
            attempts,
            last_exit_code,
        }) => {
            tracing::error!(attempts, last_exit_code, "supervisor gave up");
            ExitCode::from(EXIT_FAILURE)
        }
        Err(e @ SupervisorError::AlreadyRunning { .. }) => {
            tracing::warn!(error = %e, "not starting a second supervisor");
            ExitCode::from(EXIT_ALREADY_RUNNING)
        }
        Err(e) => {
            tracing::error!(error = %e, "supervisor failed");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn run_watchdog(config_path: &Path, config: Config) -> ExitCode {
    let config_path = config::absolute(config_path);
    let launcher = match DetachedLauncher::supervisor(&config_path, &config.pipeline.workdir) {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, "cannot locate own executable");
            return ExitCode::from(EXIT_FAILURE);
        }
    };
    let watchdog = match Watchdog::new(&config, ProcFs::new(), launcher) {
        Ok(w) => w,
        Err(e) => {
            tracing::error!(error = %e, "invalid watchdog setup");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    // The check blocks on a file lock and polls; keep it off the runtime threads.
    let result = match tokio::task::spawn_blocking(move || watchdog.check()).await {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(error = %e, "watchdog task panicked");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    match result {
        Ok(WatchdogOutcome::Running { pid }) => {
            tracing::info!(pid = ?pid, "pipeline running");
            ExitCode::SUCCESS
        }
        Ok(WatchdogOutcome::Restarted { pid }) => {
            tracing::info!(pid, "pipeline supervisor restarted");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "watchdog check failed");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

fn run_status(config: &Config) -> ExitCode {
    let status_file = status::StatusFile::new(config.resolve(&config.supervisor.status_file));
    let status = status_file.read();
    if let Err(e) = &status {
        if !matches!(e, status::StatusError::Read { .. }) {
            tracing::warn!(error = %e, "unreadable status file");
        }
    }
    println!(
        "{}",
        render_supervisor(status_file.path(), &status, status::pid_alive)
    );

    match progress::collect(config) {
        Ok(report) => {
            println!("{report}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to read pipeline progress");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

/// Supervisor section of `pipewarden status`, ending with a blank line.
fn render_supervisor(
    path: &Path,
    status: &Result<status::StatusData, status::StatusError>,
    pid_alive: impl Fn(u32) -> bool,
) -> String {
    let mut lines = vec!["Supervisor".to_string()];
    match status {
        Ok(data) => {
            let liveness = if data.state.is_terminal() {
                "exited"
            } else if pid_alive(data.pid) {
                "alive"
            } else {
                "not running (stale status)"
            };
            lines.push(format!("  state:       {:?} ({liveness})", data.state));
            lines.push(format!("  pid:         {}", data.pid));
            lines.push(match data.max_attempts {
                Some(max) => format!("  attempt:     {} of {max}", data.attempt),
                None => format!("  attempt:     {}", data.attempt),
            });
            if let Some(code) = data.last_exit_code {
                lines.push(format!("  last exit:   {code}"));
            }
            if let Some(at) = data.next_retry_at {
                lines.push(format!(
                    "  next retry:  {}",
                    at.format("%Y-%m-%d %H:%M:%S UTC")
                ));
            }
            lines.push(format!("  run log:     {}", data.run_log));
            lines.push(format!(
                "  started:     {}",
                data.started_at.format("%Y-%m-%d %H:%M:%S UTC")
            ));
            lines.push(format!(
                "  updated:     {}",
                data.last_update.format("%Y-%m-%d %H:%M:%S UTC")
            ));
        }
        Err(status::StatusError::Read { .. }) => {
            lines.push(format!("  no status file at {}", path.display()));
        }
        Err(e) => {
            lines.push(format!("  unreadable status file: {e}"));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

fn print_resolved(config_path: &Path, config: &Config) {
    println!("{}", render_resolved(config_path, config));
}

/// Settings summary printed by `--dry-run`.
fn render_resolved(config_path: &Path, config: &Config) -> String {
    let pattern = match config.pipeline.match_regex() {
        Ok(re) => re.to_string(),
        Err(e) => e.to_string(),
    };
    let attempts = match config.retry.max_attempts {
        0 => "unlimited".to_string(),
        n => n.to_string(),
    };
    [
        format!("pipewarden v{}", env!("CARGO_PKG_VERSION")),
        format!("Config file:   {}", config_path.display()),
        format!("Pipeline:      {}", config.pipeline.command_line()),
        format!("Workdir:       {}", config.pipeline.workdir.display()),
        format!("Match pattern: {pattern}"),
        format!(
            "Run logs:      {}/{}-<timestamp>.log",
            config.resolve(&config.supervisor.log_dir).display(),
            config.supervisor.log_prefix
        ),
        format!(
            "Retry:         {}s initial, x{} per failure, {}s max, attempts {attempts}",
            config.retry.initial_delay_secs, config.retry.factor, config.retry.max_delay_secs
        ),
        format!(
            "Restart log:   {}",
            config.resolve(&config.watchdog.restart_log).display()
        ),
        "Dry run mode: config validated, not running.".to_string(),
    ]
    .join("\n")
}
