use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Upper bound for `retry.max_delay_secs` (one week).
pub const MAX_RETRY_DELAY_SECS: u64 = 7 * 24 * 60 * 60;
/// Upper bound for `watchdog.settle_timeout_secs` (one hour).
pub const MAX_SETTLE_TIMEOUT_SECS: u64 = 60 * 60;

/// Top-level configuration loaded from pipewarden.toml.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub supervisor: SupervisorConfig,
    pub retry: RetryConfig,
    pub watchdog: WatchdogConfig,
    pub progress: ProgressConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Directory the pipeline runs in. Relative paths elsewhere in the
    /// config are resolved against it.
    pub workdir: PathBuf,
    /// Regex matched against process command lines. Defaults to the
    /// escaped `command args...` string.
    pub match_pattern: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub log_dir: PathBuf,
    pub log_prefix: String,
    pub lock_file: PathBuf,
    pub status_file: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_delay_secs: u64,
    pub max_delay_secs: u64,
    pub factor: f64,
    /// 0 means retry forever.
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub restart_log: PathBuf,
    pub lock_file: PathBuf,
    pub settle_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    pub metadata_file: PathBuf,
    pub progress_file: PathBuf,
    pub episodes_dir: PathBuf,
    pub transcripts_dir: PathBuf,
    pub tags_dir: PathBuf,
}

// --- Default implementations ---

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            command: "python3".to_string(),
            args: vec!["pipeline.py".to_string()],
            workdir: PathBuf::from("."),
            match_pattern: None,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            log_prefix: "pipeline".to_string(),
            lock_file: PathBuf::from(".pipewarden/supervisor.lock"),
            status_file: PathBuf::from(".pipewarden/status.json"),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: 10,
            max_delay_secs: 600,
            factor: 1.0,
            max_attempts: 0,
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            restart_log: PathBuf::from("restart.log"),
            lock_file: PathBuf::from(".pipewarden/watchdog.lock"),
            settle_timeout_secs: 5,
            poll_interval_ms: 200,
        }
    }
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            metadata_file: PathBuf::from("episodes_metadata.json"),
            progress_file: PathBuf::from("pipeline_progress.json"),
            episodes_dir: PathBuf::from("episodes"),
            transcripts_dir: PathBuf::from("transcripts"),
            tags_dir: PathBuf::from("tags"),
        }
    }
}

impl Config {
    /// Load config from `path`, falling back to defaults when the file is absent.
    ///
    /// A relative `pipeline.workdir` is anchored at the config file's directory
    /// (or the current directory when there is no file), so a detached
    /// supervisor sees the same paths as the watchdog that launched it.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let (mut config, base) = if path.exists() {
            let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })?;
            let config: Config = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                source: e,
            })?;
            let base = match path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
                _ => PathBuf::from("."),
            };
            (config, base)
        } else {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            (Config::default(), PathBuf::from("."))
        };

        if config.pipeline.workdir.is_relative() {
            let base = absolute(&base);
            config.pipeline.workdir = base.join(&config.pipeline.workdir);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.command.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "pipeline.command must not be empty".to_string(),
            ));
        }
        if self.retry.factor.is_nan() || self.retry.factor < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "retry.factor must be >= 1.0, got {}",
                self.retry.factor
            )));
        }
        if self.retry.max_delay_secs < self.retry.initial_delay_secs {
            return Err(ConfigError::Invalid(format!(
                "retry.max_delay_secs ({}) is below retry.initial_delay_secs ({})",
                self.retry.max_delay_secs, self.retry.initial_delay_secs
            )));
        }
        if self.retry.max_delay_secs > MAX_RETRY_DELAY_SECS {
            return Err(ConfigError::Invalid(format!(
                "retry.max_delay_secs must be at most {MAX_RETRY_DELAY_SECS}, got {}",
                self.retry.max_delay_secs
            )));
        }
        if self.watchdog.settle_timeout_secs > MAX_SETTLE_TIMEOUT_SECS {
            return Err(ConfigError::Invalid(format!(
                "watchdog.settle_timeout_secs must be at most {MAX_SETTLE_TIMEOUT_SECS}, got {}",
                self.watchdog.settle_timeout_secs
            )));
        }
        self.pipeline.match_regex()?;
        Ok(())
    }

    /// Resolve a configured path against the pipeline working directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.pipeline.workdir.join(path)
        }
    }
}

impl PipelineConfig {
    /// The full invocation as it appears in a process table.
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Compile the pattern used to find the pipeline in the process table.
    pub fn match_regex(&self) -> Result<Regex, ConfigError> {
        let pattern = match &self.match_pattern {
            Some(p) => p.clone(),
            None => regex::escape(&self.command_line()),
        };
        Regex::new(&pattern).map_err(|e| ConfigError::Pattern {
            pattern,
            source: e,
        })
    }
}

/// Anchor a relative path at the current directory.
pub(crate) fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}

/// Errors from loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Pattern {
        pattern: String,
        source: regex::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
            ConfigError::Pattern { pattern, source } => {
                write!(f, "invalid match pattern '{pattern}': {source}")
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Pattern { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_match_shell_scripts() {
        let config = Config::default();
        assert_eq!(config.pipeline.command_line(), "python3 pipeline.py");
        assert_eq!(config.retry.initial_delay_secs, 10);
        assert_eq!(config.retry.factor, 1.0);
        assert_eq!(config.retry.max_attempts, 0);
        assert_eq!(config.supervisor.log_dir, PathBuf::from("logs"));
        assert_eq!(config.watchdog.restart_log, PathBuf::from("restart.log"));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.pipeline.command, "python3");
        assert!(config.pipeline.workdir.is_absolute());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipewarden.toml");
        std::fs::write(
            &path,
            "[pipeline]\ncommand = \"./run.sh\"\nargs = []\n\n[retry]\nmax_attempts = 3\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.pipeline.command, "./run.sh");
        assert!(config.pipeline.args.is_empty());
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_delay_secs, 10);
        assert_eq!(config.supervisor.log_prefix, "pipeline");
    }

    #[test]
    fn test_relative_workdir_anchored_at_config_dir() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipewarden.toml");
        std::fs::write(&path, "[pipeline]\nworkdir = \"podcast\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.pipeline.workdir, dir.path().join("podcast"));
        assert_eq!(
            config.resolve(Path::new("logs")),
            dir.path().join("podcast/logs")
        );
        assert_eq!(
            config.resolve(Path::new("/var/log/x.log")),
            PathBuf::from("/var/log/x.log")
        );
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipewarden.toml");
        std::fs::write(&path, "[retry\nmax_attempts = ").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("failed to parse config"));
    }

    #[test]
    fn test_factor_below_one_rejected() {
        let mut config = Config::default();
        config.retry.factor = 0.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("retry.factor"));
    }

    #[test]
    fn test_max_delay_below_initial_rejected() {
        let mut config = Config::default();
        config.retry.initial_delay_secs = 30;
        config.retry.max_delay_secs = 10;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_oversized_delays_rejected() {
        let mut config = Config::default();
        config.retry.initial_delay_secs = u64::MAX;
        config.retry.max_delay_secs = u64::MAX;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("retry.max_delay_secs"));

        let mut config = Config::default();
        config.retry.max_delay_secs = MAX_RETRY_DELAY_SECS;
        assert!(config.validate().is_ok());

        let mut config = Config::default();
        config.watchdog.settle_timeout_secs = u64::MAX;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("watchdog.settle_timeout_secs"));
    }

    #[test]
    fn test_absolute_anchors_relative_paths() {
        assert_eq!(absolute(Path::new("/a/b")), PathBuf::from("/a/b"));
        let rel = absolute(Path::new("rel.toml"));
        assert!(rel.is_absolute());
        assert!(rel.ends_with("rel.toml"));
    }

    #[test]
    fn test_empty_command_rejected() {
        let mut config = Config::default();
        config.pipeline.command = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_match_regex_is_escaped_command_line() {
        let config = PipelineConfig::default();
        let re = config.match_regex().unwrap();
        assert!(re.is_match("/usr/bin/python3 pipeline.py"));
        assert!(!re.is_match("python3 pipelineXpy"));
        assert!(!re.is_match("pipewarden watchdog"));
    }

    #[test]
    fn test_custom_match_pattern() {
        let config = PipelineConfig {
            match_pattern: Some(r"pipeline\.py$".to_string()),
            ..Default::default()
        };
        let re = config.match_regex().unwrap();
        assert!(re.is_match("python3 -u pipeline.py"));
    }

    #[test]
    fn test_invalid_match_pattern() {
        let config = PipelineConfig {
            match_pattern: Some("(unclosed".to_string()),
            ..Default::default()
        };
        let err = config.match_regex().unwrap_err();
        assert!(matches!(err, ConfigError::Pattern { .. }));
    }
}
