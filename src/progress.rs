/// Pipeline progress report for `pipewarden status`.
///
/// Reads the artifacts the supervised pipeline leaves in its working
/// directory: the episode metadata list, the progress JSON it checkpoints
/// after each transcription/tagging step, and the per-episode output files.
/// Anything missing counts as zero; the pipeline may simply not have got
/// that far yet.
use crate::config::Config;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Deserialize)]
struct PipelineProgress {
    #[serde(default)]
    transcribed: Vec<String>,
    #[serde(default)]
    tagged: Vec<String>,
    #[serde(default)]
    started_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EpisodeMeta {
    #[serde(default)]
    local_file: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressReport {
    pub episodes_listed: usize,
    pub episodes_downloaded: usize,
    pub audio_files: usize,
    pub transcribed: usize,
    pub tagged: usize,
    pub transcript_files: usize,
    pub tag_files: usize,
    pub started_at: Option<String>,
}

pub fn collect(config: &Config) -> Result<ProgressReport, ProgressError> {
    let paths = &config.progress;
    let mut report = ProgressReport::default();

    if let Some(episodes) =
        read_json::<Vec<EpisodeMeta>>(&config.resolve(&paths.metadata_file))?
    {
        report.episodes_listed = episodes.len();
        report.episodes_downloaded = episodes
            .iter()
            .filter_map(|ep| ep.local_file.as_deref())
            .filter(|f| config.resolve(Path::new(f)).exists())
            .count();
    }

    if let Some(progress) = read_json::<PipelineProgress>(&config.resolve(&paths.progress_file))? {
        report.transcribed = progress.transcribed.len();
        report.tagged = progress.tagged.len();
        report.started_at = progress.started_at;
    }

    report.audio_files = count_files(&config.resolve(&paths.episodes_dir), "mp3")?;
    report.transcript_files = count_files(&config.resolve(&paths.transcripts_dir), "txt")?;
    report.tag_files = count_files(&config.resolve(&paths.tags_dir), "json")?;

    Ok(report)
}

impl std::fmt::Display for ProgressReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Pipeline progress")?;
        writeln!(
            f,
            "  episodes:    {} listed, {} downloaded, {} audio files",
            self.episodes_listed, self.episodes_downloaded, self.audio_files
        )?;
        writeln!(
            f,
            "  transcribed: {} ({} transcripts on disk)",
            self.transcribed, self.transcript_files
        )?;
        write!(
            f,
            "  tagged:      {} ({} tag files on disk)",
            self.tagged, self.tag_files
        )?;
        if let Some(started) = &self.started_at {
            write!(f, "\n  started at:  {started}")?;
        }
        Ok(())
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, ProgressError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(ProgressError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|e| ProgressError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
}

fn count_files(dir: &Path, extension: &str) -> Result<usize, ProgressError> {
    let escaped = glob::Pattern::escape(&dir.to_string_lossy());
    let pattern = format!("{escaped}/*.{extension}");
    let paths = glob::glob(&pattern).map_err(|e| ProgressError::Pattern {
        pattern: pattern.clone(),
        source: e,
    })?;
    Ok(paths.filter_map(Result::ok).filter(|p| p.is_file()).count())
}

#[derive(Debug)]
pub enum ProgressError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    Pattern {
        pattern: String,
        source: glob::PatternError,
    },
}

impl std::fmt::Display for ProgressError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgressError::Read { path, source } => {
                write!(f, "failed to read {}: {source}", path.display())
            }
            ProgressError::Parse { path, source } => {
                write!(f, "failed to parse {}: {source}", path.display())
            }
            ProgressError::Pattern { pattern, source } => {
                write!(f, "bad glob pattern '{pattern}': {source}")
            }
        }
    }
}

impl std::error::Error for ProgressError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProgressError::Read { source, .. } => Some(source),
            ProgressError::Parse { source, .. } => Some(source),
            ProgressError::Pattern { source, .. } => Some(source),
        }
    }
}
