use clap::Parser;
use facegallery_core::{AdmissionConfig, AdmissionMode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("unknown mode {0:?} (expected run, run-save, train, update or delete)")]
    UnknownMode(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// What the daemon does after startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    /// Recognize and annotate; the gallery is read-only.
    #[default]
    Run,
    /// Recognize, enroll strangers and augment known persons.
    RunSave,
    /// Enroll the labeled training tree, then exit.
    Train,
    /// Recalibrate thresholds, then exit.
    Update,
    /// Clear the gallery, then exit.
    Delete,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Run => "run",
            RunMode::RunSave => "run-save",
            RunMode::Train => "train",
            RunMode::Update => "update",
            RunMode::Delete => "delete",
        }
    }

    /// Admission mode of the frame callback, for the streaming modes.
    pub fn admission(&self) -> Option<AdmissionMode> {
        match self {
            RunMode::Run => Some(AdmissionMode::Inference),
            RunMode::RunSave => Some(AdmissionMode::Enroll),
            _ => None,
        }
    }
}

impl FromStr for RunMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "run" => Ok(RunMode::Run),
            "run-save" => Ok(RunMode::RunSave),
            "train" => Ok(RunMode::Train),
            "update" => Ok(RunMode::Update),
            "delete" => Ok(RunMode::Delete),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

/// Command-line flags. Every flag overrides the file and the environment.
#[derive(Parser, Debug, Default)]
#[command(name = "facegalleryd", version, about = "Face gallery daemon")]
pub struct Args {
    /// run, run-save, train, update or delete
    #[arg(long)]
    pub mode: Option<String>,

    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Root for database/, faces/ and train/
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Detection feed socket
    #[arg(long)]
    pub socket: Option<PathBuf>,

    /// Labeled training tree (one subdirectory per person)
    #[arg(long)]
    pub train_dir: Option<PathBuf>,

    /// Image writer threads
    #[arg(long)]
    pub max_workers: Option<usize>,

    /// Do not register the D-Bus review service
    #[arg(long)]
    pub no_dbus: bool,
}

/// Daemon configuration: defaults, then the TOML file, then `FACEGALLERY_*`
/// environment variables, then command-line flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mode: RunMode,
    pub data_dir: PathBuf,
    /// Defaults to `<data_dir>/database`.
    pub database_dir: Option<PathBuf>,
    /// Defaults to `<data_dir>/faces`.
    pub samples_dir: Option<PathBuf>,
    /// Defaults to `<data_dir>/train`.
    pub train_dir: Option<PathBuf>,
    /// Copied into an empty `train_dir` before training.
    pub bundled_train_dir: Option<PathBuf>,
    pub socket_path: PathBuf,
    /// Register `org.facegallery.Gallery1` on the session bus.
    pub dbus_enabled: bool,
    /// Upstream analyzer used by training. `{image}` and `{repeat}` are
    /// substituted; arguments are split on whitespace.
    pub analyzer_command: Option<String>,
    pub analyzer_repeat: u32,
    pub max_workers: usize,
    pub queue_capacity: usize,
    pub shutdown_timeout_secs: u64,
    pub train_frame_timeout_secs: u64,
    /// Frames a track must be observed before its first decision.
    pub warmup_frames: u64,
    /// Tracks unseen for this many frames are forgotten.
    pub track_idle_frames: u64,
    pub admission: AdmissionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: RunMode::Run,
            data_dir: default_data_dir(),
            database_dir: None,
            samples_dir: None,
            train_dir: None,
            bundled_train_dir: None,
            socket_path: default_socket_path(),
            dbus_enabled: true,
            analyzer_command: None,
            analyzer_repeat: 30,
            max_workers: 1,
            queue_capacity: 64,
            shutdown_timeout_secs: 2,
            train_frame_timeout_secs: 2,
            warmup_frames: 0,
            track_idle_frames: 300,
            admission: AdmissionConfig::default(),
        }
    }
}

impl Config {
    /// Build the effective configuration for this process.
    pub fn load(args: &Args) -> Result<Self, ConfigError> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.apply_args(args)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `FACEGALLERY_*` overrides. Unparseable numbers keep the
    /// current value; an unknown mode is an error.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(mode) = std::env::var("FACEGALLERY_MODE") {
            self.mode = mode.parse()?;
        }
        if let Some(dir) = env_path("FACEGALLERY_DATA_DIR") {
            self.data_dir = dir;
        }
        if let Some(dir) = env_path("FACEGALLERY_DATABASE_DIR") {
            self.database_dir = Some(dir);
        }
        if let Some(dir) = env_path("FACEGALLERY_SAMPLES_DIR") {
            self.samples_dir = Some(dir);
        }
        if let Some(dir) = env_path("FACEGALLERY_TRAIN_DIR") {
            self.train_dir = Some(dir);
        }
        if let Some(dir) = env_path("FACEGALLERY_BUNDLED_TRAIN_DIR") {
            self.bundled_train_dir = Some(dir);
        }
        if let Some(path) = env_path("FACEGALLERY_SOCKET") {
            self.socket_path = path;
        }
        if let Ok(cmd) = std::env::var("FACEGALLERY_ANALYZER_COMMAND") {
            self.analyzer_command = Some(cmd);
        }
        if let Ok(v) = std::env::var("FACEGALLERY_DBUS_ENABLED") {
            self.dbus_enabled = v != "0";
        }

        self.analyzer_repeat = env_u32("FACEGALLERY_ANALYZER_REPEAT", self.analyzer_repeat);
        self.max_workers = env_usize("FACEGALLERY_MAX_WORKERS", self.max_workers);
        self.queue_capacity = env_usize("FACEGALLERY_QUEUE_CAPACITY", self.queue_capacity);
        self.shutdown_timeout_secs = env_u64("FACEGALLERY_SHUTDOWN_TIMEOUT_SECS", self.shutdown_timeout_secs);
        self.train_frame_timeout_secs =
            env_u64("FACEGALLERY_TRAIN_FRAME_TIMEOUT_SECS", self.train_frame_timeout_secs);
        self.warmup_frames = env_u64("FACEGALLERY_WARMUP_FRAMES", self.warmup_frames);
        self.track_idle_frames = env_u64("FACEGALLERY_TRACK_IDLE_FRAMES", self.track_idle_frames);

        let a = &mut self.admission;
        a.embedding_distance_tolerance =
            env_f32("FACEGALLERY_EMBEDDING_DISTANCE_TOLERANCE", a.embedding_distance_tolerance);
        a.min_face_pixels_tolerance = env_u64("FACEGALLERY_MIN_FACE_PIXELS", a.min_face_pixels_tolerance);
        a.blurriness_tolerance = env_f64("FACEGALLERY_BLURRINESS_TOLERANCE", a.blurriness_tolerance);
        a.max_faces_per_person = env_usize("FACEGALLERY_MAX_FACES_PER_PERSON", a.max_faces_per_person);
        a.last_image_sent_threshold_time =
            env_i64("FACEGALLERY_LAST_IMAGE_SENT_THRESHOLD_TIME", a.last_image_sent_threshold_time);
        a.procrustes_distance_threshold =
            env_f64("FACEGALLERY_PROCRUSTES_DISTANCE_THRESHOLD", a.procrustes_distance_threshold);
        if let Ok(v) = std::env::var("FACEGALLERY_ENFORCE_BLURRINESS") {
            a.enforce_blurriness = v != "0";
        }
        Ok(())
    }

    pub fn apply_args(&mut self, args: &Args) -> Result<(), ConfigError> {
        if let Some(mode) = &args.mode {
            self.mode = mode.parse()?;
        }
        if let Some(dir) = &args.data_dir {
            self.data_dir = dir.clone();
        }
        if let Some(path) = &args.socket {
            self.socket_path = path.clone();
        }
        if let Some(dir) = &args.train_dir {
            self.train_dir = Some(dir.clone());
        }
        if let Some(n) = args.max_workers {
            self.max_workers = n;
        }
        if args.no_dbus {
            self.dbus_enabled = false;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid("max_workers must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be at least 1".into()));
        }
        if self.admission.max_faces_per_person == 0 {
            return Err(ConfigError::Invalid("max_faces_per_person must be at least 1".into()));
        }
        Ok(())
    }

    pub fn database_dir(&self) -> PathBuf {
        self.database_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("database"))
    }

    pub fn samples_dir(&self) -> PathBuf {
        self.samples_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("faces"))
    }

    pub fn train_dir(&self) -> PathBuf {
        self.train_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("train"))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn train_frame_timeout(&self) -> Duration {
        Duration::from_secs(self.train_frame_timeout_secs)
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facegallery")
}

fn default_socket_path() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join("facegallery.sock")
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().filter(|v| !v.is_empty()).map(PathBuf::from)
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("run".parse::<RunMode>().unwrap(), RunMode::Run);
        assert_eq!("run-save".parse::<RunMode>().unwrap(), RunMode::RunSave);
        assert_eq!("delete".parse::<RunMode>().unwrap(), RunMode::Delete);
        assert!(matches!("serve".parse::<RunMode>(), Err(ConfigError::UnknownMode(_))));
        assert_eq!(RunMode::RunSave.admission(), Some(AdmissionMode::Enroll));
        assert_eq!(RunMode::Train.admission(), None);
    }

    #[test]
    fn test_file_then_args() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
mode = "run-save"
data_dir = "/srv/gallery"
max_workers = 3

[admission]
max_faces_per_person = 5
enforce_blurriness = false
"#
        )
        .unwrap();

        let mut config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.mode, RunMode::RunSave);
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.admission.max_faces_per_person, 5);
        assert!(!config.admission.enforce_blurriness);
        assert_eq!(config.admission.blurriness_tolerance, 300.0);
        assert_eq!(config.database_dir(), PathBuf::from("/srv/gallery/database"));
        assert_eq!(config.samples_dir(), PathBuf::from("/srv/gallery/faces"));

        let args = Args {
            mode: Some("train".into()),
            max_workers: Some(2),
            no_dbus: true,
            ..Args::default()
        };
        config.apply_args(&args).unwrap();
        assert_eq!(config.mode, RunMode::Train);
        assert_eq!(config.max_workers, 2);
        assert!(!config.dbus_enabled);
    }

    #[test]
    fn test_unknown_mode_in_file_is_fatal() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"mode = "serve""#).unwrap();
        assert!(matches!(Config::from_file(file.path()), Err(ConfigError::Parse { .. })));

        let args = Args {
            mode: Some("serve".into()),
            ..Args::default()
        };
        assert!(matches!(
            Config::default().apply_args(&args),
            Err(ConfigError::UnknownMode(_))
        ));
    }

    #[test]
    fn test_validate() {
        let config = Config {
            max_workers: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
        assert!(Config::default().validate().is_ok());
    }
}
