use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod strategy;

pub use strategy::{ConfigSelection, InitMode, RegistrationStrategy};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub registration: RegistrationDefaults,
    pub artifacts: ArtifactConfig,
    pub evaluation: EvaluationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Explicit path to the engine; skips discovery when set.
    pub executable: Option<PathBuf>,
    pub executable_name: String,
    pub search_paths: Vec<PathBuf>,
    /// Directory holding the per-strategy engine configuration files.
    pub config_directory: PathBuf,
    /// Parent of per-run working directories (system temp dir when unset).
    pub work_root: Option<PathBuf>,
    pub poll_interval_ms: u64,
    pub stop_grace_period_ms: u64,
    /// Pass `--initialization <mode>` to engines that understand it.
    pub forward_init_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationDefaults {
    pub strategy: RegistrationStrategy,
    /// Fraction of voxels the engine samples, in (0, 1].
    pub sampling_percentage: f64,
    pub init_mode: InitMode,
}

/// What to do when several unmarked transform artifacts remain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguityPolicy {
    /// Take the first candidate in file-name order.
    #[default]
    FirstByName,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    pub extensions: Vec<String>,
    pub result_marker: String,
    /// File stem of the exported initial transform, never a result candidate.
    pub initial_transform_name: String,
    pub ambiguity: AmbiguityPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    pub poll_interval_ms: u64,
    pub histogram_bins: usize,
    /// Fraction of fixed voxels used by the MI metric, in (0, 1].
    pub sampling_percentage: f64,
    pub random_seed: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            executable: None,
            executable_name: "MIRegistration".to_string(),
            search_paths: Vec::new(),
            config_directory: PathBuf::from("config"),
            work_root: None,
            poll_interval_ms: 100,
            stop_grace_period_ms: 5000,
            forward_init_mode: false,
        }
    }
}

impl Default for RegistrationDefaults {
    fn default() -> Self {
        Self {
            strategy: RegistrationStrategy::Rigid,
            sampling_percentage: 0.10,
            init_mode: InitMode::Geometry,
        }
    }
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            extensions: ["h5", "tfm", "txt", "mat"].iter().map(|e| e.to_string()).collect(),
            result_marker: "registration_transform".to_string(),
            initial_transform_name: "initial_transform".to_string(),
            ambiguity: AmbiguityPolicy::FirstByName,
        }
    }
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            histogram_bins: 32,
            sampling_percentage: 1.0,
            random_seed: 121212,
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_millis(self.stop_grace_period_ms)
    }

    /// Locate the engine: explicit path, then search paths, then `PATH`.
    pub fn resolve_executable(&self) -> Option<PathBuf> {
        if let Some(ref explicit) = self.executable {
            return explicit.is_file().then(|| explicit.clone());
        }

        let path_dirs = env::var_os("PATH")
            .map(|p| env::split_paths(&p).collect::<Vec<_>>())
            .unwrap_or_default();

        self.search_paths
            .iter()
            .chain(path_dirs.iter())
            .find_map(|dir| self.executable_in(dir))
    }

    fn executable_in(&self, dir: &Path) -> Option<PathBuf> {
        let candidate = dir.join(&self.executable_name);
        if candidate.is_file() {
            return Some(candidate);
        }
        if cfg!(windows) {
            let exe = dir.join(format!("{}.exe", self.executable_name));
            if exe.is_file() {
                return Some(exe);
            }
        }
        None
    }
}

impl EvaluationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let content = fs::read_to_string(path)?;

        if content.trim_start().starts_with('{') {
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(toml::from_str(&content)?)
        }
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P, format: ConfigFormat) -> crate::Result<()> {
        let content = match format {
            ConfigFormat::Json => serde_json::to_string_pretty(self)?,
            ConfigFormat::Toml => toml::to_string_pretty(self)?,
        };

        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.engine.executable_name.trim().is_empty() {
            errors.push("Engine executable_name must not be empty".to_string());
        }

        if self.engine.poll_interval_ms == 0 {
            errors.push("Engine poll_interval_ms must be positive".to_string());
        }

        let sampling = self.registration.sampling_percentage;
        if !(sampling > 0.0 && sampling <= 1.0) {
            errors.push(format!("Registration sampling_percentage must be in (0, 1], got {}", sampling));
        }

        if self.artifacts.extensions.is_empty() {
            errors.push("At least one artifact extension is required".to_string());
        }

        if self.artifacts.result_marker.is_empty() {
            errors.push("Artifact result_marker must not be empty".to_string());
        }

        if self.evaluation.histogram_bins < 2 {
            errors.push("Evaluation histogram_bins must be at least 2".to_string());
        }

        let mi_sampling = self.evaluation.sampling_percentage;
        if !(mi_sampling > 0.0 && mi_sampling <= 1.0) {
            errors.push(format!("Evaluation sampling_percentage must be in (0, 1], got {}", mi_sampling));
        }

        if self.evaluation.poll_interval_ms == 0 {
            errors.push("Evaluation poll_interval_ms must be positive".to_string());
        }

        if let Err(e) = self.logging.validate() {
            errors.push(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Clone)]
pub enum ConfigFormat {
    Json,
    Toml,
}

impl ConfigFormat {
    /// Pick the format from a file extension, TOML unless it is `.json`.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ConfigFormat::Json,
            _ => ConfigFormat::Toml,
        }
    }
}

pub fn load_config_or_default(config_path: Option<&Path>) -> Config {
    match config_path {
        Some(path) => match Config::load_from_file(path) {
            Ok(config) => {
                if let Err(errors) = config.validate() {
                    for error in errors {
                        tracing::warn!(path = %path.display(), "Configuration problem: {}", error);
                    }
                    tracing::warn!("Using default configuration instead");
                    Config::default()
                } else {
                    config
                }
            }
            Err(e) => {
                tracing::warn!("Failed to load config from '{}': {:#}", path.display(), e);
                tracing::warn!("Using default configuration");
                Config::default()
            }
        },
        None => Config::default(),
    }
}
