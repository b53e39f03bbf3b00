use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Registration strategy, each backed by a configuration file shipped with the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStrategy {
    #[default]
    Rigid,
    Affine,
    RigidThenAffine,
}

impl RegistrationStrategy {
    pub const ALL: [RegistrationStrategy; 3] = [
        RegistrationStrategy::Rigid,
        RegistrationStrategy::Affine,
        RegistrationStrategy::RigidThenAffine,
    ];

    /// File name of the engine configuration for this strategy.
    pub fn config_file_name(self) -> &'static str {
        match self {
            RegistrationStrategy::Rigid => "Rigid.json",
            RegistrationStrategy::Affine => "Affine.json",
            RegistrationStrategy::RigidThenAffine => "Rigid+Affine.json",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            RegistrationStrategy::Rigid => "Rigid",
            RegistrationStrategy::Affine => "Affine",
            RegistrationStrategy::RigidThenAffine => "Rigid + Affine",
        }
    }
}

impl fmt::Display for RegistrationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for RegistrationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace([' ', '-', '_'], "").as_str() {
            "rigid" => Ok(RegistrationStrategy::Rigid),
            "affine" => Ok(RegistrationStrategy::Affine),
            "rigid+affine" | "rigidthenaffine" => Ok(RegistrationStrategy::RigidThenAffine),
            _ => Err(format!("Unknown registration strategy '{}'", s)),
        }
    }
}

/// Initial alignment performed by the engine when no initial transform is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitMode {
    None,
    #[default]
    Geometry,
    Moments,
}

impl InitMode {
    pub fn as_str(self) -> &'static str {
        match self {
            InitMode::None => "none",
            InitMode::Geometry => "geometry",
            InitMode::Moments => "moments",
        }
    }
}

impl FromStr for InitMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(InitMode::None),
            "geometry" => Ok(InitMode::Geometry),
            "moments" => Ok(InitMode::Moments),
            _ => Err(format!("Unknown init mode '{}'", s)),
        }
    }
}

/// Which engine configuration file a run uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSelection {
    Strategy(RegistrationStrategy),
    File(PathBuf),
}

impl Default for ConfigSelection {
    fn default() -> Self {
        ConfigSelection::Strategy(RegistrationStrategy::default())
    }
}

impl ConfigSelection {
    /// Resolve to an existing file; `None` when nothing usable is found.
    pub fn resolve(&self, config_directory: &Path) -> Option<PathBuf> {
        let candidate = match self {
            ConfigSelection::Strategy(strategy) => config_directory.join(strategy.config_file_name()),
            ConfigSelection::File(path) => path.clone(),
        };
        candidate.is_file().then_some(candidate)
    }
}

impl From<RegistrationStrategy> for ConfigSelection {
    fn from(strategy: RegistrationStrategy) -> Self {
        ConfigSelection::Strategy(strategy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_strategy_file_names() {
        assert_eq!(RegistrationStrategy::Rigid.config_file_name(), "Rigid.json");
        assert_eq!(RegistrationStrategy::RigidThenAffine.config_file_name(), "Rigid+Affine.json");
    }

    #[test]
    fn test_parse_strategy_and_init_mode() {
        assert_eq!("rigid+affine".parse(), Ok(RegistrationStrategy::RigidThenAffine));
        assert_eq!("Rigid Then Affine".parse(), Ok(RegistrationStrategy::RigidThenAffine));
        assert_eq!("AFFINE".parse(), Ok(RegistrationStrategy::Affine));
        assert!("bspline".parse::<RegistrationStrategy>().is_err());
        assert_eq!("moments".parse(), Ok(InitMode::Moments));
    }

    #[test]
    fn test_resolve_selection() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("Affine.json"), "{}").unwrap();

        let affine = ConfigSelection::from(RegistrationStrategy::Affine);
        assert_eq!(affine.resolve(dir.path()), Some(dir.path().join("Affine.json")));
        assert!(ConfigSelection::from(RegistrationStrategy::Rigid).resolve(dir.path()).is_none());

        let custom = ConfigSelection::File(dir.path().join("Affine.json"));
        assert!(custom.resolve(Path::new("/nonexistent")).is_some());
    }
}
