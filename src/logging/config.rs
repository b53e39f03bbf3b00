//! Logging configuration
//!
//! Per-component log levels and output destinations for the registration
//! coordinator.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Global log level (trace, debug, info, warn, error)
    pub global_level: String,

    /// Enable console output
    pub console_output: bool,

    /// Directory for JSON log files (None = no file logging)
    pub log_directory: Option<PathBuf>,

    /// Include file location in logs
    pub include_file_location: bool,

    /// Level for the engine output stream (`image_registration::engine`)
    pub engine_level: String,

    /// Level for the registration state machine and process supervision
    pub orchestration_level: String,

    /// Level for TRE / MI evaluation
    pub evaluation_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            global_level: "info".to_string(),
            console_output: true,
            log_directory: None,
            include_file_location: false,
            engine_level: "info".to_string(),
            orchestration_level: "info".to_string(),
            evaluation_level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Verbose logging, engine output included line by line
    pub fn development() -> Self {
        Self {
            global_level: "debug".to_string(),
            console_output: true,
            log_directory: Some(PathBuf::from("logs")),
            include_file_location: true,
            engine_level: "trace".to_string(),
            orchestration_level: "debug".to_string(),
            evaluation_level: "debug".to_string(),
        }
    }

    pub fn production() -> Self {
        Self {
            global_level: "warn".to_string(),
            console_output: false,
            log_directory: Some(PathBuf::from("/var/log/image-registration")),
            include_file_location: false,
            engine_level: "info".to_string(),
            orchestration_level: "info".to_string(),
            evaluation_level: "warn".to_string(),
        }
    }

    /// Validate the configuration and provide helpful error messages
    pub fn validate(&self) -> Result<(), String> {
        let levels = [
            ("global_level", &self.global_level),
            ("engine_level", &self.engine_level),
            ("orchestration_level", &self.orchestration_level),
            ("evaluation_level", &self.evaluation_level),
        ];
        for (field, level) in levels {
            if !VALID_LEVELS.contains(&level.as_str()) {
                return Err(format!(
                    "Invalid {}: {}. Must be one of: {:?}",
                    field, level, VALID_LEVELS
                ));
            }
        }

        if let Some(ref log_dir) = self.log_directory {
            if let Some(parent) = log_dir.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    return Err(format!("Log directory parent does not exist: {:?}", parent));
                }
            }
        }

        Ok(())
    }

    /// Get the effective log level for a specific component
    pub fn get_component_level(&self, component: &str) -> &str {
        match component {
            "engine" => &self.engine_level,
            "orchestration" | "registration" | "process" => &self.orchestration_level,
            "evaluation" | "analysis" => &self.evaluation_level,
            _ => &self.global_level,
        }
    }
}
