//! Configuration module
//!
//! Section/entry store persisted as TOML, plus the typed settings the
//! builder and sessions read from it.

mod settings;
mod store;

pub use settings::{GlobalSettings, LoggingSettings, SessionSettings, LOGGER_SECTION, SESSION_SECTION};
pub use store::{ConfigError, ConfigStore};

use directories::ProjectDirs;
use std::path::PathBuf;

/// Name of the configuration file inside [`config_dir`]
pub const CONFIG_FILE_NAME: &str = "config.toml";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "labwire", "Labwire")
}

/// Get the application configuration directory
pub fn config_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the application data directory
pub fn data_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.data_dir().to_path_buf())
}

/// Get the default log directory
pub fn log_dir() -> Option<PathBuf> {
    data_dir().map(|d| d.join("logs"))
}

/// Get the default configuration file path
pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join(CONFIG_FILE_NAME))
}

/// Create the configuration and data directories
pub fn init_directories() -> std::io::Result<()> {
    if let Some(dir) = config_dir() {
        std::fs::create_dir_all(&dir)?;
    }
    if let Some(dir) = log_dir() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(())
}
