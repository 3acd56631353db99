//! Typed view of the global settings the core consumes

use super::store::{ConfigError, ConfigStore};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Section holding logging settings
pub const LOGGER_SECTION: &str = "Logger";

/// Section holding session timing defaults
pub const SESSION_SECTION: &str = "Session";

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Default level (`trace`, `debug`, `info`, `warn`, `error`)
    pub level: String,
    /// Directory for rolling log files; stderr only when unset
    pub directory: Option<PathBuf>,
    /// Number of rolled files to keep
    pub max_files: usize,
    /// Log file name prefix
    pub file_prefix: String,
    /// Write JSON lines to the log file
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
            max_files: 5,
            file_prefix: "labwire".to_string(),
            json: false,
        }
    }
}

/// Timing defaults for threaded sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Per-cycle read budget in milliseconds
    pub read_timeout_ms: u64,
    /// Pause between cycles in milliseconds
    pub cycle_sleep_ms: u64,
    /// Bound on waiting for a stopped worker in milliseconds
    pub teardown_timeout_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            read_timeout_ms: 100,
            cycle_sleep_ms: 10,
            teardown_timeout_ms: 2000,
        }
    }
}

impl SessionSettings {
    /// Per-cycle read budget
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Pause between cycles
    pub fn cycle_sleep(&self) -> Duration {
        Duration::from_millis(self.cycle_sleep_ms)
    }

    /// Teardown bound
    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }
}

/// Settings read from the configuration store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalSettings {
    /// Logging
    pub logging: LoggingSettings,
    /// Session timing
    pub session: SessionSettings,
}

impl GlobalSettings {
    /// Read settings, falling back to defaults for missing entries
    pub fn from_store(store: &ConfigStore) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let logging = LoggingSettings {
            level: store
                .find_as(LOGGER_SECTION, "level")?
                .unwrap_or(defaults.logging.level),
            directory: store
                .find_as::<String>(LOGGER_SECTION, "directory")?
                .filter(|dir| !dir.is_empty())
                .map(PathBuf::from),
            max_files: store
                .find_as(LOGGER_SECTION, "max_files")?
                .unwrap_or(defaults.logging.max_files),
            file_prefix: store
                .find_as(LOGGER_SECTION, "file_prefix")?
                .unwrap_or(defaults.logging.file_prefix),
            json: store
                .find_as(LOGGER_SECTION, "json")?
                .unwrap_or(defaults.logging.json),
        };

        let session = SessionSettings {
            read_timeout_ms: store
                .find_as(SESSION_SECTION, "read_timeout_ms")?
                .unwrap_or(defaults.session.read_timeout_ms),
            cycle_sleep_ms: store
                .find_as(SESSION_SECTION, "cycle_sleep_ms")?
                .unwrap_or(defaults.session.cycle_sleep_ms),
            teardown_timeout_ms: store
                .find_as(SESSION_SECTION, "teardown_timeout_ms")?
                .unwrap_or(defaults.session.teardown_timeout_ms),
        };

        Ok(Self { logging, session })
    }

    /// Write every setting missing from `store`. Returns the number of entries added.
    pub fn apply_defaults(&self, store: &mut ConfigStore) -> Result<usize, ConfigError> {
        let directory = self
            .logging
            .directory
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_default();

        let entries: [(&str, &str, toml::Value); 8] = [
            (LOGGER_SECTION, "level", self.logging.level.clone().into()),
            (LOGGER_SECTION, "directory", directory.into()),
            (LOGGER_SECTION, "max_files", to_integer(self.logging.max_files as u64)),
            (LOGGER_SECTION, "file_prefix", self.logging.file_prefix.clone().into()),
            (LOGGER_SECTION, "json", self.logging.json.into()),
            (SESSION_SECTION, "read_timeout_ms", to_integer(self.session.read_timeout_ms)),
            (SESSION_SECTION, "cycle_sleep_ms", to_integer(self.session.cycle_sleep_ms)),
            (
                SESSION_SECTION,
                "teardown_timeout_ms",
                to_integer(self.session.teardown_timeout_ms),
            ),
        ];

        let mut added = 0;
        for (section, key, value) in entries {
            if !store.has_section(section) {
                store.add_section(section, None)?;
            }
            if store.get_entry(section, key).is_err() {
                store.add_entry(section, key, value)?;
                added += 1;
            }
        }
        Ok(added)
    }
}

fn to_integer(value: u64) -> toml::Value {
    toml::Value::Integer(i64::try_from(value).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_store_empty() {
        let settings = GlobalSettings::from_store(&ConfigStore::new()).unwrap();
        assert_eq!(settings, GlobalSettings::default());
        assert_eq!(settings.session.read_timeout(), Duration::from_millis(100));
    }

    #[test]
    fn test_values_read_from_store() {
        let store = ConfigStore::from_toml_str(
            "[Logger]\nlevel = \"debug\"\ndirectory = \"/tmp/labwire-logs\"\nmax_files = 2\n\n[Session]\ncycle_sleep_ms = 1\n",
        )
        .unwrap();
        let settings = GlobalSettings::from_store(&store).unwrap();
        assert_eq!(settings.logging.level, "debug");
        assert_eq!(settings.logging.directory, Some(PathBuf::from("/tmp/labwire-logs")));
        assert_eq!(settings.logging.max_files, 2);
        assert_eq!(settings.session.cycle_sleep_ms, 1);
        assert_eq!(settings.session.read_timeout_ms, 100);
    }

    #[test]
    fn test_apply_defaults_fills_gaps_only() {
        let mut store = ConfigStore::from_toml_str("[Logger]\nlevel = \"warn\"\n").unwrap();
        let added = GlobalSettings::default().apply_defaults(&mut store).unwrap();
        assert_eq!(added, 7);
        assert_eq!(store.get_as::<String>(LOGGER_SECTION, "level").unwrap(), "warn");
        assert_eq!(store.get_as::<u64>(SESSION_SECTION, "teardown_timeout_ms").unwrap(), 2000);

        let again = GlobalSettings::default().apply_defaults(&mut store).unwrap();
        assert_eq!(again, 0);
    }
}
