//! Section/entry configuration store persisted as TOML

use serde::de::DeserializeOwned;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use toml::{Table, Value};

/// Configuration store errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Section already present
    #[error("Section already exists: {0}")]
    SectionExists(String),

    /// Section absent
    #[error("Section not found: {0}")]
    SectionNotFound(String),

    /// Entry already present in the section
    #[error("Entry already exists: {section}.{key}")]
    EntryExists {
        /// Section name
        section: String,
        /// Entry key
        key: String,
    },

    /// Entry absent from the section
    #[error("Entry not found: {section}.{key}")]
    EntryNotFound {
        /// Section name
        section: String,
        /// Entry key
        key: String,
    },

    /// A top-level value that is not a table
    #[error("Not a section: {0}")]
    NotASection(String),

    /// File to read does not exist
    #[error("Configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Path points to a directory
    #[error("Path is a directory: {}", .0.display())]
    IsADirectory(PathBuf),

    /// Parent directory of the target file is missing
    #[error("Parent directory does not exist: {}", .0.display())]
    ParentMissing(PathBuf),

    /// Store has no backing file
    #[error("Configuration store has no file path")]
    NoPath,

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TOML syntax error
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Entry exists but has the wrong shape for the requested type
    #[error("Invalid value for {section}.{key}: {reason}")]
    InvalidValue {
        /// Section name
        section: String,
        /// Entry key
        key: String,
        /// Conversion failure
        reason: String,
    },
}

/// Ordered sections of ordered entries
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    sections: Table,
}

impl ConfigStore {
    /// Create an empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a store from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let mut store = Self::new();
        store.loads(text)?;
        Ok(store)
    }

    /// Open the store backed by `path`, creating an empty file when it does
    /// not exist yet but its parent directory does.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        if path.is_dir() {
            return Err(ConfigError::IsADirectory(path));
        }

        if path.exists() {
            return Self::load(path);
        }

        check_parent(&path)?;
        fs::write(&path, "")?;
        tracing::info!(path = %path.display(), "Created configuration file");
        Ok(Self {
            path: Some(path),
            sections: Table::new(),
        })
    }

    /// Read an existing configuration file
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        if path.is_dir() {
            return Err(ConfigError::IsADirectory(path));
        }
        if !path.exists() {
            return Err(ConfigError::NotFound(path));
        }

        let text = fs::read_to_string(&path)?;
        let mut store = Self::from_toml_str(&text)?;
        store.path = Some(path);
        Ok(store)
    }

    /// Backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Replace the contents with parsed TOML text
    pub fn loads(&mut self, text: &str) -> Result<(), ConfigError> {
        let table: Table = text.parse()?;
        if let Some((name, _)) = table.iter().find(|(_, v)| !v.is_table()) {
            return Err(ConfigError::NotASection(name.clone()));
        }
        self.sections = table;
        Ok(())
    }

    /// Render the contents as TOML
    pub fn dumps(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&self.sections)?)
    }

    /// Write the contents to `path`
    pub fn dump(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if path.is_dir() {
            return Err(ConfigError::IsADirectory(path.to_path_buf()));
        }
        check_parent(path)?;
        fs::write(path, self.dumps()?)?;
        Ok(())
    }

    /// Write the contents back to the backing file
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = self.path.as_ref().ok_or(ConfigError::NoPath)?;
        self.dump(path)
    }

    /// Section names in order
    pub fn sections(&self) -> impl Iterator<Item = &str> {
        self.sections.keys().map(String::as_str)
    }

    /// Whether `section` exists
    pub fn has_section(&self, section: &str) -> bool {
        self.sections.contains_key(section)
    }

    /// Add a section, optionally pre-filled
    pub fn add_section(&mut self, section: &str, entries: Option<Table>) -> Result<(), ConfigError> {
        if self.has_section(section) {
            return Err(ConfigError::SectionExists(section.to_string()));
        }
        self.sections
            .insert(section.to_string(), Value::Table(entries.unwrap_or_default()));
        Ok(())
    }

    /// Remove a section and all its entries
    pub fn delete_section(&mut self, section: &str) -> Result<Table, ConfigError> {
        match self.sections.remove(section) {
            Some(Value::Table(table)) => Ok(table),
            Some(_) => Err(ConfigError::NotASection(section.to_string())),
            None => Err(ConfigError::SectionNotFound(section.to_string())),
        }
    }

    /// Entries of a section
    pub fn section(&self, section: &str) -> Result<&Table, ConfigError> {
        self.sections
            .get(section)
            .ok_or_else(|| ConfigError::SectionNotFound(section.to_string()))?
            .as_table()
            .ok_or_else(|| ConfigError::NotASection(section.to_string()))
    }

    fn section_mut(&mut self, section: &str) -> Result<&mut Table, ConfigError> {
        self.sections
            .get_mut(section)
            .ok_or_else(|| ConfigError::SectionNotFound(section.to_string()))?
            .as_table_mut()
            .ok_or_else(|| ConfigError::NotASection(section.to_string()))
    }

    /// Add a new entry to an existing section
    pub fn add_entry(
        &mut self,
        section: &str,
        key: &str,
        value: impl Into<Value>,
    ) -> Result<(), ConfigError> {
        let table = self.section_mut(section)?;
        if table.contains_key(key) {
            return Err(ConfigError::EntryExists {
                section: section.to_string(),
                key: key.to_string(),
            });
        }
        table.insert(key.to_string(), value.into());
        Ok(())
    }

    /// Replace the value of an existing entry, returning the old one
    pub fn update_entry(
        &mut self,
        section: &str,
        key: &str,
        value: impl Into<Value>,
    ) -> Result<Value, ConfigError> {
        let table = self.section_mut(section)?;
        let slot = table.get_mut(key).ok_or_else(|| ConfigError::EntryNotFound {
            section: section.to_string(),
            key: key.to_string(),
        })?;
        Ok(std::mem::replace(slot, value.into()))
    }

    /// Remove an entry, returning its value
    pub fn delete_entry(&mut self, section: &str, key: &str) -> Result<Value, ConfigError> {
        self.section_mut(section)?
            .remove(key)
            .ok_or_else(|| ConfigError::EntryNotFound {
                section: section.to_string(),
                key: key.to_string(),
            })
    }

    /// Raw value of an entry
    pub fn get_entry(&self, section: &str, key: &str) -> Result<&Value, ConfigError> {
        self.section(section)?
            .get(key)
            .ok_or_else(|| ConfigError::EntryNotFound {
                section: section.to_string(),
                key: key.to_string(),
            })
    }

    /// Typed value of an entry
    pub fn get_as<T: DeserializeOwned>(&self, section: &str, key: &str) -> Result<T, ConfigError> {
        self.get_entry(section, key)?
            .clone()
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::InvalidValue {
                section: section.to_string(),
                key: key.to_string(),
                reason: e.message().to_string(),
            })
    }

    /// Typed value of an entry, `None` when the section or entry is absent
    pub fn find_as<T: DeserializeOwned>(&self, section: &str, key: &str) -> Result<Option<T>, ConfigError> {
        match self.get_as(section, key) {
            Ok(value) => Ok(Some(value)),
            Err(ConfigError::SectionNotFound(_) | ConfigError::EntryNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Contents as a TOML table
    pub fn as_table(&self) -> &Table {
        &self.sections
    }
}

fn check_parent(path: &Path) -> Result<(), ConfigError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() && !parent.is_dir() => {
            Err(ConfigError::ParentMissing(parent.to_path_buf()))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_and_entry_lifecycle() {
        let mut store = ConfigStore::new();
        store.add_section("Logger", None).unwrap();
        store.add_entry("Logger", "level", "debug").unwrap();
        store.add_entry("Logger", "max_files", 3).unwrap();

        assert!(matches!(
            store.add_section("Logger", None),
            Err(ConfigError::SectionExists(_))
        ));
        assert!(matches!(
            store.add_entry("Logger", "level", "info"),
            Err(ConfigError::EntryExists { .. })
        ));
        assert!(matches!(
            store.add_entry("Missing", "level", "info"),
            Err(ConfigError::SectionNotFound(_))
        ));

        let old = store.update_entry("Logger", "level", "warn").unwrap();
        assert_eq!(old.as_str(), Some("debug"));
        assert_eq!(store.get_as::<String>("Logger", "level").unwrap(), "warn");
        assert_eq!(store.get_as::<u32>("Logger", "max_files").unwrap(), 3);

        store.delete_entry("Logger", "max_files").unwrap();
        assert!(matches!(
            store.get_entry("Logger", "max_files"),
            Err(ConfigError::EntryNotFound { .. })
        ));
        assert!(matches!(
            store.update_entry("Logger", "max_files", 1),
            Err(ConfigError::EntryNotFound { .. })
        ));

        store.delete_section("Logger").unwrap();
        assert!(!store.has_section("Logger"));
        assert!(matches!(
            store.delete_section("Logger"),
            Err(ConfigError::SectionNotFound(_))
        ));
    }

    #[test]
    fn test_typed_lookup_errors() {
        let store = ConfigStore::from_toml_str("[Session]\nread_timeout_ms = \"fast\"\n").unwrap();
        assert!(matches!(
            store.get_as::<u64>("Session", "read_timeout_ms"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert_eq!(store.find_as::<u64>("Session", "cycle_sleep_ms").unwrap(), None);
        assert_eq!(store.find_as::<u64>("Other", "x").unwrap(), None);
    }

    #[test]
    fn test_top_level_scalars_rejected() {
        assert!(matches!(
            ConfigStore::from_toml_str("level = 1\n"),
            Err(ConfigError::NotASection(_))
        ));
    }

    #[test]
    fn test_dumps_round_trip_keeps_order() {
        let mut store = ConfigStore::new();
        store.add_section("Zeta", None).unwrap();
        store.add_section("Alpha", None).unwrap();
        store.add_entry("Zeta", "b", 2).unwrap();
        store.add_entry("Zeta", "a", 1).unwrap();

        let text = store.dumps().unwrap();
        let reloaded = ConfigStore::from_toml_str(&text).unwrap();
        assert_eq!(reloaded.sections().collect::<Vec<_>>(), vec!["Zeta", "Alpha"]);
        let keys: Vec<_> = reloaded.section("Zeta").unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["b", "a"]);
    }
}
