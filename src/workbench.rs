//! Top-level process object
//!
//! A [`Workbench`] owns the registry, the type table and the configuration
//! for the whole process, and hands them to the [`Builder`]. Only one
//! workbench may exist at a time.

use crate::builder::{BuildError, Builder, ModelSource};
use crate::capability::CapabilityRegistry;
use crate::config::{ConfigError, ConfigStore, GlobalSettings};
use crate::identity::Uid;
use crate::registry::{DeviceHandle, Registry, RegistryError, Resolved, VerifyReport};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

static RUNNING: AtomicBool = AtomicBool::new(false);

/// Workbench errors
#[derive(Error, Debug)]
pub enum WorkbenchError {
    /// Another workbench is alive
    #[error("A workbench already exists in this process")]
    AlreadyRunning,

    /// Configuration could not be read or written
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Holds the single-instance slot until dropped
#[derive(Debug)]
struct InstanceGuard;

impl InstanceGuard {
    fn acquire() -> Result<Self, WorkbenchError> {
        RUNNING
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| Self)
            .map_err(|_| WorkbenchError::AlreadyRunning)
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        RUNNING.store(false, Ordering::Release);
    }
}

/// Registry, type table and configuration of one process
#[derive(Debug)]
pub struct Workbench {
    config: ConfigStore,
    settings: GlobalSettings,
    builder: Builder,
    _guard: InstanceGuard,
}

impl Workbench {
    /// Workbench with built-in types and default settings
    pub fn new() -> Result<Self, WorkbenchError> {
        Self::with_config(ConfigStore::new())
    }

    /// Workbench using the settings in `config`; missing entries are filled
    /// with defaults in memory
    pub fn with_config(config: ConfigStore) -> Result<Self, WorkbenchError> {
        Self::with_parts(config, CapabilityRegistry::with_builtins())
    }

    /// Workbench with a custom type table
    pub fn with_parts(mut config: ConfigStore, capabilities: CapabilityRegistry) -> Result<Self, WorkbenchError> {
        let guard = InstanceGuard::acquire()?;

        let settings = GlobalSettings::from_store(&config)?;
        let added = settings.apply_defaults(&mut config)?;
        if added > 0 {
            tracing::debug!(added, "Filled missing configuration entries");
        }

        let builder = Builder::new(
            Arc::new(Registry::new()),
            Arc::new(capabilities),
            settings.session,
        );
        tracing::info!(version = crate::VERSION, "Workbench started");

        Ok(Self {
            config,
            settings,
            builder,
            _guard: guard,
        })
    }

    /// Open the configuration file at `path`, creating it with defaults when
    /// it does not exist
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, WorkbenchError> {
        let path = path.into();
        let existed = path.exists();
        let bench = Self::with_config(ConfigStore::open(path)?)?;
        if !existed {
            bench.config.save()?;
        }
        Ok(bench)
    }

    /// Whether a workbench is alive in this process
    pub fn is_running() -> bool {
        RUNNING.load(Ordering::Acquire)
    }

    /// Identity registry
    pub fn registry(&self) -> &Arc<Registry> {
        self.builder.registry()
    }

    /// Type table
    pub fn capabilities(&self) -> &Arc<CapabilityRegistry> {
        self.builder.capabilities()
    }

    /// Configuration store
    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    /// Typed settings read at startup
    pub fn settings(&self) -> &GlobalSettings {
        &self.settings
    }

    /// Model builder
    pub fn builder(&self) -> &Builder {
        &self.builder
    }

    /// Load a model from text or a file
    pub fn load(&self, source: impl Into<ModelSource>) -> Result<DeviceHandle, BuildError> {
        self.builder.load(source)
    }

    /// Load a model from text
    pub fn load_str(&self, text: &str) -> Result<DeviceHandle, BuildError> {
        self.builder.load_str(text)
    }

    /// Load a model file
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<DeviceHandle, BuildError> {
        self.builder.load_file(path)
    }

    /// View of the instance registered under `uid`
    pub fn resolve(&self, uid: Uid) -> Result<Resolved, RegistryError> {
        self.registry().resolve(uid)
    }

    /// Evict stale registry entries
    pub fn verify(&self) -> VerifyReport {
        let report = self.registry().verify_registry();
        if !report.is_clean() {
            tracing::info!(
                evicted = report.evicted.len(),
                orphaned = report.orphaned.len(),
                "Registry reconciled"
            );
        }
        report
    }
}

impl Drop for Workbench {
    fn drop(&mut self) {
        let report = self.registry().verify_registry();
        tracing::info!(
            remaining = self.registry().len(),
            evicted = report.evicted.len(),
            "Workbench stopped"
        );
    }
}
