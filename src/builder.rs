//! Model loading
//!
//! [`Builder::load`] turns a model document into a registered device graph.
//! Construction is all-or-nothing: every instance is built and linked first,
//! and only a complete graph is registered. A failed load issues no identity
//! and leaves no entry behind.

use crate::capability::{CapabilityError, CapabilityRegistry};
use crate::config::SessionSettings;
use crate::device::{Device, DeviceError};
use crate::model::{InterfaceDecl, ModelDocument, ModelError};
use crate::registry::{DeviceHandle, Registry, RegistryError};
use crate::transport::{TransportError, TransportNode};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Source label of models loaded from a string
pub const STRING_SOURCE: &str = "<string>";

/// Model loading errors
#[derive(Error, Debug)]
pub enum BuildError {
    /// Model path does not exist
    #[error("Model file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Model path is a directory
    #[error("Model path is a directory: {}", .0.display())]
    IsADirectory(PathBuf),

    /// Model file could not be read
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        /// Model path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Malformed model
    #[error(transparent)]
    Model(#[from] ModelError),

    /// Type lookup failed
    #[error(transparent)]
    Capability(#[from] CapabilityError),

    /// Device construction or linking failed
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Transport construction failed
    #[error("Transport `{name}`: {source}")]
    Transport {
        /// Declared transport name
        name: String,
        /// Underlying error
        #[source]
        source: TransportError,
    },

    /// Registration failed
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Where a model comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// Model text
    Text(String),
    /// Path to a model file
    Path(PathBuf),
}

impl From<&Path> for ModelSource {
    fn from(path: &Path) -> Self {
        Self::Path(path.to_path_buf())
    }
}

impl From<PathBuf> for ModelSource {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

/// Builds device graphs from models
pub struct Builder {
    registry: Arc<Registry>,
    capabilities: Arc<CapabilityRegistry>,
    session: SessionSettings,
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("registry", &self.registry)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl Builder {
    /// Create a builder registering into `registry`
    pub fn new(registry: Arc<Registry>, capabilities: Arc<CapabilityRegistry>, session: SessionSettings) -> Self {
        Self {
            registry,
            capabilities,
            session,
        }
    }

    /// Registry graphs are registered into
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Type table used for construction
    pub fn capabilities(&self) -> &Arc<CapabilityRegistry> {
        &self.capabilities
    }

    /// Load a model from text or a file
    pub fn load(&self, source: impl Into<ModelSource>) -> Result<DeviceHandle, BuildError> {
        match source.into() {
            ModelSource::Text(text) => self.load_str(&text),
            ModelSource::Path(path) => self.load_file(path),
        }
    }

    /// Load a model from text
    pub fn load_str(&self, text: &str) -> Result<DeviceHandle, BuildError> {
        self.load_document(ModelDocument::parse(text)?, STRING_SOURCE)
    }

    /// Load a model file
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<DeviceHandle, BuildError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(BuildError::NotFound(path.to_path_buf()));
        }
        if path.is_dir() {
            return Err(BuildError::IsADirectory(path.to_path_buf()));
        }
        if path.is_relative() {
            tracing::warn!(path = %path.display(), "Model path is relative");
        }

        let text = std::fs::read_to_string(path).map_err(|source| BuildError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let document = ModelDocument::parse(&text)?;
        self.load_document(document, &path.display().to_string())
    }

    /// Build and register an already parsed model
    pub fn load_document(&self, document: ModelDocument, source_label: &str) -> Result<DeviceHandle, BuildError> {
        let device = Arc::new(self.construct(&document)?);
        let uid = self.registry.register_graph(&device, source_label)?;

        let _span = device.span().entered();
        tracing::info!(
            transports = device.transport_count(),
            source = source_label,
            "Device loaded"
        );
        Ok(DeviceHandle::new(uid, device, Arc::clone(&self.registry)))
    }

    /// Build the device and its transports without touching the registry
    fn construct(&self, document: &ModelDocument) -> Result<Device, BuildError> {
        let build_device = self.capabilities.device_constructor(&document.device_type)?;
        let device = build_device(&document.device_type, &document.device_fields)?;

        let Some(interfaces) = &document.interfaces else {
            tracing::warn!(
                device_type = %document.device_type,
                name = device.name(),
                "Model declares no interfaces"
            );
            return Ok(device);
        };

        for (index, decl) in interfaces.iter().enumerate() {
            let node = self.construct_transport(decl, index)?;
            device.add_transport(Arc::new(node))?;
        }
        Ok(device)
    }

    fn construct_transport(&self, decl: &InterfaceDecl, index: usize) -> Result<TransportNode, BuildError> {
        let build = self.capabilities.transport_constructor(&decl.type_name)?;
        let name = default_name(decl, index);
        let transport = build(&decl.fields, &self.session).map_err(|source| BuildError::Transport {
            name: name.clone(),
            source,
        })?;
        Ok(TransportNode::new(name, decl.type_name.clone(), transport))
    }
}

/// Declared name, else the block label, else `<type>_<index>`
fn default_name(decl: &InterfaceDecl, index: usize) -> String {
    if let Some(name) = &decl.name {
        return name.clone();
    }
    if decl.key != decl.type_name {
        return decl.key.clone();
    }
    format!("{}_{index}", decl.type_name)
}
