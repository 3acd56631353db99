//! Model documents
//!
//! A model describes one device and the transports it exposes:
//!
//! ```yaml
//! Device:
//!   name: bench-psu
//!   id: 12
//!   interfaces:
//!     Socket:
//!       name: CTRL
//!       host: 127.0.0.1
//!       port: 5025
//! ```
//!
//! The single root key names the device type. Each key under `interfaces`
//! names a transport type, unless the block carries an explicit `type` field,
//! in which case the key is only a label.

use serde_yaml::{Mapping, Value};
use thiserror::Error;

/// Reserved key holding the transport blocks
pub const INTERFACES_KEY: &str = "interfaces";

/// Optional transport block field naming the transport
pub const NAME_KEY: &str = "name";

/// Optional transport block field naming the transport type
pub const TYPE_KEY: &str = "type";

/// Model parsing errors
#[derive(Error, Debug)]
pub enum ModelError {
    /// YAML syntax error
    #[error("Malformed model: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Document has no root
    #[error("Model document is empty")]
    Empty,

    /// Document has more than one root
    #[error("Model document has {} roots, expected one: {}", .0.len(), .0.join(", "))]
    MultipleRoots(Vec<String>),

    /// A block that must be a mapping is something else
    #[error("Expected a mapping at `{0}`")]
    NotAMapping(String),

    /// A mapping key is not a string
    #[error("Non-string key under `{0}`")]
    InvalidKey(String),

    /// A reserved field has the wrong shape
    #[error("Invalid field `{field}` in `{block}`: expected a string")]
    InvalidField {
        /// Block containing the field
        block: String,
        /// Field name
        field: String,
    },
}

/// One transport block from the `interfaces` mapping
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceDecl {
    /// Key the block was declared under
    pub key: String,
    /// Registered transport type name
    pub type_name: String,
    /// Explicit transport name, if given
    pub name: Option<String>,
    /// Remaining fields, in document order
    pub fields: Mapping,
}

/// Parsed model document
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDocument {
    /// Registered device type name (the root key)
    pub device_type: String,
    /// Device fields without the `interfaces` block
    pub device_fields: Mapping,
    /// Transport blocks in document order; `None` when the block is absent or empty
    pub interfaces: Option<Vec<InterfaceDecl>>,
}

impl ModelDocument {
    /// Parse a YAML model
    pub fn parse(text: &str) -> Result<Self, ModelError> {
        if text.trim().is_empty() {
            return Err(ModelError::Empty);
        }
        let value: Value = serde_yaml::from_str(text)?;
        Self::from_value(value)
    }

    /// Interpret an already deserialized model
    pub fn from_value(value: Value) -> Result<Self, ModelError> {
        let root = match value {
            Value::Null => return Err(ModelError::Empty),
            Value::Mapping(map) => map,
            _ => return Err(ModelError::NotAMapping("<root>".to_string())),
        };

        if root.len() > 1 {
            let keys = root.keys().map(describe_key).collect();
            return Err(ModelError::MultipleRoots(keys));
        }

        let Some((key, body)) = root.into_iter().next() else {
            return Err(ModelError::Empty);
        };
        let device_type = string_key(key, "<root>")?;
        let mut device_fields = as_mapping(body, &device_type)?;

        let interfaces = match device_fields.remove(INTERFACES_KEY) {
            None | Some(Value::Null) => None,
            Some(Value::Mapping(blocks)) if blocks.is_empty() => None,
            Some(Value::Mapping(blocks)) => Some(parse_interfaces(blocks, &device_type)?),
            Some(_) => {
                return Err(ModelError::NotAMapping(format!(
                    "{device_type}.{INTERFACES_KEY}"
                )))
            }
        };

        Ok(Self {
            device_type,
            device_fields,
            interfaces,
        })
    }

    /// Number of declared transports
    pub fn interface_count(&self) -> usize {
        self.interfaces.as_ref().map_or(0, Vec::len)
    }
}

fn parse_interfaces(blocks: Mapping, device_type: &str) -> Result<Vec<InterfaceDecl>, ModelError> {
    let parent = format!("{device_type}.{INTERFACES_KEY}");
    let mut decls = Vec::with_capacity(blocks.len());

    for (key, body) in blocks {
        let key = string_key(key, &parent)?;
        let path = format!("{parent}.{key}");
        let mut fields = as_mapping(body, &path)?;

        let type_name = take_string(&mut fields, TYPE_KEY, &path)?.unwrap_or_else(|| key.clone());
        let name = take_string(&mut fields, NAME_KEY, &path)?;

        decls.push(InterfaceDecl {
            key,
            type_name,
            name,
            fields,
        });
    }

    Ok(decls)
}

fn as_mapping(value: Value, path: &str) -> Result<Mapping, ModelError> {
    match value {
        Value::Null => Ok(Mapping::new()),
        Value::Mapping(map) => {
            if map.keys().any(|k| !k.is_string()) {
                return Err(ModelError::InvalidKey(path.to_string()));
            }
            Ok(map)
        }
        _ => Err(ModelError::NotAMapping(path.to_string())),
    }
}

fn string_key(key: Value, path: &str) -> Result<String, ModelError> {
    match key {
        Value::String(s) => Ok(s),
        _ => Err(ModelError::InvalidKey(path.to_string())),
    }
}

fn take_string(fields: &mut Mapping, field: &str, block: &str) -> Result<Option<String>, ModelError> {
    match fields.remove(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(_) => Err(ModelError::InvalidField {
            block: block.to_string(),
            field: field.to_string(),
        }),
    }
}

fn describe_key(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "?".to_string()),
    }
}
