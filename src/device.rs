//! Device aggregate
//!
//! A device owns its transport nodes by name. Well-known model fields are
//! typed; anything else the model carries is kept in [`DeviceFields::extra`].

use crate::identity::{IdentityCell, IdentityError, Uid};
use crate::logging;
use crate::transport::TransportNode;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Model fields a device may not set itself
pub const RESERVED_FIELDS: [&str; 2] = ["uid", "duid"];

/// Device errors
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Model sets an identity field
    #[error("Field `{0}` is reserved")]
    ReservedField(String),

    /// A field has a nested value
    #[error("Field `{0}` must be a scalar")]
    NonScalarField(String),

    /// A typed field has the wrong type
    #[error("Invalid device fields: {0}")]
    InvalidFields(String),

    /// Two transports share a name
    #[error("Device `{device}` already has a transport named `{name}`")]
    DuplicateTransport {
        /// Device name
        device: String,
        /// Transport name
        name: String,
    },
}

/// Device fields from the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceFields {
    /// Human name
    pub name: String,
    /// User-assigned numeric tag
    pub id: i64,
    /// Model designation
    pub model: String,
    /// Free-form description
    pub description: String,
    /// Any other scalar field
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for DeviceFields {
    fn default() -> Self {
        Self {
            name: "UNKNOWN".to_string(),
            id: 9999,
            model: "Generic".to_string(),
            description: "UNKNOWN".to_string(),
            extra: BTreeMap::new(),
        }
    }
}

impl DeviceFields {
    /// Read fields from a model block (without its `interfaces`)
    pub fn from_mapping(fields: &Mapping) -> Result<Self, DeviceError> {
        for (key, value) in fields {
            let key = key.as_str().unwrap_or_default();
            if RESERVED_FIELDS.contains(&key) {
                return Err(DeviceError::ReservedField(key.to_string()));
            }
            if matches!(value, Value::Mapping(_) | Value::Sequence(_) | Value::Tagged(_)) {
                return Err(DeviceError::NonScalarField(key.to_string()));
            }
        }
        serde_yaml::from_value(Value::Mapping(fields.clone()))
            .map_err(|e| DeviceError::InvalidFields(e.to_string()))
    }

    /// Extra field by name
    pub fn extra(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }
}

/// A device and the transports it exposes
pub struct Device {
    type_name: String,
    fields: DeviceFields,
    uid: IdentityCell,
    transports: RwLock<Vec<Arc<TransportNode>>>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("type_name", &self.type_name)
            .field("name", &self.fields.name)
            .field("uid", &self.uid.get())
            .field("transports", &self.transport_names())
            .finish()
    }
}

impl Device {
    /// Create a device of registered type `type_name`
    pub fn new(type_name: impl Into<String>, fields: DeviceFields) -> Self {
        Self {
            type_name: type_name.into(),
            fields,
            uid: IdentityCell::new(),
            transports: RwLock::new(Vec::new()),
        }
    }

    /// Registered type name
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// All fields
    pub fn fields(&self) -> &DeviceFields {
        &self.fields
    }

    /// Human name
    pub fn name(&self) -> &str {
        &self.fields.name
    }

    /// User-assigned tag
    pub fn id(&self) -> i64 {
        self.fields.id
    }

    /// Model designation
    pub fn model(&self) -> &str {
        &self.fields.model
    }

    /// Description
    pub fn description(&self) -> &str {
        &self.fields.description
    }

    /// Identity, once registered
    pub fn uid(&self) -> Option<Uid> {
        self.uid.get()
    }

    /// Stamp the identity (once)
    pub fn assign_uid(&self, uid: Uid) -> Result<(), IdentityError> {
        self.uid.assign(uid)
    }

    /// Span for log records about this device
    pub fn span(&self) -> tracing::Span {
        logging::device_span(self.uid(), &self.type_name, &self.fields.name)
    }

    /// Link a transport under its own name
    pub fn add_transport(&self, node: Arc<TransportNode>) -> Result<(), DeviceError> {
        let mut transports = self.transports.write();
        if transports.iter().any(|t| t.name() == node.name()) {
            return Err(DeviceError::DuplicateTransport {
                device: self.fields.name.clone(),
                name: node.name().to_string(),
            });
        }
        transports.push(node);
        Ok(())
    }

    /// Unlink a transport by name
    pub fn remove_transport(&self, name: &str) -> Option<Arc<TransportNode>> {
        let mut transports = self.transports.write();
        let index = transports.iter().position(|t| t.name() == name)?;
        Some(transports.remove(index))
    }

    /// Transport by name
    pub fn transport(&self, name: &str) -> Option<Arc<TransportNode>> {
        self.transports.read().iter().find(|t| t.name() == name).cloned()
    }

    /// Transports in declaration order
    pub fn transports(&self) -> Vec<Arc<TransportNode>> {
        self.transports.read().clone()
    }

    /// Transport names in declaration order
    pub fn transport_names(&self) -> Vec<String> {
        self.transports.read().iter().map(|t| t.name().to_string()).collect()
    }

    /// Identities of registered transports
    pub fn transport_uids(&self) -> Vec<Uid> {
        self.transports.read().iter().filter_map(|t| t.uid()).collect()
    }

    /// Number of linked transports
    pub fn transport_count(&self) -> usize {
        self.transports.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::loopback_node;

    fn fields(yaml: &str) -> Mapping {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_defaults_and_extra_fields() {
        let parsed = DeviceFields::from_mapping(&fields("name: PSU\nvoltage: 12.5\nchannel: 3\n")).unwrap();
        assert_eq!(parsed.name, "PSU");
        assert_eq!(parsed.id, 9999);
        assert_eq!(parsed.model, "Generic");
        assert_eq!(parsed.extra("channel"), Some(&Value::from(3)));
        assert!(parsed.extra("voltage").is_some());
        assert!(parsed.extra("name").is_none());
    }

    #[test]
    fn test_reserved_and_nested_fields_rejected() {
        assert!(matches!(
            DeviceFields::from_mapping(&fields("uid: 4\n")),
            Err(DeviceError::ReservedField(f)) if f == "uid"
        ));
        assert!(matches!(
            DeviceFields::from_mapping(&fields("limits: [1, 2]\n")),
            Err(DeviceError::NonScalarField(_))
        ));
        assert!(matches!(
            DeviceFields::from_mapping(&fields("id: twelve\n")),
            Err(DeviceError::InvalidFields(_))
        ));
    }

    #[test]
    fn test_transport_names_unique() {
        let device = Device::new("Device", DeviceFields::default());
        device.add_transport(Arc::new(loopback_node("A"))).unwrap();
        device.add_transport(Arc::new(loopback_node("B"))).unwrap();
        assert!(matches!(
            device.add_transport(Arc::new(loopback_node("A"))),
            Err(DeviceError::DuplicateTransport { .. })
        ));
        assert_eq!(device.transport_names(), vec!["A", "B"]);

        assert!(device.remove_transport("A").is_some());
        assert!(device.remove_transport("A").is_none());
        assert_eq!(device.transport_count(), 1);
        assert!(device.transport("B").is_some());
    }
}
