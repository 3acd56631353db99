//! Identity registry
//!
//! The registry tracks every device and transport by [`Uid`]. It holds only
//! weak references: the caller owns devices through [`DeviceHandle`], devices
//! own their transports. Entries whose instance was dropped without an
//! explicit removal are evicted by [`Registry::verify_registry`].
//!
//! Views ([`DeviceView`], [`TransportView`]) carry a copy of the identity and
//! re-resolve through the registry on every access, so a view never reaches
//! an instance that was removed or destroyed.

use crate::device::Device;
use crate::identity::{IdentityCounter, IdentityError, Uid};
use crate::transport::{TransportError, TransportNode};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;

/// Kind of a registered instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Device
    Device,
    /// Transport
    Transport,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device => write!(f, "device"),
            Self::Transport => write!(f, "transport"),
        }
    }
}

/// Bookkeeping record for one registered instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryEntry {
    /// Identity
    pub uid: Uid,
    /// Device or transport
    pub kind: EntryKind,
    /// Owning device, for transports
    pub owner_uid: Option<Uid>,
    /// Where the instance came from (model path or `<string>`)
    pub source_label: String,
}

/// Registry errors
#[derive(Error, Debug)]
pub enum RegistryError {
    /// No entry for the identity
    #[error("Unknown identity {0}")]
    UnknownIdentity(Uid),

    /// Instance is not registered
    #[error("Instance not found in registry")]
    NotFound,

    /// Entry exists but the instance was destroyed
    #[error("Instance {0} was dropped")]
    InstanceDropped(Uid),

    /// Identity belongs to the other kind
    #[error("Identity {uid} is a {actual}, expected a {expected}")]
    KindMismatch {
        /// Identity
        uid: Uid,
        /// Kind the caller asked for
        expected: EntryKind,
        /// Registered kind
        actual: EntryKind,
    },

    /// Identity stamping failed
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

/// Outcome of a consistency sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    /// Entries examined
    pub checked: usize,
    /// Entries whose instance was gone
    pub evicted: Vec<Uid>,
    /// Transport entries whose owner was gone
    pub orphaned: Vec<Uid>,
}

impl VerifyReport {
    /// Whether the sweep found nothing to fix
    pub fn is_clean(&self) -> bool {
        self.evicted.is_empty() && self.orphaned.is_empty()
    }
}

#[derive(Default)]
struct State {
    entries: BTreeMap<Uid, RegistryEntry>,
    devices: BTreeMap<Uid, Weak<Device>>,
    transports: BTreeMap<Uid, Weak<TransportNode>>,
}

impl State {
    fn entry(&self, uid: Uid, expected: EntryKind) -> Result<&RegistryEntry, RegistryError> {
        let entry = self
            .entries
            .get(&uid)
            .ok_or(RegistryError::UnknownIdentity(uid))?;
        if entry.kind != expected {
            return Err(RegistryError::KindMismatch {
                uid,
                expected,
                actual: entry.kind,
            });
        }
        Ok(entry)
    }

    fn insert_device(&mut self, uid: Uid, device: &Arc<Device>, source_label: &str) {
        self.entries.insert(
            uid,
            RegistryEntry {
                uid,
                kind: EntryKind::Device,
                owner_uid: None,
                source_label: source_label.to_string(),
            },
        );
        self.devices.insert(uid, Arc::downgrade(device));
    }

    fn insert_transport(&mut self, uid: Uid, owner: Uid, node: &Arc<TransportNode>, source_label: &str) {
        self.entries.insert(
            uid,
            RegistryEntry {
                uid,
                kind: EntryKind::Transport,
                owner_uid: Some(owner),
                source_label: source_label.to_string(),
            },
        );
        self.transports.insert(uid, Arc::downgrade(node));
    }

    fn owned_transports(&self, owner: Uid) -> Vec<Uid> {
        self.entries
            .values()
            .filter(|e| e.kind == EntryKind::Transport && e.owner_uid == Some(owner))
            .map(|e| e.uid)
            .collect()
    }
}

fn ensure_unassigned(current: Option<Uid>) -> Result<(), IdentityError> {
    match current {
        Some(current) => Err(IdentityError::AlreadyAssigned { current }),
        None => Ok(()),
    }
}

/// Registry of live devices and transports
#[derive(Default)]
pub struct Registry {
    counter: IdentityCounter,
    state: Mutex<State>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("entries", &self.len())
            .field("next_identity", &self.counter.peek())
            .finish()
    }
}

impl Registry {
    /// Empty registry with identities starting at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty registry with identities starting at `first`
    pub fn starting_at(first: u64) -> Self {
        Self {
            counter: IdentityCounter::starting_at(first),
            state: Mutex::default(),
        }
    }

    /// Issue a fresh identity
    pub fn get_new_identity(&self) -> Uid {
        self.counter.next_identity()
    }

    /// Identity the next issue will return
    pub fn peek_identity(&self) -> Uid {
        self.counter.peek()
    }

    /// Stamp and register a device
    pub fn register_device(&self, device: &Arc<Device>, source_label: &str) -> Result<Uid, RegistryError> {
        let mut state = self.state.lock();
        ensure_unassigned(device.uid())?;
        let uid = self.get_new_identity();
        device.assign_uid(uid)?;
        state.insert_device(uid, device, source_label);
        tracing::debug!(uid = uid.get(), name = device.name(), source = source_label, "Registered device");
        Ok(uid)
    }

    /// Stamp and register a transport owned by device `owner_uid`
    pub fn register_transport(
        &self,
        node: &Arc<TransportNode>,
        owner_uid: Uid,
        source_label: &str,
    ) -> Result<Uid, RegistryError> {
        let mut state = self.state.lock();
        state.entry(owner_uid, EntryKind::Device)?;
        ensure_unassigned(node.uid())?;
        ensure_unassigned(node.duid())?;

        let uid = self.get_new_identity();
        node.assign_uid(uid)?;
        node.assign_duid(owner_uid)?;
        state.insert_transport(uid, owner_uid, node, source_label);
        tracing::debug!(
            uid = uid.get(),
            duid = owner_uid.get(),
            name = node.name(),
            source = source_label,
            "Registered transport"
        );
        Ok(uid)
    }

    /// Register a device and every transport linked into it in one step.
    ///
    /// Nothing is stamped or inserted unless every instance is still
    /// unidentified. Identities are issued device first, then transports in
    /// link order.
    pub fn register_graph(&self, device: &Arc<Device>, source_label: &str) -> Result<Uid, RegistryError> {
        let transports = device.transports();
        let mut state = self.state.lock();

        ensure_unassigned(device.uid())?;
        for node in &transports {
            ensure_unassigned(node.uid())?;
            ensure_unassigned(node.duid())?;
        }

        let duid = self.get_new_identity();
        device.assign_uid(duid)?;
        state.insert_device(duid, device, source_label);

        for node in &transports {
            let uid = self.get_new_identity();
            node.assign_uid(uid)?;
            node.assign_duid(duid)?;
            state.insert_transport(uid, duid, node, source_label);
        }

        tracing::debug!(
            uid = duid.get(),
            name = device.name(),
            transports = transports.len(),
            source = source_label,
            "Registered device graph"
        );
        Ok(duid)
    }

    /// View of the instance registered under `uid`
    pub fn resolve(self: &Arc<Self>, uid: Uid) -> Result<Resolved, RegistryError> {
        let kind = {
            let state = self.state.lock();
            state
                .entries
                .get(&uid)
                .ok_or(RegistryError::UnknownIdentity(uid))?
                .kind
        };
        match kind {
            EntryKind::Device => {
                self.resolve_device(uid)?;
                Ok(Resolved::Device(DeviceView::new(uid, Arc::clone(self))))
            }
            EntryKind::Transport => {
                self.resolve_transport(uid)?;
                Ok(Resolved::Transport(TransportView::new(uid, Arc::clone(self))))
            }
        }
    }

    /// Live device registered under `uid`
    pub fn resolve_device(&self, uid: Uid) -> Result<Arc<Device>, RegistryError> {
        let state = self.state.lock();
        state.entry(uid, EntryKind::Device)?;
        state
            .devices
            .get(&uid)
            .and_then(Weak::upgrade)
            .ok_or(RegistryError::InstanceDropped(uid))
    }

    /// Live transport registered under `uid`
    pub fn resolve_transport(&self, uid: Uid) -> Result<Arc<TransportNode>, RegistryError> {
        let state = self.state.lock();
        state.entry(uid, EntryKind::Transport)?;
        state
            .transports
            .get(&uid)
            .and_then(Weak::upgrade)
            .ok_or(RegistryError::InstanceDropped(uid))
    }

    /// Identity of a registered instance, found by scanning for the same object
    pub fn resolve_identity<T>(&self, instance: &Arc<T>) -> Result<Uid, RegistryError> {
        let target = Arc::as_ptr(instance).cast::<()>();
        let state = self.state.lock();
        state
            .devices
            .iter()
            .find(|(_, weak)| Weak::as_ptr(weak).cast::<()>() == target)
            .map(|(uid, _)| *uid)
            .or_else(|| {
                state
                    .transports
                    .iter()
                    .find(|(_, weak)| Weak::as_ptr(weak).cast::<()>() == target)
                    .map(|(uid, _)| *uid)
            })
            .ok_or(RegistryError::NotFound)
    }

    /// Like [`resolve_identity`](Self::resolve_identity), falling back to `default`
    pub fn resolve_identity_or<T>(&self, instance: &Arc<T>, default: Uid) -> Uid {
        self.resolve_identity(instance).unwrap_or(default)
    }

    /// Remove a transport entry, unlink it from its device and disconnect it
    pub fn remove_transport(&self, uid: Uid) -> Result<(), RegistryError> {
        let (node, owner) = {
            let mut state = self.state.lock();
            let owner_uid = state.entry(uid, EntryKind::Transport)?.owner_uid;
            state.entries.remove(&uid);
            let node = state.transports.remove(&uid).and_then(|w| w.upgrade());
            let owner = owner_uid
                .and_then(|o| state.devices.get(&o))
                .and_then(Weak::upgrade);
            (node, owner)
        };

        if let Some(node) = node {
            if let Some(owner) = owner {
                owner.remove_transport(node.name());
            }
            node.release();
            tracing::info!(uid = uid.get(), name = node.name(), "Removed transport");
        } else {
            tracing::info!(uid = uid.get(), "Removed entry of dropped transport");
        }
        Ok(())
    }

    /// Remove a device and every transport it owns; returns the number of entries removed
    pub fn remove_device(&self, uid: Uid) -> Result<usize, RegistryError> {
        let (device, count, nodes) = {
            let mut state = self.state.lock();
            state.entry(uid, EntryKind::Device)?;
            let owned = state.owned_transports(uid);

            state.entries.remove(&uid);
            let device = state.devices.remove(&uid).and_then(|w| w.upgrade());
            let nodes: Vec<_> = owned
                .iter()
                .filter_map(|t| {
                    state.entries.remove(t);
                    state.transports.remove(t).and_then(|w| w.upgrade())
                })
                .collect();
            (device, owned.len(), nodes)
        };

        for node in &nodes {
            node.release();
        }
        match device {
            Some(device) => {
                tracing::info!(uid = uid.get(), name = device.name(), transports = count, "Removed device");
            }
            None => tracing::info!(uid = uid.get(), transports = count, "Removed entry of dropped device"),
        }
        Ok(count + 1)
    }

    /// [`remove_device`](Self::remove_device) by object
    pub fn remove_device_by_ref(&self, device: &Arc<Device>) -> Result<usize, RegistryError> {
        let uid = self.resolve_identity(device)?;
        self.remove_device(uid)
    }

    /// [`remove_transport`](Self::remove_transport) by object
    pub fn remove_transport_by_ref(&self, node: &Arc<TransportNode>) -> Result<(), RegistryError> {
        let uid = self.resolve_identity(node)?;
        self.remove_transport(uid)
    }

    /// Evict entries whose instance is gone, and transports whose owner is gone
    pub fn verify_registry(&self) -> VerifyReport {
        let mut state = self.state.lock();
        let mut report = VerifyReport {
            checked: state.entries.len(),
            ..VerifyReport::default()
        };

        let dead: Vec<Uid> = state
            .entries
            .values()
            .filter(|e| match e.kind {
                EntryKind::Device => state.devices.get(&e.uid).and_then(Weak::upgrade).is_none(),
                EntryKind::Transport => state.transports.get(&e.uid).and_then(Weak::upgrade).is_none(),
            })
            .map(|e| e.uid)
            .collect();
        for uid in &dead {
            state.entries.remove(uid);
            state.devices.remove(uid);
            state.transports.remove(uid);
            tracing::warn!(uid = uid.get(), "Evicted stale registry entry");
        }
        report.evicted = dead;

        let orphaned: Vec<Uid> = state
            .entries
            .values()
            .filter(|e| e.owner_uid.is_some_and(|o| !state.entries.contains_key(&o)))
            .map(|e| e.uid)
            .collect();
        for uid in &orphaned {
            state.entries.remove(uid);
            state.transports.remove(uid);
            tracing::warn!(uid = uid.get(), "Evicted transport of removed device");
        }
        report.orphaned = orphaned;

        report
    }

    /// Whether `uid` has an entry
    pub fn contains(&self, uid: Uid) -> bool {
        self.state.lock().entries.contains_key(&uid)
    }

    /// Entry for `uid`
    pub fn entry(&self, uid: Uid) -> Option<RegistryEntry> {
        self.state.lock().entries.get(&uid).cloned()
    }

    /// All entries ordered by identity
    pub fn entries(&self) -> Vec<RegistryEntry> {
        self.state.lock().entries.values().cloned().collect()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered device identities
    pub fn device_uids(&self) -> Vec<Uid> {
        self.state.lock().devices.keys().copied().collect()
    }

    /// Registered transport identities
    pub fn transport_uids(&self) -> Vec<Uid> {
        self.state.lock().transports.keys().copied().collect()
    }
}

/// Result of [`Registry::resolve`]
#[derive(Debug, Clone)]
pub enum Resolved {
    /// A device
    Device(DeviceView),
    /// A transport
    Transport(TransportView),
}

impl Resolved {
    /// Identity of the resolved instance
    pub fn uid(&self) -> Uid {
        match self {
            Self::Device(view) => view.uid(),
            Self::Transport(view) => view.uid(),
        }
    }

    /// Device view, if this is a device
    pub fn into_device(self) -> Option<DeviceView> {
        match self {
            Self::Device(view) => Some(view),
            Self::Transport(_) => None,
        }
    }

    /// Transport view, if this is a transport
    pub fn into_transport(self) -> Option<TransportView> {
        match self {
            Self::Transport(view) => Some(view),
            Self::Device(_) => None,
        }
    }
}

/// Errors from handle and view operations
#[derive(Error, Debug)]
pub enum HandleError {
    /// The identity no longer resolves
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The transport operation failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The device has no transport by that name
    #[error("Device `{device}` has no transport named `{name}`")]
    NoSuchTransport {
        /// Device name
        device: String,
        /// Requested transport
        name: String,
    },
}

/// Re-resolving view of a device
#[derive(Clone)]
pub struct DeviceView {
    uid: Uid,
    registry: Arc<Registry>,
}

impl fmt::Debug for DeviceView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceView").field("uid", &self.uid).finish()
    }
}

impl DeviceView {
    fn new(uid: Uid, registry: Arc<Registry>) -> Self {
        Self { uid, registry }
    }

    /// Identity this view resolves
    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// Whether the device is still registered and alive
    pub fn is_alive(&self) -> bool {
        self.registry.resolve_device(self.uid).is_ok()
    }

    /// Run `f` against the device
    pub fn with<R>(&self, f: impl FnOnce(&Device) -> R) -> Result<R, RegistryError> {
        let device = self.registry.resolve_device(self.uid)?;
        Ok(f(&device))
    }

    /// Device name
    pub fn name(&self) -> Result<String, RegistryError> {
        self.with(|d| d.name().to_string())
    }

    /// Transport names
    pub fn transport_names(&self) -> Result<Vec<String>, RegistryError> {
        self.with(Device::transport_names)
    }

    /// View of the transport named `name`
    pub fn transport(&self, name: &str) -> Result<TransportView, HandleError> {
        let device = self.registry.resolve_device(self.uid)?;
        transport_view(&device, name, &self.registry)
    }
}

fn transport_view(device: &Device, name: &str, registry: &Arc<Registry>) -> Result<TransportView, HandleError> {
    let uid = device
        .transport(name)
        .and_then(|node| node.uid())
        .ok_or_else(|| HandleError::NoSuchTransport {
            device: device.name().to_string(),
            name: name.to_string(),
        })?;
    registry.resolve_transport(uid)?;
    Ok(TransportView::new(uid, Arc::clone(registry)))
}

/// Re-resolving view of a transport
#[derive(Clone)]
pub struct TransportView {
    uid: Uid,
    registry: Arc<Registry>,
}

impl fmt::Debug for TransportView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportView").field("uid", &self.uid).finish()
    }
}

impl TransportView {
    fn new(uid: Uid, registry: Arc<Registry>) -> Self {
        Self { uid, registry }
    }

    fn node(&self) -> Result<Arc<TransportNode>, RegistryError> {
        self.registry.resolve_transport(self.uid)
    }

    /// Identity this view resolves
    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// Owning device identity
    pub fn duid(&self) -> Result<Option<Uid>, RegistryError> {
        Ok(self.node()?.duid())
    }

    /// Whether the transport is still registered and alive
    pub fn is_alive(&self) -> bool {
        self.node().is_ok()
    }

    /// Run `f` against the transport node
    pub fn with<R>(&self, f: impl FnOnce(&TransportNode) -> R) -> Result<R, RegistryError> {
        let node = self.node()?;
        Ok(f(&node))
    }

    /// Transport name
    pub fn name(&self) -> Result<String, RegistryError> {
        self.with(|n| n.name().to_string())
    }

    /// Open the connection
    pub fn connect(&self) -> Result<(), HandleError> {
        Ok(self.node()?.connect()?)
    }

    /// Close the connection
    pub fn disconnect(&self) -> Result<(), HandleError> {
        Ok(self.node()?.disconnect()?)
    }

    /// Whether data can flow
    pub fn is_connected(&self) -> Result<bool, RegistryError> {
        self.with(TransportNode::is_connected)
    }

    /// Read one message with the transport's default wait
    pub fn read(&self) -> Result<Bytes, HandleError> {
        Ok(self.node()?.read()?)
    }

    /// Read one message waiting at most `timeout`
    pub fn read_timeout(&self, timeout: Option<Duration>) -> Result<Bytes, HandleError> {
        Ok(self.node()?.read_timeout(timeout)?)
    }

    /// Send `data`
    pub fn write(&self, data: &[u8]) -> Result<usize, HandleError> {
        Ok(self.node()?.write(data)?)
    }
}

/// Owning handle to a loaded device
///
/// The handle keeps the device alive. Dropping it without
/// [`remove`](Self::remove) leaves a stale entry for
/// [`Registry::verify_registry`] to evict.
pub struct DeviceHandle {
    uid: Uid,
    device: Arc<Device>,
    registry: Arc<Registry>,
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("uid", &self.uid)
            .field("device", &self.device)
            .finish()
    }
}

impl Deref for DeviceHandle {
    type Target = Device;

    fn deref(&self) -> &Device {
        &self.device
    }
}

impl DeviceHandle {
    pub(crate) fn new(uid: Uid, device: Arc<Device>, registry: Arc<Registry>) -> Self {
        Self { uid, device, registry }
    }

    /// Device identity
    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// The device itself
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Whether the registry still tracks the device
    pub fn is_registered(&self) -> bool {
        self.registry.contains(self.uid)
    }

    /// Re-resolving view of the device
    pub fn view(&self) -> DeviceView {
        DeviceView::new(self.uid, Arc::clone(&self.registry))
    }

    /// View of the transport named `name`
    pub fn transport(&self, name: &str) -> Result<TransportView, HandleError> {
        transport_view(&self.device, name, &self.registry)
    }

    /// Remove the device and its transports from the registry and drop them
    pub fn remove(self) -> Result<usize, RegistryError> {
        self.registry.remove_device(self.uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceFields;
    use crate::transport::testing::loopback_node;

    fn device_with(names: &[&str]) -> Arc<Device> {
        let device = Device::new("Device", DeviceFields::default());
        for name in names {
            device.add_transport(Arc::new(loopback_node(name))).unwrap();
        }
        Arc::new(device)
    }

    #[test]
    fn test_identities_strictly_increase() {
        let registry = Registry::new();
        let issued: Vec<Uid> = (0..50).map(|_| registry.get_new_identity()).collect();
        assert!(issued.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(registry.peek_identity(), Uid::new(50));
    }

    #[test]
    fn test_register_graph_orders_identities() {
        let registry = Registry::starting_at(10);
        let device = device_with(&["A", "B"]);
        let duid = registry.register_graph(&device, "<string>").unwrap();

        assert_eq!(duid, Uid::new(10));
        assert_eq!(device.transport_uids(), vec![Uid::new(11), Uid::new(12)]);
        for node in device.transports() {
            assert_eq!(node.duid(), Some(duid));
        }
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.entry(Uid::new(11)).unwrap().owner_uid, Some(duid));
    }

    #[test]
    fn test_register_twice_rejected() {
        let registry = Registry::new();
        let device = device_with(&[]);
        registry.register_device(&device, "test").unwrap();
        assert!(matches!(
            registry.register_device(&device, "test"),
            Err(RegistryError::Identity(IdentityError::AlreadyAssigned { .. }))
        ));
        assert!(matches!(
            registry.register_graph(&device, "test"),
            Err(RegistryError::Identity(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_transport_needs_owner() {
        let registry = Registry::new();
        let node = Arc::new(loopback_node("X"));
        assert!(matches!(
            registry.register_transport(&node, Uid::new(99), "test"),
            Err(RegistryError::UnknownIdentity(_))
        ));
        assert!(node.uid().is_none());

        let device = device_with(&[]);
        let duid = registry.register_device(&device, "test").unwrap();
        let uid = registry.register_transport(&node, duid, "test").unwrap();
        assert_eq!(registry.resolve_transport(uid).unwrap().duid(), Some(duid));
    }

    #[test]
    fn test_resolve_kinds() {
        let registry = Arc::new(Registry::new());
        let device = device_with(&["A"]);
        let duid = registry.register_graph(&device, "test").unwrap();
        let tuid = device.transport_uids()[0];

        assert!(matches!(registry.resolve(duid).unwrap(), Resolved::Device(_)));
        assert!(matches!(registry.resolve(tuid).unwrap(), Resolved::Transport(_)));
        assert!(matches!(
            registry.resolve(Uid::new(1234)),
            Err(RegistryError::UnknownIdentity(_))
        ));
        assert!(matches!(
            registry.resolve_device(tuid),
            Err(RegistryError::KindMismatch { .. })
        ));
    }

    #[test]
    fn test_resolve_identity_by_object() {
        let registry = Registry::new();
        let device = device_with(&["A"]);
        let duid = registry.register_graph(&device, "test").unwrap();
        let node = device.transport("A").unwrap();

        assert_eq!(registry.resolve_identity(&device).unwrap(), duid);
        assert_eq!(registry.resolve_identity(&node).unwrap(), node.uid().unwrap());

        let stranger = device_with(&[]);
        assert!(matches!(registry.resolve_identity(&stranger), Err(RegistryError::NotFound)));
        assert_eq!(registry.resolve_identity_or(&stranger, Uid::new(7)), Uid::new(7));
    }

    #[test]
    fn test_cascading_delete() {
        let registry = Arc::new(Registry::new());
        let device = device_with(&["A", "B", "C"]);
        let duid = registry.register_graph(&device, "test").unwrap();
        let mut all = device.transport_uids();
        all.push(duid);

        let view = match registry.resolve(duid).unwrap() {
            Resolved::Device(view) => view,
            Resolved::Transport(_) => unreachable!(),
        };
        assert_eq!(registry.remove_device(duid).unwrap(), 4);
        assert!(registry.is_empty());
        for uid in all {
            assert!(matches!(registry.resolve(uid), Err(RegistryError::UnknownIdentity(_))));
        }
        assert!(matches!(view.name(), Err(RegistryError::UnknownIdentity(_))));
        assert!(matches!(registry.remove_device(duid), Err(RegistryError::UnknownIdentity(_))));
    }

    #[test]
    fn test_remove_transport_unlinks_and_disconnects() {
        let registry = Arc::new(Registry::new());
        let device = device_with(&["A", "B"]);
        registry.register_graph(&device, "test").unwrap();
        let node = device.transport("A").unwrap();
        node.connect().unwrap();
        let uid = node.uid().unwrap();

        registry.remove_transport(uid).unwrap();
        assert!(!node.is_connected());
        assert_eq!(device.transport_names(), vec!["B"]);
        assert_eq!(registry.len(), 2);
        assert!(matches!(registry.remove_transport(uid), Err(RegistryError::UnknownIdentity(_))));
    }

    #[test]
    fn test_verify_evicts_dropped_instances() {
        let registry = Arc::new(Registry::new());
        let kept = device_with(&["A"]);
        registry.register_graph(&kept, "test").unwrap();

        let dropped = device_with(&["A", "B"]);
        let duid = registry.register_graph(&dropped, "test").unwrap();
        let view = DeviceView::new(duid, Arc::clone(&registry));
        drop(dropped);

        assert_eq!(registry.len(), 5);
        assert!(matches!(view.name(), Err(RegistryError::InstanceDropped(_))));

        let report = registry.verify_registry();
        assert_eq!(report.checked, 5);
        assert_eq!(report.evicted.len(), 3);
        assert!(report.orphaned.is_empty());
        assert_eq!(registry.len(), 2);
        assert!(matches!(view.name(), Err(RegistryError::UnknownIdentity(_))));

        assert!(registry.verify_registry().is_clean());
    }

    #[test]
    fn test_verify_evicts_orphaned_transports() {
        let registry = Registry::new();
        let device = device_with(&[]);
        let duid = registry.register_device(&device, "test").unwrap();
        let node = Arc::new(loopback_node("A"));
        let tuid = registry.register_transport(&node, duid, "test").unwrap();

        drop(device);
        let report = registry.verify_registry();
        assert_eq!(report.evicted, vec![duid]);
        assert_eq!(report.orphaned, vec![tuid]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_transport_view_io() {
        let registry = Arc::new(Registry::new());
        let device = device_with(&["LOOP"]);
        let duid = registry.register_graph(&device, "test").unwrap();
        let handle = DeviceHandle::new(duid, Arc::clone(&device), Arc::clone(&registry));

        let transport = handle.transport("LOOP").unwrap();
        transport.connect().unwrap();
        assert_eq!(transport.write(b"PING\n").unwrap(), 5);
        assert_eq!(transport.read().unwrap(), Bytes::from_static(b"PING\n"));
        assert!(matches!(
            handle.transport("NOPE"),
            Err(HandleError::NoSuchTransport { .. })
        ));

        drop(device);
        assert_eq!(handle.remove().unwrap(), 2);
        assert!(matches!(
            transport.write(b"x"),
            Err(HandleError::Registry(RegistryError::UnknownIdentity(_)))
        ));
    }
}
