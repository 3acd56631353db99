//! Capability registry
//!
//! Maps the type names used in model documents to constructors. Each
//! transport type also declares a [`CapabilitySet`] describing what the
//! medium supports, so callers can query features without connecting.

use crate::config::SessionSettings;
use crate::device::{Device, DeviceError, DeviceFields};
use crate::transport::{
    BluetoothTransport, CanTransport, EthernetTransport, I2cTransport, SerialTransport,
    SocketTransport, SpiTransport, SshTransport, TelnetTransport, Transport, TransportError,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_yaml::Mapping;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Name of the built-in generic device type
pub const DEFAULT_DEVICE_TYPE: &str = "Device";

/// Transport capability flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    // Data handling
    /// Supports binary data transmission
    Binary,
    /// Supports streaming data
    Streaming,
    /// Supports packet/message based communication
    PacketBased,
    /// Datagram delivery without ordering guarantees
    Datagram,
    /// I/O runs on a session thread behind queues
    Queued,

    // Connection features
    /// Supports connection timeout configuration
    ConfigurableTimeout,
    /// Supports keep-alive
    KeepAlive,

    // Flow control
    /// Supports hardware flow control
    HardwareFlowControl,
    /// Supports software flow control (XON/XOFF)
    SoftwareFlowControl,
    /// Supports break signal
    BreakSignal,
    /// Supports modem control lines (DTR/RTS/CTS/DSR)
    ModemLines,

    // Interactive features
    /// Supports interactive shell/terminal
    Interactive,
    /// Supports PTY allocation
    Pty,
    /// Supports one-shot remote commands
    CommandExec,

    // Security
    /// Connection is encrypted
    Encrypted,
    /// Supports password authentication
    PasswordAuth,
    /// Supports public key authentication
    KeyAuth,
    /// Supports agent authentication
    AgentAuth,

    // Protocol specific
    /// Supports Telnet option negotiation
    TelnetOptions,
    /// Supports BLE GATT
    BleGatt,
    /// Supports BLE notifications
    BleNotify,
    /// Supports BLE scanning
    BleScan,
    /// Receive side filters frames by identifier
    FrameFiltering,
    /// Full-duplex exchange in one call
    FullDuplexTransfer,
    /// Register addressed reads and writes
    RegisterAccess,

    // Serial specific
    /// Supports baud rate configuration
    BaudRate,
    /// Supports data bits configuration
    DataBits,
    /// Supports parity configuration
    Parity,
    /// Supports stop bits configuration
    StopBits,
}

/// Transport capability set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    capabilities: BTreeSet<Capability>,
    description: String,
}

impl CapabilitySet {
    /// Create a new empty capability set
    pub fn new() -> Self {
        Self::default()
    }

    /// Create capability set with description
    pub fn with_description(description: &str) -> Self {
        Self {
            capabilities: BTreeSet::new(),
            description: description.to_string(),
        }
    }

    /// Add a capability
    pub fn add(&mut self, cap: Capability) -> &mut Self {
        self.capabilities.insert(cap);
        self
    }

    /// Add multiple capabilities
    pub fn add_all(&mut self, caps: &[Capability]) -> &mut Self {
        self.capabilities.extend(caps.iter().copied());
        self
    }

    /// Remove a capability
    pub fn remove(&mut self, cap: Capability) -> &mut Self {
        self.capabilities.remove(&cap);
        self
    }

    /// Check if capability is supported
    pub fn supports(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }

    /// Check if all capabilities are supported
    pub fn supports_all(&self, caps: &[Capability]) -> bool {
        caps.iter().all(|c| self.capabilities.contains(c))
    }

    /// Check if any capability is supported
    pub fn supports_any(&self, caps: &[Capability]) -> bool {
        caps.iter().any(|c| self.capabilities.contains(c))
    }

    /// All capabilities, ordered
    pub fn all(&self) -> &BTreeSet<Capability> {
        &self.capabilities
    }

    /// Get description
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Check if supports binary data
    pub fn is_binary(&self) -> bool {
        self.supports(Capability::Binary)
    }

    /// Check if supports interactive terminal
    pub fn is_interactive(&self) -> bool {
        self.supports(Capability::Interactive)
    }

    /// Check if encrypted
    pub fn is_encrypted(&self) -> bool {
        self.supports(Capability::Encrypted)
    }
}

/// Capability sets of the built-in transports
pub mod presets {
    use super::{Capability, CapabilitySet};

    /// Socket with a session thread
    pub fn socket() -> CapabilitySet {
        let mut caps = CapabilitySet::with_description("TCP/UDP socket with queued session");
        caps.add_all(&[
            Capability::Binary,
            Capability::Streaming,
            Capability::Datagram,
            Capability::Queued,
            Capability::ConfigurableTimeout,
            Capability::KeepAlive,
        ]);
        caps
    }

    /// Direct TCP/UDP
    pub fn ethernet() -> CapabilitySet {
        let mut caps = CapabilitySet::with_description("Raw TCP/UDP socket");
        caps.add_all(&[
            Capability::Binary,
            Capability::Streaming,
            Capability::Datagram,
            Capability::ConfigurableTimeout,
        ]);
        caps
    }

    /// Serial port
    pub fn serial() -> CapabilitySet {
        let mut caps = CapabilitySet::with_description("Serial Port (RS-232/RS-485/USB)");
        caps.add_all(&[
            Capability::Binary,
            Capability::Streaming,
            Capability::ConfigurableTimeout,
            Capability::HardwareFlowControl,
            Capability::SoftwareFlowControl,
            Capability::BreakSignal,
            Capability::ModemLines,
            Capability::BaudRate,
            Capability::DataBits,
            Capability::Parity,
            Capability::StopBits,
        ]);
        caps
    }

    /// Telnet
    pub fn telnet() -> CapabilitySet {
        let mut caps = CapabilitySet::with_description("Telnet Protocol");
        caps.add_all(&[
            Capability::Binary,
            Capability::Streaming,
            Capability::ConfigurableTimeout,
            Capability::Interactive,
            Capability::TelnetOptions,
        ]);
        caps
    }

    /// SSH
    pub fn ssh() -> CapabilitySet {
        let mut caps = CapabilitySet::with_description("SSH-2 Protocol");
        caps.add_all(&[
            Capability::Binary,
            Capability::Streaming,
            Capability::ConfigurableTimeout,
            Capability::KeepAlive,
            Capability::Interactive,
            Capability::Pty,
            Capability::CommandExec,
            Capability::Encrypted,
            Capability::PasswordAuth,
            Capability::KeyAuth,
            Capability::AgentAuth,
        ]);
        caps
    }

    /// Bluetooth LE
    pub fn bluetooth() -> CapabilitySet {
        let mut caps = CapabilitySet::with_description("Bluetooth Low Energy");
        caps.add_all(&[
            Capability::Binary,
            Capability::PacketBased,
            Capability::ConfigurableTimeout,
            Capability::BleGatt,
            Capability::BleNotify,
            Capability::BleScan,
        ]);
        caps
    }

    /// SocketCAN
    pub fn can() -> CapabilitySet {
        let mut caps = CapabilitySet::with_description("SocketCAN raw frames");
        caps.add_all(&[
            Capability::Binary,
            Capability::PacketBased,
            Capability::ConfigurableTimeout,
            Capability::FrameFiltering,
        ]);
        caps
    }

    /// spidev
    pub fn spi() -> CapabilitySet {
        let mut caps = CapabilitySet::with_description("SPI (spidev)");
        caps.add_all(&[Capability::Binary, Capability::FullDuplexTransfer]);
        caps
    }

    /// i2c-dev
    pub fn i2c() -> CapabilitySet {
        let mut caps = CapabilitySet::with_description("I2C (i2c-dev)");
        caps.add_all(&[Capability::Binary, Capability::RegisterAccess]);
        caps
    }
}

/// Builds a device from its type name and model fields
pub type DeviceConstructor =
    Arc<dyn Fn(&str, &Mapping) -> Result<Device, DeviceError> + Send + Sync>;

/// Builds a transport from its model fields
pub type TransportConstructor = Arc<
    dyn Fn(&Mapping, &SessionSettings) -> Result<Box<dyn Transport>, TransportError> + Send + Sync,
>;

/// What a registered name builds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeKind {
    /// Device
    Device,
    /// Transport
    Transport,
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device => write!(f, "device"),
            Self::Transport => write!(f, "transport"),
        }
    }
}

#[derive(Clone)]
enum Constructor {
    Device(DeviceConstructor),
    Transport(TransportConstructor),
}

impl Constructor {
    fn kind(&self) -> TypeKind {
        match self {
            Self::Device(_) => TypeKind::Device,
            Self::Transport(_) => TypeKind::Transport,
        }
    }
}

#[derive(Clone)]
struct TypeDefinition {
    constructor: Constructor,
    capabilities: CapabilitySet,
}

/// Capability registry errors
#[derive(Error, Debug)]
pub enum CapabilityError {
    /// Name already registered
    #[error("Type `{0}` is already registered")]
    NameInUse(String),

    /// Name not registered
    #[error("Unknown type `{0}`")]
    UnknownType(String),

    /// Name registered as the other kind
    #[error("Type `{name}` is a {actual}, expected a {expected}")]
    WrongKind {
        /// Registered name
        name: String,
        /// Kind the caller asked for
        expected: TypeKind,
        /// Kind actually registered
        actual: TypeKind,
    },
}

/// Registered type summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeInfo {
    /// Registered name
    pub name: String,
    /// What the name builds
    pub kind: TypeKind,
    /// Declared capabilities
    pub capabilities: CapabilitySet,
}

/// Name to constructor table
#[derive(Default)]
pub struct CapabilityRegistry {
    types: Mutex<BTreeMap<String, TypeDefinition>>,
}

impl fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("types", &self.names())
            .finish()
    }
}

fn boxed<T: Transport + 'static>(
    transport: Result<T, TransportError>,
) -> Result<Box<dyn Transport>, TransportError> {
    transport.map(|t| Box::new(t) as Box<dyn Transport>)
}

fn device<F>(constructor: F) -> Constructor
where
    F: Fn(&str, &Mapping) -> Result<Device, DeviceError> + Send + Sync + 'static,
{
    Constructor::Device(Arc::new(constructor))
}

fn transport<F>(constructor: F) -> Constructor
where
    F: Fn(&Mapping, &SessionSettings) -> Result<Box<dyn Transport>, TransportError>
        + Send
        + Sync
        + 'static,
{
    Constructor::Transport(Arc::new(constructor))
}

impl CapabilityRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the generic device and every built-in transport
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        {
            let mut types = registry.types.lock();
            let mut insert = |name: &str, constructor: Constructor, capabilities: CapabilitySet| {
                types.insert(
                    name.to_string(),
                    TypeDefinition {
                        constructor,
                        capabilities,
                    },
                );
            };

            insert(
                DEFAULT_DEVICE_TYPE,
                device(|type_name, fields| {
                    Ok(Device::new(type_name, DeviceFields::from_mapping(fields)?))
                }),
                CapabilitySet::with_description("Generic device"),
            );
            insert(
                "Socket",
                transport(|f, s| boxed(SocketTransport::from_fields(f, s))),
                presets::socket(),
            );
            insert(
                "Ethernet",
                transport(|f, s| boxed(EthernetTransport::from_fields(f, s))),
                presets::ethernet(),
            );
            insert(
                "Serial",
                transport(|f, s| boxed(SerialTransport::from_fields(f, s))),
                presets::serial(),
            );
            insert(
                "Telnet",
                transport(|f, s| boxed(TelnetTransport::from_fields(f, s))),
                presets::telnet(),
            );
            insert(
                "Ssh",
                transport(|f, s| boxed(SshTransport::from_fields(f, s))),
                presets::ssh(),
            );
            insert(
                "Bluetooth",
                transport(|f, s| boxed(BluetoothTransport::from_fields(f, s))),
                presets::bluetooth(),
            );
            insert(
                "Can",
                transport(|f, s| boxed(CanTransport::from_fields(f, s))),
                presets::can(),
            );
            insert(
                "Spi",
                transport(|f, s| boxed(SpiTransport::from_fields(f, s))),
                presets::spi(),
            );
            insert(
                "I2c",
                transport(|f, s| boxed(I2cTransport::from_fields(f, s))),
                presets::i2c(),
            );
        }
        registry
    }

    fn insert_new(&self, name: &str, definition: TypeDefinition) -> Result<(), CapabilityError> {
        let mut types = self.types.lock();
        if types.contains_key(name) {
            return Err(CapabilityError::NameInUse(name.to_string()));
        }
        types.insert(name.to_string(), definition);
        tracing::debug!(name, "Registered type");
        Ok(())
    }

    fn replace(&self, name: &str, definition: TypeDefinition) -> Result<(), CapabilityError> {
        let mut types = self.types.lock();
        let slot = types
            .get_mut(name)
            .ok_or_else(|| CapabilityError::UnknownType(name.to_string()))?;
        let actual = slot.constructor.kind();
        let expected = definition.constructor.kind();
        if actual != expected {
            return Err(CapabilityError::WrongKind {
                name: name.to_string(),
                expected,
                actual,
            });
        }
        *slot = definition;
        tracing::debug!(name, "Updated type");
        Ok(())
    }

    /// Register a device type
    pub fn register_device<F>(&self, name: &str, constructor: F) -> Result<(), CapabilityError>
    where
        F: Fn(&str, &Mapping) -> Result<Device, DeviceError> + Send + Sync + 'static,
    {
        self.insert_new(
            name,
            TypeDefinition {
                constructor: device(constructor),
                capabilities: CapabilitySet::new(),
            },
        )
    }

    /// Register a transport type
    pub fn register_transport<F>(
        &self,
        name: &str,
        constructor: F,
        capabilities: CapabilitySet,
    ) -> Result<(), CapabilityError>
    where
        F: Fn(&Mapping, &SessionSettings) -> Result<Box<dyn Transport>, TransportError>
            + Send
            + Sync
            + 'static,
    {
        self.insert_new(
            name,
            TypeDefinition {
                constructor: transport(constructor),
                capabilities,
            },
        )
    }

    /// Replace the constructor of a registered device type
    pub fn update_device<F>(&self, name: &str, constructor: F) -> Result<(), CapabilityError>
    where
        F: Fn(&str, &Mapping) -> Result<Device, DeviceError> + Send + Sync + 'static,
    {
        self.replace(
            name,
            TypeDefinition {
                constructor: device(constructor),
                capabilities: CapabilitySet::new(),
            },
        )
    }

    /// Replace the definition of a registered transport type
    pub fn update_transport<F>(
        &self,
        name: &str,
        constructor: F,
        capabilities: CapabilitySet,
    ) -> Result<(), CapabilityError>
    where
        F: Fn(&Mapping, &SessionSettings) -> Result<Box<dyn Transport>, TransportError>
            + Send
            + Sync
            + 'static,
    {
        self.replace(
            name,
            TypeDefinition {
                constructor: transport(constructor),
                capabilities,
            },
        )
    }

    /// Remove a type
    pub fn unregister(&self, name: &str) -> Result<TypeKind, CapabilityError> {
        let removed = self
            .types
            .lock()
            .remove(name)
            .ok_or_else(|| CapabilityError::UnknownType(name.to_string()))?;
        tracing::debug!(name, "Unregistered type");
        Ok(removed.constructor.kind())
    }

    fn lookup(&self, name: &str) -> Result<TypeDefinition, CapabilityError> {
        self.types
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| CapabilityError::UnknownType(name.to_string()))
    }

    /// Constructor for a device type
    pub fn device_constructor(&self, name: &str) -> Result<DeviceConstructor, CapabilityError> {
        match self.lookup(name)?.constructor {
            Constructor::Device(constructor) => Ok(constructor),
            Constructor::Transport(_) => Err(CapabilityError::WrongKind {
                name: name.to_string(),
                expected: TypeKind::Device,
                actual: TypeKind::Transport,
            }),
        }
    }

    /// Constructor for a transport type
    pub fn transport_constructor(&self, name: &str) -> Result<TransportConstructor, CapabilityError> {
        match self.lookup(name)?.constructor {
            Constructor::Transport(constructor) => Ok(constructor),
            Constructor::Device(_) => Err(CapabilityError::WrongKind {
                name: name.to_string(),
                expected: TypeKind::Transport,
                actual: TypeKind::Device,
            }),
        }
    }

    /// Declared capabilities of a type
    pub fn capabilities(&self, name: &str) -> Result<CapabilitySet, CapabilityError> {
        Ok(self.lookup(name)?.capabilities)
    }

    /// Kind of a registered name
    pub fn kind_of(&self, name: &str) -> Option<TypeKind> {
        self.types.lock().get(name).map(|d| d.constructor.kind())
    }

    /// Whether `name` is registered
    pub fn contains(&self, name: &str) -> bool {
        self.types.lock().contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        self.types.lock().keys().cloned().collect()
    }

    /// Summary of every registered type
    pub fn describe(&self) -> Vec<TypeInfo> {
        self.types
            .lock()
            .iter()
            .map(|(name, definition)| TypeInfo {
                name: name.clone(),
                kind: definition.constructor.kind(),
                capabilities: definition.capabilities.clone(),
            })
            .collect()
    }
}
