//! Transport layer for device communication channels
//!
//! Every channel implements [`Transport`]: connect, disconnect, read, write
//! and a connected flag. Network-backed channels run their I/O on a
//! [`ThreadedSession`](session::ThreadedSession). A [`TransportNode`] wraps a
//! boxed transport with the identities the registry stamps on it.
//!
//! Supported media:
//! - Sockets with a threaded session (TCP/UDP)
//! - Direct Ethernet sockets
//! - Serial ports
//! - Telnet
//! - SSH-2
//! - Bluetooth LE
//! - CAN, SPI and I2C on Linux

pub mod bluetooth;
pub mod can;
pub mod ethernet;
pub mod i2c;
pub mod serial;
pub mod session;
pub mod socket;
pub mod spi;
pub mod ssh;
pub mod telnet;

pub use bluetooth::{BluetoothConfig, BluetoothTransport};
pub use can::{CanConfig, CanTransport};
pub use ethernet::{EthernetConfig, EthernetTransport};
pub use i2c::{I2cConfig, I2cTransport};
pub use serial::{SerialConfig, SerialFlowControl, SerialParity, SerialTransport};
pub use session::{
    DelimiterFramer, FixedHeartbeat, Framer, HeartbeatPolicy, Link, NoHeartbeat, SessionConfig,
    SessionQueues, SessionState, ThreadedSession,
};
pub use socket::{IpFamily, SocketConfig, SocketKind, SocketTransport};
pub use spi::{SpiConfig, SpiTransport};
pub use ssh::{SshConfig, SshTransport};
pub use telnet::{TelnetConfig, TelnetTransport};

use crate::identity::{IdentityCell, IdentityError, Uid};
use crate::logging::{self, Direction};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::fmt;
use std::io;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Transport type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Socket with a threaded session
    Socket,
    /// Direct TCP/UDP socket
    Ethernet,
    /// Serial port
    Serial,
    /// Telnet
    Telnet,
    /// SSH
    Ssh,
    /// Bluetooth LE
    Bluetooth,
    /// SocketCAN
    Can,
    /// spidev
    Spi,
    /// i2c-dev
    I2c,
    /// Anything registered outside this crate
    Custom,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket => write!(f, "Socket"),
            Self::Ethernet => write!(f, "Ethernet"),
            Self::Serial => write!(f, "Serial"),
            Self::Telnet => write!(f, "Telnet"),
            Self::Ssh => write!(f, "SSH"),
            Self::Bluetooth => write!(f, "Bluetooth"),
            Self::Can => write!(f, "CAN"),
            Self::Spi => write!(f, "SPI"),
            Self::I2c => write!(f, "I2C"),
            Self::Custom => write!(f, "Custom"),
        }
    }
}

/// Transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection timeout
    #[error("Connection timeout after {0:?}")]
    Timeout(Duration),

    /// Port or device node not found
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// Operation needs an open connection
    #[error("Not connected")]
    NotConnected,

    /// Peer closed the connection
    #[error("Disconnected")]
    Disconnected,

    /// Send error
    #[error("Send error: {0}")]
    SendError(String),

    /// Receive error
    #[error("Receive error: {0}")]
    ReceiveError(String),

    /// Payload rejected before it reached the wire
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Session worker did not stop within the bound
    #[error("Session did not stop within {0:?}")]
    TeardownTimeout(Duration),

    /// Medium not available on this platform
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl TransportError {
    /// Map a configuration deserialization failure
    pub fn invalid_config(kind: TransportKind, err: impl fmt::Display) -> Self {
        Self::InvalidConfiguration(format!("{kind}: {err}"))
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
    /// Packets sent
    pub packets_sent: u64,
    /// Packets received
    pub packets_received: u64,
    /// Errors count
    pub errors: u64,
    /// Connection uptime in seconds
    pub uptime_secs: u64,
}

impl TransportStats {
    /// Count one outgoing message
    pub fn record_sent(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
        self.packets_sent += 1;
    }

    /// Count one incoming message; empty reads are not counted
    pub fn record_received(&mut self, bytes: usize) {
        if bytes > 0 {
            self.bytes_received += bytes as u64;
            self.packets_received += 1;
        }
    }

    /// Count one error
    pub fn record_error(&mut self) {
        self.errors += 1;
    }

    /// Copy with uptime filled in from `connected_at`
    pub fn snapshot(&self, connected_at: Option<Instant>) -> Self {
        let mut stats = self.clone();
        stats.uptime_secs = connected_at.map_or(0, |t| t.elapsed().as_secs());
        stats
    }
}

/// Connection state of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No open connection
    Unattached,
    /// Connection open
    Connected,
}

/// Downcast support for boxed transports
pub trait AsAny {
    /// Borrow as `Any`
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Contract every channel satisfies.
///
/// `connect` on a connected transport is a no-op; `disconnect` on an
/// unattached one fails with [`TransportError::NotConnected`]. A failing
/// operation closes the transport's own connection state before returning
/// the error so that [`is_connected`](Transport::is_connected) stays truthful.
pub trait Transport: AsAny + Send {
    /// Medium of this transport
    fn kind(&self) -> TransportKind;

    /// Open the connection
    fn connect(&mut self) -> Result<(), TransportError>;

    /// Close the connection
    fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Whether data can flow
    fn is_connected(&self) -> bool;

    /// Read one message with the transport's default wait.
    /// An expired wait yields empty bytes, not an error.
    fn read(&mut self) -> Result<Bytes, TransportError>;

    /// Read one message waiting at most `timeout`; `None` waits indefinitely
    fn read_timeout(&mut self, timeout: Option<Duration>) -> Result<Bytes, TransportError> {
        let _ = timeout;
        self.read()
    }

    /// Send `data`, returning the number of bytes accepted
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Human-readable endpoint description
    fn connection_info(&self) -> String;

    /// Traffic counters
    fn stats(&self) -> TransportStats;

    /// Queues of a running session, for transports whose I/O is queued.
    /// [`TransportNode`] reads and writes through them without holding its lock.
    fn queues(&self) -> Option<SessionQueues> {
        None
    }
}

/// Deserialize an adapter configuration from model fields
pub fn config_from_fields<T: DeserializeOwned>(
    kind: TransportKind,
    fields: &serde_yaml::Mapping,
) -> Result<T, TransportError> {
    serde_yaml::from_value(serde_yaml::Value::Mapping(fields.clone()))
        .map_err(|e| TransportError::invalid_config(kind, e))
}

/// Whether an I/O error is a read timeout rather than a failure
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// Run `op` up to `attempts` times, sleeping `delay` between failures
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub(crate) fn with_retries<T>(
    attempts: u32,
    delay: Duration,
    mut op: impl FnMut() -> io::Result<T>,
) -> io::Result<T> {
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                tracing::debug!(attempt, error = %e, "Retrying");
                attempt += 1;
                std::thread::sleep(delay);
            }
        }
    }
}

/// A named transport carrying its identity and its owner's identity
pub struct TransportNode {
    name: String,
    type_name: String,
    uid: IdentityCell,
    duid: IdentityCell,
    inner: Mutex<Box<dyn Transport>>,
}

impl fmt::Debug for TransportNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportNode")
            .field("name", &self.name)
            .field("type_name", &self.type_name)
            .field("uid", &self.uid.get())
            .field("duid", &self.duid.get())
            .finish_non_exhaustive()
    }
}

impl TransportNode {
    /// Wrap a transport under `name`
    pub fn new(name: impl Into<String>, type_name: impl Into<String>, transport: Box<dyn Transport>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            uid: IdentityCell::new(),
            duid: IdentityCell::new(),
            inner: Mutex::new(transport),
        }
    }

    /// Name within the owning device
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registered type name this transport was built from
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Own identity
    pub fn uid(&self) -> Option<Uid> {
        self.uid.get()
    }

    /// Owning device identity
    pub fn duid(&self) -> Option<Uid> {
        self.duid.get()
    }

    /// Stamp the own identity (once)
    pub fn assign_uid(&self, uid: Uid) -> Result<(), IdentityError> {
        self.uid.assign(uid)
    }

    /// Stamp the owning device identity (once)
    pub fn assign_duid(&self, duid: Uid) -> Result<(), IdentityError> {
        self.duid.assign(duid)
    }

    fn span(&self, kind: TransportKind) -> tracing::Span {
        logging::transport_span(self.uid(), self.duid(), &kind.to_string(), &self.name)
    }

    /// Medium of the wrapped transport
    pub fn kind(&self) -> TransportKind {
        self.inner.lock().kind()
    }

    /// Open the connection
    pub fn connect(&self) -> Result<(), TransportError> {
        let mut transport = self.inner.lock();
        let _span = self.span(transport.kind()).entered();
        if transport.is_connected() {
            tracing::debug!("Already connected");
            return Ok(());
        }
        match transport.connect() {
            Ok(()) => {
                tracing::info!(endpoint = %transport.connection_info(), "Connected");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "Connect failed");
                Err(e)
            }
        }
    }

    /// Close the connection
    pub fn disconnect(&self) -> Result<(), TransportError> {
        let mut transport = self.inner.lock();
        let _span = self.span(transport.kind()).entered();
        transport.disconnect()?;
        tracing::info!("Disconnected");
        Ok(())
    }

    /// Whether data can flow
    pub fn is_connected(&self) -> bool {
        self.inner.lock().is_connected()
    }

    /// Connection state
    pub fn state(&self) -> ConnectionState {
        if self.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Unattached
        }
    }

    /// Session queues and span, taken under a short lock
    fn queued(&self) -> (Option<SessionQueues>, tracing::Span) {
        let transport = self.inner.lock();
        (transport.queues(), self.span(transport.kind()))
    }

    /// Read one message with the transport's default wait
    pub fn read(&self) -> Result<Bytes, TransportError> {
        let (queues, span) = self.queued();
        let _span = span.entered();
        let data = match queues {
            Some(queues) => queues.read()?,
            None => self.inner.lock().read()?,
        };
        logging::log_traffic(Direction::Rx, &data);
        Ok(data)
    }

    /// Read one message waiting at most `timeout`.
    ///
    /// A queued transport is read without holding the node lock, so writes
    /// from other threads go through while this call waits.
    pub fn read_timeout(&self, timeout: Option<Duration>) -> Result<Bytes, TransportError> {
        let (queues, span) = self.queued();
        let _span = span.entered();
        let data = match queues {
            Some(queues) => queues.read_timeout(timeout)?,
            None => self.inner.lock().read_timeout(timeout)?,
        };
        logging::log_traffic(Direction::Rx, &data);
        Ok(data)
    }

    /// Send `data`
    pub fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        let (queues, span) = self.queued();
        let _span = span.entered();
        let written = match queues {
            Some(queues) => queues.write(data)?,
            None => self.inner.lock().write(data)?,
        };
        logging::log_traffic(Direction::Tx, data);
        Ok(written)
    }

    /// Endpoint description
    pub fn connection_info(&self) -> String {
        self.inner.lock().connection_info()
    }

    /// Traffic counters
    pub fn stats(&self) -> TransportStats {
        self.inner.lock().stats()
    }

    /// Run `f` against the wrapped transport
    pub fn with_transport<R>(&self, f: impl FnOnce(&mut dyn Transport) -> R) -> R {
        let mut transport = self.inner.lock();
        f(transport.as_mut())
    }

    /// Run `f` against the wrapped transport if it is a `T`
    pub fn with_adapter<T: Transport + 'static, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut transport = self.inner.lock();
        let any = AsAny::as_any_mut(transport.as_mut());
        any.downcast_mut::<T>().map(f)
    }

    /// Disconnect if connected, logging rather than returning failures
    pub(crate) fn release(&self) {
        let mut transport = self.inner.lock();
        if !transport.is_connected() {
            return;
        }
        let _span = self.span(transport.kind()).entered();
        if let Err(e) = transport.disconnect() {
            tracing::warn!(error = %e, "Disconnect on release failed");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_node_connection_state_machine() {
        let node = loopback_node("LOOP_0");
        assert_eq!(node.state(), ConnectionState::Unattached);

        node.connect().unwrap();
        node.connect().unwrap();
        assert_eq!(node.state(), ConnectionState::Connected);

        node.disconnect().unwrap();
        assert!(matches!(node.disconnect(), Err(TransportError::NotConnected)));
        assert_eq!(node.state(), ConnectionState::Unattached);
    }

    #[test]
    fn test_node_read_write() {
        let node = loopback_node("LOOP_0");
        node.connect().unwrap();
        assert_eq!(node.write(b"hello").unwrap(), 5);
        assert_eq!(node.read().unwrap(), Bytes::from_static(b"hello"));
        assert!(node.read().unwrap().is_empty());

        let stats = node.stats();
        assert_eq!(stats.bytes_sent, 5);
        assert_eq!(stats.packets_received, 1);
    }

    #[test]
    fn test_node_identity_assign_once() {
        let node = loopback_node("LOOP_0");
        node.assign_uid(Uid::new(1)).unwrap();
        node.assign_duid(Uid::new(0)).unwrap();
        assert!(node.assign_uid(Uid::new(2)).is_err());
        assert!(node.assign_duid(Uid::new(5)).is_err());
        assert_eq!(node.uid(), Some(Uid::new(1)));
        assert_eq!(node.duid(), Some(Uid::new(0)));
    }

    #[test]
    fn test_with_adapter_downcasts() {
        let node = loopback_node("LOOP_0");
        let replies = node.with_adapter(|t: &mut LoopbackTransport| {
            t.replies.push_back(Bytes::from_static(b"x"));
            t.replies.len()
        });
        assert_eq!(replies, Some(1));
        assert!(node.with_adapter(|_: &mut SerialTransport| ()).is_none());
    }

    #[test]
    fn test_with_retries_stops_after_attempts() {
        let mut calls = 0;
        let result: io::Result<()> = with_retries(3, Duration::ZERO, || {
            calls += 1;
            Err(io::Error::other("busy"))
        });
        assert!(result.is_err());
        assert_eq!(calls, 3);

        let mut calls = 0;
        let value = with_retries(3, Duration::ZERO, || {
            calls += 1;
            if calls < 2 {
                Err(io::Error::other("busy"))
            } else {
                Ok(calls)
            }
        })
        .unwrap();
        assert_eq!(value, 2);
    }

    #[test]
    fn test_failed_connect_leaves_unattached() {
        let node = TransportNode::new(
            "BROKEN",
            "Loopback",
            Box::new(LoopbackTransport {
                fail_connect: true,
                ..LoopbackTransport::default()
            }),
        );
        assert!(node.connect().is_err());
        assert!(!node.is_connected());
    }
}
