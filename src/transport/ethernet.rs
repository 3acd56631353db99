//! Direct Ethernet transport
//!
//! Unthreaded TCP/UDP socket: every read and write happens on the caller's
//! thread. Use the socket transport when device timing must be decoupled
//! from the caller.

use super::session::Link;
use super::socket::{open_link, IpFamily, SocketKind};
use super::{config_from_fields, is_timeout, Transport, TransportError, TransportKind, TransportStats};
use crate::config::SessionSettings;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Lowest port accepted for direct connections
pub const MIN_PORT: u16 = 1024;

/// Ethernet transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EthernetConfig {
    /// Literal IP address of the device
    pub ip_address: String,
    /// Port number
    pub port: u16,
    /// `IPv4` or `IPv6`
    pub type_of_ip: String,
    /// `TCP` or `UDP`
    pub type_of_communication: String,
    /// Connect and read timeout in seconds
    pub timeout: f64,
    /// Maximum bytes returned by one read
    pub read_size: usize,
}

impl Default for EthernetConfig {
    fn default() -> Self {
        Self {
            ip_address: "127.0.0.1".to_string(),
            port: 8000,
            type_of_ip: "IPv4".to_string(),
            type_of_communication: "TCP".to_string(),
            timeout: 1.0,
            read_size: 4096,
        }
    }
}

impl EthernetConfig {
    fn family(&self) -> Result<IpFamily, TransportError> {
        match self.type_of_ip.to_ascii_lowercase().as_str() {
            "ipv4" => Ok(IpFamily::Ipv4),
            "ipv6" => Ok(IpFamily::Ipv6),
            other => Err(TransportError::InvalidConfiguration(format!(
                "type_of_ip must be IPv4 or IPv6, got {other}"
            ))),
        }
    }

    fn socket_kind(&self) -> Result<SocketKind, TransportError> {
        match self.type_of_communication.to_ascii_lowercase().as_str() {
            "tcp" => Ok(SocketKind::Stream),
            "udp" => Ok(SocketKind::Dgram),
            other => Err(TransportError::InvalidConfiguration(format!(
                "type_of_communication must be TCP or UDP, got {other}"
            ))),
        }
    }

    fn validate(&self) -> Result<(), TransportError> {
        let addr: IpAddr = self.ip_address.parse().map_err(|_| {
            TransportError::InvalidConfiguration(format!("Invalid IP address: {}", self.ip_address))
        })?;
        let family = self.family()?;
        if addr.is_ipv4() != (family == IpFamily::Ipv4) {
            return Err(TransportError::InvalidConfiguration(format!(
                "{} is not an {} address",
                self.ip_address, self.type_of_ip
            )));
        }
        self.socket_kind()?;
        if self.port < MIN_PORT {
            return Err(TransportError::InvalidConfiguration(format!(
                "Port must be between {MIN_PORT} and 65535, got {}",
                self.port
            )));
        }
        if !self.timeout.is_finite() || self.timeout < 0.0 {
            return Err(TransportError::InvalidConfiguration(format!(
                "timeout must be a non-negative number of seconds, got {}",
                self.timeout
            )));
        }
        if self.read_size == 0 {
            return Err(TransportError::InvalidConfiguration(
                "read_size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Direct Ethernet transport
pub struct EthernetTransport {
    config: EthernetConfig,
    link: Option<Box<dyn Link>>,
    stats: TransportStats,
    connected_at: Option<Instant>,
}

impl EthernetTransport {
    /// Create a new Ethernet transport
    pub fn new(config: EthernetConfig) -> Result<Self, TransportError> {
        config.validate()?;
        Ok(Self {
            config,
            link: None,
            stats: TransportStats::default(),
            connected_at: None,
        })
    }

    /// Build from model fields
    pub fn from_fields(
        fields: &serde_yaml::Mapping,
        _session: &SessionSettings,
    ) -> Result<Self, TransportError> {
        Self::new(config_from_fields(TransportKind::Ethernet, fields)?)
    }

    /// Configuration in use
    pub fn config(&self) -> &EthernetConfig {
        &self.config
    }

    fn close(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        self.connected_at = None;
    }

    fn fail(&mut self, err: std::io::Error) -> TransportError {
        self.stats.record_error();
        self.close();
        TransportError::IoError(err)
    }
}

impl Transport for EthernetTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ethernet
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        if self.link.is_some() {
            return Ok(());
        }
        let timeout = Duration::from_secs_f64(self.config.timeout);
        let link = open_link(
            &self.config.ip_address,
            self.config.port,
            self.config.family()?,
            self.config.socket_kind()?,
            timeout,
            timeout,
        )?;
        self.link = Some(link);
        self.connected_at = Some(Instant::now());
        self.stats = TransportStats::default();
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        if self.link.is_none() {
            return Err(TransportError::NotConnected);
        }
        self.close();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    fn read(&mut self) -> Result<Bytes, TransportError> {
        let stream = self.config.socket_kind()? == SocketKind::Stream;
        let link = self.link.as_mut().ok_or(TransportError::NotConnected)?;
        let mut buffer = vec![0u8; self.config.read_size];

        match link.recv_bytes(&mut buffer) {
            Ok(0) if stream => {
                self.close();
                Err(TransportError::Disconnected)
            }
            Ok(n) => {
                buffer.truncate(n);
                self.stats.record_received(n);
                Ok(Bytes::from(buffer))
            }
            Err(ref e) if is_timeout(e) => Ok(Bytes::new()),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let link = self.link.as_mut().ok_or(TransportError::NotConnected)?;
        match link.send_bytes(data) {
            Ok(()) => {
                self.stats.record_sent(data.len());
                Ok(data.len())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn connection_info(&self) -> String {
        format!(
            "{} {}:{}",
            self.config.type_of_communication, self.config.ip_address, self.config.port
        )
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot(self.connected_at)
    }
}
