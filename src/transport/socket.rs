//! Socket transport backed by a threaded session
//!
//! Connecting spawns a [`ThreadedSession`] that owns the socket. Writes are
//! queued and never block; reads take framed messages from the inbound queue.
//! Every connect builds a fresh session, since a stopped session cannot be
//! restarted.

use super::session::{
    DelimiterFramer, FixedHeartbeat, HeartbeatPolicy, Link, NoHeartbeat, SessionConfig,
    SessionQueues, SessionState, ThreadedSession,
};
use super::{config_from_fields, Transport, TransportError, TransportKind, TransportStats};
use crate::config::SessionSettings;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

/// Address family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    /// IPv4
    #[default]
    #[serde(alias = "AF_INET", alias = "inet")]
    Ipv4,
    /// IPv6
    #[serde(alias = "AF_INET6", alias = "inet6")]
    Ipv6,
}

/// Socket type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketKind {
    /// TCP
    #[default]
    #[serde(alias = "SOCK_STREAM", alias = "tcp")]
    Stream,
    /// UDP
    #[serde(alias = "SOCK_DGRAM", alias = "udp")]
    Dgram,
}

/// Socket transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Host name or address
    pub host: String,
    /// Port number
    pub port: u16,
    /// Address family
    pub protocol: IpFamily,
    /// Stream or datagram
    pub socket_type: SocketKind,
    /// Connect timeout and default read wait, in seconds
    pub timeout: f64,
    /// Per-cycle read budget in seconds; configured default when unset
    pub read_timeout: Option<f64>,
    /// Pause between worker cycles in seconds; configured default when unset
    pub cycle_sleep: Option<f64>,
    /// Teardown bound in seconds; configured default when unset
    pub teardown_timeout: Option<f64>,
    /// Message delimiter
    pub endline: String,
    /// Keep-alive payload sent on idle cycles
    pub heartbeat: Option<String>,
    /// Seconds of outbound silence before a keep-alive
    pub heartbeat_interval: f64,
    /// Queue empty reads too
    pub forward_empty_reads: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.168".to_string(),
            port: 8080,
            protocol: IpFamily::Ipv4,
            socket_type: SocketKind::Stream,
            timeout: 1.0,
            read_timeout: None,
            cycle_sleep: None,
            teardown_timeout: None,
            endline: "\n".to_string(),
            heartbeat: None,
            heartbeat_interval: 1.0,
            forward_empty_reads: false,
        }
    }
}

impl SocketConfig {
    /// Create a configuration for `host:port`
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            ..Self::default()
        }
    }

    /// Set address family
    #[must_use]
    pub fn protocol(mut self, protocol: IpFamily) -> Self {
        self.protocol = protocol;
        self
    }

    /// Set socket type
    #[must_use]
    pub fn socket_type(mut self, kind: SocketKind) -> Self {
        self.socket_type = kind;
        self
    }

    /// Set connect timeout and default read wait
    #[must_use]
    pub fn timeout(mut self, secs: f64) -> Self {
        self.timeout = secs;
        self
    }

    /// Set per-cycle read budget
    #[must_use]
    pub fn read_timeout(mut self, secs: f64) -> Self {
        self.read_timeout = Some(secs);
        self
    }

    /// Set message delimiter
    #[must_use]
    pub fn endline(mut self, endline: &str) -> Self {
        self.endline = endline.to_string();
        self
    }

    /// Enable a keep-alive payload
    #[must_use]
    pub fn heartbeat(mut self, payload: &str, interval_secs: f64) -> Self {
        self.heartbeat = Some(payload.to_string());
        self.heartbeat_interval = interval_secs;
        self
    }

    fn validate(&self) -> Result<(), TransportError> {
        let durations = [
            ("timeout", Some(self.timeout)),
            ("read_timeout", self.read_timeout),
            ("cycle_sleep", self.cycle_sleep),
            ("teardown_timeout", self.teardown_timeout),
            ("heartbeat_interval", Some(self.heartbeat_interval)),
        ];
        for (field, value) in durations {
            if let Some(value) = value {
                if !value.is_finite() || value < 0.0 {
                    return Err(TransportError::InvalidConfiguration(format!(
                        "{field} must be a non-negative number of seconds, got {value}"
                    )));
                }
            }
        }
        if self.port == 0 {
            return Err(TransportError::InvalidConfiguration(
                "port must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Socket transport using a threaded session
pub struct SocketTransport {
    config: SocketConfig,
    session_defaults: SessionSettings,
    session: Option<Arc<ThreadedSession>>,
    name: String,
}

impl SocketTransport {
    /// Create a new socket transport
    pub fn new(config: SocketConfig, session_defaults: SessionSettings) -> Result<Self, TransportError> {
        config.validate()?;
        Ok(Self {
            name: format!("socket-{}:{}", config.host, config.port),
            config,
            session_defaults,
            session: None,
        })
    }

    /// Build from model fields
    pub fn from_fields(
        fields: &serde_yaml::Mapping,
        session_defaults: &SessionSettings,
    ) -> Result<Self, TransportError> {
        let config: SocketConfig = config_from_fields(TransportKind::Socket, fields)?;
        Self::new(config, *session_defaults)
    }

    /// Configuration in use
    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    /// State of the current session, if one was started
    pub fn session_state(&self) -> Option<SessionState> {
        self.session.as_deref().map(ThreadedSession::state)
    }

    /// Drop queued inbound messages
    pub fn flush_input(&self) -> usize {
        self.session.as_deref().map_or(0, ThreadedSession::flush_inbound)
    }

    /// Drop messages not yet sent
    pub fn flush_output(&self) -> usize {
        self.session.as_deref().map_or(0, ThreadedSession::flush_outbound)
    }

    fn session_config(&self) -> SessionConfig {
        let secs = |value: Option<f64>, fallback: Duration| {
            value.map_or(fallback, Duration::from_secs_f64)
        };
        SessionConfig::from_settings(&self.session_defaults)
            .name(self.name.clone())
            .read_timeout(secs(self.config.read_timeout, self.session_defaults.read_timeout()))
            .cycle_sleep(secs(self.config.cycle_sleep, self.session_defaults.cycle_sleep()))
            .teardown_timeout(secs(
                self.config.teardown_timeout,
                self.session_defaults.teardown_timeout(),
            ))
            .forward_empty_reads(self.config.forward_empty_reads)
    }

    fn heartbeat_policy(&self) -> Box<dyn HeartbeatPolicy> {
        match &self.config.heartbeat {
            Some(payload) => Box::new(FixedHeartbeat::new(
                Bytes::from(payload.clone().into_bytes()),
                Duration::from_secs_f64(self.config.heartbeat_interval),
            )),
            None => Box::new(NoHeartbeat),
        }
    }

    fn running_session(&self) -> Result<&ThreadedSession, TransportError> {
        self.session
            .as_deref()
            .filter(|s| s.is_running())
            .ok_or(TransportError::NotConnected)
    }
}

fn resolve(host: &str, port: u16, family: IpFamily) -> Result<SocketAddr, TransportError> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| TransportError::ConnectionFailed(format!("Cannot resolve {host}:{port}: {e}")))?;

    addrs
        .into_iter()
        .find(|addr| match family {
            IpFamily::Ipv4 => addr.is_ipv4(),
            IpFamily::Ipv6 => addr.is_ipv6(),
        })
        .ok_or_else(|| {
            TransportError::ConnectionFailed(format!("No {family:?} address for {host}:{port}"))
        })
}

/// Open a socket link with the given connect timeout and per-read timeout
pub(crate) fn open_link(
    host: &str,
    port: u16,
    family: IpFamily,
    kind: SocketKind,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Box<dyn Link>, TransportError> {
    let addr = resolve(host, port, family)?;
    // A zero read timeout means "block forever" to the OS
    let read_timeout = read_timeout.max(Duration::from_millis(1));

    match kind {
        SocketKind::Stream => {
            let stream = if connect_timeout.is_zero() {
                TcpStream::connect(addr)
            } else {
                TcpStream::connect_timeout(&addr, connect_timeout)
            }
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::TimedOut => TransportError::Timeout(connect_timeout),
                _ => TransportError::ConnectionFailed(format!("{addr}: {e}")),
            })?;
            stream.set_nodelay(true)?;
            stream.set_read_timeout(Some(read_timeout))?;
            Ok(Box::new(stream))
        }
        SocketKind::Dgram => {
            let bind: SocketAddr = match family {
                IpFamily::Ipv4 => ([0, 0, 0, 0], 0).into(),
                IpFamily::Ipv6 => ([0u16; 8], 0).into(),
            };
            let socket = UdpSocket::bind(bind)?;
            socket.connect(addr)?;
            socket.set_read_timeout(Some(read_timeout))?;
            Ok(Box::new(socket))
        }
    }
}

impl Transport for SocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }
        // Reap a session whose worker is no longer running
        if let Some(stale) = self.session.take() {
            let timeout = self.session_defaults.teardown_timeout();
            stale.shutdown(timeout)?;
        }

        let config = self.session_config();
        let host = self.config.host.clone();
        let (port, family, kind) = (self.config.port, self.config.protocol, self.config.socket_type);
        let connect_timeout = Duration::from_secs_f64(self.config.timeout);
        let read_timeout = config.read_timeout;

        let session = ThreadedSession::start(
            config,
            move || open_link(&host, port, family, kind, connect_timeout, read_timeout),
            Box::new(DelimiterFramer::new(self.config.endline.clone().into_bytes())),
            self.heartbeat_policy(),
        )?;
        self.session = Some(Arc::new(session));
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        let session = self.session.take().ok_or(TransportError::NotConnected)?;
        let timeout = self.session_config().teardown_timeout;
        session.shutdown(timeout)
    }

    fn is_connected(&self) -> bool {
        self.session.as_deref().is_some_and(ThreadedSession::is_running)
    }

    fn read(&mut self) -> Result<Bytes, TransportError> {
        let timeout = Duration::from_secs_f64(self.config.timeout);
        self.read_timeout(Some(timeout))
    }

    fn read_timeout(&mut self, timeout: Option<Duration>) -> Result<Bytes, TransportError> {
        self.running_session()?.read(timeout)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.running_session()?.write(Bytes::copy_from_slice(data))
    }

    fn connection_info(&self) -> String {
        let scheme = match self.config.socket_type {
            SocketKind::Stream => "tcp",
            SocketKind::Dgram => "udp",
        };
        format!("{scheme}://{}:{}", self.config.host, self.config.port)
    }

    fn stats(&self) -> TransportStats {
        self.session
            .as_deref()
            .map(ThreadedSession::stats)
            .unwrap_or_default()
    }

    fn queues(&self) -> Option<SessionQueues> {
        let session = self.session.as_ref().filter(|s| s.is_running())?;
        Some(SessionQueues::new(
            Arc::clone(session),
            Some(Duration::from_secs_f64(self.config.timeout)),
        ))
    }
}
