//! Telnet transport implementation
//!
//! Plain RFC 854 client over a blocking TCP stream. Every option the peer
//! offers or requests is refused, so the session stays in NVT mode.

use super::{config_from_fields, is_timeout, Transport, TransportError, TransportKind, TransportStats};
use crate::config::SessionSettings;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

// Telnet protocol constants
const IAC: u8 = 255; // Interpret As Command
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250; // Subnegotiation Begin
const SE: u8 = 240; // Subnegotiation End

/// Telnet connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelnetConfig {
    /// Host address
    pub host: String,
    /// Port number (default: 23)
    pub port: u16,
    /// Connect and read timeout in seconds
    pub timeout: f64,
}

impl TelnetConfig {
    /// Create a new Telnet configuration
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            port: 23,
            timeout: 1.0,
        }
    }

    /// Set port
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set timeout in seconds
    #[must_use]
    pub fn timeout(mut self, secs: f64) -> Self {
        self.timeout = secs;
        self
    }
}

impl Default for TelnetConfig {
    fn default() -> Self {
        Self::new("127.0.0.1")
    }
}

/// Splits a Telnet byte stream into data and negotiation replies
#[derive(Debug, Default)]
struct CommandFilter {
    /// Incomplete command carried over from the previous chunk
    pending: BytesMut,
}

impl CommandFilter {
    /// Strip commands from `raw`, returning data and the bytes to send back
    fn process(&mut self, raw: &[u8]) -> (Bytes, Vec<u8>) {
        let mut input = std::mem::take(&mut self.pending);
        input.extend_from_slice(raw);

        let mut output = BytesMut::with_capacity(input.len());
        let mut replies = Vec::new();
        let mut i = 0;

        while i < input.len() {
            if input[i] != IAC {
                output.extend_from_slice(&[input[i]]);
                i += 1;
                continue;
            }
            if i + 1 >= input.len() {
                self.pending.extend_from_slice(&input[i..]);
                break;
            }

            match input[i + 1] {
                IAC => {
                    // Escaped IAC (255 255 -> 255)
                    output.extend_from_slice(&[IAC]);
                    i += 2;
                }
                DO | DONT | WILL | WONT => {
                    if i + 2 >= input.len() {
                        self.pending.extend_from_slice(&input[i..]);
                        break;
                    }
                    let option = input[i + 2];
                    match input[i + 1] {
                        DO => replies.extend_from_slice(&[IAC, WONT, option]),
                        WILL => replies.extend_from_slice(&[IAC, DONT, option]),
                        _ => {}
                    }
                    i += 3;
                }
                SB => {
                    let end = input[i + 2..]
                        .windows(2)
                        .position(|w| w == [IAC, SE])
                        .map(|p| i + 2 + p);
                    match end {
                        Some(j) => i = j + 2,
                        None => {
                            self.pending.extend_from_slice(&input[i..]);
                            break;
                        }
                    }
                }
                _ => {
                    // Other commands, skip
                    i += 2;
                }
            }
        }

        (output.freeze(), replies)
    }

    fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Double every IAC byte in outgoing data
fn escape(data: &[u8]) -> Vec<u8> {
    let mut escaped = Vec::with_capacity(data.len());
    for &byte in data {
        if byte == IAC {
            escaped.push(IAC);
        }
        escaped.push(byte);
    }
    escaped
}

/// Telnet transport
pub struct TelnetTransport {
    config: TelnetConfig,
    stream: Option<TcpStream>,
    stats: TransportStats,
    connected_at: Option<Instant>,
    filter: CommandFilter,
}

impl TelnetTransport {
    /// Create a new Telnet transport
    pub fn new(config: TelnetConfig) -> Result<Self, TransportError> {
        if !config.timeout.is_finite() || config.timeout <= 0.0 {
            return Err(TransportError::InvalidConfiguration(format!(
                "timeout must be a positive number of seconds, got {}",
                config.timeout
            )));
        }
        Ok(Self {
            config,
            stream: None,
            stats: TransportStats::default(),
            connected_at: None,
            filter: CommandFilter::default(),
        })
    }

    /// Build from model fields
    pub fn from_fields(
        fields: &serde_yaml::Mapping,
        _session: &SessionSettings,
    ) -> Result<Self, TransportError> {
        Self::new(config_from_fields(TransportKind::Telnet, fields)?)
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.config.timeout)
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.connected_at = None;
        self.filter.clear();
    }

    fn fail(&mut self, err: std::io::Error) -> TransportError {
        self.stats.record_error();
        self.close();
        TransportError::IoError(err)
    }

    /// Read one chunk of data, answering negotiation on the way
    fn read_chunk(&mut self) -> Result<Bytes, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        let mut buffer = vec![0u8; 4096];

        let n = match stream.read(&mut buffer) {
            Ok(0) => {
                self.close();
                return Err(TransportError::Disconnected);
            }
            Ok(n) => n,
            Err(ref e) if is_timeout(e) => return Ok(Bytes::new()),
            Err(e) => return Err(self.fail(e)),
        };

        let (data, replies) = self.filter.process(&buffer[..n]);
        if !replies.is_empty() {
            tracing::trace!(bytes = replies.len(), "Refusing telnet options");
            if let Some(stream) = self.stream.as_mut() {
                if let Err(e) = stream.write_all(&replies) {
                    return Err(self.fail(e));
                }
            }
        }
        Ok(data)
    }

    /// Read until `pattern` is seen or `timeout` expires.
    /// Returns whatever arrived, which may not contain `pattern`.
    pub fn read_until(&mut self, pattern: &[u8], timeout: Duration) -> Result<Bytes, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut collected = BytesMut::new();

        loop {
            let chunk = self.read_chunk()?;
            collected.extend_from_slice(&chunk);
            let found = !pattern.is_empty()
                && collected.windows(pattern.len()).any(|w| w == pattern);
            if found || Instant::now() >= deadline {
                break;
            }
        }

        self.stats.record_received(collected.len());
        Ok(collected.freeze())
    }

    /// Send `command` followed by a newline and return the first reply
    pub fn execute(&mut self, command: &str) -> Result<Bytes, TransportError> {
        self.write(format!("{command}\n").as_bytes())?;
        self.read()
    }
}

impl Transport for TelnetTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Telnet
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        if self.stream.is_some() {
            return Ok(());
        }

        let timeout = self.timeout();
        let addr = (self.config.host.as_str(), self.config.port)
            .to_socket_addrs()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?
            .next()
            .ok_or_else(|| {
                TransportError::ConnectionFailed(format!("No address for {}", self.config.host))
            })?;

        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(|e| match e.kind() {
            std::io::ErrorKind::TimedOut => TransportError::Timeout(timeout),
            _ => TransportError::ConnectionFailed(e.to_string()),
        })?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(timeout))?;

        self.stream = Some(stream);
        self.connected_at = Some(Instant::now());
        self.filter.clear();
        self.stats = TransportStats::default();
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        if self.stream.is_none() {
            return Err(TransportError::NotConnected);
        }
        self.close();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn read(&mut self) -> Result<Bytes, TransportError> {
        let data = self.read_chunk()?;
        self.stats.record_received(data.len());
        Ok(data)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        let escaped = escape(data);
        match stream.write_all(&escaped).and_then(|()| stream.flush()) {
            Ok(()) => {
                self.stats.record_sent(data.len());
                Ok(data.len())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn connection_info(&self) -> String {
        format!("telnet://{}:{}", self.config.host, self.config.port)
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot(self.connected_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_options_refused_and_stripped() {
        let mut filter = CommandFilter::default();
        let (data, replies) = filter.process(&[b'o', IAC, DO, 1, b'k', IAC, WILL, 3, IAC, IAC]);
        assert_eq!(&data[..], &[b'o', b'k', IAC]);
        assert_eq!(replies, vec![IAC, WONT, 1, IAC, DONT, 3]);
    }

    #[test]
    fn test_split_command_carried_over() {
        let mut filter = CommandFilter::default();
        let (data, replies) = filter.process(&[b'a', IAC]);
        assert_eq!(&data[..], b"a");
        assert!(replies.is_empty());

        let (data, replies) = filter.process(&[DO, 24, b'b']);
        assert_eq!(&data[..], b"b");
        assert_eq!(replies, vec![IAC, WONT, 24]);
    }

    #[test]
    fn test_subnegotiation_skipped() {
        let mut filter = CommandFilter::default();
        let (data, _) = filter.process(&[IAC, SB, 24, 1, IAC, SE, b'x']);
        assert_eq!(&data[..], b"x");

        let (data, _) = filter.process(&[IAC, SB, 24, 1]);
        assert!(data.is_empty());
        let (data, _) = filter.process(&[IAC, SE, b'y']);
        assert_eq!(&data[..], b"y");
    }

    #[test]
    fn test_escape_doubles_iac() {
        assert_eq!(escape(&[1, IAC, 2]), vec![1, IAC, IAC, 2]);
    }

    #[test]
    fn test_exchange_with_negotiating_server() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(&[IAC, DO, 31]).unwrap();
            let mut reply = [0u8; 3];
            stream.read_exact(&mut reply).unwrap();
            stream.write_all(b"login: ").unwrap();
            reply
        });

        let mut transport =
            TelnetTransport::new(TelnetConfig::new("127.0.0.1").port(port)).unwrap();
        transport.connect().unwrap();
        let banner = transport.read_until(b"login:", Duration::from_secs(5)).unwrap();
        assert_eq!(&banner[..], b"login: ");
        assert_eq!(server.join().unwrap(), [IAC, WONT, 31]);
        transport.disconnect().unwrap();
    }
}
