//! SSH transport implementation
//!
//! Provides SSH-2 protocol support with:
//! - Password, public key and agent authentication
//! - Interactive shell channel with a PTY
//! - Single command execution

use super::{config_from_fields, is_timeout, Transport, TransportError, TransportKind, TransportStats};
use crate::config::SessionSettings;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// SSH authentication method
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SshAuth {
    /// Password authentication
    Password(String),
    /// Public key authentication
    PublicKey {
        /// Path to private key file
        private_key: PathBuf,
        /// Optional passphrase for encrypted keys
        passphrase: Option<String>,
    },
    /// SSH agent authentication
    Agent,
}

/// SSH connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// Hostname or IP address
    #[serde(alias = "hostname")]
    pub host: String,
    /// Port (default: 22)
    pub port: u16,
    /// Username
    pub username: String,
    /// Password; agent authentication when neither this nor `key_file` is set
    pub password: Option<String>,
    /// Private key file
    pub key_file: Option<PathBuf>,
    /// Passphrase for `key_file`
    pub passphrase: Option<String>,
    /// Connect and read timeout in seconds
    pub timeout: f64,
    /// Request PTY for shell
    pub request_pty: bool,
    /// Terminal type for PTY
    pub term_type: String,
    /// Terminal width
    pub term_width: u32,
    /// Terminal height
    pub term_height: u32,
}

impl SshConfig {
    /// Create a new SSH configuration with defaults
    pub fn new(host: &str, username: &str) -> Self {
        Self {
            host: host.to_string(),
            port: 22,
            username: username.to_string(),
            password: None,
            key_file: None,
            passphrase: None,
            timeout: 10.0,
            request_pty: true,
            term_type: "xterm".to_string(),
            term_width: 80,
            term_height: 24,
        }
    }

    /// Set port
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set password authentication
    #[must_use]
    pub fn password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    /// Set public key authentication
    #[must_use]
    pub fn private_key(mut self, path: PathBuf, passphrase: Option<String>) -> Self {
        self.key_file = Some(path);
        self.passphrase = passphrase;
        self
    }

    /// Authentication method implied by the configured fields.
    /// A key file wins over a password.
    pub fn auth(&self) -> SshAuth {
        match (&self.key_file, &self.password) {
            (Some(key), _) => SshAuth::PublicKey {
                private_key: key.clone(),
                passphrase: self.passphrase.clone(),
            },
            (None, Some(password)) => SshAuth::Password(password.clone()),
            (None, None) => SshAuth::Agent,
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self::new("192.168.1.83", "user")
    }
}

/// SSH transport using ssh2 crate (libssh2 bindings)
pub struct SshTransport {
    config: SshConfig,
    session: Option<ssh2::Session>,
    channel: Option<ssh2::Channel>,
    stats: TransportStats,
    connected_at: Option<Instant>,
}

fn ssh_failure(context: &str, err: &ssh2::Error) -> TransportError {
    TransportError::ConnectionFailed(format!("{context}: {err}"))
}

impl SshTransport {
    /// Create a new SSH transport
    pub fn new(config: SshConfig) -> Result<Self, TransportError> {
        if config.username.is_empty() {
            return Err(TransportError::InvalidConfiguration("username is empty".to_string()));
        }
        if !config.timeout.is_finite() || config.timeout <= 0.0 {
            return Err(TransportError::InvalidConfiguration(format!(
                "timeout must be a positive number of seconds, got {}",
                config.timeout
            )));
        }
        Ok(Self {
            config,
            session: None,
            channel: None,
            stats: TransportStats::default(),
            connected_at: None,
        })
    }

    /// Build from model fields
    pub fn from_fields(
        fields: &serde_yaml::Mapping,
        _session: &SessionSettings,
    ) -> Result<Self, TransportError> {
        Self::new(config_from_fields(TransportKind::Ssh, fields)?)
    }

    /// Configuration in use
    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    /// Authenticate with the configured method
    fn authenticate(&self, session: &ssh2::Session) -> Result<(), TransportError> {
        let username = &self.config.username;
        match self.config.auth() {
            SshAuth::Password(password) => {
                session
                    .userauth_password(username, &password)
                    .map_err(|e| ssh_failure("Password auth failed", &e))?;
            }
            SshAuth::PublicKey { private_key, passphrase } => {
                session
                    .userauth_pubkey_file(username, None, &private_key, passphrase.as_deref())
                    .map_err(|e| ssh_failure("Key auth failed", &e))?;
            }
            SshAuth::Agent => {
                let mut agent = session.agent().map_err(|e| ssh_failure("Agent connect failed", &e))?;
                agent.connect().map_err(|e| ssh_failure("Agent connect failed", &e))?;
                agent
                    .list_identities()
                    .map_err(|e| ssh_failure("Agent list failed", &e))?;

                let identities = agent.identities().unwrap_or_default();
                let authenticated = identities
                    .iter()
                    .any(|identity| agent.userauth(username, identity).is_ok());

                if !authenticated {
                    return Err(TransportError::ConnectionFailed(
                        "No valid agent identity".to_string(),
                    ));
                }
            }
        }

        if !session.authenticated() {
            return Err(TransportError::ConnectionFailed("Authentication failed".to_string()));
        }
        Ok(())
    }

    /// Open a shell channel with PTY
    fn open_shell(&self, session: &ssh2::Session) -> Result<ssh2::Channel, TransportError> {
        let mut channel = session
            .channel_session()
            .map_err(|e| ssh_failure("Channel open failed", &e))?;

        if self.config.request_pty {
            channel
                .request_pty(
                    &self.config.term_type,
                    None,
                    Some((self.config.term_width, self.config.term_height, 0, 0)),
                )
                .map_err(|e| ssh_failure("PTY request failed", &e))?;
        }

        channel.shell().map_err(|e| ssh_failure("Shell request failed", &e))?;
        Ok(channel)
    }

    fn close(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            let _ = channel.close();
            let _ = channel.wait_close();
        }
        if let Some(session) = self.session.take() {
            let _ = session.disconnect(None, "User disconnect", None);
        }
        self.connected_at = None;
    }

    fn fail(&mut self, err: std::io::Error) -> TransportError {
        self.stats.record_error();
        self.close();
        TransportError::IoError(err)
    }

    /// Execute a single command on a fresh channel and return its output
    pub fn exec(&mut self, command: &str) -> Result<String, TransportError> {
        let session = self.session.as_ref().ok_or(TransportError::NotConnected)?;

        let mut channel = session
            .channel_session()
            .map_err(|e| ssh_failure("Channel open failed", &e))?;
        channel
            .exec(command)
            .map_err(|e| TransportError::SendError(format!("Exec failed: {e}")))?;

        let mut output = String::new();
        channel.read_to_string(&mut output)?;
        channel
            .wait_close()
            .map_err(|e| TransportError::ReceiveError(e.to_string()))?;

        tracing::debug!(command, exit_status = ?channel.exit_status().ok(), "Command finished");
        Ok(output)
    }

    /// Resize the PTY
    pub fn resize_pty(&mut self, width: u32, height: u32) -> Result<(), TransportError> {
        if let Some(channel) = self.channel.as_mut() {
            channel
                .request_pty_size(width, height, None, None)
                .map_err(|e| TransportError::SendError(format!("PTY resize failed: {e}")))?;
        }
        self.config.term_width = width;
        self.config.term_height = height;
        Ok(())
    }
}

impl Transport for SshTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ssh
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }

        let timeout = Duration::from_secs_f64(self.config.timeout);
        let addr = (self.config.host.as_str(), self.config.port)
            .to_socket_addrs()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?
            .next()
            .ok_or_else(|| {
                TransportError::ConnectionFailed(format!("No address for {}", self.config.host))
            })?;

        let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|e| match e.kind() {
            std::io::ErrorKind::TimedOut => TransportError::Timeout(timeout),
            _ => TransportError::ConnectionFailed(e.to_string()),
        })?;

        let mut session = ssh2::Session::new().map_err(|e| ssh_failure("Session init failed", &e))?;
        session.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| ssh_failure("SSH handshake failed", &e))?;

        self.authenticate(&session)?;
        let channel = self.open_shell(&session)?;

        self.session = Some(session);
        self.channel = Some(channel);
        self.connected_at = Some(Instant::now());
        self.stats = TransportStats::default();
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.close();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.is_some() && self.channel.is_some()
    }

    fn read(&mut self) -> Result<Bytes, TransportError> {
        let channel = self.channel.as_mut().ok_or(TransportError::NotConnected)?;
        let mut buffer = vec![0u8; 4096];

        match channel.read(&mut buffer) {
            Ok(0) => {
                if channel.eof() {
                    self.close();
                    Err(TransportError::Disconnected)
                } else {
                    Ok(Bytes::new())
                }
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
        let channel = self.channel.as_mut().ok_or(TransportError::NotConnected)?;
        match channel.write_all(data).and_then(|()| channel.flush()) {
            Ok(()) => {
                self.stats.record_sent(data.len());
                Ok(data.len())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn connection_info(&self) -> String {
        format!(
            "ssh://{}@{}:{}",
            self.config.username, self.config.host, self.config.port
        )
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot(self.connected_at)
    }
}
