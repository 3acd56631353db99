//! I2C transport over Linux i2c-dev

use super::{config_from_fields, Transport, TransportError, TransportKind, TransportStats};
use crate::config::SessionSettings;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Highest 7-bit device address
pub const MAX_ADDRESS: u16 = 0x7F;

/// I2C transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct I2cConfig {
    /// Bus number, the `N` in `/dev/i2c-N`
    pub bus_number: u32,
    /// 7-bit device address
    pub device_address: u16,
    /// Bytes returned by one read
    pub read_size: usize,
    /// Attempts for open, read and write
    pub retries: u32,
    /// Pause between attempts in seconds
    pub retry_delay: f64,
}

impl Default for I2cConfig {
    fn default() -> Self {
        Self {
            bus_number: 1,
            device_address: 0x20,
            read_size: 16,
            retries: 3,
            retry_delay: 0.1,
        }
    }
}

impl I2cConfig {
    /// Device node path
    pub fn device_path(&self) -> PathBuf {
        PathBuf::from(format!("/dev/i2c-{}", self.bus_number))
    }

    fn validate(&self) -> Result<(), TransportError> {
        if self.device_address > MAX_ADDRESS {
            return Err(TransportError::InvalidConfiguration(format!(
                "device_address must be between 0 and {MAX_ADDRESS:#x}, got {:#x}",
                self.device_address
            )));
        }
        if self.read_size == 0 || self.retries == 0 {
            return Err(TransportError::InvalidConfiguration(
                "read_size and retries must be non-zero".to_string(),
            ));
        }
        if !self.retry_delay.is_finite() || self.retry_delay < 0.0 {
            return Err(TransportError::InvalidConfiguration(format!(
                "retry_delay must be a non-negative number of seconds, got {}",
                self.retry_delay
            )));
        }
        Ok(())
    }

    fn retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay)
    }
}

#[cfg(target_os = "linux")]
mod sys {
    use std::fs::{File, OpenOptions};
    use std::io;
    use std::os::fd::AsRawFd;
    use std::path::Path;

    const I2C_SLAVE: u16 = 0x0703;

    nix::ioctl_write_int_bad!(i2c_set_slave, I2C_SLAVE);

    pub fn open(path: &Path, address: u16) -> io::Result<File> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        // SAFETY: `file` is open for the whole call
        unsafe {
            i2c_set_slave(file.as_raw_fd(), libc::c_int::from(address))?;
        }
        Ok(file)
    }
}

/// I2C transport
pub struct I2cTransport {
    config: I2cConfig,
    #[cfg(target_os = "linux")]
    device: Option<std::fs::File>,
    stats: TransportStats,
    connected_at: Option<Instant>,
}

impl I2cTransport {
    /// Create a new I2C transport
    pub fn new(config: I2cConfig) -> Result<Self, TransportError> {
        config.validate()?;
        Ok(Self {
            config,
            #[cfg(target_os = "linux")]
            device: None,
            stats: TransportStats::default(),
            connected_at: None,
        })
    }

    /// Build from model fields
    pub fn from_fields(
        fields: &serde_yaml::Mapping,
        _session: &SessionSettings,
    ) -> Result<Self, TransportError> {
        Self::new(config_from_fields(TransportKind::I2c, fields)?)
    }

    /// Configuration in use
    pub fn config(&self) -> &I2cConfig {
        &self.config
    }
}

#[cfg(target_os = "linux")]
impl I2cTransport {
    fn fail(&mut self, err: std::io::Error) -> TransportError {
        self.stats.record_error();
        self.device = None;
        self.connected_at = None;
        TransportError::IoError(err)
    }

    /// Write `data` to register `register`
    pub fn write_register(&mut self, register: u8, data: &[u8]) -> Result<(), TransportError> {
        let mut message = Vec::with_capacity(data.len() + 1);
        message.push(register);
        message.extend_from_slice(data);
        self.write(&message).map(|_| ())
    }

    /// Read `length` bytes starting at register `register`
    pub fn read_register(&mut self, register: u8, length: usize) -> Result<Bytes, TransportError> {
        use std::io::{Read, Write};

        let mut device = self.device.as_ref().ok_or(TransportError::NotConnected)?;
        let mut buffer = vec![0u8; length];
        let result = super::with_retries(self.config.retries, self.config.retry_delay(), || {
            device.write_all(&[register])?;
            device.read_exact(&mut buffer)
        });
        match result {
            Ok(()) => {
                self.stats.record_sent(1);
                self.stats.record_received(length);
                Ok(Bytes::from(buffer))
            }
            Err(e) => Err(self.fail(e)),
        }
    }
}

#[cfg(target_os = "linux")]
impl Transport for I2cTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::I2c
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        if self.device.is_some() {
            return Ok(());
        }
        let path = self.config.device_path();
        let address = self.config.device_address;
        let device = super::with_retries(self.config.retries, self.config.retry_delay(), || {
            sys::open(&path, address)
        })
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => TransportError::PortNotFound(path.display().to_string()),
            std::io::ErrorKind::PermissionDenied => {
                TransportError::PermissionDenied(path.display().to_string())
            }
            _ => TransportError::ConnectionFailed(format!(
                "I2C device {address:#04x} on {}: {e}",
                path.display()
            )),
        })?;

        self.device = Some(device);
        self.connected_at = Some(Instant::now());
        self.stats = TransportStats::default();
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        if self.device.take().is_none() {
            return Err(TransportError::NotConnected);
        }
        self.connected_at = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.device.is_some()
    }

    fn read(&mut self) -> Result<Bytes, TransportError> {
        use std::io::Read;

        let mut device = self.device.as_ref().ok_or(TransportError::NotConnected)?;
        let mut buffer = vec![0u8; self.config.read_size];
        let result = super::with_retries(self.config.retries, self.config.retry_delay(), || {
            device.read(&mut buffer)
        });
        match result {
            Ok(n) => {
                buffer.truncate(n);
                self.stats.record_received(n);
                Ok(Bytes::from(buffer))
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        use std::io::Write;

        let mut device = self.device.as_ref().ok_or(TransportError::NotConnected)?;
        let result = super::with_retries(self.config.retries, self.config.retry_delay(), || {
            device.write_all(data)
        });
        match result {
            Ok(()) => {
                self.stats.record_sent(data.len());
                Ok(data.len())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn connection_info(&self) -> String {
        format!(
            "{} @ {:#04x}",
            self.config.device_path().display(),
            self.config.device_address
        )
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot(self.connected_at)
    }
}

#[cfg(not(target_os = "linux"))]
impl Transport for I2cTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::I2c
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("i2c-dev requires Linux".to_string()))
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        Err(TransportError::NotConnected)
    }

    fn is_connected(&self) -> bool {
        false
    }

    fn read(&mut self) -> Result<Bytes, TransportError> {
        Err(TransportError::NotConnected)
    }

    fn write(&mut self, _data: &[u8]) -> Result<usize, TransportError> {
        Err(TransportError::NotConnected)
    }

    fn connection_info(&self) -> String {
        self.config.device_path().display().to_string()
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot(self.connected_at)
    }
}
