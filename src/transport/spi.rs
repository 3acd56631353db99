//! SPI transport over Linux spidev

use super::{config_from_fields, Transport, TransportError, TransportKind, TransportStats};
use crate::config::SessionSettings;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// SPI transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpiConfig {
    /// Bus number, the `B` in `/dev/spidevB.C`
    pub bus_number: u32,
    /// Chip select, the `C` in `/dev/spidevB.C`
    pub device_number: u32,
    /// Clock polarity and phase (0..=3)
    pub mode: u8,
    /// Maximum clock speed in Hz
    pub max_speed_hz: u32,
    /// Bytes clocked in by one read
    pub read_size: usize,
    /// Attempts for open, read and write
    pub retries: u32,
    /// Pause between attempts in seconds
    pub retry_delay: f64,
}

impl Default for SpiConfig {
    fn default() -> Self {
        Self {
            bus_number: 0,
            device_number: 0,
            mode: 0,
            max_speed_hz: 500_000,
            read_size: 32,
            retries: 3,
            retry_delay: 0.1,
        }
    }
}

impl SpiConfig {
    /// Device node path
    pub fn device_path(&self) -> PathBuf {
        PathBuf::from(format!("/dev/spidev{}.{}", self.bus_number, self.device_number))
    }

    fn validate(&self) -> Result<(), TransportError> {
        if self.mode > 3 {
            return Err(TransportError::InvalidConfiguration(format!(
                "mode must be 0 to 3, got {}",
                self.mode
            )));
        }
        if self.max_speed_hz == 0 || self.read_size == 0 || self.retries == 0 {
            return Err(TransportError::InvalidConfiguration(
                "max_speed_hz, read_size and retries must be non-zero".to_string(),
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

    const SPI_IOC_MAGIC: u8 = b'k';

    /// `struct spi_ioc_transfer` from linux/spi/spidev.h
    #[repr(C)]
    #[derive(Debug, Default)]
    pub struct SpiIocTransfer {
        tx_buf: u64,
        rx_buf: u64,
        len: u32,
        speed_hz: u32,
        delay_usecs: u16,
        bits_per_word: u8,
        cs_change: u8,
        tx_nbits: u8,
        rx_nbits: u8,
        word_delay_usecs: u8,
        pad: u8,
    }

    nix::ioctl_write_ptr!(spi_write_mode, SPI_IOC_MAGIC, 1, u8);
    nix::ioctl_write_ptr!(spi_write_bits_per_word, SPI_IOC_MAGIC, 3, u8);
    nix::ioctl_write_ptr!(spi_write_max_speed_hz, SPI_IOC_MAGIC, 4, u32);
    nix::ioctl_write_buf!(spi_message, SPI_IOC_MAGIC, 0, SpiIocTransfer);

    pub fn open(path: &Path, mode: u8, speed_hz: u32) -> io::Result<File> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let fd = file.as_raw_fd();
        let bits: u8 = 8;
        // SAFETY: `fd` is open and the pointees outlive each call
        unsafe {
            spi_write_mode(fd, &mode)?;
            spi_write_bits_per_word(fd, &bits)?;
            spi_write_max_speed_hz(fd, &speed_hz)?;
        }
        Ok(file)
    }

    /// Full-duplex exchange; the returned buffer has the length of `tx`
    pub fn transfer(file: &File, tx: &[u8], speed_hz: u32) -> io::Result<Vec<u8>> {
        let mut rx = vec![0u8; tx.len()];
        let transfer = SpiIocTransfer {
            tx_buf: tx.as_ptr() as u64,
            rx_buf: rx.as_mut_ptr() as u64,
            len: u32::try_from(tx.len()).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?,
            speed_hz,
            bits_per_word: 8,
            ..SpiIocTransfer::default()
        };
        // SAFETY: both buffers are live and `len` bytes long for the whole call
        unsafe {
            spi_message(file.as_raw_fd(), std::slice::from_ref(&transfer))?;
        }
        Ok(rx)
    }
}

/// SPI transport
pub struct SpiTransport {
    config: SpiConfig,
    #[cfg(target_os = "linux")]
    device: Option<std::fs::File>,
    stats: TransportStats,
    connected_at: Option<Instant>,
}

impl SpiTransport {
    /// Create a new SPI transport
    pub fn new(config: SpiConfig) -> Result<Self, TransportError> {
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
        Self::new(config_from_fields(TransportKind::Spi, fields)?)
    }

    /// Configuration in use
    pub fn config(&self) -> &SpiConfig {
        &self.config
    }
}

#[cfg(target_os = "linux")]
impl SpiTransport {
    fn fail(&mut self, err: std::io::Error) -> TransportError {
        self.stats.record_error();
        self.device = None;
        self.connected_at = None;
        TransportError::IoError(err)
    }

    /// Clock out `data` while clocking in the same number of bytes
    pub fn transfer(&mut self, data: &[u8]) -> Result<Bytes, TransportError> {
        let device = self.device.as_ref().ok_or(TransportError::NotConnected)?;
        let speed = self.config.max_speed_hz;
        let result = super::with_retries(self.config.retries, self.config.retry_delay(), || {
            sys::transfer(device, data, speed)
        });
        match result {
            Ok(rx) => {
                self.stats.record_sent(data.len());
                self.stats.record_received(rx.len());
                Ok(Bytes::from(rx))
            }
            Err(e) => Err(self.fail(e)),
        }
    }
}

#[cfg(target_os = "linux")]
impl Transport for SpiTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Spi
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        if self.device.is_some() {
            return Ok(());
        }
        let path = self.config.device_path();
        let (mode, speed) = (self.config.mode, self.config.max_speed_hz);
        let device = super::with_retries(self.config.retries, self.config.retry_delay(), || {
            sys::open(&path, mode, speed)
        })
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => TransportError::PortNotFound(path.display().to_string()),
            std::io::ErrorKind::PermissionDenied => {
                TransportError::PermissionDenied(path.display().to_string())
            }
            _ => TransportError::ConnectionFailed(format!("{}: {e}", path.display())),
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
            "{} mode {} @ {} Hz",
            self.config.device_path().display(),
            self.config.mode,
            self.config.max_speed_hz
        )
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot(self.connected_at)
    }
}

#[cfg(not(target_os = "linux"))]
impl Transport for SpiTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Spi
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("spidev requires Linux".to_string()))
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
