//! Serial port transport implementation

use super::{config_from_fields, is_timeout, Transport, TransportError, TransportKind, TransportStats};
use crate::config::SessionSettings;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{Read, Write};
use std::time::{Duration, Instant};

/// Serial port flow control type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialFlowControl {
    /// No flow control
    #[default]
    #[serde(alias = "None")]
    None,
    /// Hardware flow control (RTS/CTS)
    #[serde(alias = "Hardware", alias = "rtscts")]
    Hardware,
    /// Software flow control (XON/XOFF)
    #[serde(alias = "Software", alias = "xonxoff")]
    Software,
}

/// Serial port parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialParity {
    /// No parity
    #[default]
    #[serde(alias = "None", alias = "N")]
    None,
    /// Odd parity
    #[serde(alias = "Odd", alias = "O")]
    Odd,
    /// Even parity
    #[serde(alias = "Even", alias = "E")]
    Even,
}

/// Serial port configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Port name (e.g., COM3, /dev/ttyUSB0)
    pub port: String,
    /// Baud rate
    pub baudrate: u32,
    /// Read timeout in seconds
    pub timeout: f64,
    /// Data bits (5, 6, 7, 8)
    pub data_bits: u8,
    /// Stop bits (1, 2)
    pub stop_bits: u8,
    /// Parity
    pub parity: SerialParity,
    /// Flow control
    pub flow_control: SerialFlowControl,
    /// Maximum bytes returned by one read
    pub read_size: usize,
}

impl SerialConfig {
    /// Create a new serial configuration with default settings
    pub fn new(port: &str, baudrate: u32) -> Self {
        Self {
            port: port.to_string(),
            baudrate,
            timeout: 1.0,
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
            flow_control: SerialFlowControl::None,
            read_size: 4096,
        }
    }

    /// Set data bits
    #[must_use]
    pub fn data_bits(mut self, bits: u8) -> Self {
        self.data_bits = bits;
        self
    }

    /// Set stop bits
    #[must_use]
    pub fn stop_bits(mut self, bits: u8) -> Self {
        self.stop_bits = bits;
        self
    }

    /// Set parity
    #[must_use]
    pub fn parity(mut self, parity: SerialParity) -> Self {
        self.parity = parity;
        self
    }

    /// Set flow control
    #[must_use]
    pub fn flow_control(mut self, flow: SerialFlowControl) -> Self {
        self.flow_control = flow;
        self
    }

    /// Set read timeout in seconds
    #[must_use]
    pub fn timeout(mut self, secs: f64) -> Self {
        self.timeout = secs;
        self
    }

    fn validate(&self) -> Result<(), TransportError> {
        if self.port.is_empty() {
            return Err(TransportError::InvalidConfiguration("port name is empty".to_string()));
        }
        if self.baudrate == 0 {
            return Err(TransportError::InvalidConfiguration(
                "baudrate must be positive".to_string(),
            ));
        }
        if !self.timeout.is_finite() || self.timeout <= 0.0 {
            return Err(TransportError::InvalidConfiguration(format!(
                "timeout must be a positive number of seconds, got {}",
                self.timeout
            )));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(TransportError::InvalidConfiguration(format!(
                "data_bits must be 5 to 8, got {}",
                self.data_bits
            )));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(TransportError::InvalidConfiguration(format!(
                "stop_bits must be 1 or 2, got {}",
                self.stop_bits
            )));
        }
        Ok(())
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self::new("COM1", 9600)
    }
}

/// Serial port transport
pub struct SerialTransport {
    config: SerialConfig,
    port: Option<Box<dyn SerialPort>>,
    stats: TransportStats,
    connected_at: Option<Instant>,
}

impl SerialTransport {
    /// Create a new serial transport
    pub fn new(config: SerialConfig) -> Result<Self, TransportError> {
        config.validate()?;
        Ok(Self {
            config,
            port: None,
            stats: TransportStats::default(),
            connected_at: None,
        })
    }

    /// Build from model fields
    pub fn from_fields(
        fields: &serde_yaml::Mapping,
        _session: &SessionSettings,
    ) -> Result<Self, TransportError> {
        Self::new(config_from_fields(TransportKind::Serial, fields)?)
    }

    /// Configuration in use
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    fn close(&mut self) {
        self.port = None;
        self.connected_at = None;
    }

    fn fail(&mut self, err: std::io::Error) -> TransportError {
        self.stats.record_error();
        self.close();
        TransportError::IoError(err)
    }

    /// Read until `delimiter` is seen, `max` bytes arrived or the timeout expired
    pub fn read_until(&mut self, delimiter: u8, max: usize) -> Result<Bytes, TransportError> {
        let mut line = BytesMut::new();
        let mut byte = [0u8; 1];

        while line.len() < max {
            let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;
            match port.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {
                    line.extend_from_slice(&byte);
                    if byte[0] == delimiter {
                        break;
                    }
                }
                Err(ref e) if is_timeout(e) => break,
                Err(e) => return Err(self.fail(e)),
            }
        }

        self.stats.record_received(line.len());
        Ok(line.freeze())
    }

    /// Read one `\n` terminated line
    pub fn read_line(&mut self) -> Result<Bytes, TransportError> {
        let max = self.config.read_size;
        self.read_until(b'\n', max)
    }

    /// Hold a break condition for `duration`
    pub fn send_break(&mut self, duration: Duration) -> Result<(), TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;
        port.set_break().map_err(|e| TransportError::IoError(e.into()))?;
        std::thread::sleep(duration);
        port.clear_break().map_err(|e| TransportError::IoError(e.into()))
    }

    /// Drive the DTR line
    pub fn set_dtr(&mut self, state: bool) -> Result<(), TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;
        port.write_data_terminal_ready(state)
            .map_err(|e| TransportError::IoError(e.into()))
    }

    /// Drive the RTS line
    pub fn set_rts(&mut self, state: bool) -> Result<(), TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;
        port.write_request_to_send(state)
            .map_err(|e| TransportError::IoError(e.into()))
    }
}

impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        if self.port.is_some() {
            return Ok(());
        }

        let data_bits = match self.config.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };

        let stop_bits = match self.config.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        };

        let parity = match self.config.parity {
            SerialParity::Odd => Parity::Odd,
            SerialParity::Even => Parity::Even,
            SerialParity::None => Parity::None,
        };

        let flow_control = match self.config.flow_control {
            SerialFlowControl::Hardware => FlowControl::Hardware,
            SerialFlowControl::Software => FlowControl::Software,
            SerialFlowControl::None => FlowControl::None,
        };

        let port = serialport::new(&self.config.port, self.config.baudrate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(flow_control)
            .timeout(Duration::from_secs_f64(self.config.timeout))
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => {
                    TransportError::PortNotFound(self.config.port.clone())
                }
                serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
                    TransportError::PortNotFound(self.config.port.clone())
                }
                serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                    TransportError::PermissionDenied(self.config.port.clone())
                }
                _ => TransportError::ConnectionFailed(e.to_string()),
            })?;

        self.port = Some(port);
        self.connected_at = Some(Instant::now());
        self.stats = TransportStats::default();
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        if self.port.is_none() {
            return Err(TransportError::NotConnected);
        }
        self.close();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn read(&mut self) -> Result<Bytes, TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;
        let mut buffer = vec![0u8; self.config.read_size];

        match port.read(&mut buffer) {
            Ok(n) => {
                buffer.truncate(n);
                self.stats.record_received(n);
                Ok(Bytes::from(buffer))
            }
            // No data within the port timeout
            Err(ref e) if is_timeout(e) => Ok(Bytes::new()),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;
        let result = port.write_all(data).and_then(|()| port.flush());
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
            "{} @ {} baud ({}{}{} {})",
            self.config.port,
            self.config.baudrate,
            self.config.data_bits,
            match self.config.parity {
                SerialParity::None => "N",
                SerialParity::Odd => "O",
                SerialParity::Even => "E",
            },
            self.config.stop_bits,
            match self.config.flow_control {
                SerialFlowControl::None => "No FC",
                SerialFlowControl::Hardware => "HW FC",
                SerialFlowControl::Software => "SW FC",
            }
        )
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot(self.connected_at)
    }
}

/// List available serial ports
pub fn list_ports() -> Result<Vec<serialport::SerialPortInfo>, TransportError> {
    serialport::available_ports().map_err(|e| TransportError::IoError(e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_with_aliases() {
        let fields: serde_yaml::Mapping = serde_yaml::from_str(
            "port: /dev/ttyUSB0\nbaudrate: 115200\nparity: E\nflow_control: rtscts\nstop_bits: 2\n",
        )
        .unwrap();
        let transport = SerialTransport::from_fields(&fields, &SessionSettings::default()).unwrap();
        let config = transport.config();
        assert_eq!(config.baudrate, 115_200);
        assert_eq!(config.parity, SerialParity::Even);
        assert_eq!(config.flow_control, SerialFlowControl::Hardware);
        assert_eq!(transport.connection_info(), "/dev/ttyUSB0 @ 115200 baud (8E2 HW FC)");
    }

    #[test]
    fn test_invalid_settings_rejected() {
        assert!(SerialTransport::new(SerialConfig::new("COM3", 0)).is_err());
        assert!(SerialTransport::new(SerialConfig::new("COM3", 9600).timeout(0.0)).is_err());
        assert!(SerialTransport::new(SerialConfig::new("COM3", 9600).data_bits(9)).is_err());
    }

    #[test]
    fn test_missing_port_fails_to_connect() {
        let mut transport =
            SerialTransport::new(SerialConfig::new("/dev/labwire-no-such-port", 9600)).unwrap();
        assert!(transport.connect().is_err());
        assert!(!transport.is_connected());
        assert!(matches!(transport.read(), Err(TransportError::NotConnected)));
        assert!(matches!(transport.disconnect(), Err(TransportError::NotConnected)));
    }
}
