//! Bluetooth LE transport
//!
//! Talks to a UART-style GATT service: writes go to the TX characteristic,
//! notifications from the RX characteristic are queued for [`Transport::read`].
//! btleplug is async, so each transport drives it on a private single-worker
//! tokio runtime and exposes a blocking interface.

use super::{config_from_fields, Transport, TransportError, TransportKind, TransportStats};
use crate::config::SessionSettings;
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;
use uuid::Uuid;

/// Nordic UART Service
pub const NUS_SERVICE: Uuid = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e_24dc_ca9e);
/// Nordic UART TX characteristic (central writes)
pub const NUS_TX: Uuid = Uuid::from_u128(0x6e40_0002_b5a3_f393_e0a9_e50e_24dc_ca9e);
/// Nordic UART RX characteristic (peripheral notifies)
pub const NUS_RX: Uuid = Uuid::from_u128(0x6e40_0003_b5a3_f393_e0a9_e50e_24dc_ca9e);

/// Bluetooth connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Device name or address
    #[serde(alias = "mac_address")]
    pub device: String,
    /// Service UUID
    pub service_uuid: Uuid,
    /// TX Characteristic UUID (for writing)
    pub tx_characteristic: Uuid,
    /// RX Characteristic UUID (for notifications)
    pub rx_characteristic: Uuid,
    /// Read wait in seconds
    pub timeout: f64,
    /// Connection timeout in seconds
    pub connect_timeout: f64,
    /// How long to scan before looking for the device, in seconds
    pub scan_secs: f64,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            service_uuid: NUS_SERVICE,
            tx_characteristic: NUS_TX,
            rx_characteristic: NUS_RX,
            timeout: 1.0,
            connect_timeout: 10.0,
            scan_secs: 3.0,
        }
    }
}

impl BluetoothConfig {
    fn validate(&self) -> Result<(), TransportError> {
        if self.device.is_empty() {
            return Err(TransportError::InvalidConfiguration(
                "device name or address is required".to_string(),
            ));
        }
        for (field, value) in [
            ("timeout", self.timeout),
            ("connect_timeout", self.connect_timeout),
            ("scan_secs", self.scan_secs),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(TransportError::InvalidConfiguration(format!(
                    "{field} must be a non-negative number of seconds, got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Discovered Bluetooth device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Device name
    pub name: String,
    /// Device address
    pub address: String,
    /// RSSI (signal strength)
    pub rssi: Option<i16>,
    /// Advertised services
    pub services: Vec<Uuid>,
}

fn runtime() -> Result<Runtime, TransportError> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("labwire-ble")
        .enable_all()
        .build()
        .map_err(TransportError::IoError)
}

fn ble_failure(context: &str, err: &btleplug::Error) -> TransportError {
    TransportError::ConnectionFailed(format!("{context}: {err}"))
}

async fn first_adapter() -> Result<Adapter, TransportError> {
    let manager = Manager::new()
        .await
        .map_err(|e| ble_failure("Failed to create Bluetooth manager", &e))?;
    let adapters = manager
        .adapters()
        .await
        .map_err(|e| ble_failure("Failed to get adapters", &e))?;
    adapters
        .into_iter()
        .next()
        .ok_or_else(|| TransportError::ConnectionFailed("No Bluetooth adapter found".to_string()))
}

async fn scan_peripherals(adapter: &Adapter, duration: Duration) -> Result<Vec<Peripheral>, TransportError> {
    adapter
        .start_scan(ScanFilter::default())
        .await
        .map_err(|e| ble_failure("Failed to start scan", &e))?;
    tokio::time::sleep(duration).await;
    let peripherals = adapter
        .peripherals()
        .await
        .map_err(|e| ble_failure("Failed to get peripherals", &e))?;
    adapter
        .stop_scan()
        .await
        .map_err(|e| ble_failure("Failed to stop scan", &e))?;
    Ok(peripherals)
}

/// Scan for advertising devices for `duration`
pub fn discover(duration: Duration) -> Result<Vec<DiscoveredDevice>, TransportError> {
    let rt = runtime()?;
    rt.block_on(async {
        let adapter = first_adapter().await?;
        let mut devices = Vec::new();
        for peripheral in scan_peripherals(&adapter, duration).await? {
            if let Ok(Some(props)) = peripheral.properties().await {
                devices.push(DiscoveredDevice {
                    name: props.local_name.unwrap_or_else(|| "Unknown".to_string()),
                    address: peripheral.id().to_string(),
                    rssi: props.rssi,
                    services: props.services,
                });
            }
        }
        Ok(devices)
    })
}

/// Live connection state
struct Connection {
    runtime: Runtime,
    peripheral: Peripheral,
    tx_char: Characteristic,
    inbound: Receiver<Bytes>,
    forwarder: tokio::task::JoinHandle<()>,
}

/// Bluetooth BLE transport
pub struct BluetoothTransport {
    config: BluetoothConfig,
    connection: Option<Connection>,
    stats: Arc<RwLock<TransportStats>>,
    connected_at: Option<Instant>,
}

impl BluetoothTransport {
    /// Create a new Bluetooth transport
    pub fn new(config: BluetoothConfig) -> Result<Self, TransportError> {
        config.validate()?;
        Ok(Self {
            config,
            connection: None,
            stats: Arc::new(RwLock::new(TransportStats::default())),
            connected_at: None,
        })
    }

    /// Build from model fields
    pub fn from_fields(
        fields: &serde_yaml::Mapping,
        _session: &SessionSettings,
    ) -> Result<Self, TransportError> {
        Self::new(config_from_fields(TransportKind::Bluetooth, fields)?)
    }

    /// Configuration in use
    pub fn config(&self) -> &BluetoothConfig {
        &self.config
    }

    async fn open(
        config: &BluetoothConfig,
        stats: Arc<RwLock<TransportStats>>,
    ) -> Result<(Peripheral, Characteristic, Receiver<Bytes>, tokio::task::JoinHandle<()>), TransportError> {
        let adapter = first_adapter().await?;

        let mut found = None;
        for peripheral in scan_peripherals(&adapter, Duration::from_secs_f64(config.scan_secs)).await? {
            if let Ok(Some(props)) = peripheral.properties().await {
                let name = props.local_name.unwrap_or_default();
                if name == config.device || peripheral.id().to_string() == config.device {
                    found = Some(peripheral);
                    break;
                }
            }
        }
        let peripheral = found.ok_or_else(|| {
            TransportError::ConnectionFailed(format!("Device '{}' not found", config.device))
        })?;

        let timeout = Duration::from_secs_f64(config.connect_timeout);
        tokio::time::timeout(timeout, peripheral.connect())
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
            .map_err(|e| ble_failure("Failed to connect", &e))?;

        peripheral
            .discover_services()
            .await
            .map_err(|e| ble_failure("Failed to discover services", &e))?;

        let characteristics = peripheral.characteristics();
        let find = |uuid: Uuid, role: &str| {
            characteristics
                .iter()
                .find(|c| c.uuid == uuid && c.service_uuid == config.service_uuid)
                .cloned()
                .ok_or_else(|| TransportError::ConnectionFailed(format!("{role} characteristic not found")))
        };
        let tx_char = find(config.tx_characteristic, "TX")?;
        let rx_char = find(config.rx_characteristic, "RX")?;

        peripheral
            .subscribe(&rx_char)
            .await
            .map_err(|e| ble_failure("Failed to subscribe", &e))?;
        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| ble_failure("Failed to open notification stream", &e))?;

        let (sender, inbound) = unbounded();
        let rx_uuid = rx_char.uuid;
        let forwarder = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != rx_uuid {
                    continue;
                }
                stats.write().record_received(notification.value.len());
                if sender.send(Bytes::from(notification.value)).is_err() {
                    break;
                }
            }
        });

        Ok((peripheral, tx_char, inbound, forwarder))
    }
}

impl Transport for BluetoothTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Bluetooth
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        if self.connection.is_some() {
            return Ok(());
        }

        let runtime = runtime()?;
        *self.stats.write() = TransportStats::default();
        let (peripheral, tx_char, inbound, forwarder) =
            runtime.block_on(Self::open(&self.config, Arc::clone(&self.stats)))?;

        self.connection = Some(Connection {
            runtime,
            peripheral,
            tx_char,
            inbound,
            forwarder,
        });
        self.connected_at = Some(Instant::now());
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        let connection = self.connection.take().ok_or(TransportError::NotConnected)?;
        self.connected_at = None;

        connection.forwarder.abort();
        connection
            .runtime
            .block_on(connection.peripheral.disconnect())
            .map_err(|e| ble_failure("Failed to disconnect", &e))
    }

    fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    fn read(&mut self) -> Result<Bytes, TransportError> {
        let timeout = Duration::from_secs_f64(self.config.timeout);
        self.read_timeout(Some(timeout))
    }

    fn read_timeout(&mut self, timeout: Option<Duration>) -> Result<Bytes, TransportError> {
        let connection = self.connection.as_ref().ok_or(TransportError::NotConnected)?;
        let received = match timeout {
            Some(timeout) => connection.inbound.recv_timeout(timeout),
            None => connection.inbound.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(data) => Ok(data),
            Err(RecvTimeoutError::Timeout) => Ok(Bytes::new()),
            Err(RecvTimeoutError::Disconnected) => {
                // Notification stream ended: the peripheral went away
                self.connection = None;
                self.connected_at = None;
                Err(TransportError::Disconnected)
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let connection = self.connection.as_ref().ok_or(TransportError::NotConnected)?;
        connection
            .runtime
            .block_on(connection.peripheral.write(&connection.tx_char, data, WriteType::WithoutResponse))
            .map_err(|e| {
                self.stats.write().record_error();
                TransportError::SendError(format!("Write failed: {e}"))
            })?;
        self.stats.write().record_sent(data.len());
        Ok(data.len())
    }

    fn connection_info(&self) -> String {
        match &self.connection {
            Some(connection) => format!("BLE: {} ({})", self.config.device, connection.peripheral.id()),
            None => format!("BLE: {} (disconnected)", self.config.device),
        }
    }

    fn stats(&self) -> TransportStats {
        self.stats.read().snapshot(self.connected_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bluetooth_config_default() {
        let config = BluetoothConfig::default();
        assert_eq!(config.service_uuid.to_string(), "6e400001-b5a3-f393-e0a9-e50e24dcca9e");
        assert_eq!(config.rx_characteristic, NUS_RX);
        assert!(BluetoothTransport::new(config).is_err());
    }

    #[test]
    fn test_fields_parse_uuids() {
        let fields: serde_yaml::Mapping = serde_yaml::from_str(
            "mac_address: \"84:76:37:80:A0:B3\"\nservice_uuid: 0000ffe0-0000-1000-8000-00805f9b34fb\n",
        )
        .unwrap();
        let transport = BluetoothTransport::from_fields(&fields, &SessionSettings::default()).unwrap();
        assert_eq!(transport.config().device, "84:76:37:80:A0:B3");
        assert_eq!(
            transport.config().service_uuid,
            Uuid::parse_str("0000ffe0-0000-1000-8000-00805f9b34fb").unwrap()
        );
        assert_eq!(transport.config().tx_characteristic, NUS_TX);
        assert_eq!(transport.connection_info(), "BLE: 84:76:37:80:A0:B3 (disconnected)");
    }

    #[test]
    fn test_bad_uuid_rejected() {
        let fields: serde_yaml::Mapping =
            serde_yaml::from_str("device: sensor\nrx_characteristic: not-a-uuid\n").unwrap();
        assert!(matches!(
            BluetoothTransport::from_fields(&fields, &SessionSettings::default()),
            Err(TransportError::InvalidConfiguration(_))
        ));
    }
}
