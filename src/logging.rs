//! Diagnostics setup and traffic records
//!
//! All diagnostics go through `tracing`. [`init`] installs the process-wide
//! subscriber from [`LoggingSettings`]; devices, transports and session
//! workers attach their identities as span fields.

use crate::config::LoggingSettings;
use crate::identity::Uid;
use chrono::{DateTime, Local};
use std::fmt;
use std::io;
use thiserror::Error;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{self, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter};

/// Target used for RX/TX records
pub const TRAFFIC_TARGET: &str = "labwire::traffic";

/// Logging setup errors
#[derive(Error, Debug)]
pub enum LoggingError {
    /// Unrecognized level name
    #[error("Invalid log level: {0}")]
    InvalidLevel(String),

    /// Log directory could not be prepared
    #[error("Cannot prepare log directory: {0}")]
    Directory(#[from] io::Error),

    /// Rolling appender could not be built
    #[error("Cannot create log file appender: {0}")]
    Appender(#[from] rolling::InitError),
}

/// Install the global subscriber.
///
/// The filter starts from `settings.level` and honors `RUST_LOG` directives on
/// top of it. When `settings.directory` is set, a daily rolling file keeps at
/// most `settings.max_files` files. Returns `Ok(None)` if a subscriber is
/// already installed; otherwise the guard must be held for the file writer to
/// keep flushing.
pub fn init(settings: &LoggingSettings) -> Result<Option<WorkerGuard>, LoggingError> {
    let level: Level = settings
        .level
        .parse()
        .map_err(|_| LoggingError::InvalidLevel(settings.level.clone()))?;

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    let mut guard = None;
    let mut text_file = None;
    let mut json_file = None;

    if let Some(dir) = &settings.directory {
        std::fs::create_dir_all(dir)?;
        let appender = rolling::Builder::new()
            .rotation(Rotation::DAILY)
            .filename_prefix(&settings.file_prefix)
            .filename_suffix("log")
            .max_log_files(settings.max_files.max(1))
            .build(dir)?;
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        guard = Some(file_guard);

        if settings.json {
            json_file = Some(tracing_fmt::layer().json().with_writer(writer));
        } else {
            text_file = Some(tracing_fmt::layer().with_ansi(false).with_writer(writer));
        }
    }

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_fmt::layer().with_writer(io::stderr))
        .with(text_file)
        .with(json_file)
        .try_init();

    if installed.is_err() {
        return Ok(None);
    }

    tracing::debug!(
        level = %level,
        directory = ?settings.directory,
        max_files = settings.max_files,
        "Logging initialized"
    );
    Ok(guard)
}

/// Span carried by a device
pub fn device_span(uid: Option<Uid>, class: &str, name: &str) -> tracing::Span {
    tracing::info_span!("device", uid = uid.map(Uid::get), class, name)
}

/// Span carried by a transport
pub fn transport_span(uid: Option<Uid>, duid: Option<Uid>, kind: &str, name: &str) -> tracing::Span {
    tracing::info_span!(
        "transport",
        uid = uid.map(Uid::get),
        duid = duid.map(Uid::get),
        kind,
        name
    )
}

/// Data direction of a traffic record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Received from the device
    Rx,
    /// Sent to the device
    Tx,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rx => write!(f, "RX"),
            Self::Tx => write!(f, "TX"),
        }
    }
}

/// One chunk of transport traffic
#[derive(Debug, Clone)]
pub struct TrafficRecord<'a> {
    /// Capture time
    pub timestamp: DateTime<Local>,
    /// Direction
    pub direction: Direction,
    /// Payload
    pub data: &'a [u8],
}

impl<'a> TrafficRecord<'a> {
    /// Record received bytes
    pub fn rx(data: &'a [u8]) -> Self {
        Self {
            timestamp: Local::now(),
            direction: Direction::Rx,
            data,
        }
    }

    /// Record sent bytes
    pub fn tx(data: &'a [u8]) -> Self {
        Self {
            timestamp: Local::now(),
            direction: Direction::Tx,
            data,
        }
    }

    /// Whether the payload renders cleanly as text
    pub fn is_printable(&self) -> bool {
        self.data
            .iter()
            .all(|&b| (32..127).contains(&b) || matches!(b, b'\n' | b'\r' | b'\t'))
    }

    /// Payload as escaped text
    pub fn to_text(&self) -> String {
        String::from_utf8_lossy(self.data).escape_debug().to_string()
    }

    /// Payload as upper-case hex
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.data)
    }
}

impl fmt::Display for TrafficRecord<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = if self.is_printable() {
            format!("\"{}\"", self.to_text())
        } else {
            format!("0x{}", self.to_hex())
        };
        write!(
            f,
            "[{}] {} {} ({} bytes)",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.direction,
            body,
            self.data.len()
        )
    }
}

/// Emit a traffic record at DEBUG level when that level is enabled
pub fn log_traffic(direction: Direction, data: &[u8]) {
    if data.is_empty() || !tracing::enabled!(target: TRAFFIC_TARGET, Level::DEBUG) {
        return;
    }
    let record = match direction {
        Direction::Rx => TrafficRecord::rx(data),
        Direction::Tx => TrafficRecord::tx(data),
    };
    tracing::debug!(target: TRAFFIC_TARGET, "{record}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_printable_record_renders_text() {
        let record = TrafficRecord::tx(b"PING\r\n");
        assert!(record.is_printable());
        let line = record.to_string();
        assert!(line.contains("TX"));
        assert!(line.contains("PING\\r\\n"));
        assert!(line.contains("6 bytes"));
    }

    #[test]
    fn test_binary_record_renders_hex() {
        let record = TrafficRecord::rx(&[0x00, 0xFF, 0x10]);
        assert!(!record.is_printable());
        assert_eq!(record.to_hex(), "00FF10");
        assert!(record.to_string().contains("RX 0x00FF10"));
    }

    #[test]
    fn test_invalid_level_rejected() {
        let settings = LoggingSettings {
            level: "chatty".to_string(),
            ..LoggingSettings::default()
        };
        assert!(matches!(init(&settings), Err(LoggingError::InvalidLevel(_))));
    }
}
