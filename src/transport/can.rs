//! SocketCAN transport (Linux)
//!
//! Raw CAN socket bound to one interface. Each write sends one classic frame
//! with the configured arbitration ID; each read returns the payload of the
//! next matching frame.

#[cfg(target_os = "linux")]
use super::is_timeout;
use super::{config_from_fields, Transport, TransportError, TransportKind, TransportStats};
use crate::config::SessionSettings;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Largest classic CAN payload
pub const MAX_PAYLOAD: usize = 8;

const STANDARD_ID_MAX: u32 = 0x7FF;
const EXTENDED_ID_MAX: u32 = 0x1FFF_FFFF;

/// CAN transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanConfig {
    /// Interface name
    pub channel: String,
    /// Identifier used for outgoing frames and for filtering incoming ones
    pub arbitration_id: u32,
    /// 29-bit identifiers
    pub extended: bool,
    /// Return frames with any identifier
    pub accept_all: bool,
    /// Read timeout in seconds
    pub timeout: f64,
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            channel: "vcan0".to_string(),
            arbitration_id: 0x100,
            extended: false,
            accept_all: false,
            timeout: 1.0,
        }
    }
}

impl CanConfig {
    fn validate(&self) -> Result<(), TransportError> {
        let max = if self.extended { EXTENDED_ID_MAX } else { STANDARD_ID_MAX };
        if self.arbitration_id > max {
            return Err(TransportError::InvalidConfiguration(format!(
                "arbitration_id {:#x} exceeds {max:#x}",
                self.arbitration_id
            )));
        }
        if self.channel.is_empty() {
            return Err(TransportError::InvalidConfiguration("channel is empty".to_string()));
        }
        if !self.timeout.is_finite() || self.timeout < 0.0 {
            return Err(TransportError::InvalidConfiguration(format!(
                "timeout must be a non-negative number of seconds, got {}",
                self.timeout
            )));
        }
        Ok(())
    }
}

/// One classic CAN frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    /// Identifier without flag bits
    pub id: u32,
    /// 29-bit identifier
    pub extended: bool,
    /// Payload, at most [`MAX_PAYLOAD`] bytes
    pub data: Bytes,
}

impl CanFrame {
    /// Build a frame, rejecting oversized payloads
    pub fn new(id: u32, extended: bool, data: &[u8]) -> Result<Self, TransportError> {
        if data.len() > MAX_PAYLOAD {
            return Err(TransportError::InvalidPayload(format!(
                "CAN frame carries at most {MAX_PAYLOAD} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self {
            id,
            extended,
            data: Bytes::copy_from_slice(data),
        })
    }
}

#[cfg(target_os = "linux")]
mod sys {
    use super::CanFrame;
    use bytes::Bytes;
    use std::ffi::CString;
    use std::io;
    use std::mem;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::time::Duration;

    pub struct CanSocket {
        fd: OwnedFd,
    }

    impl CanSocket {
        pub fn open(channel: &str, timeout: Duration) -> io::Result<Self> {
            let ifname = CString::new(channel)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

            // SAFETY: socket(2) has no memory preconditions
            let raw = unsafe { libc::socket(libc::PF_CAN, libc::SOCK_RAW | libc::SOCK_CLOEXEC, libc::CAN_RAW) };
            if raw < 0 {
                return Err(io::Error::last_os_error());
            }
            // SAFETY: `raw` is a fresh descriptor owned by nobody else
            let fd = unsafe { OwnedFd::from_raw_fd(raw) };

            // SAFETY: `ifname` is a valid NUL-terminated string
            let index = unsafe { libc::if_nametoindex(ifname.as_ptr()) };
            if index == 0 {
                return Err(io::Error::last_os_error());
            }

            // SAFETY: sockaddr_can is plain data; all-zero is a valid value
            let mut addr: libc::sockaddr_can = unsafe { mem::zeroed() };
            addr.can_family = libc::sa_family_t::try_from(libc::AF_CAN)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            addr.can_ifindex = libc::c_int::try_from(index)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

            // SAFETY: `addr` outlives the call and the length matches its type
            let rc = unsafe {
                libc::bind(
                    fd.as_raw_fd(),
                    std::ptr::addr_of!(addr).cast::<libc::sockaddr>(),
                    socklen::<libc::sockaddr_can>(),
                )
            };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }

            let socket = Self { fd };
            socket.set_read_timeout(timeout)?;
            Ok(socket)
        }

        fn set_read_timeout(&self, timeout: Duration) -> io::Result<()> {
            // A zero timeval blocks forever
            let timeout = timeout.max(Duration::from_millis(1));
            let tv = libc::timeval {
                tv_sec: libc::time_t::try_from(timeout.as_secs()).unwrap_or(libc::time_t::MAX),
                tv_usec: libc::suseconds_t::try_from(timeout.subsec_micros()).unwrap_or(0),
            };
            // SAFETY: `tv` outlives the call and the length matches its type
            let rc = unsafe {
                libc::setsockopt(
                    self.fd.as_raw_fd(),
                    libc::SOL_SOCKET,
                    libc::SO_RCVTIMEO,
                    std::ptr::addr_of!(tv).cast::<libc::c_void>(),
                    socklen::<libc::timeval>(),
                )
            };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub fn send(&self, frame: &CanFrame) -> io::Result<()> {
            // SAFETY: can_frame is plain data; all-zero is a valid value
            let mut raw: libc::can_frame = unsafe { mem::zeroed() };
            raw.can_id = if frame.extended {
                (frame.id & libc::CAN_EFF_MASK) | libc::CAN_EFF_FLAG
            } else {
                frame.id & libc::CAN_SFF_MASK
            };
            raw.can_dlc = u8::try_from(frame.data.len())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            raw.data[..frame.data.len()].copy_from_slice(&frame.data);

            // SAFETY: `raw` is a valid can_frame for the whole call
            let n = unsafe {
                libc::write(
                    self.fd.as_raw_fd(),
                    std::ptr::addr_of!(raw).cast::<libc::c_void>(),
                    mem::size_of::<libc::can_frame>(),
                )
            };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub fn recv(&self) -> io::Result<CanFrame> {
            // SAFETY: can_frame is plain data; all-zero is a valid value
            let mut raw: libc::can_frame = unsafe { mem::zeroed() };
            // SAFETY: the kernel writes at most size_of::<can_frame>() bytes into `raw`
            let n = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    std::ptr::addr_of_mut!(raw).cast::<libc::c_void>(),
                    mem::size_of::<libc::can_frame>(),
                )
            };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }

            let extended = raw.can_id & libc::CAN_EFF_FLAG != 0;
            let id = if extended {
                raw.can_id & libc::CAN_EFF_MASK
            } else {
                raw.can_id & libc::CAN_SFF_MASK
            };
            let len = usize::from(raw.can_dlc).min(super::MAX_PAYLOAD);
            Ok(CanFrame {
                id,
                extended,
                data: Bytes::copy_from_slice(&raw.data[..len]),
            })
        }
    }

    fn socklen<T>() -> libc::socklen_t {
        libc::socklen_t::try_from(mem::size_of::<T>()).unwrap_or(libc::socklen_t::MAX)
    }
}

/// SocketCAN transport
pub struct CanTransport {
    config: CanConfig,
    #[cfg(target_os = "linux")]
    socket: Option<sys::CanSocket>,
    stats: TransportStats,
    connected_at: Option<Instant>,
}

impl CanTransport {
    /// Create a new CAN transport
    pub fn new(config: CanConfig) -> Result<Self, TransportError> {
        config.validate()?;
        Ok(Self {
            config,
            #[cfg(target_os = "linux")]
            socket: None,
            stats: TransportStats::default(),
            connected_at: None,
        })
    }

    /// Build from model fields
    pub fn from_fields(
        fields: &serde_yaml::Mapping,
        _session: &SessionSettings,
    ) -> Result<Self, TransportError> {
        Self::new(config_from_fields(TransportKind::Can, fields)?)
    }

    /// Configuration in use
    pub fn config(&self) -> &CanConfig {
        &self.config
    }
}

#[cfg(target_os = "linux")]
impl CanTransport {
    fn map_open_error(&self, err: std::io::Error) -> TransportError {
        match err.raw_os_error() {
            Some(libc::ENODEV | libc::ENXIO) => TransportError::PortNotFound(self.config.channel.clone()),
            Some(libc::EACCES | libc::EPERM) => {
                TransportError::PermissionDenied(self.config.channel.clone())
            }
            _ => TransportError::ConnectionFailed(format!("{}: {err}", self.config.channel)),
        }
    }

    /// Send one frame with an explicit identifier
    pub fn send_frame(&mut self, frame: &CanFrame) -> Result<(), TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::NotConnected)?;
        if let Err(e) = socket.send(frame) {
            self.stats.record_error();
            return Err(TransportError::IoError(e));
        }
        self.stats.record_sent(frame.data.len());
        Ok(())
    }

    /// Receive the next frame of any identifier; `None` when the timeout expired
    pub fn recv_frame(&mut self) -> Result<Option<CanFrame>, TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::NotConnected)?;
        match socket.recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(ref e) if is_timeout(e) => Ok(None),
            Err(e) => {
                self.stats.record_error();
                Err(TransportError::IoError(e))
            }
        }
    }
}

#[cfg(target_os = "linux")]
impl Transport for CanTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Can
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        if self.socket.is_some() {
            return Ok(());
        }
        let timeout = Duration::from_secs_f64(self.config.timeout);
        let socket = sys::CanSocket::open(&self.config.channel, timeout)
            .map_err(|e| self.map_open_error(e))?;
        self.socket = Some(socket);
        self.connected_at = Some(Instant::now());
        self.stats = TransportStats::default();
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        if self.socket.take().is_none() {
            return Err(TransportError::NotConnected);
        }
        self.connected_at = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    fn read(&mut self) -> Result<Bytes, TransportError> {
        let deadline = Instant::now() + Duration::from_secs_f64(self.config.timeout);
        loop {
            let Some(frame) = self.recv_frame()? else {
                return Ok(Bytes::new());
            };
            if self.config.accept_all
                || (frame.id == self.config.arbitration_id && frame.extended == self.config.extended)
            {
                self.stats.record_received(frame.data.len());
                return Ok(frame.data);
            }
            if Instant::now() >= deadline {
                return Ok(Bytes::new());
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let frame = CanFrame::new(self.config.arbitration_id, self.config.extended, data)?;
        self.send_frame(&frame)?;
        Ok(data.len())
    }

    fn connection_info(&self) -> String {
        format!("can://{}#{:x}", self.config.channel, self.config.arbitration_id)
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot(self.connected_at)
    }
}

#[cfg(not(target_os = "linux"))]
impl Transport for CanTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Can
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("SocketCAN requires Linux".to_string()))
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
        format!("can://{}#{:x}", self.config.channel, self.config.arbitration_id)
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot(self.connected_at)
    }
}
