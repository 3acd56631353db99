//! Threaded transport session
//!
//! A session owns one blocking [`Link`] on a dedicated worker thread and
//! exchanges data with callers through two FIFO queues. Each worker cycle:
//!
//! 1. sends at most one queued outbound message (or a heartbeat, if the
//!    [`HeartbeatPolicy`] asks for one);
//! 2. reads one message through the [`Framer`], bounded by the read budget;
//!    a timeout or an I/O error yields an empty message;
//! 3. queues the message for the caller;
//! 4. sleeps for the cycle interval.
//!
//! The worker only exits when [`ThreadedSession::stop`] is requested.
//! Lifecycle: `Created → Running → Stopped`, never back.

use super::{is_timeout, TransportError, TransportStats};
use crate::config::SessionSettings;
use bytes::{Bytes, BytesMut};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::{Condvar, Mutex, RwLock};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Worker spawned, connection not yet established
    Created,
    /// Connection established, worker cycling
    Running,
    /// Worker exited and connection closed
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Blocking byte pipe driven by the session worker
pub trait Link: Send {
    /// Send all of `data`
    fn send_bytes(&mut self, data: &[u8]) -> io::Result<()>;

    /// Receive into `buf`, blocking at most the link's own read timeout.
    /// Timeouts surface as `WouldBlock` or `TimedOut`.
    fn recv_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Close the link
    fn close(&mut self) {}

    /// Whether a zero-length receive is an empty message rather than end of stream
    fn is_datagram(&self) -> bool {
        false
    }
}

impl Link for TcpStream {
    fn send_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        self.write_all(data)?;
        self.flush()
    }

    fn recv_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf)
    }

    fn close(&mut self) {
        let _ = self.shutdown(Shutdown::Both);
    }
}

impl Link for UdpSocket {
    fn send_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        UdpSocket::send(self, data).map(|_| ())
    }

    fn recv_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        UdpSocket::recv(self, buf)
    }

    fn is_datagram(&self) -> bool {
        true
    }
}

/// Splits the incoming byte stream into messages
pub trait Framer: Send {
    /// Read one message from `link`, spending at most about `budget`.
    /// Returns empty bytes when no complete message arrived in time.
    fn read_frame(&mut self, link: &mut dyn Link, budget: Duration) -> io::Result<Bytes>;
}

/// Frames messages on a delimiter, keeping partial input across cycles
#[derive(Debug, Clone)]
pub struct DelimiterFramer {
    delimiter: Vec<u8>,
    pending: BytesMut,
    max_frame: usize,
}

impl Default for DelimiterFramer {
    fn default() -> Self {
        Self::new(b"\n".to_vec())
    }
}

impl DelimiterFramer {
    /// Frame on `delimiter`; an empty delimiter passes chunks through as they arrive
    pub fn new(delimiter: impl Into<Vec<u8>>) -> Self {
        Self {
            delimiter: delimiter.into(),
            pending: BytesMut::new(),
            max_frame: 64 * 1024,
        }
    }

    /// Emit an undelimited frame once this many bytes are pending
    #[must_use]
    pub fn max_frame(mut self, bytes: usize) -> Self {
        self.max_frame = bytes.max(1);
        self
    }

    /// Delimiter in use
    pub fn delimiter(&self) -> &[u8] {
        &self.delimiter
    }

    /// Bytes received but not yet framed
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    fn take_frame(&mut self) -> Option<Bytes> {
        if self.pending.is_empty() {
            return None;
        }
        if self.delimiter.is_empty() {
            return Some(self.pending.split().freeze());
        }
        if let Some(pos) = self
            .pending
            .windows(self.delimiter.len())
            .position(|w| w == self.delimiter.as_slice())
        {
            return Some(self.pending.split_to(pos + self.delimiter.len()).freeze());
        }
        if self.pending.len() >= self.max_frame {
            return Some(self.pending.split_to(self.max_frame).freeze());
        }
        None
    }
}

impl Framer for DelimiterFramer {
    fn read_frame(&mut self, link: &mut dyn Link, budget: Duration) -> io::Result<Bytes> {
        let deadline = Instant::now() + budget;
        let mut chunk = [0u8; 512];

        loop {
            if let Some(frame) = self.take_frame() {
                return Ok(frame);
            }
            if Instant::now() >= deadline {
                return Ok(Bytes::new());
            }
            match link.recv_bytes(&mut chunk) {
                Ok(0) if link.is_datagram() => return Ok(Bytes::new()),
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed the connection",
                    ))
                }
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e) if is_timeout(&e) => {}
                Err(e) => return Err(e),
            }
        }
    }
}

/// Decides when an idle session sends a keep-alive
pub trait HeartbeatPolicy: Send {
    /// Payload to send on an idle cycle, if any
    fn next_beat(&mut self, now: Instant) -> Option<Bytes>;

    /// Called after a caller message went out
    fn sent(&mut self, now: Instant) {
        let _ = now;
    }
}

/// Never sends anything on idle cycles
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHeartbeat;

impl HeartbeatPolicy for NoHeartbeat {
    fn next_beat(&mut self, _now: Instant) -> Option<Bytes> {
        None
    }
}

/// Sends a fixed payload after `interval` without traffic
#[derive(Debug, Clone)]
pub struct FixedHeartbeat {
    payload: Bytes,
    interval: Duration,
    last: Option<Instant>,
}

impl FixedHeartbeat {
    /// Send `payload` every `interval` of outbound silence
    pub fn new(payload: impl Into<Bytes>, interval: Duration) -> Self {
        Self {
            payload: payload.into(),
            interval,
            last: None,
        }
    }
}

impl HeartbeatPolicy for FixedHeartbeat {
    fn next_beat(&mut self, now: Instant) -> Option<Bytes> {
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => None,
            _ => {
                self.last = Some(now);
                Some(self.payload.clone())
            }
        }
    }

    fn sent(&mut self, now: Instant) {
        self.last = Some(now);
    }
}

/// Session timing and behavior
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Worker thread name
    pub name: String,
    /// Per-cycle read budget
    pub read_timeout: Duration,
    /// Pause between cycles
    pub cycle_sleep: Duration,
    /// Bound used when the session is dropped while running
    pub teardown_timeout: Duration,
    /// Queue empty reads for the caller too
    pub forward_empty_reads: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_settings(&SessionSettings::default())
    }
}

impl SessionConfig {
    /// Build from configured defaults
    pub fn from_settings(settings: &SessionSettings) -> Self {
        Self {
            name: "session".to_string(),
            read_timeout: settings.read_timeout(),
            cycle_sleep: settings.cycle_sleep(),
            teardown_timeout: settings.teardown_timeout(),
            forward_empty_reads: false,
        }
    }

    /// Set worker name
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set per-cycle read budget
    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set cycle pause
    #[must_use]
    pub fn cycle_sleep(mut self, sleep: Duration) -> Self {
        self.cycle_sleep = sleep;
        self
    }

    /// Set teardown bound
    #[must_use]
    pub fn teardown_timeout(mut self, timeout: Duration) -> Self {
        self.teardown_timeout = timeout;
        self
    }

    /// Queue empty reads
    #[must_use]
    pub fn forward_empty_reads(mut self, enable: bool) -> Self {
        self.forward_empty_reads = enable;
        self
    }
}

struct Shared {
    state: Mutex<SessionState>,
    changed: Condvar,
    stop: AtomicBool,
    failure: Mutex<Option<TransportError>>,
    stats: RwLock<TransportStats>,
    connected_at: Mutex<Option<Instant>>,
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
        self.changed.notify_all();
    }
}

/// Marks the session stopped however the worker exits
struct StopOnExit(Arc<Shared>);

impl Drop for StopOnExit {
    fn drop(&mut self) {
        *self.0.connected_at.lock() = None;
        self.0.set_state(SessionState::Stopped);
    }
}

/// Worker thread plus its inbound and outbound queues
pub struct ThreadedSession {
    config: SessionConfig,
    shared: Arc<Shared>,
    outbound_tx: Sender<Bytes>,
    outbound_rx: Receiver<Bytes>,
    inbound_rx: Receiver<Bytes>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ThreadedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadedSession")
            .field("name", &self.config.name)
            .field("state", &self.state())
            .field("inbound", &self.inbound_rx.len())
            .field("outbound", &self.outbound_rx.len())
            .finish()
    }
}

impl ThreadedSession {
    /// Spawn the worker and wait until it is running or has failed to connect
    pub fn start<C>(
        config: SessionConfig,
        connect: C,
        framer: Box<dyn Framer>,
        heartbeat: Box<dyn HeartbeatPolicy>,
    ) -> Result<Self, TransportError>
    where
        C: FnOnce() -> Result<Box<dyn Link>, TransportError> + Send + 'static,
    {
        let session = Self::spawn(config, connect, framer, heartbeat)?;
        if let Err(e) = session.wait_running(None) {
            if let Some(worker) = session.worker.lock().take() {
                let _ = worker.join();
            }
            return Err(e);
        }
        Ok(session)
    }

    /// Spawn the worker without waiting; the session starts in `Created`
    pub fn spawn<C>(
        config: SessionConfig,
        connect: C,
        framer: Box<dyn Framer>,
        heartbeat: Box<dyn HeartbeatPolicy>,
    ) -> Result<Self, TransportError>
    where
        C: FnOnce() -> Result<Box<dyn Link>, TransportError> + Send + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(SessionState::Created),
            changed: Condvar::new(),
            stop: AtomicBool::new(false),
            failure: Mutex::new(None),
            stats: RwLock::new(TransportStats::default()),
            connected_at: Mutex::new(None),
        });
        let (outbound_tx, outbound_rx) = unbounded();
        let (inbound_tx, inbound_rx) = unbounded();

        let worker = Worker {
            shared: Arc::clone(&shared),
            config: config.clone(),
            framer,
            heartbeat,
            outbound: outbound_rx.clone(),
            inbound: inbound_tx,
        };
        let span = tracing::info_span!("session", name = %config.name);

        let handle = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || {
                let _entered = span.entered();
                worker.run(connect);
            })
            .map_err(TransportError::IoError)?;

        Ok(Self {
            config,
            shared,
            outbound_tx,
            outbound_rx,
            inbound_rx,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Block until the worker leaves `Created`.
    /// Fails with the connect error if the worker could not connect.
    pub fn wait_running(&self, timeout: Option<Duration>) -> Result<(), TransportError> {
        let mut state = self.shared.state.lock();
        match timeout {
            None => {
                while *state == SessionState::Created {
                    self.shared.changed.wait(&mut state);
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while *state == SessionState::Created {
                    if self.shared.changed.wait_until(&mut state, deadline).timed_out() {
                        return Err(TransportError::Timeout(timeout));
                    }
                }
            }
        }

        match *state {
            SessionState::Running => Ok(()),
            _ => Err(self
                .shared
                .failure
                .lock()
                .take()
                .unwrap_or(TransportError::NotConnected)),
        }
    }

    /// Session name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    /// Whether the worker is cycling
    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }

    /// Queue `data` for sending and return its length. Never blocks.
    pub fn write(&self, data: impl Into<Bytes>) -> Result<usize, TransportError> {
        if self.state() == SessionState::Stopped {
            return Err(TransportError::NotConnected);
        }
        let data = data.into();
        let len = data.len();
        self.outbound_tx
            .send(data)
            .map_err(|_| TransportError::Disconnected)?;
        Ok(len)
    }

    /// Take the oldest inbound message.
    ///
    /// `None` waits indefinitely, a zero timeout makes one non-blocking
    /// attempt, anything else waits at most that long. An expired wait
    /// returns empty bytes. Fails with [`TransportError::Disconnected`]
    /// only once the worker has exited and the queue is drained.
    pub fn read(&self, timeout: Option<Duration>) -> Result<Bytes, TransportError> {
        match timeout {
            None => self
                .inbound_rx
                .recv()
                .map_err(|_| TransportError::Disconnected),
            Some(timeout) if timeout.is_zero() => match self.inbound_rx.try_recv() {
                Ok(data) => Ok(data),
                Err(TryRecvError::Empty) => Ok(Bytes::new()),
                Err(TryRecvError::Disconnected) => Err(TransportError::Disconnected),
            },
            Some(timeout) => match self.inbound_rx.recv_timeout(timeout) {
                Ok(data) => Ok(data),
                Err(RecvTimeoutError::Timeout) => Ok(Bytes::new()),
                Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected),
            },
        }
    }

    /// Messages waiting for the caller
    pub fn pending_inbound(&self) -> usize {
        self.inbound_rx.len()
    }

    /// Messages waiting for the wire
    pub fn pending_outbound(&self) -> usize {
        self.outbound_rx.len()
    }

    /// Drop every queued inbound message, returning how many were dropped
    pub fn flush_inbound(&self) -> usize {
        self.inbound_rx.try_iter().count()
    }

    /// Drop every message not yet sent, returning how many were dropped
    pub fn flush_outbound(&self) -> usize {
        self.outbound_rx.try_iter().count()
    }

    /// Ask the worker to stop after its current cycle
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
    }

    /// Wait for `Stopped`; exceeding `timeout` is a [`TransportError::TeardownTimeout`]
    pub fn wait_stopped(&self, timeout: Duration) -> Result<(), TransportError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while *state != SessionState::Stopped {
            if self.shared.changed.wait_until(&mut state, deadline).timed_out()
                && *state != SessionState::Stopped
            {
                return Err(TransportError::TeardownTimeout(timeout));
            }
        }
        Ok(())
    }

    /// Stop and wait for the worker to exit.
    ///
    /// On [`TransportError::TeardownTimeout`] the worker is detached and left
    /// to finish its cycle; later calls only wait for `Stopped`.
    pub fn shutdown(&self, timeout: Duration) -> Result<(), TransportError> {
        self.stop();
        let worker = self.worker.lock().take();
        self.wait_stopped(timeout)?;
        if let Some(worker) = worker {
            if worker.join().is_err() {
                tracing::error!(session = %self.config.name, "Session worker panicked");
            }
        }
        Ok(())
    }

    /// Traffic counters
    pub fn stats(&self) -> TransportStats {
        self.shared
            .stats
            .read()
            .snapshot(*self.shared.connected_at.lock())
    }
}

impl Drop for ThreadedSession {
    fn drop(&mut self) {
        if self.worker.get_mut().is_none() {
            return;
        }
        let timeout = self.config.teardown_timeout;
        if let Err(e) = self.shutdown(timeout) {
            tracing::warn!(session = %self.config.name, error = %e, "Session teardown incomplete");
        }
    }
}

/// Shared handle to a running session's queues.
///
/// Reads and writes through the handle go straight to the queues, so a
/// caller blocked in [`read_timeout`](Self::read_timeout) never holds back a
/// [`write`](Self::write) from another thread.
#[derive(Debug, Clone)]
pub struct SessionQueues {
    session: Arc<ThreadedSession>,
    default_wait: Option<Duration>,
}

impl SessionQueues {
    /// Share `session`; [`read`](Self::read) waits `default_wait`
    pub fn new(session: Arc<ThreadedSession>, default_wait: Option<Duration>) -> Self {
        Self {
            session,
            default_wait,
        }
    }

    fn running(&self) -> Result<&ThreadedSession, TransportError> {
        if self.session.is_running() {
            Ok(&*self.session)
        } else {
            Err(TransportError::NotConnected)
        }
    }

    /// Take the oldest inbound message with the default wait
    pub fn read(&self) -> Result<Bytes, TransportError> {
        self.read_timeout(self.default_wait)
    }

    /// Take the oldest inbound message waiting at most `timeout`
    pub fn read_timeout(&self, timeout: Option<Duration>) -> Result<Bytes, TransportError> {
        self.running()?.read(timeout)
    }

    /// Queue `data` for sending
    pub fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        self.running()?.write(Bytes::copy_from_slice(data))
    }
}

struct Worker {
    shared: Arc<Shared>,
    config: SessionConfig,
    framer: Box<dyn Framer>,
    heartbeat: Box<dyn HeartbeatPolicy>,
    outbound: Receiver<Bytes>,
    inbound: Sender<Bytes>,
}

impl Worker {
    fn run<C>(mut self, connect: C)
    where
        C: FnOnce() -> Result<Box<dyn Link>, TransportError>,
    {
        let _stopped = StopOnExit(Arc::clone(&self.shared));

        let mut link = match connect() {
            Ok(link) => link,
            Err(e) => {
                tracing::warn!(error = %e, "Session connect failed");
                *self.shared.failure.lock() = Some(e);
                return;
            }
        };

        if self.shared.stop.load(Ordering::Acquire) {
            link.close();
            return;
        }

        *self.shared.connected_at.lock() = Some(Instant::now());
        self.shared.set_state(SessionState::Running);
        tracing::info!("Session running");

        let mut last_error: Option<io::ErrorKind> = None;

        while !self.shared.stop.load(Ordering::Acquire) {
            if !self.send_one(link.as_mut()) {
                break;
            }

            let frame = match self.framer.read_frame(link.as_mut(), self.config.read_timeout) {
                Ok(frame) => {
                    last_error = None;
                    frame
                }
                Err(e) => {
                    if last_error == Some(e.kind()) {
                        tracing::trace!(error = %e, "Read failed again");
                    } else {
                        tracing::warn!(error = %e, "Read failed, treating as empty");
                    }
                    last_error = Some(e.kind());
                    self.shared.stats.write().record_error();
                    Bytes::new()
                }
            };

            self.shared.stats.write().record_received(frame.len());
            if (!frame.is_empty() || self.config.forward_empty_reads) && self.inbound.send(frame).is_err() {
                break;
            }

            thread::sleep(self.config.cycle_sleep);
        }

        link.close();
        tracing::info!("Session stopped");
    }

    /// Sends one queued message or heartbeat. Returns false once the caller side is gone.
    fn send_one(&mut self, link: &mut dyn Link) -> bool {
        let message = match self.outbound.try_recv() {
            Ok(message) => {
                self.heartbeat.sent(Instant::now());
                message
            }
            Err(TryRecvError::Empty) => match self.heartbeat.next_beat(Instant::now()) {
                Some(beat) => {
                    tracing::trace!(bytes = beat.len(), "Heartbeat");
                    beat
                }
                None => return true,
            },
            Err(TryRecvError::Disconnected) => return false,
        };

        match link.send_bytes(&message) {
            Ok(()) => self.shared.stats.write().record_sent(message.len()),
            Err(e) => {
                tracing::warn!(error = %e, bytes = message.len(), "Send failed");
                self.shared.stats.write().record_error();
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// In-memory link that echoes whatever is sent and records the wire order
    struct EchoLink {
        wire: Arc<Mutex<Vec<Bytes>>>,
        echo: VecDeque<u8>,
    }

    impl Link for EchoLink {
        fn send_bytes(&mut self, data: &[u8]) -> io::Result<()> {
            self.wire.lock().push(Bytes::copy_from_slice(data));
            self.echo.extend(data.iter().copied());
            Ok(())
        }

        fn recv_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.echo.is_empty() {
                thread::sleep(Duration::from_millis(2));
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "idle"));
            }
            let n = buf.len().min(self.echo.len());
            for (slot, byte) in buf.iter_mut().zip(self.echo.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    struct ChunkLink(VecDeque<io::Result<Vec<u8>>>);

    impl Link for ChunkLink {
        fn send_bytes(&mut self, _data: &[u8]) -> io::Result<()> {
            Ok(())
        }

        fn recv_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.pop_front() {
                Some(Ok(chunk)) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                Some(Err(e)) => Err(e),
                None => Err(io::Error::new(io::ErrorKind::TimedOut, "idle")),
            }
        }
    }

    fn fast_config() -> SessionConfig {
        SessionConfig::default()
            .name("test-session")
            .read_timeout(Duration::from_millis(20))
            .cycle_sleep(Duration::from_millis(1))
    }

    fn echo_session(wire: &Arc<Mutex<Vec<Bytes>>>) -> ThreadedSession {
        let wire = Arc::clone(wire);
        ThreadedSession::start(
            fast_config(),
            move || {
                Ok(Box::new(EchoLink {
                    wire,
                    echo: VecDeque::new(),
                }) as Box<dyn Link>)
            },
            Box::new(DelimiterFramer::default()),
            Box::new(NoHeartbeat),
        )
        .unwrap()
    }

    #[test]
    fn test_framer_splits_on_delimiter() {
        let mut link = ChunkLink(VecDeque::from(vec![Ok(b"AB\nCD".to_vec()), Ok(b"E\n".to_vec())]));
        let mut framer = DelimiterFramer::default();
        let budget = Duration::from_millis(50);

        assert_eq!(framer.read_frame(&mut link, budget).unwrap(), Bytes::from_static(b"AB\n"));
        assert_eq!(framer.read_frame(&mut link, budget).unwrap(), Bytes::from_static(b"CDE\n"));
        assert!(framer.read_frame(&mut link, budget).unwrap().is_empty());
    }

    #[test]
    fn test_framer_keeps_partial_input_on_timeout() {
        let mut link = ChunkLink(VecDeque::from(vec![Ok(b"PART".to_vec())]));
        let mut framer = DelimiterFramer::new(b"\r\n".to_vec());

        assert!(framer.read_frame(&mut link, Duration::from_millis(10)).unwrap().is_empty());
        assert_eq!(framer.pending(), b"PART");

        link.0.push_back(Ok(b"IAL\r\n".to_vec()));
        assert_eq!(
            framer.read_frame(&mut link, Duration::from_millis(10)).unwrap(),
            Bytes::from_static(b"PARTIAL\r\n")
        );
    }

    #[test]
    fn test_framer_reports_eof_and_errors() {
        let mut link = ChunkLink(VecDeque::from(vec![
            Ok(Vec::new()),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ]));
        let mut framer = DelimiterFramer::default();
        let budget = Duration::from_millis(10);

        let err = framer.read_frame(&mut link, budget).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        let err = framer.read_frame(&mut link, budget).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    /// Datagram link replaying scripted receives
    struct DatagramLink(VecDeque<Vec<u8>>);

    impl Link for DatagramLink {
        fn send_bytes(&mut self, _data: &[u8]) -> io::Result<()> {
            Ok(())
        }

        fn recv_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.pop_front() {
                Some(datagram) => {
                    buf[..datagram.len()].copy_from_slice(&datagram);
                    Ok(datagram.len())
                }
                None => Err(io::Error::new(io::ErrorKind::WouldBlock, "idle")),
            }
        }

        fn is_datagram(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_framer_empty_datagram_is_not_eof() {
        let mut link = DatagramLink(VecDeque::from(vec![Vec::new(), b"OK\n".to_vec()]));
        let mut framer = DelimiterFramer::default();
        let budget = Duration::from_millis(10);

        assert!(framer.read_frame(&mut link, budget).unwrap().is_empty());
        assert_eq!(framer.read_frame(&mut link, budget).unwrap(), Bytes::from_static(b"OK\n"));
    }

    #[test]
    fn test_framer_caps_undelimited_frames() {
        let mut link = ChunkLink(VecDeque::from(vec![Ok(vec![b'x'; 10])]));
        let mut framer = DelimiterFramer::default().max_frame(4);
        let frame = framer.read_frame(&mut link, Duration::from_millis(10)).unwrap();
        assert_eq!(frame.len(), 4);
        assert_eq!(framer.pending().len(), 6);
    }

    #[test]
    fn test_fixed_heartbeat_interval() {
        let start = Instant::now();
        let mut beat = FixedHeartbeat::new(Bytes::from_static(b"\0"), Duration::from_secs(1));
        assert!(beat.next_beat(start).is_some());
        assert!(beat.next_beat(start + Duration::from_millis(500)).is_none());
        assert!(beat.next_beat(start + Duration::from_millis(1000)).is_some());

        beat.sent(start + Duration::from_millis(1500));
        assert!(beat.next_beat(start + Duration::from_millis(2000)).is_none());
        assert!(beat.next_beat(start + Duration::from_millis(2600)).is_some());
        assert!(NoHeartbeat.next_beat(start).is_none());
    }

    #[test]
    fn test_session_lifecycle() {
        let wire = Arc::new(Mutex::new(Vec::new()));
        let session = echo_session(&wire);
        assert_eq!(session.state(), SessionState::Running);

        session.shutdown(Duration::from_secs(2)).unwrap();
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(matches!(session.write(&b"late\n"[..]), Err(TransportError::NotConnected)));
        assert!(matches!(session.read(None), Err(TransportError::Disconnected)));
    }

    #[test]
    fn test_session_sends_in_fifo_order() {
        let wire = Arc::new(Mutex::new(Vec::new()));
        let session = echo_session(&wire);

        let messages: Vec<Bytes> = (0..5).map(|i| Bytes::from(format!("MSG{i}\n"))).collect();
        for message in &messages {
            assert_eq!(session.write(message.clone()).unwrap(), message.len());
        }

        let mut replies = Vec::new();
        while replies.len() < messages.len() {
            let reply = session.read(Some(Duration::from_secs(2))).unwrap();
            assert!(!reply.is_empty(), "timed out waiting for echo");
            replies.push(reply);
        }

        session.shutdown(Duration::from_secs(2)).unwrap();
        assert_eq!(*wire.lock(), messages);
        assert_eq!(replies, messages);

        let stats = session.stats();
        assert_eq!(stats.packets_sent, 5);
        assert_eq!(stats.packets_received, 5);
    }

    #[test]
    fn test_read_timeout_returns_empty() {
        let wire = Arc::new(Mutex::new(Vec::new()));
        let session = echo_session(&wire);

        let started = Instant::now();
        let data = session.read(Some(Duration::from_millis(200))).unwrap();
        let elapsed = started.elapsed();
        assert!(data.is_empty());
        assert!(elapsed >= Duration::from_millis(190));
        assert!(elapsed < Duration::from_secs(1));

        let started = Instant::now();
        assert!(session.read(Some(Duration::ZERO)).unwrap().is_empty());
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_forward_empty_reads() {
        let wire = Arc::new(Mutex::new(Vec::new()));
        let link_wire = Arc::clone(&wire);
        let session = ThreadedSession::start(
            fast_config().forward_empty_reads(true),
            move || {
                Ok(Box::new(EchoLink {
                    wire: link_wire,
                    echo: VecDeque::new(),
                }) as Box<dyn Link>)
            },
            Box::new(DelimiterFramer::default()),
            Box::new(NoHeartbeat),
        )
        .unwrap();

        let started = Instant::now();
        let first = session.read(Some(Duration::from_secs(1))).unwrap();
        assert!(first.is_empty());
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(wire.lock().is_empty());
    }

    #[test]
    fn test_connect_failure_reported_by_start() {
        let result = ThreadedSession::start(
            fast_config(),
            || Err(TransportError::ConnectionFailed("refused".to_string())),
            Box::new(DelimiterFramer::default()),
            Box::new(NoHeartbeat),
        );
        assert!(matches!(result, Err(TransportError::ConnectionFailed(msg)) if msg == "refused"));
    }

    #[test]
    fn test_spawn_starts_in_created() {
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
        let wire = Arc::new(Mutex::new(Vec::new()));
        let link_wire = Arc::clone(&wire);
        let session = ThreadedSession::spawn(
            fast_config(),
            move || {
                let _ = release_rx.recv();
                Ok(Box::new(EchoLink {
                    wire: link_wire,
                    echo: VecDeque::new(),
                }) as Box<dyn Link>)
            },
            Box::new(DelimiterFramer::default()),
            Box::new(NoHeartbeat),
        )
        .unwrap();

        assert_eq!(session.state(), SessionState::Created);
        assert!(matches!(
            session.wait_running(Some(Duration::from_millis(20))),
            Err(TransportError::Timeout(_))
        ));

        release_tx.send(()).unwrap();
        session.wait_running(None).unwrap();
        session.shutdown(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn test_teardown_timeout_when_worker_is_stuck() {
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
        let session = ThreadedSession::spawn(
            fast_config(),
            move || {
                let _ = release_rx.recv();
                Err(TransportError::NotConnected)
            },
            Box::new(DelimiterFramer::default()),
            Box::new(NoHeartbeat),
        )
        .unwrap();

        session.stop();
        assert!(matches!(
            session.wait_stopped(Duration::from_millis(30)),
            Err(TransportError::TeardownTimeout(_))
        ));
        release_tx.send(()).unwrap();
        session.wait_stopped(Duration::from_secs(2)).unwrap();
    }

    /// Link whose every receive stalls well past the teardown bound
    struct StallLink;

    impl Link for StallLink {
        fn send_bytes(&mut self, _data: &[u8]) -> io::Result<()> {
            Ok(())
        }

        fn recv_bytes(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            thread::sleep(Duration::from_millis(300));
            Err(io::Error::new(io::ErrorKind::WouldBlock, "idle"))
        }
    }

    #[test]
    fn test_timed_out_shutdown_is_not_repeated_on_drop() {
        let session = ThreadedSession::start(
            fast_config().teardown_timeout(Duration::from_secs(2)),
            || Ok(Box::new(StallLink) as Box<dyn Link>),
            Box::new(DelimiterFramer::default()),
            Box::new(NoHeartbeat),
        )
        .unwrap();

        assert!(matches!(
            session.shutdown(Duration::from_millis(20)),
            Err(TransportError::TeardownTimeout(_))
        ));

        let started = Instant::now();
        drop(session);
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn test_queues_write_while_read_is_blocked() {
        let wire = Arc::new(Mutex::new(Vec::new()));
        let queues = SessionQueues::new(Arc::new(echo_session(&wire)), Some(Duration::from_secs(2)));

        let reader = {
            let queues = queues.clone();
            thread::spawn(move || queues.read_timeout(None))
        };
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        assert_eq!(queues.write(b"PING\n").unwrap(), 5);
        assert!(started.elapsed() < Duration::from_millis(50));
        assert_eq!(reader.join().unwrap().unwrap(), Bytes::from_static(b"PING\n"));
    }

    #[test]
    fn test_flush_outbound_drops_unsent() {
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
        let wire = Arc::new(Mutex::new(Vec::new()));
        let link_wire = Arc::clone(&wire);
        let session = ThreadedSession::spawn(
            fast_config(),
            move || {
                let _ = release_rx.recv();
                Ok(Box::new(EchoLink {
                    wire: link_wire,
                    echo: VecDeque::new(),
                }) as Box<dyn Link>)
            },
            Box::new(DelimiterFramer::default()),
            Box::new(NoHeartbeat),
        )
        .unwrap();

        session.write(&b"a\n"[..]).unwrap();
        session.write(&b"b\n"[..]).unwrap();
        assert_eq!(session.pending_outbound(), 2);
        assert_eq!(session.flush_outbound(), 2);

        release_tx.send(()).unwrap();
        session.wait_running(None).unwrap();
        session.shutdown(Duration::from_secs(2)).unwrap();
        assert!(wire.lock().is_empty());
    }
}
