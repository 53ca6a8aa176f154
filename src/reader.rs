//! Background reader.
//!
//! The reader polls the port, frames the byte stream into lines, parses
//! each line and applies it to the shared [`SensorState`]. It runs on a
//! dedicated thread started by [`Sensor::start`](crate::Sensor::start) until
//! a stop is requested.
//!
//! No fault stops the reader: framing, parse and I/O faults are logged,
//! counted in [`Diagnostics`](crate::state::Diagnostics) and passed to the
//! optional fault callback.

use crate::{
    FaultCallback, Read,
    framer::{Frame, LineFramer},
    message::{Message, ParseError},
    state::SensorState,
};
use core::fmt::{Display, Formatter};
use embedded_io::{Error as _, ErrorKind};
use log::{debug, info, trace, warn};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
    thread,
    time::{Duration, Instant},
};
use strum::FromRepr;

// Size of the buffer passed to a single read
const READ_BUFFER_SIZE: usize = 64;

/// Delay before the first retry after a failed read.
///
/// Doubles with every consecutive failure, up to [`MAX_RETRY_INTERVAL`].
pub const RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound of the delay between retries of a failing port.
pub const MAX_RETRY_INTERVAL: Duration = Duration::from_millis(500);

// Longest uninterrupted sleep, bounding the reaction time to a stop request
const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Lifecycle phase of the background reader.
///
/// Phases only move forward. A stopped reader cannot be restarted.
#[derive(FromRepr, strum::Display, PartialEq, Eq, Copy, Clone, Debug)]
#[repr(u8)]
pub enum Phase {
    /// The reader has not been started yet.
    Idle,
    /// The reader is polling the port.
    Running,
    /// A stop was requested, the reader exits after the current poll.
    Stopping,
    /// The reader has exited and released its half of the connection.
    Stopped,
}

/// Non-fatal fault observed by the reader.
#[non_exhaustive]
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum Fault {
    /// A byte outside the ASCII range was dropped.
    InvalidByte(u8),
    /// An unterminated line grew too long and was dropped.
    Overflow,
    /// A framed line could not be parsed and was dropped.
    Parse(ParseError),
    /// Reading from the port failed.
    Io(ErrorKind),
}

impl Display for Fault {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        match self {
            Self::InvalidByte(byte) => write!(f, "invalid byte: {byte:#04x}"),
            Self::Overflow => write!(f, "line too long"),
            Self::Parse(err) => write!(f, "parse error: {err}"),
            Self::Io(kind) => write!(f, "input/output error: {kind:?}"),
        }
    }
}

/// Phase and stop request shared between the reader and its owner.
#[derive(Debug)]
pub(crate) struct Control {
    phase: AtomicU8,
    stop: AtomicBool,
}

impl Control {
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(Phase::Idle as u8),
            stop: AtomicBool::new(false),
        }
    }

    pub fn phase(&self) -> Phase {
        Phase::from_repr(self.phase.load(Ordering::Acquire)).unwrap_or(Phase::Stopped)
    }

    pub fn set_phase(&self, phase: Phase) {
        debug!("Reader phase: {phase}");
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Requests a stop, moving a running reader to [`Phase::Stopping`].
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);

        if self
            .phase
            .compare_exchange(
                Phase::Running as u8,
                Phase::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            debug!("Reader phase: {}", Phase::Stopping);
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// Destination of framed lines and faults.
struct Sink {
    state: Arc<SensorState>,
    on_fault: Option<FaultCallback>,
}

impl Sink {
    fn line(&self, line: &str) {
        match line.parse::<Message>() {
            Ok(msg) => {
                if let Message::Diagnostic(text) = &msg {
                    info!("Sensor: {text}");
                }

                self.state.receive(line, Some(&msg));
            }
            Err(err) => {
                debug!("Discarding message {line:?}: {err}");
                self.state.receive(line, None);
                self.fault(&Fault::Parse(err));
            }
        }
    }

    fn fault(&self, fault: &Fault) {
        self.state.record_fault(fault);

        if let Some(callback) = &self.on_fault {
            callback(fault);
        }
    }
}

/// Background reader owning the read half of the connection.
pub(crate) struct Reader<R> {
    port: R,
    framer: LineFramer,
    sink: Sink,
    control: Arc<Control>,
    poll_interval: Duration,
    // Zero while the port is healthy
    retry_delay: Duration,
}

impl<R: Read> Reader<R> {
    pub fn new(
        port: R,
        state: Arc<SensorState>,
        control: Arc<Control>,
        poll_interval: Duration,
        on_fault: Option<FaultCallback>,
    ) -> Self {
        Self {
            port,
            framer: LineFramer::new(),
            sink: Sink { state, on_fault },
            control,
            poll_interval,
            retry_delay: Duration::ZERO,
        }
    }

    /// Polls the port until a stop is requested.
    ///
    /// The port is dropped before the phase moves to [`Phase::Stopped`].
    pub fn run(mut self) {
        let mut buf = [0x00; READ_BUFFER_SIZE];

        while !self.control.stop_requested() {
            if self.poll(&mut buf) == 0 {
                self.pause(self.poll_interval.max(self.retry_delay));
            }
        }

        let Self { port, control, .. } = self;

        drop(port);
        control.set_phase(Phase::Stopped);
    }

    /// Performs a single read and processes the received bytes.
    ///
    /// Returns the number of bytes read. Timeouts count as empty reads.
    fn poll(&mut self, buf: &mut [u8]) -> usize {
        match self.port.read(buf) {
            Ok(len) => {
                self.recovered();
                self.process(&buf[..len]);

                len
            }
            Err(err) => {
                match err.kind() {
                    ErrorKind::TimedOut | ErrorKind::Interrupted => self.recovered(),
                    kind => {
                        if self.retry_delay.is_zero() {
                            warn!("Error reading from port: {kind:?}");
                            self.retry_delay = RETRY_INTERVAL;
                        } else {
                            debug!("Error reading from port: {kind:?}");
                            self.retry_delay = (self.retry_delay * 2).min(MAX_RETRY_INTERVAL);
                        }

                        // Bytes may have been lost in the middle of a line
                        self.framer.clear();
                        self.sink.fault(&Fault::Io(kind));
                    }
                }

                0
            }
        }
    }

    fn recovered(&mut self) {
        if !self.retry_delay.is_zero() {
            info!("Port recovered");
            self.retry_delay = Duration::ZERO;
        }

        self.sink.state.record_read();
    }

    /// Sleeps for `delay`, returning early if a stop is requested.
    fn pause(&self, delay: Duration) {
        let deadline = Instant::now() + delay;

        while !self.control.stop_requested() {
            let remaining = deadline.saturating_duration_since(Instant::now());

            if remaining.is_zero() {
                break;
            }

            thread::sleep(remaining.min(STOP_CHECK_INTERVAL));
        }
    }

    fn process(&mut self, bytes: &[u8]) {
        if !bytes.is_empty() {
            trace!("Read from port: {bytes:02x?}");
        }

        for frame in self.framer.push(bytes) {
            match frame {
                Frame::Line(line) => self.sink.line(&line),
                Frame::InvalidByte(byte) => {
                    debug!("Discarding invalid byte: {byte:#04x}");
                    self.sink.fault(&Fault::InvalidByte(byte));
                }
                Frame::Overflow => {
                    debug!("Discarding overlong line");
                    self.sink.fault(&Fault::Overflow);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        framer::MAX_LINE_LENGTH,
        testing::{MockPort, init_logger, wait_until},
    };
    use std::sync::Mutex;

    fn reader(port: &MockPort, state: &Arc<SensorState>) -> Reader<MockPort> {
        Reader::new(
            port.clone(),
            Arc::clone(state),
            Arc::new(Control::new()),
            Duration::from_millis(1),
            None,
        )
    }

    fn poll_all(reader: &mut Reader<MockPort>, port: &MockPort) {
        let mut buf = [0x00; READ_BUFFER_SIZE];

        while !port.is_drained() {
            reader.poll(&mut buf);
        }
    }

    #[test]
    fn applies_messages_in_order() {
        init_logger();

        let port = MockPort::new();
        let state = Arc::new(SensorState::new(100));
        let mut reader = reader(&port, &state);

        port.feed(b"|11\r\n~04-2\r\n!8388708\r\n|10\r\n!8388508\r\n");
        poll_all(&mut reader, &port);

        let snapshot = state.snapshot();

        assert!(!snapshot.laser_on(), "last flag update should win");
        assert_eq!(snapshot.cell_temp_error, Some(-2));
        assert_eq!(snapshot.last_measurement, Some(-1.0));
        assert_eq!(snapshot.last_message.as_deref(), Some("!8388508"));
        assert_eq!(state.history(), [1.0, -1.0]);
        assert_eq!(state.diagnostics().messages, 5);
    }

    #[test]
    fn malformed_message_discarded() {
        init_logger();

        let port = MockPort::new();
        let state = Arc::new(SensorState::new(100));
        let mut reader = reader(&port, &state);

        port.feed(b"!abc\n");
        poll_all(&mut reader, &port);

        assert_eq!(state.last_measurement(), None);
        assert!(state.history().is_empty());
        assert_eq!(state.diagnostics().parse_faults, 1);

        port.feed(b"!08388608\n");
        poll_all(&mut reader, &port);

        assert_eq!(state.last_measurement(), Some(0.0));
        assert_eq!(state.history(), [0.0]);
    }

    #[test]
    fn invalid_bytes_counted() {
        init_logger();

        let port = MockPort::new();
        let state = Arc::new(SensorState::new(100));
        let mut reader = reader(&port, &state);

        port.feed(b"!83\xfe88\xff608\n");
        poll_all(&mut reader, &port);

        assert_eq!(state.last_measurement(), Some(0.0));
        assert_eq!(state.diagnostics().framing_faults, 2);
    }

    #[test]
    fn io_fault_recovers() {
        init_logger();

        let port = MockPort::new();
        let state = Arc::new(SensorState::new(100));
        let mut reader = reader(&port, &state);
        let mut buf = [0x00; READ_BUFFER_SIZE];

        port.feed(b"!83886");
        poll_all(&mut reader, &port);
        port.fail_next_read(std::io::ErrorKind::BrokenPipe);
        port.fail_next_read(std::io::ErrorKind::BrokenPipe);

        assert_eq!(reader.poll(&mut buf), 0);
        assert_eq!(reader.poll(&mut buf), 0);
        assert_eq!(state.diagnostics().consecutive_io_faults, 2);
        assert_eq!(reader.framer.pending(), "", "partial line should be dropped");

        port.feed(b"|51\n");
        poll_all(&mut reader, &port);

        assert!(state.master_mode());
        assert_eq!(state.diagnostics().io_faults, 2);
        assert_eq!(state.diagnostics().consecutive_io_faults, 0);
        assert_eq!(state.diagnostics().parse_faults, 0);
    }

    #[test]
    fn overlong_line_discarded() {
        init_logger();

        let port = MockPort::new();
        let state = Arc::new(SensorState::new(100));
        let mut reader = reader(&port, &state);

        port.feed(&[b'7'; MAX_LINE_LENGTH + 1]);
        port.feed(b"!8388608\n");
        poll_all(&mut reader, &port);

        assert_eq!(state.diagnostics().framing_faults, 1);
        assert_eq!(state.diagnostics().parse_faults, 0);
        assert_eq!(state.last_message().as_deref(), Some("!8388608"));
        assert_eq!(state.last_measurement(), Some(0.0));
    }

    #[test]
    fn retry_delay_grows_until_recovery() {
        init_logger();

        let port = MockPort::new();
        let state = Arc::new(SensorState::new(100));
        let mut reader = reader(&port, &state);
        let mut buf = [0x00; READ_BUFFER_SIZE];

        for _ in 0..10 {
            port.fail_next_read(std::io::ErrorKind::BrokenPipe);
        }

        reader.poll(&mut buf);
        assert_eq!(reader.retry_delay, RETRY_INTERVAL);

        reader.poll(&mut buf);
        assert_eq!(reader.retry_delay, RETRY_INTERVAL * 2);

        poll_all(&mut reader, &port);
        assert_eq!(reader.retry_delay, MAX_RETRY_INTERVAL);

        reader.poll(&mut buf);

        assert_eq!(reader.retry_delay, Duration::ZERO);
        assert_eq!(state.diagnostics().io_faults, 10);
        assert_eq!(state.diagnostics().consecutive_io_faults, 0);
    }

    #[test]
    fn persistent_io_fault_rate_bounded() {
        init_logger();

        let port = MockPort::new();
        let state = Arc::new(SensorState::new(100));
        let control = Arc::new(Control::new());
        let reader = Reader::new(
            port.clone(),
            Arc::clone(&state),
            Arc::clone(&control),
            Duration::from_millis(1),
            None,
        );

        for _ in 0..10_000 {
            port.fail_next_read(std::io::ErrorKind::BrokenPipe);
        }

        control.set_phase(Phase::Running);

        let start = Instant::now();
        let handle = thread::spawn(move || reader.run());

        wait_until(|| state.diagnostics().io_faults >= 3);
        thread::sleep(Duration::from_millis(200));
        control.request_stop();
        handle.join().unwrap();

        let elapsed = start.elapsed();
        let faults = state.diagnostics().io_faults;

        // Retries never come faster than the initial retry interval
        let bound = elapsed.as_millis() / RETRY_INTERVAL.as_millis() + 1;

        assert!(
            u128::from(faults) <= bound,
            "{faults} faults in {elapsed:?} should be rate limited"
        );
        assert!(elapsed < Duration::from_secs(3), "stop should not wait for the retry delay");
    }

    #[test]
    fn timeout_is_empty_read() {
        init_logger();

        let port = MockPort::new();
        let state = Arc::new(SensorState::new(100));
        let mut reader = reader(&port, &state);
        let mut buf = [0x00; READ_BUFFER_SIZE];

        port.fail_next_read(std::io::ErrorKind::TimedOut);

        assert_eq!(reader.poll(&mut buf), 0);
        assert_eq!(state.diagnostics().io_faults, 0);
    }

    #[test]
    fn fault_callback() {
        init_logger();

        let faults = Arc::new(Mutex::new(Vec::new()));
        let port = MockPort::new();
        let state = Arc::new(SensorState::new(100));
        let callback: FaultCallback = {
            let faults = Arc::clone(&faults);

            Arc::new(move |fault: &Fault| faults.lock().unwrap().push(fault.clone()))
        };
        let mut reader = Reader::new(
            port.clone(),
            Arc::clone(&state),
            Arc::new(Control::new()),
            Duration::from_millis(1),
            Some(callback),
        );

        port.feed(b"|\n\x80");
        poll_all(&mut reader, &port);

        assert_eq!(
            *faults.lock().unwrap(),
            [
                Fault::Parse(ParseError::Truncated),
                Fault::InvalidByte(0x80)
            ]
        );
    }

    #[test]
    fn run_until_stopped() {
        init_logger();

        let port = MockPort::new();
        let state = Arc::new(SensorState::new(100));
        let control = Arc::new(Control::new());
        let reader = Reader::new(
            port.clone(),
            Arc::clone(&state),
            Arc::clone(&control),
            Duration::from_millis(1),
            None,
        );

        control.set_phase(Phase::Running);

        let handle = thread::spawn(move || reader.run());

        port.feed(b"|41\n");
        wait_until(|| state.field_zeroing());
        control.request_stop();

        assert!(matches!(control.phase(), Phase::Stopping | Phase::Stopped));

        handle.join().unwrap();

        assert_eq!(control.phase(), Phase::Stopped);
        assert_eq!(port.connections(), 0, "port should be released");
    }
}
