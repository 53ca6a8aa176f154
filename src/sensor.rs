use crate::{
    Command, DEFAULT_QUEUE_LENGTH, Error, Read, Result, Write,
    reader::{Control, Fault, Phase, Reader},
    state::{Diagnostics, SensorState, Snapshot},
};
use core::fmt::{Debug, Formatter};
use log::{debug, trace, warn};
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
    time::Duration,
};

/// Callback invoked on the reader thread for every non-fatal fault.
pub type FaultCallback = Arc<dyn Fn(&Fault) + Send + Sync>;

/// Sensor configuration.
#[derive(Clone)]
pub struct Config {
    /// Number of measurements kept in the history. Must not be zero.
    pub queue_length: usize,
    /// Pause between polls when no bytes were available.
    pub poll_interval: Duration,
    /// Optional fault callback.
    pub on_fault: Option<FaultCallback>,
}

impl Config {
    /// Sets the number of measurements kept in the history.
    #[must_use]
    pub fn with_queue_length(mut self, queue_length: usize) -> Self {
        self.queue_length = queue_length;
        self
    }

    /// Sets the pause between polls when no bytes were available.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Sets a callback invoked for every fault observed by the reader.
    #[must_use]
    pub fn with_fault_callback(mut self, callback: impl Fn(&Fault) + Send + Sync + 'static) -> Self {
        self.on_fault = Some(Arc::new(callback));
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_length: DEFAULT_QUEUE_LENGTH,
            poll_interval: Duration::from_millis(1),
            on_fault: None,
        }
    }
}

impl Debug for Config {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Config")
            .field("queue_length", &self.queue_length)
            .field("poll_interval", &self.poll_interval)
            .field("on_fault", &self.on_fault.is_some())
            .finish()
    }
}

/// Connected magnetometer.
///
/// Owns both halves of the serial connection: the read half `R` is handed to
/// the background reader when [`Sensor::start`] is called, the write half `W`
/// is used for commands. Commands may be sent from several threads, writes
/// are serialized so command bytes never interleave.
///
/// The connection is released by [`Sensor::stop`], which first waits for the
/// reader to exit and then closes the write half. Dropping the sensor stops it
/// as well, so the connection is released on every exit path.
///
/// # Examples
///
/// ```no_run
/// use quspin::{
///     Config, Sensor,
///     embedded_io::{Read, Write},
/// };
///
/// fn monitor<R, W>(rx: R, tx: W) -> quspin::Result<(), W::Error>
/// where
///     R: Read + Send + 'static,
///     W: Write,
/// {
///     let sensor = Sensor::new(rx, tx, Config::default().with_queue_length(500))?;
///
///     sensor.start()?;
///     sensor.show_measurement()?;
///
///     std::thread::sleep(std::time::Duration::from_secs(1));
///
///     println!("Recent samples: {:?}", sensor.history());
///
///     sensor.stop();
///
///     Ok(())
/// }
/// ```
pub struct Sensor<R, W> {
    writer: Mutex<Option<W>>,
    reader: Mutex<Option<Reader<R>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    state: Arc<SensorState>,
    control: Arc<Control>,
}

impl<R, W> Sensor<R, W>
where
    R: Read + Send + 'static,
    W: Write,
{
    /// Constructs a sensor from the two halves of a connection.
    ///
    /// The reader is not started yet, see [`Sensor::start`].
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if the queue length is zero.
    pub fn new(reader: R, writer: W, config: Config) -> Result<Self, W::Error> {
        if config.queue_length == 0 {
            return Err(Error::InvalidArgument);
        }

        let state = Arc::new(SensorState::new(config.queue_length));
        let control = Arc::new(Control::new());
        let reader = Reader::new(
            reader,
            Arc::clone(&state),
            Arc::clone(&control),
            config.poll_interval,
            config.on_fault,
        );

        Ok(Self {
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Some(reader)),
            thread: Mutex::new(None),
            state,
            control,
        })
    }

    /// Starts the background reader.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if the reader was already started or stopped.
    /// - [`Error::Spawn`] if the reader thread could not be spawned.
    pub fn start(&self) -> Result<(), W::Error> {
        // Held until the handle is stored, so a concurrent `stop` can join it
        let mut pending = lock(&self.reader);

        if self.control.stop_requested() {
            return Err(Error::InvalidState);
        }

        let reader = pending.take().ok_or(Error::InvalidState)?;

        self.control.set_phase(Phase::Running);

        let handle = thread::Builder::new()
            .name("quspin-reader".into())
            .spawn(move || reader.run())
            .map_err(|err| {
                self.control.set_phase(Phase::Stopped);
                Error::Spawn(err)
            })?;

        *lock(&self.thread) = Some(handle);

        Ok(())
    }

    /// Sends a command to the sensor.
    ///
    /// The command is not acknowledged by the sensor.
    ///
    /// # Errors
    ///
    /// - [`Error::Closed`] if the sensor has been stopped.
    pub fn send(&self, cmd: Command) -> Result<(), W::Error> {
        let mut writer = lock(&self.writer);
        let port = writer.as_mut().ok_or(Error::Closed)?;

        trace!("Sending command {cmd}: {:02x}", cmd.code());

        port.write_all(&[cmd.code()]).inspect_err(|_| warn!("Error sending command {cmd}"))?;
        port.flush()?;

        Ok(())
    }

    /// Runs the automatic start-up routine.
    pub fn auto_start(&self) -> Result<(), W::Error> {
        self.send(Command::AutoStart)
    }

    /// Switches the sensor output to status messages.
    pub fn show_status(&self) -> Result<(), W::Error> {
        self.send(Command::StatusMode)
    }

    /// Switches the sensor output to field measurements.
    pub fn show_measurement(&self) -> Result<(), W::Error> {
        self.send(Command::MeasurementMode)
    }

    /// Enables or disables field zeroing.
    pub fn field_zero(&self, enable: bool) -> Result<(), W::Error> {
        self.send(if enable {
            Command::FieldZeroOn
        } else {
            Command::FieldZeroOff
        })
    }

    /// Runs the calibration routine.
    pub fn calibrate(&self) -> Result<(), W::Error> {
        self.send(Command::Calibrate)
    }

    /// Measures the field along the z axis.
    pub fn z_axis(&self) -> Result<(), W::Error> {
        self.send(Command::ZAxis)
    }

    /// Measures the field along the y axis.
    pub fn y_axis(&self) -> Result<(), W::Error> {
        self.send(Command::YAxis)
    }

    /// Reboots the sensor's microcontroller.
    pub fn reboot(&self) -> Result<(), W::Error> {
        self.send(Command::Reboot)
    }
}

impl<R, W> Sensor<R, W> {
    /// Stops the background reader and closes the connection.
    ///
    /// Blocks until the reader has exited, which takes at most one poll.
    /// Commands sent after this call fail with [`Error::Closed`].
    /// Calling `stop` again has no effect.
    pub fn stop(&self) {
        self.control.request_stop();

        // Refuse new commands, but keep the write half open until the reader exits
        let writer = lock(&self.writer).take();

        if let Some(reader) = lock(&self.reader).take() {
            drop(reader);
            self.control.set_phase(Phase::Stopped);
        }

        let handle = lock(&self.thread).take();

        if let Some(handle) = handle
            && handle.join().is_err()
        {
            warn!("Reader thread panicked");
            self.control.set_phase(Phase::Stopped);
        }

        if writer.is_some() {
            drop(writer);
            debug!("Connection closed");
        }
    }

    /// Returns the shared state updated by the reader.
    #[must_use]
    pub fn state(&self) -> &SensorState {
        &self.state
    }

    /// Returns a copy of all current values.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.state.snapshot()
    }

    /// Returns the latest field measurement in picotesla.
    #[must_use]
    pub fn last_measurement(&self) -> Option<f64> {
        self.state.last_measurement()
    }

    /// Returns a copy of the measurement history, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<f64> {
        self.state.history()
    }

    /// Returns the message and fault counters.
    #[must_use]
    pub fn diagnostics(&self) -> Diagnostics {
        self.state.diagnostics()
    }

    /// Returns the lifecycle phase of the background reader.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.control.phase()
    }
}

impl<R, W> Drop for Sensor<R, W> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
