//! Shared sensor state.
//!
//! [`SensorState`] is written by the background reader only and can be read
//! from any thread. Every accessor returns a copy taken under a lock, so a
//! reader never observes a partially applied message.

use crate::{
    message::{Message, Register},
    reader::Fault,
};
use bitflags_derive::{FlagsDebug, FlagsDisplay};
use core::fmt::{Display, Formatter};
use std::{
    collections::VecDeque,
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

bitflags::bitflags! {
    /// Sensor status flag.
    ///
    /// Each flag is reported individually by a `|` message.
    /// Flags that were never reported are cleared.
    #[derive(FlagsDisplay, FlagsDebug, PartialEq, Eq, Copy, Clone, Default)]
    pub struct StatusFlags: u8 {
        /// Laser is switched on.
        const LaserOn = 0x01;
        /// Vapor cell temperature is locked.
        const CellTemperatureLock = 0x02;
        /// Laser is locked.
        const LaserLock = 0x04;
        /// Field zeroing is active.
        const FieldZeroing = 0x08;
        /// Sensor operates in master mode.
        const MasterMode = 0x10;
    }
}

/// Consistent copy of the latest sensor values.
#[derive(PartialEq, Clone, Debug, Default)]
pub struct Snapshot {
    /// Cell temperature error (digital value).
    pub cell_temp_error: Option<i32>,
    /// Cell temperature control voltage (digital value).
    pub cell_temp_control_voltage: Option<i32>,
    /// Status flags.
    pub flags: StatusFlags,
    /// Latest field measurement in picotesla.
    pub last_measurement: Option<f64>,
    /// Latest complete line received, regardless of its kind.
    pub last_message: Option<String>,
}

impl Snapshot {
    /// Returns whether the laser is switched on.
    #[must_use]
    pub fn laser_on(&self) -> bool {
        self.flags.contains(StatusFlags::LaserOn)
    }

    /// Returns whether the cell temperature is locked.
    #[must_use]
    pub fn cell_temperature_lock(&self) -> bool {
        self.flags.contains(StatusFlags::CellTemperatureLock)
    }

    /// Returns whether the laser is locked.
    #[must_use]
    pub fn laser_lock(&self) -> bool {
        self.flags.contains(StatusFlags::LaserLock)
    }

    /// Returns whether field zeroing is active.
    #[must_use]
    pub fn field_zeroing(&self) -> bool {
        self.flags.contains(StatusFlags::FieldZeroing)
    }

    /// Returns whether the sensor operates in master mode.
    #[must_use]
    pub fn master_mode(&self) -> bool {
        self.flags.contains(StatusFlags::MasterMode)
    }
}

struct Optional<'a, T>(Option<&'a T>);

impl<T: Display> Display for Optional<'_, T> {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        match self.0 {
            Some(val) => val.fmt(f),
            None => write!(f, "-"),
        }
    }
}

impl Display for Snapshot {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        writeln!(f, "Temperature error: {}", Optional(self.cell_temp_error.as_ref()))?;
        writeln!(
            f,
            "Temperature voltage: {}",
            Optional(self.cell_temp_control_voltage.as_ref())
        )?;
        writeln!(f, "Laser on: {}", self.laser_on())?;
        writeln!(f, "Cell temperature lock: {}", self.cell_temperature_lock())?;
        writeln!(f, "Laser lock: {}", self.laser_lock())?;
        writeln!(f, "Field zeroing: {}", self.field_zeroing())?;
        writeln!(f, "Master mode: {}", self.master_mode())?;

        match self.last_measurement {
            Some(val) => write!(f, "Last measurement: {val:.2} pT"),
            None => write!(f, "Last measurement: -"),
        }
    }
}

/// Counters of processed messages and non-fatal faults.
///
/// A growing `consecutive_io_faults` indicates a disconnected or
/// misbehaving device.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Default)]
pub struct Diagnostics {
    /// Messages parsed and applied, including diagnostic lines.
    pub messages: u64,
    /// Diagnostic lines without a known tag.
    pub unrecognized: u64,
    /// Bytes or partial lines dropped while framing.
    pub framing_faults: u64,
    /// Lines dropped because they could not be parsed.
    pub parse_faults: u64,
    /// Failed reads from the port.
    pub io_faults: u64,
    /// Failed reads since the last successful one.
    pub consecutive_io_faults: u64,
}

#[derive(Default, Debug)]
struct Inner {
    snapshot: Snapshot,
    history: VecDeque<f64>,
    diagnostics: Diagnostics,
}

impl Inner {
    fn apply(&mut self, msg: &Message, queue_length: usize) {
        self.diagnostics.messages += 1;

        match msg {
            Message::Register(Register::CellTemperatureError, val) => {
                self.snapshot.cell_temp_error = Some(*val);
            }
            Message::Register(Register::CellTemperatureControlVoltage, val) => {
                self.snapshot.cell_temp_control_voltage = Some(*val);
            }
            Message::Flag(flag, val) => self.snapshot.flags.set(*flag, *val),
            Message::Measurement(meas) => self.push_measurement(meas.picotesla(), queue_length),
            Message::Diagnostic(_) => self.diagnostics.unrecognized += 1,
            Message::Ignored => {}
        }
    }

    fn push_measurement(&mut self, val: f64, queue_length: usize) {
        self.snapshot.last_measurement = Some(val);

        if queue_length == 0 {
            return;
        }

        if self.history.len() >= queue_length {
            self.history.pop_front();
        }

        self.history.push_back(val);
    }
}

/// Latest sensor values and a bounded history of measurements.
#[derive(Debug)]
pub struct SensorState {
    inner: RwLock<Inner>,
    queue_length: usize,
}

impl SensorState {
    /// Constructs an empty state keeping at most `queue_length` measurements.
    ///
    /// The history grows on demand, so any queue length is accepted.
    #[must_use]
    pub fn new(queue_length: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            queue_length,
        }
    }

    /// Returns the capacity of the measurement history.
    #[must_use]
    pub fn queue_length(&self) -> usize {
        self.queue_length
    }

    /// Returns a copy of all current values.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.read().snapshot.clone()
    }

    /// Returns the cell temperature error, if reported.
    #[must_use]
    pub fn cell_temp_error(&self) -> Option<i32> {
        self.read().snapshot.cell_temp_error
    }

    /// Returns the cell temperature control voltage, if reported.
    #[must_use]
    pub fn cell_temp_control_voltage(&self) -> Option<i32> {
        self.read().snapshot.cell_temp_control_voltage
    }

    /// Returns the status flags.
    #[must_use]
    pub fn flags(&self) -> StatusFlags {
        self.read().snapshot.flags
    }

    /// Returns whether the laser is switched on.
    #[must_use]
    pub fn laser_on(&self) -> bool {
        self.flags().contains(StatusFlags::LaserOn)
    }

    /// Returns whether the cell temperature is locked.
    #[must_use]
    pub fn cell_temperature_lock(&self) -> bool {
        self.flags().contains(StatusFlags::CellTemperatureLock)
    }

    /// Returns whether the laser is locked.
    #[must_use]
    pub fn laser_lock(&self) -> bool {
        self.flags().contains(StatusFlags::LaserLock)
    }

    /// Returns whether field zeroing is active.
    #[must_use]
    pub fn field_zeroing(&self) -> bool {
        self.flags().contains(StatusFlags::FieldZeroing)
    }

    /// Returns whether the sensor operates in master mode.
    #[must_use]
    pub fn master_mode(&self) -> bool {
        self.flags().contains(StatusFlags::MasterMode)
    }

    /// Returns the latest field measurement in picotesla.
    #[must_use]
    pub fn last_measurement(&self) -> Option<f64> {
        self.read().snapshot.last_measurement
    }

    /// Returns the latest complete line received.
    #[must_use]
    pub fn last_message(&self) -> Option<String> {
        self.read().snapshot.last_message.clone()
    }

    /// Returns a copy of the measurement history, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<f64> {
        self.read().history.iter().copied().collect()
    }

    /// Returns the message and fault counters.
    #[must_use]
    pub fn diagnostics(&self) -> Diagnostics {
        self.read().diagnostics
    }

    /// Records a measurement in picotesla.
    ///
    /// Updates the latest measurement and appends it to the history,
    /// evicting the oldest entry if the history is full.
    pub fn push_measurement(&self, val: f64) {
        self.write().push_measurement(val, self.queue_length);
    }

    /// Applies a parsed message to the state.
    pub fn apply(&self, msg: &Message) {
        self.write().apply(msg, self.queue_length);
    }

    /// Records a received line together with its parsed message, if any,
    /// under a single lock.
    pub(crate) fn receive(&self, line: &str, msg: Option<&Message>) {
        let mut inner = self.write();

        inner.snapshot.last_message = Some(line.into());

        if let Some(msg) = msg {
            inner.apply(msg, self.queue_length);
        }
    }

    pub(crate) fn record_fault(&self, fault: &Fault) {
        let mut inner = self.write();
        let diag = &mut inner.diagnostics;

        match fault {
            Fault::InvalidByte(_) | Fault::Overflow => diag.framing_faults += 1,
            Fault::Parse(_) => diag.parse_faults += 1,
            Fault::Io(_) => {
                diag.io_faults += 1;
                diag.consecutive_io_faults += 1;
            }
        }
    }

    pub(crate) fn record_read(&self) {
        if self.read().diagnostics.consecutive_io_faults > 0 {
            self.write().diagnostics.consecutive_io_faults = 0;
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        // Values are plain data, a panicking writer cannot leave them inconsistent
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
